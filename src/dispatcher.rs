//! Routes parsed server commands to the collaborators and queues replies.

use crate::config::Settings;
use crate::host::{Host, HostEvent, PlayRequest, PlaySource, SequenceRequest};
use crate::outbound::OutboundQueue;
use crate::streams::{Position, StreamRecord, StreamRegistry};
use crate::transfer::{DownloadJob, TransferManager, TransferStart};
use audio_protocol::{
    parse_line, ClientMessage, Handle, Inbound, PlayCode, PlayCommand, SequenceBatch, SequenceEnd,
    ServerCommand, TransferCode,
};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// What the session has to do after a command was handled
#[derive(Debug, PartialEq)]
pub enum DispatchOutcome {
    Done,
    /// The server accepted the connection
    Authenticated,
    /// Socket bytes now belong to the upload
    UploadStarted { expected_size: u64 },
    DownloadRequested(DownloadJob),
}

pub struct Dispatcher {
    settings: Arc<Settings>,
    streams: StreamRegistry,
    download_dir: Option<PathBuf>,
    player_name: String,
}

impl Dispatcher {
    pub fn new(settings: Arc<Settings>, player_name: impl Into<String>) -> Self {
        Self {
            settings,
            streams: StreamRegistry::new(),
            download_dir: None,
            player_name: player_name.into(),
        }
    }

    pub fn player_name(&self) -> &str {
        &self.player_name
    }

    pub fn download_dir(&self) -> Option<&Path> {
        self.download_dir.as_deref()
    }

    pub fn streams(&self) -> &StreamRegistry {
        &self.streams
    }

    /// Parse and execute one line. Empty lines are acknowledged, malformed
    /// lines dropped.
    pub async fn handle_line(
        &mut self,
        line: &str,
        host: &mut Host,
        outbound: &OutboundQueue,
        transfers: &mut TransferManager,
    ) -> DispatchOutcome {
        match parse_line(line) {
            Ok(Inbound::Empty) => {
                outbound.send(ClientMessage::Ack);
                DispatchOutcome::Done
            }
            Ok(Inbound::Command(command)) => {
                self.dispatch(command, host, outbound, transfers).await
            }
            Err(e) => {
                debug!("Dropping {:?}: {}", line, e);
                DispatchOutcome::Done
            }
        }
    }

    pub async fn dispatch(
        &mut self,
        command: ServerCommand,
        host: &mut Host,
        outbound: &OutboundQueue,
        transfers: &mut TransferManager,
    ) -> DispatchOutcome {
        debug!("📥 {:?}", command);
        match command {
            ServerCommand::Connect { download_dir } => {
                if let Some(name) = download_dir {
                    self.set_download_dir(&name, host).await;
                }
                return DispatchOutcome::Authenticated;
            }
            ServerCommand::Message { text } => {
                host.program.log_line(&format!("Message from server: {text}"));
            }
            ServerCommand::Name { name } => {
                info!("Player name changed to {}", name);
                self.player_name = name;
            }
            ServerCommand::Transfer(request) => {
                let start = transfers.begin(&request, self.download_dir.as_deref()).await;
                return match start {
                    TransferStart::Rejected(reason) => {
                        host.program.log_line(&format!(
                            "Transfer of \"{}\" rejected: {}",
                            request.name, reason
                        ));
                        outbound.send(ClientMessage::Transfer(TransferCode::Error));
                        DispatchOutcome::Done
                    }
                    TransferStart::AlreadyPresent(file) => {
                        outbound.send(ClientMessage::Transfer(TransferCode::Check));
                        host.audio.register_file(file.id, &file.name, &file.path);
                        DispatchOutcome::Done
                    }
                    TransferStart::Upload { expected_size } => {
                        host.program
                            .log_line(&format!("Transferring file \"{}\"", request.name));
                        outbound.send(ClientMessage::Transfer(TransferCode::Local));
                        DispatchOutcome::UploadStarted { expected_size }
                    }
                    TransferStart::Download(job) => {
                        host.program
                            .log_line(&format!("Downloading remote file \"{}\"", job.url));
                        DispatchOutcome::DownloadRequested(job)
                    }
                };
            }
            ServerCommand::TransferBatchComplete => {
                host.program.log_line("All files processed");
            }
            ServerCommand::Play(command) => self.play(command, host, outbound),
            ServerCommand::StartSequence {
                sequence_id,
                handle,
                flags,
                batch,
            } => {
                self.streams.start_sequence(handle, sequence_id, flags);
                self.apply_sequence_batch(handle, batch, host, outbound);
            }
            ServerCommand::ExtendSequence { handle, batch } => {
                if self.streams.is_sequencing(handle) {
                    self.apply_sequence_batch(handle, batch, host, outbound);
                }
            }
            ServerCommand::Pause { handle } => {
                if let Some(name) = self.known_name(handle) {
                    if host.audio.pause(handle) {
                        host.program.log_line(&format!("Paused: \"{name}\""));
                    }
                }
            }
            ServerCommand::Resume { handle } => {
                if let Some(name) = self.known_name(handle) {
                    if host.audio.resume(handle) {
                        host.program.log_line(&format!("Resumed: \"{name}\""));
                    }
                }
            }
            ServerCommand::Stop { handle } => {
                if self.streams.contains(handle) {
                    host.audio.stop(handle);
                }
            }
            ServerCommand::Restart { handle } => {
                if let Some(name) = self.known_name(handle) {
                    if host.audio.restart(handle) {
                        host.program.log_line(&format!("Restarted: \"{name}\""));
                    }
                }
            }
            ServerCommand::GetPosition { request_id, handle } => {
                let seconds = if self.streams.contains(handle) {
                    host.audio.position_seconds(handle).unwrap_or(0.0)
                } else {
                    0.0
                };
                outbound.send(ClientMessage::Position {
                    request_id,
                    handle,
                    seconds: seconds.max(0.0).trunc() as i64,
                });
            }
            ServerCommand::SetPosition { handle, seconds } => {
                if self.streams.contains(handle) {
                    host.audio.set_position_seconds(handle, seconds);
                }
            }
            ServerCommand::SetVolume { handle, percent } => {
                if self.streams.contains(handle) && !self.streams.is_positioned(handle) {
                    host.audio.set_volume(handle, percent);
                }
            }
            ServerCommand::SetEffect { handle, slot } => {
                if self.streams.contains(handle) {
                    host.audio.set_effect(handle, slot);
                }
            }
            ServerCommand::RemoveEffect { handle, slot } => {
                if self.streams.contains(handle) {
                    host.audio.remove_effect(handle, slot);
                }
            }
            ServerCommand::Set3DPosition {
                handle,
                x,
                y,
                z,
                max_distance,
            } => {
                let position = Position::new(x, y, z, max_distance);
                if self.streams.set_position(handle, position) {
                    host.audio.set_3d_position(handle, &position);
                }
            }
            ServerCommand::Remove3DPosition { handle } => {
                if self.streams.clear_position(handle) {
                    host.audio.clear_3d_position(handle);
                }
            }
            ServerCommand::GetRadioStation => match host.game.radio_station() {
                Some(station) => {
                    outbound.send(ClientMessage::RadioStation { station });
                }
                None => debug!("No radio station to report"),
            },
            ServerCommand::SetRadioStation { station } => {
                if self.settings.allow_radio_station_adjustment {
                    host.game.set_radio_station(station);
                }
            }
            ServerCommand::StopRadio => {
                if self.settings.allow_radio_station_adjustment {
                    host.game.stop_radio();
                }
            }
        }
        DispatchOutcome::Done
    }

    /// React to something the audio engine or game reported
    pub fn handle_host_event(
        &mut self,
        event: HostEvent,
        host: &mut Host,
        outbound: &OutboundQueue,
    ) {
        match event {
            HostEvent::StreamStopped { handle } => match self.streams.remove(handle) {
                Some(record) => {
                    host.program
                        .log_line(&format!("Stopped: \"{}\"", record.name));
                    outbound.send(ClientMessage::Stop { handle });
                }
                None => debug!("Ignoring stop of untracked handle {}", handle),
            },
            HostEvent::TrackChanged { handle, title } => {
                if self.streams.contains(handle) {
                    outbound.send(ClientMessage::Track { handle, title });
                }
            }
            HostEvent::RadioStationChanged { station } => {
                outbound.send(ClientMessage::RadioStation { station });
            }
        }
    }

    /// Forget everything tied to the current connection
    pub fn reset(&mut self, host: &mut Host) {
        self.streams.clear();
        self.download_dir = None;
        host.audio.free_all();
    }

    async fn set_download_dir(&mut self, name: &str, host: &mut Host) {
        if self.settings.contains_illegal_characters(name) {
            warn!("Refusing download directory {:?}", name);
            host.program
                .log_line(&format!("Download path \"{name}\" contains illegal characters"));
            return;
        }

        let dir = host.program.save_path().join("audiopacks").join(name);
        match tokio::fs::create_dir_all(&dir).await {
            Ok(()) => {
                host.program
                    .log_line(&format!("Download path set to \"{}\"", dir.display()));
                self.download_dir = Some(dir);
            }
            Err(e) => {
                warn!("Could not create {}: {}", dir.display(), e);
                host.program
                    .log_line(&format!("Could not create download path \"{}\"", dir.display()));
            }
        }
    }

    fn play(&mut self, command: PlayCommand, host: &mut Host, outbound: &OutboundQueue) {
        let handle = command.handle;
        let source = if command.source.contains("://") {
            if !self.settings.stream_files {
                host.program.log_line(&format!(
                    "Stream of \"{}\" rejected: streaming disabled",
                    command.source
                ));
                outbound.send(play_reply(handle, false));
                return;
            }
            PlaySource::Url(command.source.clone())
        } else {
            match command.source.parse::<i32>() {
                Ok(id) => PlaySource::Library(id),
                Err(_) => {
                    debug!("Play source {:?} is neither a URL nor a file id", command.source);
                    outbound.send(play_reply(handle, false));
                    return;
                }
            }
        };

        self.streams
            .insert(handle, StreamRecord::simple(command.source.clone()));
        let request = PlayRequest {
            source,
            flags: command.flags,
        };
        match host.audio.play(handle, &request) {
            Ok(()) => {
                host.program
                    .log_line(&format!("Playing: \"{}\"", command.source));
                outbound.send(play_reply(handle, true));
            }
            Err(reason) => {
                self.streams.remove(handle);
                host.program.log_line(&format!(
                    "Could not play \"{}\": {}",
                    command.source, reason
                ));
                outbound.send(play_reply(handle, false));
            }
        }
    }

    fn apply_sequence_batch(
        &mut self,
        handle: Handle,
        batch: SequenceBatch,
        host: &mut Host,
        outbound: &OutboundQueue,
    ) {
        let Some(sequence_id) = self.streams.extend_sequence(handle, &batch.audio_ids) else {
            return;
        };

        match batch.end {
            Some(SequenceEnd::Finish) => {
                let Some(draft) = self.streams.finish_sequence(handle) else {
                    return;
                };
                let request = SequenceRequest {
                    sequence_id: draft.sequence_id,
                    audio_ids: draft.audio_ids,
                    flags: draft.flags,
                };
                self.play_sequence(handle, request, host, outbound);
            }
            Some(SequenceEnd::RequestMore) => {
                outbound.send(ClientMessage::Sequence {
                    sequence_id,
                    handle,
                });
            }
            None => {}
        }
    }

    fn play_sequence(
        &mut self,
        handle: Handle,
        request: SequenceRequest,
        host: &mut Host,
        outbound: &OutboundQueue,
    ) {
        match host.audio.play_sequence(handle, &request) {
            Ok(()) => {
                host.program
                    .log_line(&format!("Playing: \"Sequence ID: {}\"", request.sequence_id));
                outbound.send(play_reply(handle, true));
            }
            Err(reason) => {
                self.streams.remove(handle);
                host.program.log_line(&format!(
                    "Could not play sequence {}: {}",
                    request.sequence_id, reason
                ));
                outbound.send(play_reply(handle, false));
            }
        }
    }

    fn known_name(&self, handle: Handle) -> Option<String> {
        self.streams.get(handle).map(|record| record.name.clone())
    }
}

fn play_reply(handle: Handle, started: bool) -> ClientMessage {
    ClientMessage::Play {
        handle,
        code: if started {
            PlayCode::Success
        } else {
            PlayCode::Failure
        },
    }
}
