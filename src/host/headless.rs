//! Collaborators for running the client outside a game: streams are tracked
//! but not rendered, the game is always ready, and the program log goes to
//! `audio.txt` in the save directory.

use super::{
    AudioEngine, GameState, HostEvent, HostEventSender, PlayRequest, PlaySource, ProgramContext,
    SequenceRequest,
};
use crate::streams::Position;
use audio_protocol::Handle;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;

struct HeadlessStream {
    started: Instant,
    /// Elapsed seconds banked while paused
    offset: f64,
    paused: bool,
}

impl HeadlessStream {
    fn new(paused: bool) -> Self {
        Self {
            started: Instant::now(),
            offset: 0.0,
            paused,
        }
    }

    fn position(&self) -> f64 {
        if self.paused {
            self.offset
        } else {
            self.offset + self.started.elapsed().as_secs_f64()
        }
    }
}

/// Tracks playback state without producing sound
pub struct HeadlessAudio {
    files: HashMap<i32, PathBuf>,
    streams: HashMap<Handle, HeadlessStream>,
    events: HostEventSender,
}

impl HeadlessAudio {
    pub fn new(events: HostEventSender) -> Self {
        Self {
            files: HashMap::new(),
            streams: HashMap::new(),
            events,
        }
    }

    fn start(&mut self, handle: Handle, paused: bool) {
        self.streams.insert(handle, HeadlessStream::new(paused));
    }
}

impl AudioEngine for HeadlessAudio {
    fn register_file(&mut self, id: i32, name: &str, path: &Path) {
        debug!("Registered file {} as id {}", name, id);
        self.files.insert(id, path.to_path_buf());
    }

    fn play(&mut self, handle: Handle, request: &PlayRequest) -> Result<(), String> {
        match &request.source {
            PlaySource::Library(id) => {
                let path = self
                    .files
                    .get(id)
                    .ok_or_else(|| format!("file id {id} was never transferred"))?;
                if !path.exists() {
                    return Err(format!("{} is missing", path.display()));
                }
                info!("🔊 [{}] Playing {}", handle, path.display());
            }
            PlaySource::Url(url) => info!("🔊 [{}] Streaming {}", handle, url),
        }
        self.start(handle, request.flags.pause);
        Ok(())
    }

    fn play_sequence(&mut self, handle: Handle, request: &SequenceRequest) -> Result<(), String> {
        let missing: Vec<i32> = request
            .audio_ids
            .iter()
            .copied()
            .filter(|id| !self.files.contains_key(id))
            .collect();
        if request.audio_ids.is_empty() || missing.len() == request.audio_ids.len() {
            return Err(format!("sequence {} has no playable files", request.sequence_id));
        }
        if !missing.is_empty() {
            warn!("Sequence {} skips unknown ids {:?}", request.sequence_id, missing);
        }
        info!(
            "🔊 [{}] Playing sequence {} ({} files)",
            handle,
            request.sequence_id,
            request.audio_ids.len() - missing.len()
        );
        self.start(handle, request.flags.pause);
        Ok(())
    }

    fn pause(&mut self, handle: Handle) -> bool {
        match self.streams.get_mut(&handle) {
            Some(stream) if !stream.paused => {
                stream.offset = stream.position();
                stream.paused = true;
                true
            }
            _ => false,
        }
    }

    fn resume(&mut self, handle: Handle) -> bool {
        match self.streams.get_mut(&handle) {
            Some(stream) if stream.paused => {
                stream.started = Instant::now();
                stream.paused = false;
                true
            }
            _ => false,
        }
    }

    fn stop(&mut self, handle: Handle) {
        if self.streams.remove(&handle).is_some() {
            let _ = self.events.send(HostEvent::StreamStopped { handle });
        }
    }

    fn restart(&mut self, handle: Handle) -> bool {
        match self.streams.get_mut(&handle) {
            Some(stream) => {
                *stream = HeadlessStream::new(false);
                true
            }
            None => false,
        }
    }

    fn position_seconds(&self, handle: Handle) -> Option<f64> {
        self.streams.get(&handle).map(HeadlessStream::position)
    }

    fn set_position_seconds(&mut self, handle: Handle, seconds: u32) {
        if let Some(stream) = self.streams.get_mut(&handle) {
            stream.offset = f64::from(seconds);
            stream.started = Instant::now();
        }
    }

    fn set_volume(&mut self, handle: Handle, percent: f32) {
        debug!("[{}] Volume {}%", handle, percent);
    }

    fn set_effect(&mut self, handle: Handle, slot: u8) {
        debug!("[{}] Effect slot {} on", handle, slot);
    }

    fn remove_effect(&mut self, handle: Handle, slot: u8) {
        debug!("[{}] Effect slot {} off", handle, slot);
    }

    fn set_3d_position(&mut self, handle: Handle, position: &Position) {
        debug!(
            "[{}] Positioned at ({}, {}, {})",
            handle, position.x, position.y, position.z
        );
    }

    fn clear_3d_position(&mut self, handle: Handle) {
        debug!("[{}] Position cleared", handle);
    }

    fn free_all(&mut self) {
        self.streams.clear();
        self.files.clear();
    }
}

/// A game that is always ready and owns a single radio dial
pub struct StandaloneGame {
    station: Option<u8>,
    events: HostEventSender,
}

impl StandaloneGame {
    pub fn new(events: HostEventSender) -> Self {
        Self {
            station: None,
            events,
        }
    }
}

impl GameState for StandaloneGame {
    fn is_session_ready(&self) -> bool {
        true
    }

    fn radio_station(&self) -> Option<u8> {
        self.station
    }

    fn set_radio_station(&mut self, station: i32) {
        match u8::try_from(station) {
            Ok(station) => {
                self.station = Some(station);
                let _ = self.events.send(HostEvent::RadioStationChanged { station });
            }
            Err(_) => warn!("Ignoring out of range radio station {}", station),
        }
    }

    fn stop_radio(&mut self) {
        self.station = None;
    }
}

/// Writes the user-visible log to `<save path>/audio.txt`
pub struct FileProgramContext {
    save_path: PathBuf,
    log_file: Option<File>,
}

impl FileProgramContext {
    pub const LOG_FILE_NAME: &'static str = "audio.txt";

    /// The log file is truncated on startup. With logging disabled no file
    /// is created.
    pub fn new(save_path: impl Into<PathBuf>, enable_logging: bool) -> std::io::Result<Self> {
        let save_path = save_path.into();
        let log_file = if enable_logging {
            Some(
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(save_path.join(Self::LOG_FILE_NAME))?,
            )
        } else {
            None
        };
        Ok(Self {
            save_path,
            log_file,
        })
    }
}

impl ProgramContext for FileProgramContext {
    fn log_line(&mut self, text: &str) {
        info!("{}", text);
        if let Some(file) = self.log_file.as_mut() {
            let stamp = chrono::Local::now().format("[%H:%M:%S]");
            if let Err(e) = writeln!(file, "{stamp} {text}") {
                warn!("Failed to write {}: {}", Self::LOG_FILE_NAME, e);
            }
        }
    }

    fn save_path(&self) -> &Path {
        &self.save_path
    }
}
