//! Recording collaborators for driving the client in tests.

use crate::host::{AudioEngine, GameState, Host, PlayRequest, ProgramContext, SequenceRequest};
use crate::streams::Position;
use audio_protocol::Handle;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Everything the recording collaborators observed
#[derive(Debug, Default)]
pub struct Recorded {
    pub calls: Vec<String>,
    pub files: HashMap<i32, PathBuf>,
    pub positions: HashMap<Handle, f64>,
    pub log: Vec<String>,
    pub radio_station: Option<u8>,
    /// When set, `play` and `play_sequence` fail
    pub fail_playback: bool,
}

/// Shared view onto a [`Recorded`], cloned into every collaborator
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    inner: Arc<Mutex<Recorded>>,
    ready: Arc<AtomicBool>,
}

impl Recorder {
    pub fn new() -> Self {
        let recorder = Self::default();
        recorder.set_ready(true);
        recorder
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Recorded) -> R) -> R {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|r| r.calls.clone())
    }

    pub fn log(&self) -> Vec<String> {
        self.with(|r| r.log.clone())
    }

    pub fn has_call(&self, call: &str) -> bool {
        self.with(|r| r.calls.iter().any(|c| c == call))
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    fn record(&self, call: String) {
        self.with(|r| r.calls.push(call));
    }
}

pub struct RecordingAudio(Recorder);
pub struct RecordingGame(Recorder);
pub struct RecordingProgram {
    recorder: Recorder,
    save_path: PathBuf,
}

/// A [`Host`] whose collaborators all write into the returned [`Recorder`]
pub fn recording_host(save_path: impl Into<PathBuf>) -> (Host, Recorder) {
    let recorder = Recorder::new();
    let host = Host::new(
        RecordingAudio(recorder.clone()),
        RecordingGame(recorder.clone()),
        RecordingProgram {
            recorder: recorder.clone(),
            save_path: save_path.into(),
        },
    );
    (host, recorder)
}

impl AudioEngine for RecordingAudio {
    fn register_file(&mut self, id: i32, name: &str, path: &Path) {
        self.0.record(format!("register {id} {name}"));
        self.0.with(|r| r.files.insert(id, path.to_path_buf()));
    }

    fn play(&mut self, handle: Handle, request: &PlayRequest) -> Result<(), String> {
        self.0.record(format!("play {handle} {:?}", request.source));
        if self.0.with(|r| r.fail_playback) {
            return Err("playback disabled".to_string());
        }
        self.0.with(|r| r.positions.insert(handle, 0.0));
        Ok(())
    }

    fn play_sequence(&mut self, handle: Handle, request: &SequenceRequest) -> Result<(), String> {
        self.0.record(format!(
            "sequence {handle} {} {:?}",
            request.sequence_id, request.audio_ids
        ));
        if self.0.with(|r| r.fail_playback) {
            return Err("playback disabled".to_string());
        }
        Ok(())
    }

    fn pause(&mut self, handle: Handle) -> bool {
        self.0.record(format!("pause {handle}"));
        true
    }

    fn resume(&mut self, handle: Handle) -> bool {
        self.0.record(format!("resume {handle}"));
        true
    }

    fn stop(&mut self, handle: Handle) {
        self.0.record(format!("stop {handle}"));
    }

    fn restart(&mut self, handle: Handle) -> bool {
        self.0.record(format!("restart {handle}"));
        true
    }

    fn position_seconds(&self, handle: Handle) -> Option<f64> {
        self.0.with(|r| r.positions.get(&handle).copied())
    }

    fn set_position_seconds(&mut self, handle: Handle, seconds: u32) {
        self.0.record(format!("seek {handle} {seconds}"));
        self.0
            .with(|r| r.positions.insert(handle, f64::from(seconds)));
    }

    fn set_volume(&mut self, handle: Handle, percent: f32) {
        self.0.record(format!("volume {handle} {percent}"));
    }

    fn set_effect(&mut self, handle: Handle, slot: u8) {
        self.0.record(format!("fx {handle} {slot}"));
    }

    fn remove_effect(&mut self, handle: Handle, slot: u8) {
        self.0.record(format!("unfx {handle} {slot}"));
    }

    fn set_3d_position(&mut self, handle: Handle, position: &Position) {
        self.0.record(format!(
            "position {handle} {} {} {} {}",
            position.x, position.y, position.z, position.distance_squared
        ));
    }

    fn clear_3d_position(&mut self, handle: Handle) {
        self.0.record(format!("unposition {handle}"));
    }

    fn free_all(&mut self) {
        self.0.record("free_all".to_string());
        self.0.with(|r| {
            r.files.clear();
            r.positions.clear();
        });
    }
}

impl GameState for RecordingGame {
    fn is_session_ready(&self) -> bool {
        self.0.ready.load(Ordering::SeqCst)
    }

    fn radio_station(&self) -> Option<u8> {
        self.0.with(|r| r.radio_station)
    }

    fn set_radio_station(&mut self, station: i32) {
        self.0.record(format!("radio {station}"));
        if let Ok(station) = u8::try_from(station) {
            self.0.with(|r| r.radio_station = Some(station));
        }
    }

    fn stop_radio(&mut self) {
        self.0.record("radio off".to_string());
        self.0.with(|r| r.radio_station = None);
    }
}

impl ProgramContext for RecordingProgram {
    fn log_line(&mut self, text: &str) {
        self.recorder.with(|r| r.log.push(text.to_string()));
    }

    fn save_path(&self) -> &Path {
        &self.save_path
    }
}
