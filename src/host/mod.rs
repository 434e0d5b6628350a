//! Collaborators the client core drives but does not implement: the audio
//! engine, the game whose state gates connecting, and the surrounding
//! program (save directory, user-visible log).
//!
//! They are injected at startup as a [`Host`]. Events flowing the other way
//! (a stream finished, a track title changed) are sent as [`HostEvent`]s over
//! a channel into the session loop.

pub mod headless;

use crate::streams::Position;
use audio_protocol::{Handle, PlaybackFlags};
use std::path::Path;
use tokio::sync::mpsc;

pub use headless::{FileProgramContext, HeadlessAudio, StandaloneGame};

/// What a `Play` command asks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaySource {
    /// A previously transferred file, by server file id
    Library(i32),
    /// An internet stream
    Url(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayRequest {
    pub source: PlaySource,
    pub flags: PlaybackFlags,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SequenceRequest {
    pub sequence_id: i32,
    pub audio_ids: Vec<i32>,
    pub flags: PlaybackFlags,
}

/// Audio backend. Every method is a request; the engine reports stream ends
/// and metadata changes back through [`HostEvent`].
pub trait AudioEngine: Send {
    /// A transferred file is available locally under `id`
    fn register_file(&mut self, id: i32, name: &str, path: &Path);

    fn play(&mut self, handle: Handle, request: &PlayRequest) -> Result<(), String>;
    fn play_sequence(&mut self, handle: Handle, request: &SequenceRequest) -> Result<(), String>;

    /// Returns true when the stream was actually paused
    fn pause(&mut self, handle: Handle) -> bool;
    fn resume(&mut self, handle: Handle) -> bool;
    fn stop(&mut self, handle: Handle);
    fn restart(&mut self, handle: Handle) -> bool;

    fn position_seconds(&self, handle: Handle) -> Option<f64>;
    fn set_position_seconds(&mut self, handle: Handle, seconds: u32);
    fn set_volume(&mut self, handle: Handle, percent: f32);
    fn set_effect(&mut self, handle: Handle, slot: u8);
    fn remove_effect(&mut self, handle: Handle, slot: u8);
    fn set_3d_position(&mut self, handle: Handle, position: &Position);
    fn clear_3d_position(&mut self, handle: Handle);

    /// Stop and release every stream and registered file
    fn free_all(&mut self);
}

/// Polled view of the game
pub trait GameState: Send {
    /// Connection attempts only start while this is true
    fn is_session_ready(&self) -> bool;
    fn radio_station(&self) -> Option<u8>;
    fn set_radio_station(&mut self, station: i32);
    fn stop_radio(&mut self);
}

pub trait ProgramContext: Send {
    /// Append a line to the user-visible log
    fn log_line(&mut self, text: &str);
    fn save_path(&self) -> &Path;
}

/// Notifications from the audio engine or game
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    StreamStopped { handle: Handle },
    TrackChanged { handle: Handle, title: String },
    RadioStationChanged { station: u8 },
}

pub type HostEventSender = mpsc::UnboundedSender<HostEvent>;
pub type HostEventReceiver = mpsc::UnboundedReceiver<HostEvent>;

/// Channel carrying [`HostEvent`]s into the session loop. Collaborators
/// keep clones of the sender.
pub fn event_channel() -> (HostEventSender, HostEventReceiver) {
    mpsc::unbounded_channel()
}

/// The injected collaborators
pub struct Host {
    pub audio: Box<dyn AudioEngine>,
    pub game: Box<dyn GameState>,
    pub program: Box<dyn ProgramContext>,
}

impl Host {
    pub fn new(
        audio: impl AudioEngine + 'static,
        game: impl GameState + 'static,
        program: impl ProgramContext + 'static,
    ) -> Self {
        Self {
            audio: Box::new(audio),
            game: Box::new(game),
            program: Box::new(program),
        }
    }
}
