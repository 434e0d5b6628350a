//! Bookkeeping for server-assigned playback handles.

use audio_protocol::{Handle, PlaybackFlags};
use std::collections::HashMap;

/// A stream's location in the game world
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Audible radius, stored squared so range checks avoid a square root
    pub distance_squared: f32,
}

impl Position {
    pub fn new(x: f32, y: f32, z: f32, max_distance: f32) -> Self {
        Self {
            x,
            y,
            z,
            distance_squared: max_distance * max_distance,
        }
    }
}

/// A sequence still receiving audio ids from the server
#[derive(Debug, Clone, PartialEq)]
pub struct SequenceDraft {
    pub sequence_id: i32,
    pub flags: PlaybackFlags,
    pub audio_ids: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackMode {
    Simple,
    Positioned(Position),
    /// Assembling; becomes `Simple` once handed to the audio engine
    Sequenced(SequenceDraft),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub name: String,
    pub mode: PlaybackMode,
}

impl StreamRecord {
    pub fn simple(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: PlaybackMode::Simple,
        }
    }
}

#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: HashMap<Handle, StreamRecord>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a handle, replacing whatever was registered under it
    pub fn insert(&mut self, handle: Handle, record: StreamRecord) {
        self.streams.insert(handle, record);
    }

    pub fn get(&self, handle: Handle) -> Option<&StreamRecord> {
        self.streams.get(&handle)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.streams.contains_key(&handle)
    }

    pub fn remove(&mut self, handle: Handle) -> Option<StreamRecord> {
        self.streams.remove(&handle)
    }

    pub fn clear(&mut self) {
        self.streams.clear();
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn is_positioned(&self, handle: Handle) -> bool {
        matches!(
            self.get(handle).map(|record| &record.mode),
            Some(PlaybackMode::Positioned(_))
        )
    }

    /// Attach a world position. Streams still assembling a sequence cannot
    /// be positioned.
    pub fn set_position(&mut self, handle: Handle, position: Position) -> bool {
        match self.streams.get_mut(&handle) {
            Some(record) if !matches!(record.mode, PlaybackMode::Sequenced(_)) => {
                record.mode = PlaybackMode::Positioned(position);
                true
            }
            _ => false,
        }
    }

    /// Drop the world position; returns false for unknown handles
    pub fn clear_position(&mut self, handle: Handle) -> bool {
        match self.streams.get_mut(&handle) {
            Some(record) => {
                if matches!(record.mode, PlaybackMode::Positioned(_)) {
                    record.mode = PlaybackMode::Simple;
                }
                true
            }
            None => false,
        }
    }

    pub fn start_sequence(&mut self, handle: Handle, sequence_id: i32, flags: PlaybackFlags) {
        self.insert(
            handle,
            StreamRecord {
                name: format!("Sequence ID: {sequence_id}"),
                mode: PlaybackMode::Sequenced(SequenceDraft {
                    sequence_id,
                    flags,
                    audio_ids: Vec::new(),
                }),
            },
        );
    }

    /// Append ids to a sequence under assembly. Returns its id, or `None`
    /// when the handle is not assembling a sequence.
    pub fn extend_sequence(&mut self, handle: Handle, audio_ids: &[i32]) -> Option<i32> {
        match self.streams.get_mut(&handle).map(|record| &mut record.mode) {
            Some(PlaybackMode::Sequenced(draft)) => {
                draft.audio_ids.extend_from_slice(audio_ids);
                Some(draft.sequence_id)
            }
            _ => None,
        }
    }

    /// Close an assembling sequence, leaving a plain stream behind
    pub fn finish_sequence(&mut self, handle: Handle) -> Option<SequenceDraft> {
        let record = self.streams.get_mut(&handle)?;
        match std::mem::replace(&mut record.mode, PlaybackMode::Simple) {
            PlaybackMode::Sequenced(draft) => Some(draft),
            other => {
                record.mode = other;
                None
            }
        }
    }

    pub fn is_sequencing(&self, handle: Handle) -> bool {
        matches!(
            self.get(handle).map(|record| &record.mode),
            Some(PlaybackMode::Sequenced(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_stores_squared_distance() {
        let position = Position::new(1.0, 2.0, 3.0, 4.0);
        assert_eq!(position.distance_squared, 16.0);
    }

    #[test]
    fn sequence_collects_ids_then_turns_simple() {
        let mut registry = StreamRegistry::new();
        registry.start_sequence(5, 42, PlaybackFlags::default());

        assert_eq!(registry.extend_sequence(5, &[1, 2]), Some(42));
        assert_eq!(registry.extend_sequence(5, &[3]), Some(42));
        assert!(registry.is_sequencing(5));

        let draft = registry.finish_sequence(5).unwrap();
        assert_eq!(draft.audio_ids, vec![1, 2, 3]);
        assert_eq!(registry.get(5).unwrap().mode, PlaybackMode::Simple);
        assert_eq!(registry.finish_sequence(5), None);
    }

    #[test]
    fn extending_plain_stream_is_rejected() {
        let mut registry = StreamRegistry::new();
        registry.insert(1, StreamRecord::simple("7"));
        assert_eq!(registry.extend_sequence(1, &[1]), None);
        assert_eq!(registry.extend_sequence(2, &[1]), None);
    }

    #[test]
    fn position_can_be_set_and_cleared() {
        let mut registry = StreamRegistry::new();
        registry.insert(1, StreamRecord::simple("7"));

        assert!(registry.set_position(1, Position::new(0.0, 0.0, 0.0, 10.0)));
        assert!(registry.is_positioned(1));
        assert!(registry.clear_position(1));
        assert!(!registry.is_positioned(1));

        assert!(!registry.set_position(9, Position::new(0.0, 0.0, 0.0, 1.0)));
        assert!(!registry.clear_position(9));
    }

    #[test]
    fn assembling_sequence_cannot_be_positioned() {
        let mut registry = StreamRegistry::new();
        registry.start_sequence(3, 1, PlaybackFlags::default());
        assert!(!registry.set_position(3, Position::new(0.0, 0.0, 0.0, 1.0)));
        assert!(registry.is_sequencing(3));
    }
}
