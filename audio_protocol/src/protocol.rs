use crate::framing::split_fields;
use strum::{Display, FromRepr};
use thiserror::Error;

/// Server-assigned identifier of one playback session
pub type Handle = i32;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid opcode: {0:?}")]
    InvalidOpcode(String),

    #[error("Unknown opcode: {0}")]
    UnknownOpcode(u8),

    #[error("Empty field at position {0}")]
    EmptyField(usize),

    #[error("{opcode} expects {expected:?} fields, got {got}")]
    FieldCount {
        opcode: ServerOpcode,
        expected: &'static [usize],
        got: usize,
    },

    #[error("Invalid value {value:?} at position {index} of {opcode}")]
    InvalidField {
        opcode: ServerOpcode,
        index: usize,
        value: String,
    },
}

/// Commands sent by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum ServerOpcode {
    Connect = 0,
    Message = 1,
    Name = 2,
    Transfer = 3,
    Play = 4,
    PlaySequence = 5,
    Pause = 6,
    Resume = 7,
    Stop = 8,
    Restart = 9,
    GetPosition = 10,
    SetPosition = 11,
    SetVolume = 12,
    SetFX = 13,
    RemoveFX = 14,
    Set3DPosition = 15,
    Remove3DPosition = 16,
    GetRadioStation = 17,
    SetRadioStation = 18,
    StopRadio = 19,
}

/// Commands sent by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum ClientOpcode {
    Authenticate = 0,
    Transfer = 1,
    Play = 2,
    Sequence = 3,
    Stop = 4,
    RadioStation = 5,
    Track = 6,
    Position = 7,
}

/// Second field of a client `Transfer` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum TransferCode {
    Local = 0,
    Remote = 1,
    Check = 2,
    Error = 3,
}

/// Third field of a client `Play` reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum PlayCode {
    Success = 0,
    Failure = 1,
}

/// Highest effect slot accepted by `SetFX`/`RemoveFX`
pub const MAX_EFFECT_SLOT: u8 = 8;

/// One parsed inbound line
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// An empty line, answered with an empty line
    Empty,
    Command(ServerCommand),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackFlags {
    pub pause: bool,
    pub looped: bool,
    pub downmix: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayCommand {
    /// Numeric file id or a URL
    pub source: String,
    pub handle: Handle,
    pub flags: PlaybackFlags,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub transferable: bool,
    pub file_id: i32,
    /// Plain file name or URL
    pub name: String,
    pub size: u64,
    /// Upper-case hex CRC-32 of the file
    pub checksum: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceEnd {
    /// `F`: the list is complete, start playback
    Finish,
    /// `U`: ask the server for the next batch
    RequestMore,
}

/// Audio ids carried by one `PlaySequence` command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SequenceBatch {
    pub audio_ids: Vec<i32>,
    pub end: Option<SequenceEnd>,
}

impl SequenceBatch {
    /// Parse a space separated token list. Scanning stops at the first
    /// `F` or `U`; tokens that are not integers are skipped. Lists that split
    /// into fewer than two pieces carry nothing.
    pub fn parse(tokens: &str) -> Self {
        let pieces: Vec<&str> = tokens.split(' ').collect();
        let mut batch = Self::default();
        if pieces.len() < 2 {
            return batch;
        }

        for piece in pieces.into_iter().filter(|p| !p.is_empty()) {
            match piece {
                "F" => {
                    batch.end = Some(SequenceEnd::Finish);
                    break;
                }
                "U" => {
                    batch.end = Some(SequenceEnd::RequestMore);
                    break;
                }
                other => {
                    if let Ok(id) = other.parse::<i32>() {
                        batch.audio_ids.push(id);
                    }
                }
            }
        }
        batch
    }
}

/// A validated server command
#[derive(Debug, Clone, PartialEq)]
pub enum ServerCommand {
    Connect {
        download_dir: Option<String>,
    },
    Message {
        text: String,
    },
    Name {
        name: String,
    },
    Transfer(TransferRequest),
    /// Single-field `Transfer`: the server has no more files to offer
    TransferBatchComplete,
    Play(PlayCommand),
    StartSequence {
        sequence_id: i32,
        handle: Handle,
        flags: PlaybackFlags,
        batch: SequenceBatch,
    },
    ExtendSequence {
        handle: Handle,
        batch: SequenceBatch,
    },
    Pause {
        handle: Handle,
    },
    Resume {
        handle: Handle,
    },
    Stop {
        handle: Handle,
    },
    Restart {
        handle: Handle,
    },
    GetPosition {
        request_id: i32,
        handle: Handle,
    },
    SetPosition {
        handle: Handle,
        seconds: u32,
    },
    SetVolume {
        handle: Handle,
        percent: f32,
    },
    SetEffect {
        handle: Handle,
        slot: u8,
    },
    RemoveEffect {
        handle: Handle,
        slot: u8,
    },
    Set3DPosition {
        handle: Handle,
        x: f32,
        y: f32,
        z: f32,
        max_distance: f32,
    },
    Remove3DPosition {
        handle: Handle,
    },
    GetRadioStation,
    SetRadioStation {
        station: i32,
    },
    StopRadio,
}

impl ServerCommand {
    pub fn opcode(&self) -> ServerOpcode {
        match self {
            ServerCommand::Connect { .. } => ServerOpcode::Connect,
            ServerCommand::Message { .. } => ServerOpcode::Message,
            ServerCommand::Name { .. } => ServerOpcode::Name,
            ServerCommand::Transfer(_) | ServerCommand::TransferBatchComplete => {
                ServerOpcode::Transfer
            }
            ServerCommand::Play(_) => ServerOpcode::Play,
            ServerCommand::StartSequence { .. } | ServerCommand::ExtendSequence { .. } => {
                ServerOpcode::PlaySequence
            }
            ServerCommand::Pause { .. } => ServerOpcode::Pause,
            ServerCommand::Resume { .. } => ServerOpcode::Resume,
            ServerCommand::Stop { .. } => ServerOpcode::Stop,
            ServerCommand::Restart { .. } => ServerOpcode::Restart,
            ServerCommand::GetPosition { .. } => ServerOpcode::GetPosition,
            ServerCommand::SetPosition { .. } => ServerOpcode::SetPosition,
            ServerCommand::SetVolume { .. } => ServerOpcode::SetVolume,
            ServerCommand::SetEffect { .. } => ServerOpcode::SetFX,
            ServerCommand::RemoveEffect { .. } => ServerOpcode::RemoveFX,
            ServerCommand::Set3DPosition { .. } => ServerOpcode::Set3DPosition,
            ServerCommand::Remove3DPosition { .. } => ServerOpcode::Remove3DPosition,
            ServerCommand::GetRadioStation => ServerOpcode::GetRadioStation,
            ServerCommand::SetRadioStation { .. } => ServerOpcode::SetRadioStation,
            ServerCommand::StopRadio => ServerOpcode::StopRadio,
        }
    }
}

/// Parse one line (terminator already removed).
///
/// Every field must be non-empty and every opcode has an exact field count;
/// anything else is an error the caller is expected to drop silently.
pub fn parse_line(line: &str) -> Result<Inbound, ProtocolError> {
    if line.is_empty() {
        return Ok(Inbound::Empty);
    }

    let fields = split_fields(line);
    if let Some(index) = fields.iter().position(|f| f.is_empty()) {
        return Err(ProtocolError::EmptyField(index));
    }

    let raw = fields[0]
        .parse::<u8>()
        .map_err(|_| ProtocolError::InvalidOpcode(fields[0].to_string()))?;
    let opcode = ServerOpcode::from_repr(raw).ok_or(ProtocolError::UnknownOpcode(raw))?;

    let f = Fields { opcode, fields };
    let command = match opcode {
        ServerOpcode::Connect => {
            f.expect(&[1, 2])?;
            ServerCommand::Connect {
                download_dir: f.optional_text(1),
            }
        }
        ServerOpcode::Message => {
            f.expect(&[2])?;
            ServerCommand::Message { text: f.text(1) }
        }
        ServerOpcode::Name => {
            f.expect(&[2])?;
            ServerCommand::Name { name: f.text(1) }
        }
        ServerOpcode::Transfer => {
            if f.expect(&[1, 6])? == 1 {
                ServerCommand::TransferBatchComplete
            } else {
                ServerCommand::Transfer(TransferRequest {
                    transferable: f.flag(1)?,
                    file_id: f.int(2)?,
                    name: f.text(3),
                    size: f.size(4)?,
                    checksum: f.text(5),
                })
            }
        }
        ServerOpcode::Play => {
            f.expect(&[6])?;
            ServerCommand::Play(PlayCommand {
                source: f.text(1),
                handle: f.int(2)?,
                flags: f.playback_flags(3)?,
            })
        }
        ServerOpcode::PlaySequence => {
            if f.expect(&[3, 7])? == 3 {
                ServerCommand::ExtendSequence {
                    handle: f.int(1)?,
                    batch: SequenceBatch::parse(f.fields[2]),
                }
            } else {
                ServerCommand::StartSequence {
                    sequence_id: f.int(1)?,
                    handle: f.int(2)?,
                    flags: f.playback_flags(3)?,
                    batch: SequenceBatch::parse(f.fields[6]),
                }
            }
        }
        ServerOpcode::Pause => ServerCommand::Pause {
            handle: f.single_handle()?,
        },
        ServerOpcode::Resume => ServerCommand::Resume {
            handle: f.single_handle()?,
        },
        ServerOpcode::Stop => ServerCommand::Stop {
            handle: f.single_handle()?,
        },
        ServerOpcode::Restart => ServerCommand::Restart {
            handle: f.single_handle()?,
        },
        ServerOpcode::GetPosition => {
            f.expect(&[3])?;
            ServerCommand::GetPosition {
                request_id: f.int(1)?,
                handle: f.int(2)?,
            }
        }
        ServerOpcode::SetPosition => {
            f.expect(&[3])?;
            let handle = f.int(1)?;
            let seconds = u32::try_from(f.int(2)?).map_err(|_| f.invalid(2))?;
            ServerCommand::SetPosition { handle, seconds }
        }
        ServerOpcode::SetVolume => {
            f.expect(&[3])?;
            let handle = f.int(1)?;
            let percent = f.float(2)?;
            if !(0.0..=100.0).contains(&percent) {
                return Err(f.invalid(2));
            }
            ServerCommand::SetVolume { handle, percent }
        }
        ServerOpcode::SetFX => {
            f.expect(&[3])?;
            ServerCommand::SetEffect {
                handle: f.int(1)?,
                slot: f.effect_slot(2)?,
            }
        }
        ServerOpcode::RemoveFX => {
            f.expect(&[3])?;
            ServerCommand::RemoveEffect {
                handle: f.int(1)?,
                slot: f.effect_slot(2)?,
            }
        }
        ServerOpcode::Set3DPosition => {
            f.expect(&[6])?;
            ServerCommand::Set3DPosition {
                handle: f.int(1)?,
                x: f.float(2)?,
                y: f.float(3)?,
                z: f.float(4)?,
                max_distance: f.float(5)?,
            }
        }
        ServerOpcode::Remove3DPosition => ServerCommand::Remove3DPosition {
            handle: f.single_handle()?,
        },
        ServerOpcode::GetRadioStation => {
            f.expect(&[1])?;
            ServerCommand::GetRadioStation
        }
        ServerOpcode::SetRadioStation => {
            f.expect(&[2])?;
            ServerCommand::SetRadioStation { station: f.int(1)? }
        }
        ServerOpcode::StopRadio => {
            f.expect(&[1])?;
            ServerCommand::StopRadio
        }
    };

    Ok(Inbound::Command(command))
}

struct Fields<'a> {
    opcode: ServerOpcode,
    fields: Vec<&'a str>,
}

impl Fields<'_> {
    fn expect(&self, counts: &'static [usize]) -> Result<usize, ProtocolError> {
        let got = self.fields.len();
        if counts.contains(&got) {
            Ok(got)
        } else {
            Err(ProtocolError::FieldCount {
                opcode: self.opcode,
                expected: counts,
                got,
            })
        }
    }

    fn invalid(&self, index: usize) -> ProtocolError {
        ProtocolError::InvalidField {
            opcode: self.opcode,
            index,
            value: self.fields[index].to_string(),
        }
    }

    fn text(&self, index: usize) -> String {
        self.fields[index].to_string()
    }

    fn optional_text(&self, index: usize) -> Option<String> {
        self.fields.get(index).map(|s| s.to_string())
    }

    fn int(&self, index: usize) -> Result<i32, ProtocolError> {
        self.fields[index]
            .parse::<i32>()
            .map_err(|_| self.invalid(index))
    }

    fn size(&self, index: usize) -> Result<u64, ProtocolError> {
        self.fields[index]
            .parse::<u64>()
            .map_err(|_| self.invalid(index))
    }

    fn float(&self, index: usize) -> Result<f32, ProtocolError> {
        match self.fields[index].parse::<f32>() {
            Ok(value) if value.is_finite() => Ok(value),
            _ => Err(self.invalid(index)),
        }
    }

    fn flag(&self, index: usize) -> Result<bool, ProtocolError> {
        match self.fields[index] {
            "0" => Ok(false),
            "1" => Ok(true),
            _ => Err(self.invalid(index)),
        }
    }

    fn playback_flags(&self, first: usize) -> Result<PlaybackFlags, ProtocolError> {
        Ok(PlaybackFlags {
            pause: self.flag(first)?,
            looped: self.flag(first + 1)?,
            downmix: self.flag(first + 2)?,
        })
    }

    fn effect_slot(&self, index: usize) -> Result<u8, ProtocolError> {
        u8::try_from(self.int(index)?)
            .ok()
            .filter(|slot| *slot <= MAX_EFFECT_SLOT)
            .ok_or_else(|| self.invalid(index))
    }

    fn single_handle(&self) -> Result<Handle, ProtocolError> {
        self.expect(&[2])?;
        self.int(1)
    }
}

/// Messages written to the server
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Reply to an empty inbound line
    Ack,
    Authenticate {
        name: String,
        version: String,
    },
    Transfer(TransferCode),
    Play {
        handle: Handle,
        code: PlayCode,
    },
    Sequence {
        sequence_id: i32,
        handle: Handle,
    },
    Stop {
        handle: Handle,
    },
    RadioStation {
        station: u8,
    },
    Track {
        handle: Handle,
        title: String,
    },
    Position {
        request_id: i32,
        handle: Handle,
        seconds: i64,
    },
}

impl ClientMessage {
    pub fn opcode(&self) -> Option<ClientOpcode> {
        match self {
            ClientMessage::Ack => None,
            ClientMessage::Authenticate { .. } => Some(ClientOpcode::Authenticate),
            ClientMessage::Transfer(_) => Some(ClientOpcode::Transfer),
            ClientMessage::Play { .. } => Some(ClientOpcode::Play),
            ClientMessage::Sequence { .. } => Some(ClientOpcode::Sequence),
            ClientMessage::Stop { .. } => Some(ClientOpcode::Stop),
            ClientMessage::RadioStation { .. } => Some(ClientOpcode::RadioStation),
            ClientMessage::Track { .. } => Some(ClientOpcode::Track),
            ClientMessage::Position { .. } => Some(ClientOpcode::Position),
        }
    }

    /// Serialize to a single newline-terminated line
    pub fn to_line(&self) -> String {
        let op = match self.opcode() {
            Some(opcode) => opcode as u8,
            None => return "\n".to_string(),
        };

        match self {
            ClientMessage::Ack => "\n".to_string(),
            ClientMessage::Authenticate { name, version } => {
                format!("{op}\t{}\t{}\n", sanitize(name), sanitize(version))
            }
            ClientMessage::Transfer(code) => format!("{op}\t{}\n", *code as u8),
            ClientMessage::Play { handle, code } => {
                format!("{op}\t{handle}\t{}\n", *code as u8)
            }
            ClientMessage::Sequence {
                sequence_id,
                handle,
            } => format!("{op}\t{sequence_id}\t{handle}\n"),
            ClientMessage::Stop { handle } => format!("{op}\t{handle}\n"),
            ClientMessage::RadioStation { station } => format!("{op}\t{station}\n"),
            ClientMessage::Track { handle, title } => {
                format!("{op}\t{handle}\t{}\n", sanitize(title))
            }
            ClientMessage::Position {
                request_id,
                handle,
                seconds,
            } => format!("{op}\t{request_id}\t{handle}\t{seconds}\n"),
        }
    }
}

/// Free text must not break framing
fn sanitize(text: &str) -> String {
    text.replace(['\t', '\n', '\r'], " ")
}
