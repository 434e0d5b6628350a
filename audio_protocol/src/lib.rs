//! # Audio Protocol
//!
//! Wire format spoken between the audio plugin and its game server.
//!
//! Every message is one line of tab-separated ASCII fields terminated by
//! `\n`; the first field is a numeric opcode. Binary file uploads are the
//! only exception and travel unframed on the same socket.
//!
//! This crate provides:
//! - [`framing`]: turns raw socket reads into complete lines
//! - [`protocol`]: opcode tables, validated inbound commands, outbound lines
//!
//! ## Example Usage
//!
//! ```rust
//! use audio_protocol::{parse_line, ClientMessage, Inbound, LineFramer, TransferCode};
//!
//! let mut framer = LineFramer::new();
//! framer.push(b"1\tWelcome!\n8\t");
//!
//! for line in framer.lines() {
//!     if let Ok(Inbound::Command(command)) = parse_line(&line) {
//!         println!("{:?}", command);
//!     }
//! }
//!
//! assert_eq!(ClientMessage::Transfer(TransferCode::Check).to_line(), "1\t2\n");
//! ```

pub mod framing;
pub mod protocol;

pub use framing::{split_fields, LineFramer};
pub use protocol::{
    parse_line, ClientMessage, ClientOpcode, Handle, Inbound, PlayCode, PlayCommand,
    PlaybackFlags, ProtocolError, SequenceBatch, SequenceEnd, ServerCommand, ServerOpcode,
    TransferCode, TransferRequest,
};
