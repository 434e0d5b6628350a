pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod download;
pub mod error;
pub mod host;
pub mod outbound;
pub mod session;
pub mod streams;
pub mod test_utils;
pub mod transfer;

pub use audio_protocol;
pub use error::{PluginError, Result};
pub use session::Session;
