//! Newline framing for the command channel.
//!
//! Socket reads arrive in arbitrary chunks. A chunk can hold zero, one or many
//! complete lines and usually ends in the middle of one, so the unterminated
//! tail is kept and completed by the next read.

use log::warn;

/// Upper bound on a single unterminated line before it is discarded.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Accumulates raw bytes and yields complete `\n`-terminated lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    buffer: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk read from the socket
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);

        if self.buffer.len() > MAX_LINE_LENGTH && !self.buffer.contains(&b'\n') {
            warn!(
                "⚠️ Discarding {} buffered bytes without a line terminator",
                self.buffer.len()
            );
            self.buffer.clear();
        }
    }

    /// Pop the next complete line, without its terminator.
    /// Returns `None` once only an incomplete fragment (or nothing) is left.
    pub fn next_line(&mut self) -> Option<String> {
        let end = self.buffer.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buffer.drain(..=end).collect();
        Some(String::from_utf8_lossy(&line[..end]).into_owned())
    }

    /// Lazily drain every complete line currently buffered
    pub fn lines(&mut self) -> Lines<'_> {
        Lines { framer: self }
    }

    /// Hand the buffered bytes to someone else (a binary transfer that starts
    /// right after a command line) and leave the framer empty.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Number of buffered bytes not yet returned as a line
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Iterator returned by [`LineFramer::lines`]
pub struct Lines<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Lines<'_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        self.framer.next_line()
    }
}

/// Split one command line into its tab-separated fields
pub fn split_fields(line: &str) -> Vec<&str> {
    line.split('\t').collect()
}
