//! File provisioning: decides how a requested file gets onto local storage
//! and tracks the single transfer that may be in flight.

use crate::config::Settings;
use audio_protocol::TransferRequest;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Sent by the server in place of upload bytes to abort a transfer
pub const CANCEL_TOKEN: &[u8] = b"CANCEL";

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("no download path specified")]
    NoDownloadDirectory,
    #[error("invalid file type")]
    InvalidFileType,
    #[error("illegal characters in file name")]
    IllegalCharacters,
    #[error("file transfer requests disabled")]
    TransfersDisabled,
    #[error("local file does not exist")]
    MissingLocalFile,
    #[error("another transfer is already in progress")]
    Busy,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server responded with HTTP {0}")]
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferMode {
    LocalUpload,
    RemoteDownload { url: String },
}

/// A file that is ready to be handed to the audio engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredFile {
    pub id: i32,
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug)]
pub struct PendingTransfer {
    pub file: RegisteredFile,
    pub expected_size: u64,
    pub bytes_written: u64,
    pub mode: TransferMode,
    handle: Option<File>,
}

/// Work the session has to start for a remote transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub url: String,
    pub file: RegisteredFile,
}

/// Result of evaluating a `Transfer` command
#[derive(Debug)]
pub enum TransferStart {
    Rejected(TransferError),
    /// The local copy is usable as is
    AlreadyPresent(RegisteredFile),
    /// The next `expected_size` bytes on the socket are file content
    Upload { expected_size: u64 },
    Download(DownloadJob),
}

#[derive(Debug)]
pub enum UploadProgress {
    Pending,
    Completed(RegisteredFile),
    Canceled(RegisteredFile),
    Failed(TransferError),
}

/// Outcome of feeding bytes to an upload. Bytes beyond `consumed` belong
/// to the command stream.
#[derive(Debug)]
pub struct UploadStep {
    pub progress: UploadProgress,
    pub consumed: usize,
}

pub struct TransferManager {
    settings: Arc<Settings>,
    active: Option<PendingTransfer>,
}

impl TransferManager {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            active: None,
        }
    }

    pub fn active(&self) -> Option<&PendingTransfer> {
        self.active.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// True while socket bytes must be routed to the upload instead of the
    /// line framer
    pub fn is_receiving_upload(&self) -> bool {
        matches!(
            self.active.as_ref().map(|t| &t.mode),
            Some(TransferMode::LocalUpload)
        )
    }

    /// Decide how to satisfy a transfer request
    pub async fn begin(
        &mut self,
        request: &TransferRequest,
        download_dir: Option<&Path>,
    ) -> TransferStart {
        if self.active.is_some() {
            return TransferStart::Rejected(TransferError::Busy);
        }
        let Some(dir) = download_dir else {
            return TransferStart::Rejected(TransferError::NoDownloadDirectory);
        };

        let remote_url = is_remote(&request.name).then(|| request.name.clone());
        let name = match &remote_url {
            Some(url) => remote_file_name(url),
            None => request.name.clone(),
        };

        if !self.settings.accepts_extension(&name) {
            return TransferStart::Rejected(TransferError::InvalidFileType);
        }
        if self.settings.contains_illegal_characters(&name) {
            return TransferStart::Rejected(TransferError::IllegalCharacters);
        }

        let file = RegisteredFile {
            id: request.file_id,
            path: dir.join(&name),
            name,
        };

        if remote_url.is_none() {
            let exists = tokio::fs::metadata(&file.path)
                .await
                .map(|meta| meta.is_file())
                .unwrap_or(false);

            if exists && !request.transferable {
                return TransferStart::AlreadyPresent(file);
            }
            if exists {
                match file_checksum(&file.path).await {
                    Ok(crc) if checksum_matches(&request.checksum, crc) => {
                        debug!("Checksum of {} matches, skipping transfer", file.name);
                        return TransferStart::AlreadyPresent(file);
                    }
                    Ok(crc) => debug!(
                        "Checksum of {} is {:08X}, server has {}",
                        file.name, crc, request.checksum
                    ),
                    Err(e) => warn!("Could not checksum {}: {}", file.path.display(), e),
                }
            } else if !request.transferable {
                return TransferStart::Rejected(TransferError::MissingLocalFile);
            }
        }

        if !self.settings.transfer_files {
            return TransferStart::Rejected(TransferError::TransfersDisabled);
        }

        match remote_url {
            Some(url) => {
                self.active = Some(PendingTransfer {
                    file: file.clone(),
                    expected_size: request.size,
                    bytes_written: 0,
                    mode: TransferMode::RemoteDownload { url: url.clone() },
                    handle: None,
                });
                TransferStart::Download(DownloadJob { url, file })
            }
            None => {
                let handle = match File::create(&file.path).await {
                    Ok(handle) => handle,
                    Err(e) => return TransferStart::Rejected(e.into()),
                };
                info!(
                    "📥 Receiving {} ({})",
                    file.name,
                    format_size(Some(request.size))
                );
                self.active = Some(PendingTransfer {
                    file,
                    expected_size: request.size,
                    bytes_written: 0,
                    mode: TransferMode::LocalUpload,
                    handle: Some(handle),
                });
                TransferStart::Upload {
                    expected_size: request.size,
                }
            }
        }
    }

    /// Feed socket bytes to the active upload. Never consumes more than the
    /// declared size.
    pub async fn write_upload(&mut self, bytes: &[u8]) -> UploadStep {
        if !self.is_receiving_upload() {
            return UploadStep {
                progress: UploadProgress::Pending,
                consumed: 0,
            };
        }

        if bytes.starts_with(CANCEL_TOKEN) {
            let mut consumed = CANCEL_TOKEN.len();
            if matches!(bytes.get(consumed), Some(b'\0' | b'\n')) {
                consumed += 1;
            }
            let progress = match self.abandon().await {
                Some(file) => UploadProgress::Canceled(file),
                None => UploadProgress::Pending,
            };
            return UploadStep { progress, consumed };
        }

        let (write_result, consumed, complete) = {
            let Some(active) = self.active.as_mut() else {
                return UploadStep {
                    progress: UploadProgress::Pending,
                    consumed: 0,
                };
            };
            let remaining = active.expected_size.saturating_sub(active.bytes_written);
            let take = usize::try_from(remaining)
                .unwrap_or(usize::MAX)
                .min(bytes.len());

            let write_result = match active.handle.as_mut() {
                Some(handle) if take > 0 => handle.write_all(&bytes[..take]).await,
                _ => Ok(()),
            };
            if write_result.is_ok() {
                active.bytes_written += take as u64;
            }
            let complete = active.bytes_written >= active.expected_size;
            (write_result, take, complete)
        };

        if let Err(e) = write_result {
            self.abandon().await;
            return UploadStep {
                progress: UploadProgress::Failed(e.into()),
                consumed,
            };
        }
        if !complete {
            return UploadStep {
                progress: UploadProgress::Pending,
                consumed,
            };
        }

        let progress = match self.active.take() {
            Some(mut transfer) => match finish_file(transfer.handle.take()).await {
                Ok(()) => UploadProgress::Completed(transfer.file),
                Err(e) => {
                    remove_partial(&transfer.file.path).await;
                    UploadProgress::Failed(e.into())
                }
            },
            None => UploadProgress::Pending,
        };
        UploadStep { progress, consumed }
    }

    /// Clear a finished remote transfer
    pub fn finish_download(&mut self) -> Option<RegisteredFile> {
        match self.active.take() {
            Some(PendingTransfer {
                mode: TransferMode::RemoteDownload { .. },
                file,
                ..
            }) => Some(file),
            other => {
                self.active = other;
                None
            }
        }
    }

    /// Drop the active transfer and remove whatever part of its file reached
    /// the disk. The download task writing a remote file must already be
    /// stopped.
    pub async fn abandon(&mut self) -> Option<RegisteredFile> {
        let mut transfer = self.active.take()?;
        drop(transfer.handle.take());
        remove_partial(&transfer.file.path).await;
        Some(transfer.file)
    }
}

async fn finish_file(handle: Option<File>) -> std::io::Result<()> {
    if let Some(mut handle) = handle {
        handle.flush().await?;
    }
    Ok(())
}

pub(crate) async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Failed to remove partial file {}: {}", path.display(), e);
        }
    }
}

/// `http://` or `https://`, any case
pub fn is_remote(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Local file name for a URL: everything after the last `/`
pub fn remote_file_name(url: &str) -> String {
    url.rsplit('/').next().unwrap_or_default().to_string()
}

/// CRC-32 (IEEE) of a file's contents
pub async fn file_checksum(path: &Path) -> std::io::Result<u32> {
    let mut file = File::open(path).await?;
    let mut hasher = crc32fast::Hasher::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize())
}

/// Compare a server checksum (hex, any case) numerically
pub fn checksum_matches(declared: &str, actual: u32) -> bool {
    u32::from_str_radix(declared.trim(), 16)
        .map(|declared| declared == actual)
        .unwrap_or(false)
}

pub fn format_size(bytes: Option<u64>) -> String {
    match bytes {
        None => "Unknown Size".to_string(),
        Some(bytes) if bytes < 1024 => format!("{bytes} bytes"),
        Some(bytes) if bytes < 1024 * 1024 => format!("{:.1} KB", bytes as f64 / 1024.0),
        Some(bytes) => format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0)),
    }
}
