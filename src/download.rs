//! HTTP pull for remote transfers.

use crate::transfer::{format_size, remove_partial, DownloadJob, TransferError};
use futures_util::StreamExt;
use log::{debug, info};
use reqwest::Client;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The local copy already has the advertised size
    AlreadyPresent,
    Completed { bytes: u64 },
}

/// `read_timeout` bounds each wait for body bytes so a stalled server frees
/// the transfer slot
pub fn http_client(
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, reqwest::Error> {
    Client::builder()
        .connect_timeout(connect_timeout)
        .read_timeout(read_timeout)
        .user_agent(concat!("audio-plugin/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Stream `job.url` into `job.file.path` until the body ends.
/// A partial file is removed on failure.
pub async fn fetch(client: &Client, job: &DownloadJob) -> Result<DownloadOutcome, TransferError> {
    let url = url::Url::parse(&job.url)?;
    let response = client.get(url).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(TransferError::Status(status.as_u16()));
    }

    let remote_size = response.content_length();
    if let (Some(size), Ok(meta)) = (remote_size, tokio::fs::metadata(&job.file.path).await) {
        if meta.is_file() && meta.len() == size {
            debug!("{} already has the remote size, skipping", job.file.name);
            return Ok(DownloadOutcome::AlreadyPresent);
        }
    }

    info!(
        "🌐 Downloading {} ({})",
        job.url,
        format_size(remote_size)
    );

    let result = stream_to_file(response, job).await;
    if result.is_err() {
        remove_partial(&job.file.path).await;
    }
    result
}

async fn stream_to_file(
    response: reqwest::Response,
    job: &DownloadJob,
) -> Result<DownloadOutcome, TransferError> {
    let mut file = tokio::fs::File::create(&job.file.path).await?;
    let mut body = response.bytes_stream();
    let mut bytes = 0u64;

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        bytes += chunk.len() as u64;
    }
    file.flush().await?;

    Ok(DownloadOutcome::Completed { bytes })
}
