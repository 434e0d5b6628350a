#![allow(dead_code)]

use audio_plugin_rs::config::{ServerAddress, Settings};
use audio_plugin_rs::host::{event_channel, HostEventSender};
use audio_plugin_rs::test_utils::{recording_host, Recorder};
use audio_plugin_rs::Session;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Fast timers so tests do not wait on production defaults
pub fn test_settings() -> Settings {
    Settings {
        connect_delay_ms: 10,
        connect_timeout_ms: 1_000,
        tick_interval_ms: 20,
        enable_logging: false,
        ..Settings::default()
    }
}

pub struct Fixture {
    pub session: Session,
    pub listener: TcpListener,
    pub recorder: Recorder,
    pub host_events: HostEventSender,
    pub save_dir: TempDir,
}

pub async fn fixture(settings: Settings) -> Fixture {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let save_dir = TempDir::new().unwrap();
    let (host, recorder) = recording_host(save_dir.path());
    let (host_events, events_rx) = event_channel();

    let session = Session::new(
        settings,
        ServerAddress::new("127.0.0.1", port).unwrap(),
        "Tester",
        host,
        events_rx,
    )
    .unwrap();

    Fixture {
        session,
        listener,
        recorder,
        host_events,
        save_dir,
    }
}

/// Poll `check` until it holds
pub async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(STEP_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition never became true");
}

pub fn file_len(path: &Path) -> Option<u64> {
    std::fs::metadata(path).ok().map(|meta| meta.len())
}

/// The server side of one accepted connection
pub struct ServerConn {
    reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

impl ServerConn {
    pub async fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        let (read_half, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer,
        }
    }

    /// Accept and consume the `Authenticate` line
    pub async fn accept_authenticated(listener: &TcpListener) -> Self {
        let mut conn = Self::accept(listener).await;
        let line = conn.read_line().await;
        assert!(line.starts_with("0\tTester\tv"), "unexpected greeting {line:?}");
        conn
    }

    /// Next line including its terminator; empty at end of stream
    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        tokio::time::timeout(STEP_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for a line")
            .unwrap();
        line
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.unwrap();
    }

    /// Serve one HTTP response with `body` on a fresh port and return its URL
    pub async fn http_file(path: &str, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            socket.write_all(header.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            let _ = socket.shutdown().await;
        });
        format!("http://{addr}/{path}")
    }

    /// Promise `declared` bytes but send only `body`, then stall
    pub async fn http_stalled_file(path: &str, declared: usize, body: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1024];
            let _ = socket.read(&mut request).await;
            let header = format!("HTTP/1.1 200 OK\r\nContent-Length: {declared}\r\n\r\n");
            socket.write_all(header.as_bytes()).await.unwrap();
            socket.write_all(body).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        });
        format!("http://{addr}/{path}")
    }
}
