//! The single event loop that owns all client state.
//!
//! Socket reads, timers, connects and downloads run as small spawned tasks
//! that report back over one channel. Every report is tagged with the
//! connection epoch it was started in; teardown bumps the epoch so late
//! results from a dead connection are dropped instead of acted on.

use crate::config::{ServerAddress, Settings, PLUGIN_VERSION};
use crate::connection::{
    Connection, ConnectionEffect, ConnectionEvent, ConnectionState, RetryPolicy,
};
use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::download::{self, DownloadOutcome};
use crate::error::Result;
use crate::host::{Host, HostEventReceiver};
use crate::outbound::{OutboundQueue, OutboundWriter};
use crate::transfer::{format_size, TransferError, TransferManager, UploadProgress};
use audio_protocol::{ClientMessage, LineFramer, TransferCode};
use log::{debug, info, warn};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// How long shutdown waits for queued lines to reach the socket
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
enum SessionEvent {
    Resolved(io::Result<Vec<SocketAddr>>),
    AttemptDue,
    Connected(TcpStream),
    ConnectFailed { endpoint: SocketAddr, reason: String },
    Received(Vec<u8>),
    ReadClosed(Option<io::Error>),
    Written,
    WriteFailed(io::Error),
    DownloadFinished(std::result::Result<DownloadOutcome, TransferError>),
}

struct Tagged {
    epoch: u64,
    event: SessionEvent,
}

#[derive(Clone)]
struct EventSender {
    epoch: u64,
    tx: mpsc::UnboundedSender<Tagged>,
}

impl EventSender {
    fn send(&self, event: SessionEvent) {
        let _ = self.tx.send(Tagged {
            epoch: self.epoch,
            event,
        });
    }
}

/// Tasks that belong to one connection cycle
#[derive(Default)]
struct ConnectionTasks {
    resolve: Option<JoinHandle<()>>,
    attempt: Option<JoinHandle<()>>,
    connect: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    download: Option<JoinHandle<()>>,
}

impl ConnectionTasks {
    fn abort_all(&mut self) {
        let tasks = [
            self.resolve.take(),
            self.attempt.take(),
            self.connect.take(),
            self.reader.take(),
            self.download.take(),
        ];
        for task in tasks.into_iter().flatten() {
            task.abort();
        }
    }
}

pub struct Session {
    settings: Arc<Settings>,
    server: ServerAddress,
    host: Host,
    host_events: HostEventReceiver,
    connection: Connection,
    dispatcher: Dispatcher,
    transfers: TransferManager,
    framer: LineFramer,
    outbound: OutboundQueue,
    http: reqwest::Client,
    epoch: u64,
    events_tx: mpsc::UnboundedSender<Tagged>,
    events_rx: mpsc::UnboundedReceiver<Tagged>,
    tasks: ConnectionTasks,
    /// Kept past teardown so queued lines can still drain
    writer: Option<JoinHandle<()>>,
    pending_stream: Option<TcpStream>,
}

impl Session {
    pub fn new(
        settings: Settings,
        server: ServerAddress,
        player_name: impl Into<String>,
        host: Host,
        host_events: HostEventReceiver,
    ) -> Result<Self> {
        let settings = Arc::new(settings);
        let http = download::http_client(settings.connect_timeout(), settings.network_timeout())?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            connection: Connection::new(RetryPolicy::from(settings.as_ref())),
            dispatcher: Dispatcher::new(settings.clone(), player_name),
            transfers: TransferManager::new(settings.clone()),
            settings,
            server,
            host,
            host_events,
            framer: LineFramer::new(),
            outbound: OutboundQueue::detached(),
            http,
            epoch: 0,
            events_tx,
            events_rx,
            tasks: ConnectionTasks::default(),
            writer: None,
            pending_stream: None,
        })
    }

    /// Drive the client until `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("🚀 Audio client starting, server is {}", self.server);
        let mut ticker = tokio::time::interval(self.settings.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let ready = self.host.game.is_session_ready();
                    self.apply(ConnectionEvent::Tick { now: Instant::now(), ready }).await;
                }
                Some(tagged) = self.events_rx.recv() => {
                    if tagged.epoch == self.epoch {
                        self.on_event(tagged.event).await;
                    } else {
                        debug!("Dropping stale event from epoch {}", tagged.epoch);
                    }
                }
                Some(event) = self.host_events.recv() => {
                    self.dispatcher.handle_host_event(event, &mut self.host, &self.outbound);
                }
            }
        }

        self.shutdown().await;
    }

    fn sender(&self) -> EventSender {
        EventSender {
            epoch: self.epoch,
            tx: self.events_tx.clone(),
        }
    }

    async fn apply(&mut self, event: ConnectionEvent) {
        for effect in self.connection.handle(event) {
            self.execute(effect).await;
        }
    }

    async fn execute(&mut self, effect: ConnectionEffect) {
        match effect {
            ConnectionEffect::Resolve => self.spawn_resolve(),
            ConnectionEffect::ScheduleAttempt { delay } => {
                if let Some(previous) = self.tasks.attempt.take() {
                    previous.abort();
                }
                let events = self.sender();
                self.tasks.attempt = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    events.send(SessionEvent::AttemptDue);
                }));
            }
            ConnectionEffect::Connect { endpoint, timeout } => self.spawn_connect(endpoint, timeout),
            ConnectionEffect::BeginSession { endpoint } => self.begin_session(endpoint),
            ConnectionEffect::Teardown { was_connected } => self.teardown(was_connected).await,
        }
    }

    async fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Resolved(Ok(endpoints)) => {
                debug!("{} resolved to {:?}", self.server, endpoints);
                self.apply(ConnectionEvent::Resolved(endpoints)).await;
            }
            SessionEvent::Resolved(Err(e)) => {
                warn!("Could not resolve {}: {}", self.server, e);
                self.apply(ConnectionEvent::ResolveFailed).await;
            }
            SessionEvent::AttemptDue => {
                let ready = self.host.game.is_session_ready();
                self.apply(ConnectionEvent::AttemptDue { ready }).await;
            }
            SessionEvent::Connected(stream) => {
                self.pending_stream = Some(stream);
                self.apply(ConnectionEvent::ConnectSucceeded {
                    now: Instant::now(),
                })
                .await;
            }
            SessionEvent::ConnectFailed { endpoint, reason } => {
                self.host
                    .program
                    .log_line(&format!("Could not connect to {endpoint}: {reason}"));
                self.apply(ConnectionEvent::ConnectFailed).await;
            }
            SessionEvent::Received(bytes) => {
                self.apply(ConnectionEvent::Activity {
                    now: Instant::now(),
                })
                .await;
                self.ingest(bytes).await;
            }
            SessionEvent::ReadClosed(reason) => {
                if self.transfers.is_receiving_upload() {
                    if let Some(file) = self.transfers.abandon().await {
                        self.host.program.log_line(&format!(
                            "Transfer of \"{}\" failed: connection closed",
                            file.name
                        ));
                    }
                    self.outbound
                        .send(ClientMessage::Transfer(TransferCode::Error));
                }
                match reason {
                    Some(e) => warn!("❌ Read failed: {}", e),
                    None => info!("Server closed the connection"),
                }
                self.apply(ConnectionEvent::TransportFailed).await;
            }
            SessionEvent::Written => {
                self.apply(ConnectionEvent::Activity {
                    now: Instant::now(),
                })
                .await;
            }
            SessionEvent::WriteFailed(e) => {
                warn!("❌ Write failed: {}", e);
                self.apply(ConnectionEvent::TransportFailed).await;
            }
            SessionEvent::DownloadFinished(result) => self.finish_download(result),
        }
    }

    fn spawn_resolve(&mut self) {
        let target = self.server.to_string();
        let limit = self.settings.connect_timeout();
        let events = self.sender();
        self.tasks.resolve = Some(tokio::spawn(async move {
            let result = resolve_endpoints(tokio::net::lookup_host(target), limit).await;
            events.send(SessionEvent::Resolved(result));
        }));
    }

    fn spawn_connect(&mut self, endpoint: SocketAddr, timeout: Duration) {
        if let ConnectionState::Connecting(plan) = self.connection.state() {
            self.host.program.log_line(&format!(
                "Connecting to {} (attempt {} of {})",
                endpoint,
                plan.attempt(),
                self.connection.policy().connect_attempts
            ));
        }

        let events = self.sender();
        self.tasks.connect = Some(tokio::spawn(async move {
            let event = match tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await {
                Ok(Ok(stream)) => SessionEvent::Connected(stream),
                Ok(Err(e)) => SessionEvent::ConnectFailed {
                    endpoint,
                    reason: e.to_string(),
                },
                Err(_) => SessionEvent::ConnectFailed {
                    endpoint,
                    reason: "connection timed out".to_string(),
                },
            };
            events.send(event);
        }));
    }

    fn begin_session(&mut self, endpoint: SocketAddr) {
        let Some(stream) = self.pending_stream.take() else {
            warn!("Connected to {} but the socket is gone", endpoint);
            return;
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }
        let (read_half, write_half) = stream.into_split();

        if let Some(previous) = self.writer.take() {
            previous.abort();
        }
        let (queue, rx) = OutboundQueue::channel();
        let events = self.sender();
        self.writer = Some(tokio::spawn(async move {
            let written = events.clone();
            let result = OutboundWriter::new(write_half, rx)
                .run(move |_| written.send(SessionEvent::Written))
                .await;
            if let Err(e) = result {
                events.send(SessionEvent::WriteFailed(e));
            }
        }));
        self.tasks.reader = Some(tokio::spawn(read_loop(read_half, self.sender())));
        self.outbound = queue;

        self.host
            .program
            .log_line(&format!("Connected to {endpoint}"));
        self.outbound.send(ClientMessage::Authenticate {
            name: self.dispatcher.player_name().to_string(),
            version: PLUGIN_VERSION.to_string(),
        });
    }

    /// Route received bytes to the active upload or the command parser.
    /// A single read can end one upload and carry the next commands.
    async fn ingest(&mut self, bytes: Vec<u8>) {
        let mut pending = bytes;
        loop {
            if self.transfers.is_receiving_upload() {
                let step = self.transfers.write_upload(&pending).await;
                pending.drain(..step.consumed.min(pending.len()));
                match step.progress {
                    UploadProgress::Pending => return,
                    UploadProgress::Completed(file) => {
                        self.host
                            .program
                            .log_line(&format!("Transfer of \"{}\" complete", file.name));
                        self.host
                            .audio
                            .register_file(file.id, &file.name, &file.path);
                    }
                    UploadProgress::Canceled(file) => {
                        self.host
                            .program
                            .log_line(&format!("Transfer of \"{}\" canceled", file.name));
                    }
                    UploadProgress::Failed(e) => {
                        self.host
                            .program
                            .log_line(&format!("Transfer failed: {e}"));
                        self.outbound
                            .send(ClientMessage::Transfer(TransferCode::Error));
                    }
                }
            }

            if !pending.is_empty() {
                self.framer.push(&pending);
                pending.clear();
            }

            while let Some(line) = self.framer.next_line() {
                let outcome = self
                    .dispatcher
                    .handle_line(&line, &mut self.host, &self.outbound, &mut self.transfers)
                    .await;
                self.apply_outcome(outcome);
                if self.transfers.is_receiving_upload() {
                    break;
                }
            }

            if !self.transfers.is_receiving_upload() {
                return;
            }
            pending = self.framer.take_remaining();
        }
    }

    fn apply_outcome(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Done => {}
            DispatchOutcome::Authenticated => {
                if self.connection.mark_authenticated() {
                    self.host.program.log_line("Authenticated with server");
                }
            }
            DispatchOutcome::UploadStarted { expected_size } => {
                debug!("Upload of {} started", format_size(Some(expected_size)));
            }
            DispatchOutcome::DownloadRequested(job) => {
                let client = self.http.clone();
                let events = self.sender();
                self.tasks.download = Some(tokio::spawn(async move {
                    let result = download::fetch(&client, &job).await;
                    events.send(SessionEvent::DownloadFinished(result));
                }));
            }
        }
    }

    fn finish_download(
        &mut self,
        result: std::result::Result<DownloadOutcome, TransferError>,
    ) {
        self.tasks.download = None;
        let Some(file) = self.transfers.finish_download() else {
            return;
        };

        match result {
            Ok(DownloadOutcome::AlreadyPresent) => {
                self.outbound
                    .send(ClientMessage::Transfer(TransferCode::Check));
                self.host
                    .audio
                    .register_file(file.id, &file.name, &file.path);
            }
            Ok(DownloadOutcome::Completed { bytes }) => {
                self.host.program.log_line(&format!(
                    "Downloaded \"{}\" ({})",
                    file.name,
                    format_size(Some(bytes))
                ));
                self.outbound
                    .send(ClientMessage::Transfer(TransferCode::Remote));
                self.host
                    .audio
                    .register_file(file.id, &file.name, &file.path);
            }
            Err(e) => {
                self.host
                    .program
                    .log_line(&format!("Download of \"{}\" failed: {}", file.name, e));
                self.outbound
                    .send(ClientMessage::Transfer(TransferCode::Error));
            }
        }
    }

    async fn teardown(&mut self, was_connected: bool) {
        self.epoch += 1;
        self.tasks.abort_all();
        self.pending_stream = None;
        self.framer.clear();
        // Dropping the queue lets the writer flush what is queued, then close
        self.outbound = OutboundQueue::detached();

        if let Some(file) = self.transfers.abandon().await {
            debug!("Abandoned transfer of {}", file.name);
        }
        if was_connected {
            self.dispatcher.reset(&mut self.host);
            self.host.program.log_line("Disconnected from server");
        }
    }

    async fn shutdown(&mut self) {
        info!("🛑 Shutting down");
        self.apply(ConnectionEvent::Close).await;
        self.tasks.abort_all();

        if let Some(writer) = self.writer.take() {
            let abort = writer.abort_handle();
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer)
                .await
                .is_err()
            {
                warn!("Outbound queue did not drain in time");
                abort.abort();
            }
        }
    }
}

/// Run an address lookup with a deadline. IPv4 endpoints come first.
async fn resolve_endpoints<F, I>(lookup: F, limit: Duration) -> io::Result<Vec<SocketAddr>>
where
    F: Future<Output = io::Result<I>>,
    I: Iterator<Item = SocketAddr>,
{
    let addrs = tokio::time::timeout(limit, lookup)
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "address lookup timed out"))??;
    let mut endpoints: Vec<SocketAddr> = addrs.collect();
    endpoints.sort_by_key(|addr| !addr.is_ipv4());
    endpoints.dedup();
    Ok(endpoints)
}

async fn read_loop(mut reader: OwnedReadHalf, events: EventSender) {
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => {
                events.send(SessionEvent::ReadClosed(None));
                return;
            }
            Ok(n) => events.send(SessionEvent::Received(buffer[..n].to_vec())),
            Err(e) => {
                events.send(SessionEvent::ReadClosed(Some(e)));
                return;
            }
        }
    }
}
