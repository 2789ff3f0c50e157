// Reconnecting WebSocket client for the relay.
//
// One owned actor holds the only socket reference. Socket I/O runs on a
// per-connection task that reports back over a channel, tagged with the
// epoch of the socket it belongs to; events from a socket that has since been
// torn down are ignored, which is how a forced reconnect keeps the old
// socket's close from scheduling a second reconnect.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::SettingsStore;
use crate::protocol::JobFrame;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Fixed delay between a close and the next connection attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long a torn-down socket gets to finish its close handshake before its
/// task is aborted.
const TEARDOWN_GRACE: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug)]
enum ClientCommand {
    Send(String),
    Reconnect,
}

#[derive(Debug)]
enum SocketEvent {
    Opened,
    Frame(String),
    Errored(String),
    Closed,
}

/// Cloneable handle to a running client.
#[derive(Clone)]
pub struct ClientHandle {
    cmd_tx: mpsc::Sender<ClientCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    attempts: Arc<AtomicU64>,
}

impl ClientHandle {
    /// Serialize `data` to JSON and send it if the connection is open.
    /// When it is not, the message is dropped with a warning.
    pub async fn send<T: Serialize>(&self, data: &T) -> anyhow::Result<()> {
        let text = serde_json::to_string(data)?;
        self.cmd_tx
            .send(ClientCommand::Send(text))
            .await
            .map_err(|_| anyhow::anyhow!("client is not running"))
    }

    /// Tear down the current connection and connect again immediately.
    pub async fn reconnect(&self) -> anyhow::Result<()> {
        self.cmd_tx
            .send(ClientCommand::Reconnect)
            .await
            .map_err(|_| anyhow::anyhow!("client is not running"))
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Total number of connection attempts started so far.
    pub fn connect_attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// ReconnectingClient
// ---------------------------------------------------------------------------

struct ActiveSocket {
    epoch: u64,
    outbound: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

pub struct ReconnectingClient {
    url: String,
    settings_rx: watch::Receiver<String>,
    jobs_tx: mpsc::Sender<JobFrame>,
    cmd_rx: mpsc::Receiver<ClientCommand>,
    events_tx: mpsc::UnboundedSender<(u64, SocketEvent)>,
    events_rx: mpsc::UnboundedReceiver<(u64, SocketEvent)>,
    /// The one live socket, connected or still connecting.
    socket: Option<ActiveSocket>,
    epoch: u64,
    /// Deadline of the single pending reconnect timer, if any.
    reconnect_at: Option<Instant>,
    state_tx: watch::Sender<ConnectionState>,
    attempts: Arc<AtomicU64>,
}

impl ReconnectingClient {
    /// Build a client that follows the server address published on
    /// `settings_rx` and forwards parsed job frames to `jobs_tx`.
    pub fn new(
        mut settings_rx: watch::Receiver<String>,
        jobs_tx: mpsc::Sender<JobFrame>,
    ) -> (Self, ClientHandle) {
        let url = settings_rx.borrow_and_update().clone();
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let attempts = Arc::new(AtomicU64::new(0));

        let client = Self {
            url,
            settings_rx,
            jobs_tx,
            cmd_rx,
            events_tx,
            events_rx,
            socket: None,
            epoch: 0,
            reconnect_at: None,
            state_tx,
            attempts: attempts.clone(),
        };
        let handle = ClientHandle {
            cmd_tx,
            state_rx,
            attempts,
        };
        (client, handle)
    }

    /// Build a client from the persisted settings, subscribed to their changes.
    pub fn init(store: &SettingsStore, jobs_tx: mpsc::Sender<JobFrame>) -> (Self, ClientHandle) {
        Self::new(store.subscribe(), jobs_tx)
    }

    /// Spawn the client's event loop and return its handle.
    pub fn spawn(
        settings_rx: watch::Receiver<String>,
        jobs_tx: mpsc::Sender<JobFrame>,
    ) -> ClientHandle {
        let (client, handle) = Self::new(settings_rx, jobs_tx);
        tokio::spawn(async move {
            if let Err(e) = client.run().await {
                error!("Relay client stopped: {e}");
            }
        });
        handle
    }

    /// Run until every `ClientHandle` has been dropped.
    pub async fn run(mut self) -> anyhow::Result<()> {
        info!("Relay client started");
        self.connect();

        let mut settings_open = true;

        loop {
            tokio::select! {
                changed = self.settings_rx.changed(), if settings_open => {
                    match changed {
                        Ok(()) => {
                            let url = self.settings_rx.borrow_and_update().clone();
                            info!("Server address changed to {url}, reconnecting");
                            self.url = url;
                            self.reconnect();
                        }
                        Err(_) => {
                            debug!("Settings channel closed; keeping {}", self.url);
                            settings_open = false;
                        }
                    }
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(ClientCommand::Send(text)) => self.send(text),
                        Some(ClientCommand::Reconnect) => self.reconnect(),
                        None => break,
                    }
                }

                Some((epoch, event)) = self.events_rx.recv() => {
                    self.handle_socket_event(epoch, event).await;
                }

                _ = tokio::time::sleep_until(self.reconnect_at.unwrap_or_else(Instant::now)),
                    if self.reconnect_at.is_some() =>
                {
                    self.reconnect_at = None;
                    self.connect();
                }
            }
        }

        self.teardown();
        info!("Relay client stopped");
        Ok(())
    }

    /// Start a connection attempt unless a socket is open or in flight.
    fn connect(&mut self) {
        if self.socket.is_some() {
            return;
        }

        self.epoch += 1;
        let epoch = self.epoch;
        self.attempts.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to {}", self.url);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive_socket(
            self.url.clone(),
            epoch,
            self.events_tx.clone(),
            outbound_rx,
        ));
        self.socket = Some(ActiveSocket {
            epoch,
            outbound,
            task,
        });
    }

    /// Drop the current socket without scheduling a reconnect, then connect.
    fn reconnect(&mut self) {
        self.teardown();
        self.set_state(ConnectionState::Disconnected);
        self.connect();
    }

    fn send(&self, text: String) {
        match &self.socket {
            Some(socket) if self.state() == ConnectionState::Connected => {
                if socket.outbound.send(Message::Text(text.into())).is_err() {
                    warn!("Cannot send, socket task has exited");
                }
            }
            _ => warn!("Cannot send, WebSocket not open"),
        }
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_some() {
            return;
        }
        self.reconnect_at = Some(Instant::now() + RECONNECT_DELAY);
    }

    fn teardown(&mut self) {
        let Some(ActiveSocket {
            epoch,
            outbound,
            task,
        }) = self.socket.take()
        else {
            return;
        };
        debug!("Tearing down socket epoch {epoch}");
        // Closing the outbound queue makes the socket task send a close frame.
        drop(outbound);
        let abort = task.abort_handle();
        tokio::spawn(async move {
            if tokio::time::timeout(TEARDOWN_GRACE, task).await.is_err() {
                abort.abort();
            }
        });
    }

    async fn handle_socket_event(&mut self, epoch: u64, event: SocketEvent) {
        if self.socket.as_ref().map(|s| s.epoch) != Some(epoch) {
            debug!("Ignoring {event:?} from stale socket epoch {epoch}");
            return;
        }

        match event {
            SocketEvent::Opened => {
                info!("WebSocket connected to {}", self.url);
                self.set_state(ConnectionState::Connected);
            }
            SocketEvent::Frame(text) => self.handle_frame(&text).await,
            SocketEvent::Errored(e) => {
                error!("WebSocket error: {e}");
            }
            SocketEvent::Closed => {
                info!(
                    "WebSocket disconnected, retrying in {}s...",
                    RECONNECT_DELAY.as_secs()
                );
                self.socket = None;
                self.set_state(ConnectionState::Disconnected);
                self.schedule_reconnect();
            }
        }
    }

    async fn handle_frame(&self, text: &str) {
        let job: JobFrame = match serde_json::from_str(text) {
            Ok(job) => job,
            Err(e) => {
                warn!("Failed to parse message: {text}: {e}");
                return;
            }
        };
        debug!("Received job for {}", job.url);
        if self.jobs_tx.send(job).await.is_err() {
            warn!("Job receiver dropped; discarding frame");
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

/// Connect, then shuttle frames both ways until the socket ends or the
/// outbound queue is closed. Always finishes by reporting `Closed`.
async fn drive_socket(
    url: String,
    epoch: u64,
    events: mpsc::UnboundedSender<(u64, SocketEvent)>,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    let report = |event: SocketEvent| {
        let _ = events.send((epoch, event));
    };

    let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            report(SocketEvent::Errored(e.to_string()));
            report(SocketEvent::Closed);
            return;
        }
    };
    report(SocketEvent::Opened);

    let (mut write, mut read) = ws.split();
    loop {
        tokio::select! {
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => report(SocketEvent::Frame(text.to_string())),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    report(SocketEvent::Errored(e.to_string()));
                    break;
                }
                Some(Ok(_)) => {}
            },
            queued = outbound.recv() => match queued {
                Some(msg) => {
                    if let Err(e) = write.send(msg).await {
                        report(SocketEvent::Errored(e.to_string()));
                        break;
                    }
                }
                None => {
                    let _ = write.close().await;
                    break;
                }
            },
        }
    }

    report(SocketEvent::Closed);
}
