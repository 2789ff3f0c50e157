// Local relay: accepts WebSocket clients and rebroadcasts every valid JSON
// frame to all of them, the sender included.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use futures_util::stream::Stream;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Identifier the hub assigns to each accepted connection.
pub type ConnectionId = u64;

/// Broadcast hub shared by every connection task.
///
/// Each registered client is represented by the sending half of its outbound
/// queue; a writer task per connection drains that queue into the socket. A
/// client whose queue is closed is no longer open and is pruned on the next
/// broadcast.
#[derive(Clone, Default)]
pub struct RelayHub {
    clients: Arc<Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Message>>>>,
    next_id: Arc<AtomicU64>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outbound queue and return its connection id.
    pub fn register(&self, tx: mpsc::UnboundedSender<Message>) -> ConnectionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, tx);
        id
    }

    pub fn unregister(&self, id: ConnectionId) {
        self.lock().remove(&id);
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.lock().len()
    }

    /// Queue `text` to every open client. Returns how many received it.
    pub fn broadcast(&self, text: &str) -> usize {
        let mut clients = self.lock();
        let mut delivered = 0;
        clients.retain(|id, tx| {
            if tx.send(Message::Text(text.into())).is_ok() {
                delivered += 1;
                true
            } else {
                debug!("Pruning closed client {id}");
                false
            }
        });
        delivered
    }

    /// Validate one inbound text frame and broadcast it.
    ///
    /// Returns the number of clients the frame went to, or `None` if the
    /// frame was not valid JSON (it is logged and discarded).
    pub fn handle_frame(&self, text: &str, addr: &str) -> Option<usize> {
        debug!("Frame from {addr}: {text}");
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!("Discarding non-JSON frame from {addr}: {e}");
                return None;
            }
        };
        let serialized = value.to_string();
        Some(self.broadcast(&serialized))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, mpsc::UnboundedSender<Message>>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Bind the relay listener.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("Relay listening on ws://{}", listener.local_addr()?);
    Ok(listener)
}

/// Pause after a failed accept before trying again.
pub const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Source of inbound byte streams for the accept loop.
#[async_trait]
pub trait ConnectionSource: Send {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&mut self) -> std::io::Result<(Self::Stream, SocketAddr)>;
}

#[async_trait]
impl ConnectionSource for TcpListener {
    type Stream = TcpStream;

    async fn accept(&mut self) -> std::io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// Accept connections forever, serving each on its own task. Accept errors
/// are logged and retried after `ACCEPT_RETRY`; they never end the loop.
pub async fn run<L: ConnectionSource>(mut listener: L, hub: RelayHub) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Failed to accept connection: {e}");
                tokio::time::sleep(ACCEPT_RETRY).await;
                continue;
            }
        };
        let addr_str = addr.to_string();
        let hub = hub.clone();

        tokio::spawn(async move {
            let ws_stream = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("WebSocket handshake failed for {addr_str}: {e}");
                    return;
                }
            };
            serve_connection(ws_stream, hub, addr_str).await;
        });
    }
}

/// Serve one accepted WebSocket until it closes or errors.
pub async fn serve_connection<S>(ws_stream: WebSocketStream<S>, hub: RelayHub, addr: String)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    info!("Client connected: {addr}");

    let (mut write, read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let id = hub.register(tx);

    let writer_addr = addr.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = write.send(msg).await {
                warn!("Failed to write to {writer_addr}: {e}");
                break;
            }
        }
    });

    process_frames(read, &hub, &addr).await;

    hub.unregister(id);
    writer.abort();
    info!("Client disconnected: {addr}");
}

/// Read frames from any message stream and hand text frames to the hub in
/// arrival order. Returns on close frame, read error, or end of stream.
///
/// Generic over the stream so it can be driven by in-memory streams in tests.
pub async fn process_frames<St>(mut stream: St, hub: &RelayHub, addr: &str)
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                hub.handle_frame(text.as_str(), addr);
            }
            Ok(Message::Close(_)) => {
                info!("Client {addr} sent close frame");
                break;
            }
            Err(e) => {
                error!("WebSocket error from {addr}: {e}");
                break;
            }
            _ => {
                // Ignore Binary, Ping, Pong, Frame variants.
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    fn mock_stream(
        messages: Vec<Result<Message, WsError>>,
    ) -> impl Stream<Item = Result<Message, WsError>> + Unpin {
        stream::iter(messages)
    }

    fn text_of(msg: Message) -> String {
        match msg {
            Message::Text(t) => t.to_string(),
            other => panic!("expected text frame, got {other:?}"),
        }
    }

    #[test]
    fn valid_frame_reaches_every_client() {
        let hub = RelayHub::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        hub.register(tx_a);
        hub.register(tx_b);

        let delivered = hub.handle_frame(r#"{"url":"u","code":"c"}"#, "test");
        assert_eq!(delivered, Some(2));

        let a: serde_json::Value = serde_json::from_str(&text_of(rx_a.try_recv().unwrap())).unwrap();
        let b: serde_json::Value = serde_json::from_str(&text_of(rx_b.try_recv().unwrap())).unwrap();
        assert_eq!(a, serde_json::json!({"url": "u", "code": "c"}));
        assert_eq!(a, b);
    }

    #[test]
    fn malformed_frame_is_not_broadcast() {
        let hub = RelayHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(tx);

        assert_eq!(hub.handle_frame("{not json", "test"), None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rebroadcast_is_compact() {
        let hub = RelayHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(tx);

        hub.handle_frame("{ \"url\" : \"u\" ,\n \"code\" : \"c\" }", "test");
        let text = text_of(rx.try_recv().unwrap());
        assert!(!text.contains(' '));
        assert!(!text.contains('\n'));
    }

    #[test]
    fn closed_clients_are_pruned() {
        let hub = RelayHub::new();
        let (tx_open, mut rx_open) = mpsc::unbounded_channel();
        let (tx_closed, rx_closed) = mpsc::unbounded_channel();
        hub.register(tx_open);
        hub.register(tx_closed);
        drop(rx_closed);

        assert_eq!(hub.broadcast("{}"), 1);
        assert_eq!(hub.client_count(), 1);
        assert!(rx_open.try_recv().is_ok());
    }

    #[test]
    fn unregistered_client_receives_nothing() {
        let hub = RelayHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.register(tx);
        hub.unregister(id);

        assert_eq!(hub.broadcast("{}"), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn frames_are_broadcast_in_arrival_order() {
        let hub = RelayHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(tx);

        let messages = vec![
            Ok(Message::Text("1".into())),
            Ok(Message::Text("garbage".into())),
            Ok(Message::Text("2".into())),
            Ok(Message::Text("3".into())),
        ];
        process_frames(mock_stream(messages), &hub, "test").await;

        assert_eq!(text_of(rx.recv().await.unwrap()), "1");
        assert_eq!(text_of(rx.recv().await.unwrap()), "2");
        assert_eq!(text_of(rx.recv().await.unwrap()), "3");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_frame_stops_processing() {
        let hub = RelayHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(tx);

        let messages = vec![
            Ok(Message::Text("{\"before\":true}".into())),
            Ok(Message::Close(None)),
            Ok(Message::Text("{\"after\":true}".into())),
        ];
        process_frames(mock_stream(messages), &hub, "test").await;

        assert_eq!(text_of(rx.recv().await.unwrap()), "{\"before\":true}");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn error_stops_processing() {
        let hub = RelayHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(tx);

        let messages = vec![
            Err(WsError::ConnectionClosed),
            Ok(Message::Text("{}".into())),
        ];
        process_frames(mock_stream(messages), &hub, "test").await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn binary_and_ping_messages_are_ignored() {
        let hub = RelayHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        hub.register(tx);

        let messages = vec![
            Ok(Message::Binary(vec![1, 2, 3].into())),
            Ok(Message::Ping(vec![].into())),
            Ok(Message::Pong(vec![].into())),
            Ok(Message::Text("{}".into())),
        ];
        process_frames(mock_stream(messages), &hub, "test").await;

        assert_eq!(text_of(rx.recv().await.unwrap()), "{}");
        assert!(rx.try_recv().is_err());
    }

    /// Accept source that fails first, then hands out in-memory streams.
    struct ScriptedSource {
        script: std::collections::VecDeque<std::io::Result<tokio::io::DuplexStream>>,
    }

    #[async_trait]
    impl ConnectionSource for ScriptedSource {
        type Stream = tokio::io::DuplexStream;

        async fn accept(&mut self) -> std::io::Result<(Self::Stream, SocketAddr)> {
            match self.script.pop_front() {
                Some(next) => next.map(|stream| (stream, "127.0.0.1:4000".parse().unwrap())),
                None => std::future::pending().await,
            }
        }
    }

    #[tokio::test]
    async fn accept_error_does_not_stop_the_relay() {
        let (server_side, client_side) = tokio::io::duplex(4096);
        let source = ScriptedSource {
            script: [
                Err(std::io::Error::other("too many open files")),
                Err(std::io::Error::from(std::io::ErrorKind::ConnectionAborted)),
                Ok(server_side),
            ]
            .into_iter()
            .collect(),
        };
        let hub = RelayHub::new();
        let server = tokio::spawn(run(source, hub.clone()));

        let (mut ws, _) = tokio_tungstenite::client_async("ws://localhost/", client_side)
            .await
            .expect("handshake after accept errors");
        ws.send(Message::Text("[1]".into())).await.unwrap();
        let echoed = ws.next().await.unwrap().unwrap();
        assert_eq!(text_of(echoed), "[1]");
        assert_eq!(hub.client_count(), 1);
        assert!(!server.is_finished());

        server.abort();
    }
}
