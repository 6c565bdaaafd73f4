//! The chat socket: one connection per logged-in user, with auto-reconnect.
//!
//! Inbound frames are decoded and forwarded on an unbounded channel; the
//! coordinator drains it. Outbound frames are queued to the writer of the
//! open connection, or refused when there is none.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use scholaris_shared::{Classification, ClientCommand, ServerEvent};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::connection::{
    ConnectionState, Dialer, ReconnectConfig, Transport, TungsteniteDialer, WsStream,
};
use crate::auth_session::AuthSession;
use crate::config::ChatConfig;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn wait_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Why a live connection ended.
#[derive(Debug, PartialEq)]
enum SessionEnd {
    /// `disconnect` was called.
    Requested,
    /// The server closed or the stream failed; eligible for reconnect.
    Dropped,
    /// The server rejected our credentials; never reconnect.
    AuthRejected(String),
}

struct ActiveConnection {
    user_id: i64,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

struct Shared {
    reconnect: ReconnectConfig,
    dialer: Arc<dyn Dialer>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ServerEvent>,
    /// Bumped by every `connect` and `disconnect`. A connection loop only
    /// touches state and writer while its own generation is current.
    generation: AtomicU64,
    /// Queue of the currently open connection, tagged with its generation.
    writer: Mutex<Option<(u64, UnboundedSender<Message>)>>,
}

impl Shared {
    fn current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Bump the generation, retiring whichever loop was running.
    fn retire(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Publish `state` on behalf of the loop of `generation`. The check runs
    /// under the watch lock, so a retired loop can never overwrite the state
    /// published by `disconnect` or by its successor.
    fn publish(&self, generation: u64, state: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if !self.current(generation) {
                return false;
            }
            *current = state;
            true
        })
    }

    fn install_writer(&self, generation: u64, tx: UnboundedSender<Message>) {
        *lock(&self.writer) = Some((generation, tx));
    }

    /// Drop the writer of `generation`; a successor's writer is left alone.
    fn clear_writer(&self, generation: u64) {
        let mut writer = lock(&self.writer);
        if writer.as_ref().is_some_and(|(owner, _)| *owner == generation) {
            writer.take();
        }
    }

    fn queue(&self, frame: Message) -> bool {
        let writer = lock(&self.writer);
        match writer.as_ref() {
            Some((owner, tx)) if self.current(*owner) => tx.unbounded_send(frame).is_ok(),
            _ => false,
        }
    }

    /// Decode one text frame and forward it. Returns `Some` when the frame
    /// ends the connection.
    fn dispatch(&self, text: &str) -> Option<SessionEnd> {
        let Some(frame) = ServerEvent::decode(text) else {
            crate::log_debug!("Ignoring malformed or unknown frame: {}", text);
            return None;
        };

        if frame.classification == Classification::ConversationHeuristic {
            crate::log_warn!(
                "Frame type '{}' is not in the dispatch table; treating it as a conversation update",
                frame.kind
            );
        }

        let end = match &frame.event {
            ServerEvent::Error { message, .. } if frame.event.is_auth_failure() => {
                Some(SessionEnd::AuthRejected(message.clone()))
            }
            _ => None,
        };

        if self.events.send(frame.event).is_err() {
            crate::log_debug!("No event consumer; dropping '{}' frame", frame.kind);
        }
        end
    }

    /// Drive one open connection until it ends.
    async fn pump(
        &self,
        stream: WsStream,
        mut rx: UnboundedReceiver<Message>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                _ = wait_shutdown(shutdown) => {
                    let _ = write.send(Message::Close(None)).await;
                    return SessionEnd::Requested;
                }
                outbound = rx.next() => {
                    let Some(frame) = outbound else {
                        return SessionEnd::Dropped;
                    };
                    if let Err(e) = write.send(frame).await {
                        crate::log_error!("Send failed: {}", e);
                        return SessionEnd::Dropped;
                    }
                }
                inbound = read.next() => match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(end) = self.dispatch(text.as_str()) {
                            let _ = write.send(Message::Close(None)).await;
                            return end;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        crate::log_info!("Chat socket received close");
                        return SessionEnd::Dropped;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        // Pong is handled automatically by tungstenite
                        crate::log_debug!("Received ping ({} bytes)", data.len());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        crate::log_error!("Chat socket read error: {}", e);
                        return SessionEnd::Dropped;
                    }
                }
            }
        }
    }
}

/// Connection loop: dial, pump, and on loss wait and redial until the retry
/// budget is spent.
async fn run_connection(
    shared: Arc<Shared>,
    generation: u64,
    url: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt = 0u32;

    loop {
        if attempt == 0 {
            shared.publish(generation, ConnectionState::Connecting);
        } else {
            shared.publish(generation, ConnectionState::Reconnecting { attempt });
        }

        let dialed = tokio::select! {
            _ = wait_shutdown(&mut shutdown) => return,
            result = shared.dialer.dial(&url) => result,
        };

        match dialed {
            Ok(stream) => {
                if *shutdown.borrow() || !shared.current(generation) {
                    return;
                }
                attempt = 0;
                let (tx, rx) = unbounded::<Message>();
                shared.install_writer(generation, tx);
                shared.publish(generation, ConnectionState::Connected);
                crate::log_info!("Chat socket connected");

                let end = shared.pump(stream, rx, &mut shutdown).await;
                shared.clear_writer(generation);

                match end {
                    SessionEnd::Requested => return,
                    SessionEnd::AuthRejected(reason) => {
                        crate::log_warn!("Chat socket rejected credentials: {}", reason);
                        shared.publish(generation, ConnectionState::Failed { reason });
                        return;
                    }
                    SessionEnd::Dropped => {
                        crate::log_info!("Chat socket closed");
                        shared.publish(generation, ConnectionState::Disconnected);
                    }
                }
            }
            Err(e) => {
                crate::log_error!("Chat socket error: {}", e);
                shared.publish(generation, ConnectionState::Disconnected);
            }
        }

        if shared.reconnect.exhausted(attempt) {
            crate::log_warn!(
                "Chat socket giving up after {} reconnect attempts",
                attempt
            );
            shared.publish(
                generation,
                ConnectionState::Failed {
                    reason: format!(
                        "Max reconnect attempts ({}) exceeded",
                        shared.reconnect.max_attempts
                    ),
                },
            );
            return;
        }

        let delay = shared.reconnect.delay_for_attempt(attempt);
        attempt += 1;
        crate::log_info!("Reconnecting in {}ms (attempt {})", delay, attempt);

        tokio::select! {
            _ = wait_shutdown(&mut shutdown) => return,
            _ = tokio::time::sleep(Duration::from_millis(delay as u64)) => {}
        }
    }
}

/// Transport client owning the chat socket of the logged-in user.
pub struct ChatSocket {
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveConnection>>,
}

impl ChatSocket {
    /// Create a socket client and the receiver of its inbound events.
    pub fn new(reconnect: ReconnectConfig) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        Self::with_dialer(reconnect, Arc::new(TungsteniteDialer))
    }

    pub fn with_dialer(
        reconnect: ReconnectConfig,
        dialer: Arc<dyn Dialer>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let socket = Self {
            shared: Arc::new(Shared {
                reconnect,
                dialer,
                state,
                events,
                generation: AtomicU64::new(0),
                writer: Mutex::new(None),
            }),
            active: Mutex::new(None),
        };
        (socket, receiver)
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Observe connection state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Open the socket for `session`. No-op without a token, or when a
    /// connection loop for the same user is already running.
    pub fn connect(&self, session: &AuthSession, config: &ChatConfig) {
        let Some(url) = session.ws_url(config) else {
            crate::log_warn!("No auth token; chat socket not started");
            return;
        };

        let mut active = lock(&self.active);
        if let Some(current) = active.as_ref() {
            if current.user_id == session.user_id && !current.task.is_finished() {
                crate::log_debug!("Chat socket already running for user {}", session.user_id);
                return;
            }
        }
        if let Some(previous) = active.take() {
            let _ = previous.shutdown.send(true);
        }

        crate::log_info!("Starting chat socket for user {}", session.user_id);
        let generation = self.shared.retire();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_connection(
            self.shared.clone(),
            generation,
            url,
            shutdown_rx,
        ));
        *active = Some(ActiveConnection {
            user_id: session.user_id,
            shutdown,
            task,
        });
    }

    /// Close the socket and cancel any pending reconnect.
    pub fn disconnect(&self) {
        if let Some(active) = lock(&self.active).take() {
            crate::log_info!("Chat socket disconnect requested");
            let _ = active.shutdown.send(true);
        }
        self.shared.retire();
        self.shared.state.send_replace(ConnectionState::Disconnected);
    }
}

impl Transport for ChatSocket {
    fn send(&self, command: ClientCommand) -> bool {
        if !self.shared.state.borrow().is_connected() {
            return false;
        }
        let json = match serde_json::to_string(&command) {
            Ok(json) => json,
            Err(e) => {
                crate::log_error!("Serialize failed: {}", e);
                return false;
            }
        };
        crate::log_debug!("Sending frame: {}", json);
        self.shared.queue(Message::Text(json.into()))
    }

    fn disconnect(&self) {
        ChatSocket::disconnect(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite;

    struct FailingDialer {
        dials: AtomicU32,
    }

    impl FailingDialer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                dials: AtomicU32::new(0),
            })
        }

        fn dials(&self) -> u32 {
            self.dials.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Dialer for FailingDialer {
        async fn dial(&self, _url: &str) -> Result<WsStream, tungstenite::Error> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            Err(tungstenite::Error::ConnectionClosed)
        }
    }

    struct CountingDialer {
        dials: AtomicU32,
    }

    #[async_trait]
    impl Dialer for CountingDialer {
        async fn dial(&self, url: &str) -> Result<WsStream, tungstenite::Error> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            TungsteniteDialer.dial(url).await
        }
    }

    fn session(token: Option<&str>) -> AuthSession {
        AuthSession {
            user_id: 7,
            token: token.map(str::to_string),
            tenant_domain: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_stops_after_five_attempts() {
        let dialer = FailingDialer::new();
        let (socket, _events) = ChatSocket::with_dialer(ReconnectConfig::default(), dialer.clone());
        let mut state = socket.subscribe_state();
        let started = tokio::time::Instant::now();

        socket.connect(&session(Some("abc")), &ChatConfig::default());
        state
            .wait_for(|s| matches!(s, ConnectionState::Failed { .. }))
            .await
            .unwrap();

        // Initial dial plus five reconnects, 3s apart.
        assert_eq!(dialer.dials(), 6);
        assert!(started.elapsed() >= Duration::from_secs(15));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(dialer.dials(), 6);
        assert!(socket.state().is_disconnected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_is_idempotent() {
        let dialer = FailingDialer::new();
        let (socket, _events) = ChatSocket::with_dialer(ReconnectConfig::default(), dialer.clone());
        let mut state = socket.subscribe_state();

        socket.connect(&session(Some("abc")), &ChatConfig::default());
        socket.connect(&session(Some("abc")), &ChatConfig::default());
        state
            .wait_for(|s| matches!(s, ConnectionState::Failed { .. }))
            .await
            .unwrap();
        assert_eq!(dialer.dials(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_token_does_not_connect() {
        let dialer = FailingDialer::new();
        let (socket, _events) = ChatSocket::with_dialer(ReconnectConfig::default(), dialer.clone());

        socket.connect(&session(None), &ChatConfig::default());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(dialer.dials(), 0);
        assert_eq!(socket.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cancels_pending_reconnect() {
        let dialer = FailingDialer::new();
        let (socket, _events) = ChatSocket::with_dialer(ReconnectConfig::default(), dialer.clone());

        socket.connect(&session(Some("abc")), &ChatConfig::default());
        while dialer.dials() < 1 {
            tokio::task::yield_now().await;
        }
        socket.disconnect();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(dialer.dials(), 1);
        assert_eq!(socket.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retired_loop_cannot_overwrite_disconnect() {
        let dialer = FailingDialer::new();
        let (socket, _events) = ChatSocket::with_dialer(ReconnectConfig::default(), dialer.clone());

        socket.connect(&session(Some("abc")), &ChatConfig::default());
        let retired = socket.shared.generation.load(Ordering::SeqCst);
        socket.disconnect();

        // A loop that was past its shutdown check when disconnect ran.
        assert!(!socket.shared.publish(retired, ConnectionState::Connected));
        assert!(!socket
            .shared
            .publish(retired, ConnectionState::Reconnecting { attempt: 1 }));
        assert_eq!(socket.state(), ConnectionState::Disconnected);

        let current = socket.shared.generation.load(Ordering::SeqCst);
        assert!(socket.shared.publish(current, ConnectionState::Connecting));
    }

    #[tokio::test]
    async fn test_old_connection_cleanup_keeps_new_writer() {
        let (socket, _events) = ChatSocket::new(ReconnectConfig::default());
        let shared = &socket.shared;

        let old = shared.retire();
        let (old_tx, _old_rx) = unbounded::<Message>();
        shared.install_writer(old, old_tx);

        let new = shared.retire();
        let (new_tx, mut new_rx) = unbounded::<Message>();
        shared.install_writer(new, new_tx);

        shared.clear_writer(old);
        assert!(shared.queue(Message::Text("ping".into())));
        assert_eq!(new_rx.next().await, Some(Message::Text("ping".into())));

        shared.clear_writer(new);
        assert!(!shared.queue(Message::Text("ping".into())));
    }

    #[tokio::test]
    async fn test_writer_of_retired_connection_refuses_frames() {
        let (socket, _events) = ChatSocket::new(ReconnectConfig::default());
        let shared = &socket.shared;

        let generation = shared.retire();
        let (tx, _rx) = unbounded::<Message>();
        shared.install_writer(generation, tx);
        assert!(shared.queue(Message::Text("a".into())));

        socket.disconnect();
        assert!(!shared.queue(Message::Text("b".into())));
    }

    #[tokio::test]
    async fn test_send_refused_without_open_socket() {
        let (socket, _events) = ChatSocket::new(ReconnectConfig::default());
        assert!(!socket.send_typing(5));
        assert!(!socket.send_message(5, "hi", "c1"));
    }

    #[tokio::test]
    async fn test_loopback_send_receive_and_auth_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();

            let first = loop {
                match ws.next().await.unwrap().unwrap() {
                    Message::Text(text) => break text,
                    _ => continue,
                }
            };
            let sent: Value = serde_json::from_str(first.as_str()).unwrap();

            let frames = [
                "garbage".to_string(),
                json!({
                    "type": "message.new",
                    "conversation_id": 5,
                    "message": {
                        "id": 1,
                        "sender_id": 9,
                        "body": "hello",
                        "created_at": "2024-03-01T10:00:00Z"
                    }
                })
                .to_string(),
                json!({ "type": "error", "code": "invalid_token", "message": "Token expired" })
                    .to_string(),
            ];
            for frame in frames {
                ws.send(Message::Text(frame.into())).await.unwrap();
            }
            // Drain until the client closes.
            while let Some(Ok(_)) = ws.next().await {}
            sent
        });

        let dialer = Arc::new(CountingDialer {
            dials: AtomicU32::new(0),
        });
        let (socket, mut events) =
            ChatSocket::with_dialer(ReconnectConfig::default(), dialer.clone());
        let mut state = socket.subscribe_state();
        let config = ChatConfig {
            default_host: addr.to_string(),
            ..ChatConfig::default()
        };

        socket.connect(&session(Some("abc")), &config);
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| s.is_connected()))
            .await
            .unwrap()
            .unwrap();

        assert!(socket.send_typing(5));

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            event,
            ServerEvent::MessageNew {
                conversation_id: 5,
                ..
            }
        ));

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.is_auth_failure());

        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| matches!(s, ConnectionState::Failed { .. })),
        )
        .await
        .unwrap()
        .unwrap();

        let sent = server.await.unwrap();
        assert_eq!(sent, json!({ "type": "typing", "conversation_id": 5 }));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
        assert!(!socket.send_typing(5));
    }
}
