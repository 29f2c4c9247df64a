//! Realtime push connection to the gateway
//!
//! `ConnectionManager` owns a single WebSocket, fans decoded frames out to
//! registered handlers and reconnects after a fixed delay whenever the
//! socket drops. There is no backoff and no retry cap: an unreachable
//! server is retried every `reconnect_delay` until shutdown.
//!
//! State machine: `Disconnected -> Connecting -> Connected -> Disconnected`.
//! Failures pass through `Error` and always land in `Disconnected` before
//! the next attempt.

pub mod events;
pub mod websocket;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time;

use crate::api::ChatApi;
use crate::config::Config;

pub use events::{normalize, SyncEvent};

/// Connection state, observable through `ConnectionManager::subscribe_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Error => "error",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("realtime connection is not open")]
    NotConnected,
    #[error("failed to encode outgoing frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where the socket token comes from. Asked again before every attempt.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn token(&self) -> Result<String>;
}

/// A fixed token.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn token(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Asks the gateway for a socket token, falling back to the bearer token.
pub struct ApiTokenSource<A: ChatApi> {
    api: Arc<A>,
    fallback: String,
}

impl<A: ChatApi> ApiTokenSource<A> {
    pub fn new(api: Arc<A>, fallback: &str) -> Self {
        Self {
            api,
            fallback: fallback.to_string(),
        }
    }
}

#[async_trait]
impl<A: ChatApi + 'static> TokenSource for ApiTokenSource<A> {
    async fn token(&self) -> Result<String> {
        match self.api.websocket_token().await {
            Ok(token) => Ok(token),
            Err(e) => {
                tracing::debug!("Websocket token request failed ({:#}), using bearer token", e);
                Ok(self.fallback.clone())
            }
        }
    }
}

/// Endpoint and reconnect policy.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub url: String,
    /// Feature flag. When off, `start` does nothing and the state stays
    /// `Disconnected`.
    pub enabled: bool,
    pub reconnect_delay: Duration,
}

impl ConnectionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            url: config.ws_url.clone(),
            enabled: config.sync.realtime,
            reconnect_delay: config.sync.reconnect_delay(),
        }
    }
}

/// Callback receiving every decoded frame.
pub type MessageHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Registration handle returned by `on_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// State shared between the manager handle and its connection task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    handlers: Mutex<Vec<(HandlerId, MessageHandler)>>,
    next_handler: AtomicU64,
    connects: AtomicU64,
    failures: AtomicU64,
    /// Present only while a socket is open.
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    reconnect: Notify,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            tracing::debug!("Connection state {} -> {}", prev.as_str(), next.as_str());
        }
    }

    fn set_outbound(&self, tx: Option<mpsc::UnboundedSender<String>>) {
        *self.outbound.lock().unwrap_or_else(|e| e.into_inner()) = tx;
    }

    fn dispatch_text(&self, text: &str) {
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.dispatch(&value),
            Err(e) => tracing::debug!("Ignoring non-JSON frame ({}): {}", e, text),
        }
    }

    /// Call every handler. A panicking handler is logged and skipped.
    fn dispatch(&self, value: &Value) {
        // Snapshot so handlers may (de)register while being called.
        let handlers: Vec<MessageHandler> = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, h)| Arc::clone(h))
            .collect();

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(value))).is_err() {
                tracing::warn!("Realtime message handler panicked; other handlers still ran");
            }
        }
    }
}

/// How one connection attempt ended.
enum SessionEnd {
    Shutdown,
    /// `reconnect()` was called; retry right away.
    Forced,
    Closed,
    Failed(anyhow::Error),
}

/// Single realtime connection with handler fan-out and fixed-delay reconnect.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    config: ConnectionConfig,
    tokens: Arc<dyn TokenSource>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionConfig, tokens: Arc<dyn TokenSource>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            shared: Arc::new(Shared {
                state,
                handlers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(1),
                connects: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                outbound: Mutex::new(None),
                reconnect: Notify::new(),
                shutdown,
            }),
            config,
            tokens,
            task: Mutex::new(None),
        }
    }

    /// Spawn the connection task. No-op when disabled or already running.
    pub fn start(&self) {
        if !self.config.enabled {
            tracing::info!("Realtime disabled; relying on polling");
            return;
        }
        let mut task = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        self.shared.shutdown.send_replace(false);
        *task = Some(tokio::spawn(connection_loop(
            Arc::clone(&self.shared),
            self.config.clone(),
            Arc::clone(&self.tokens),
        )));
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Number of sockets opened so far.
    pub fn successful_connects(&self) -> u64 {
        self.shared.connects.load(Ordering::Relaxed)
    }

    /// Number of attempts that ended in `Error`.
    pub fn failed_attempts(&self) -> u64 {
        self.shared.failures.load(Ordering::Relaxed)
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Queue a JSON frame on the open socket.
    pub fn send_message(&self, payload: &Value) -> Result<(), ConnectionError> {
        let text = serde_json::to_string(payload)?;
        let guard = self.shared.outbound.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) if tx.send(text).is_ok() => Ok(()),
            _ => Err(ConnectionError::NotConnected),
        }
    }

    /// Register a frame handler.
    pub fn on_message<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = HandlerId(self.shared.next_handler.fetch_add(1, Ordering::Relaxed));
        self.shared
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(handler)));
        id
    }

    /// Remove a handler. Returns false if it was not registered.
    pub fn off_message(&self, id: HandlerId) -> bool {
        let mut handlers = self.shared.handlers.lock().unwrap_or_else(|e| e.into_inner());
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id);
        handlers.len() != before
    }

    /// Drop the current socket (or skip the pending delay) and connect again.
    pub fn reconnect(&self) {
        tracing::info!("Reconnect requested");
        self.shared.reconnect.notify_one();
    }

    /// Stop reconnecting, close the socket and wait for the task to finish.
    pub async fn shutdown(&self) {
        self.shared.shutdown.send_replace(true);
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!("Connection task ended abnormally: {}", e);
            }
        }
        self.shared.set_outbound(None);
        self.shared.set_state(ConnectionState::Disconnected);
    }

    #[cfg(test)]
    pub(crate) fn dispatch(&self, value: &Value) {
        self.shared.dispatch(value);
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}

/// Resolves once shutdown has been requested.
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Connect, run, and reconnect until shutdown. Only one instance runs per
/// manager, so at most one reconnect timer is ever pending.
async fn connection_loop(
    shared: Arc<Shared>,
    config: ConnectionConfig,
    tokens: Arc<dyn TokenSource>,
) {
    let mut shutdown_rx = shared.shutdown.subscribe();

    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        shared.set_state(ConnectionState::Connecting);
        match run_session(&shared, &config, tokens.as_ref(), &mut shutdown_rx).await {
            SessionEnd::Shutdown => break,
            SessionEnd::Forced => {
                shared.set_state(ConnectionState::Disconnected);
                continue;
            }
            SessionEnd::Closed => {
                tracing::warn!(
                    "Realtime connection closed. Reconnecting in {:?}...",
                    config.reconnect_delay
                );
                shared.set_state(ConnectionState::Disconnected);
            }
            SessionEnd::Failed(e) => {
                tracing::warn!(
                    "Realtime connection error: {:#}. Reconnecting in {:?}...",
                    e,
                    config.reconnect_delay
                );
                shared.failures.fetch_add(1, Ordering::Relaxed);
                shared.set_state(ConnectionState::Error);
                shared.set_state(ConnectionState::Disconnected);
            }
        }

        tokio::select! {
            _ = time::sleep(config.reconnect_delay) => {}
            _ = shared.reconnect.notified() => {}
            _ = shutdown_requested(&mut shutdown_rx) => {}
        }
    }

    shared.set_outbound(None);
    shared.set_state(ConnectionState::Disconnected);
    tracing::info!("Realtime connection stopped");
}

/// One connection attempt: token, connect, then pump frames until the
/// socket ends or we are told to stop.
async fn run_session(
    shared: &Shared,
    config: &ConnectionConfig,
    tokens: &dyn TokenSource,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let connect = async {
        let token = tokens
            .token()
            .await
            .context("Failed to obtain websocket token")?;
        let url = websocket::socket_url(&config.url, &token)?;
        websocket::GatewaySocket::connect(&url).await
    };

    let mut ws = tokio::select! {
        result = connect => match result {
            Ok(ws) => ws,
            Err(e) => return SessionEnd::Failed(e),
        },
        _ = shutdown_requested(shutdown_rx) => return SessionEnd::Shutdown,
    };

    // A reconnect requested before this socket opened is satisfied by it;
    // drop the stored permit so the frame loop does not tear it down.
    let _ = shared.reconnect.notified().now_or_never();

    let (tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    shared.set_outbound(Some(tx));
    shared.connects.fetch_add(1, Ordering::Relaxed);
    shared.set_state(ConnectionState::Connected);

    let end = loop {
        tokio::select! {
            frame = ws.recv_frame() => {
                match frame {
                    Ok(Some(text)) => shared.dispatch_text(&text),
                    Ok(None) => break SessionEnd::Closed,
                    Err(e) => break SessionEnd::Failed(e),
                }
            }
            Some(text) = outbound_rx.recv() => {
                if let Err(e) = ws.send_text(&text).await {
                    break SessionEnd::Failed(e);
                }
            }
            _ = shared.reconnect.notified() => {
                tracing::info!("Dropping realtime connection for forced reconnect");
                break SessionEnd::Forced;
            }
            _ = shutdown_requested(shutdown_rx) => break SessionEnd::Shutdown,
        }
    };

    shared.set_outbound(None);
    if !matches!(end, SessionEnd::Closed) {
        ws.close().await;
    }
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    fn manager(url: &str, delay_ms: u64) -> ConnectionManager {
        ConnectionManager::new(
            ConnectionConfig {
                url: url.to_string(),
                enabled: true,
                reconnect_delay: Duration::from_millis(delay_ms),
            },
            Arc::new(StaticToken("tok".into())),
        )
    }

    async fn wait_state(rx: &mut watch::Receiver<ConnectionState>, want: ConnectionState) {
        time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
            .await
            .expect("timed out waiting for state")
            .expect("state channel closed");
    }

    #[test]
    fn test_handler_panic_does_not_block_others() {
        let mgr = manager("ws://127.0.0.1:1/ws", 10);
        let hits = Arc::new(AtomicUsize::new(0));

        mgr.on_message(|_| panic!("bad consumer"));
        let h = Arc::clone(&hits);
        mgr.on_message(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        mgr.dispatch(&json!({"type": "ws.ready"}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_off_message() {
        let mgr = manager("ws://127.0.0.1:1/ws", 10);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let id = mgr.on_message(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        mgr.dispatch(&json!({}));
        assert!(mgr.off_message(id));
        assert!(!mgr.off_message(id));
        mgr.dispatch(&json!({}));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_send_without_connection() {
        let mgr = manager("ws://127.0.0.1:1/ws", 10);
        assert!(matches!(
            mgr.send_message(&json!({"ping": 1})),
            Err(ConnectionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_disabled_manager_stays_disconnected() {
        let mgr = ConnectionManager::new(
            ConnectionConfig {
                url: "ws://127.0.0.1:1/ws".into(),
                enabled: false,
                reconnect_delay: Duration::from_millis(10),
            },
            Arc::new(StaticToken("tok".into())),
        );
        mgr.start();
        time::sleep(Duration::from_millis(30)).await;
        assert_eq!(mgr.connection_state(), ConnectionState::Disconnected);
        assert!(!mgr.enabled());
    }

    #[tokio::test]
    async fn test_frames_fan_out_and_reconnect_after_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Server: accept twice. First connection sends one frame then closes.
        let server = tokio::spawn(async move {
            let mut seen_tokens = Vec::new();
            for round in 0..2 {
                let (tcp, _) = listener.accept().await.unwrap();
                let mut path = String::new();
                let mut ws = tokio_tungstenite::accept_hdr_async(
                    tcp,
                    |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                        path = req.uri().to_string();
                        Ok(resp)
                    },
                )
                .await
                .unwrap();
                seen_tokens.push(path);

                if round == 0 {
                    ws.send(WsMessage::Text(
                        json!({"type": "chat.deleted", "chat_id": "1@c.us"}).to_string(),
                    ))
                    .await
                    .unwrap();
                    ws.close(None).await.unwrap();
                } else {
                    // Echo one client frame back, then hold the socket open.
                    if let Some(Ok(msg)) = ws.next().await {
                        ws.send(msg).await.unwrap();
                    }
                    while ws.next().await.is_some() {}
                }
            }
            seen_tokens
        });

        let mgr = manager(&format!("ws://{}/api/ws", addr), 20);
        let received = Arc::new(Mutex::new(Vec::<Value>::new()));
        let sink = Arc::clone(&received);
        mgr.on_message(move |v| sink.lock().unwrap().push(v.clone()));

        let mut states = mgr.subscribe_state();
        mgr.start();

        // Server closes the first socket; manager must come back on its own.
        time::timeout(Duration::from_secs(5), async {
            while mgr.successful_connects() < 2 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("manager did not reconnect");
        wait_state(&mut states, ConnectionState::Connected).await;

        mgr.send_message(&json!({"type": "ping"})).unwrap();
        time::timeout(Duration::from_secs(5), async {
            loop {
                if received.lock().unwrap().len() >= 2 {
                    break;
                }
                time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let frames = received.lock().unwrap().clone();
        assert_eq!(frames[0]["type"], "chat.deleted");
        assert_eq!(frames[1]["type"], "ping");

        mgr.shutdown().await;
        assert_eq!(mgr.connection_state(), ConnectionState::Disconnected);

        let paths = server.await.unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p == "/api/ws?token=tok"));
    }

    #[tokio::test]
    async fn test_unreachable_server_keeps_retrying() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        let mgr = manager(&format!("ws://{}/api/ws", addr), 10);
        let mut states = mgr.subscribe_state();

        mgr.start();
        time::timeout(Duration::from_secs(5), async {
            while mgr.failed_attempts() < 3 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("expected repeated connection errors");
        assert_eq!(mgr.successful_connects(), 0);

        mgr.shutdown().await;
        wait_state(&mut states, ConnectionState::Disconnected).await;
    }

    #[tokio::test]
    async fn test_early_reconnect_does_not_drop_fresh_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&accepted);
        tokio::spawn(async move {
            loop {
                let (tcp, _) = listener.accept().await.unwrap();
                count.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    if let Ok(mut ws) = tokio_tungstenite::accept_async(tcp).await {
                        while ws.next().await.is_some() {}
                    }
                });
            }
        });

        let mgr = manager(&format!("ws://{}/api/ws", addr), 20);
        // Requested before anything is running.
        mgr.reconnect();
        mgr.start();

        time::timeout(Duration::from_secs(5), async {
            while mgr.successful_connects() < 1 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(mgr.successful_connects(), 1);
        assert!(mgr.is_connected());

        // A reconnect on a live socket still replaces it exactly once.
        mgr.reconnect();
        time::timeout(Duration::from_secs(5), async {
            while mgr.successful_connects() < 2 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("forced reconnect did not reopen the socket");
        time::sleep(Duration::from_millis(300)).await;
        assert_eq!(mgr.successful_connects(), 2);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);

        mgr.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_skips_pending_delay() {
        let addr = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap()
        };
        // Long delay: only a forced reconnect can produce a second attempt quickly.
        let mgr = manager(&format!("ws://{}/api/ws", addr), 60_000);
        mgr.start();

        time::timeout(Duration::from_secs(5), async {
            while mgr.failed_attempts() < 1 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        mgr.reconnect();
        time::timeout(Duration::from_secs(5), async {
            while mgr.failed_attempts() < 2 {
                time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reconnect() should trigger an immediate attempt");

        mgr.shutdown().await;
    }
}
