//! Agent side of the tunnel: one persistent WebSocket to the relay that
//! reconnects on its own after any close or failed connect.
//!
//! Delivery is at-most-once. Frames are only written while a connection is
//! open; anything sent while disconnected is dropped, and frames queued for a
//! connection that has since closed are discarded with it. Work started by a
//! message answers through a [`ConnectionSink`] bound to the connection that
//! carried it, so nothing leaks onto a later connection.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use browser_relay_protocol::ACCOUNT_QUERY_PARAM;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

type TunnelSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unsupported endpoint scheme `{0}` (expected ws, wss, http or https)")]
    UnsupportedScheme(String),
    #[error("account must not be empty")]
    MissingAccount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    /// Text frame received on connection number `connection`.
    Message { connection: u64, text: String },
}

/// What the transport must do after a connection ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseOutcome {
    pub emit_disconnected: bool,
    pub schedule_reconnect: bool,
}

/// Connection state machine, kept free of I/O.
#[derive(Debug)]
pub struct Lifecycle {
    state: ConnectionState,
    reconnect_pending: bool,
    failed_attempts: u32,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_pending: false,
            failed_attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_pending
    }

    /// Consecutive connects that failed since the last successful open.
    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn begin_connect(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    pub fn opened(&mut self) {
        self.state = ConnectionState::Open;
        self.failed_attempts = 0;
        self.reconnect_pending = false;
    }

    pub fn closed(&mut self) -> CloseOutcome {
        let was_open = self.state == ConnectionState::Open;
        if !was_open {
            self.failed_attempts = self.failed_attempts.saturating_add(1);
        }
        self.state = ConnectionState::Disconnected;
        let schedule_reconnect = !self.reconnect_pending;
        self.reconnect_pending = true;
        CloseOutcome {
            emit_disconnected: was_open,
            schedule_reconnect,
        }
    }

    pub fn reconnect_fired(&mut self) {
        self.reconnect_pending = false;
    }
}

#[derive(Debug)]
struct OpenConnection {
    id: u64,
    sender: mpsc::UnboundedSender<Message>,
}

#[derive(Debug, Default)]
struct Outbound {
    opened: u64,
    current: Option<OpenConnection>,
}

/// Cloneable sender for the current connection.
#[derive(Debug, Clone, Default)]
pub struct TransportHandle {
    outbound: Arc<Mutex<Outbound>>,
}

impl TransportHandle {
    /// Queues a text frame on connection `connection`. Returns false, after
    /// logging, when that connection is no longer the open one.
    pub fn send_on(&self, connection: u64, text: String) -> bool {
        let outbound = self.outbound.lock().expect("transport outbound lock");
        match outbound.current.as_ref() {
            Some(open) if open.id == connection => {
                open.sender.send(Message::Text(text)).is_ok()
            }
            _ => {
                tracing::warn!(connection, "tunnel not open; dropping outbound frame");
                false
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.outbound
            .lock()
            .expect("transport outbound lock")
            .current
            .is_some()
    }

    /// Sink that writes only while connection `connection` stays open.
    pub fn sink(&self, connection: u64) -> ConnectionSink {
        ConnectionSink {
            handle: self.clone(),
            connection,
        }
    }

    fn install(&self, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let mut outbound = self.outbound.lock().expect("transport outbound lock");
        outbound.opened += 1;
        let id = outbound.opened;
        outbound.current = Some(OpenConnection { id, sender });
        id
    }

    fn clear(&self) {
        self.outbound
            .lock()
            .expect("transport outbound lock")
            .current
            .take();
    }
}

#[derive(Debug, Clone)]
pub struct ConnectionSink {
    handle: TransportHandle,
    connection: u64,
}

impl ConnectionSink {
    pub fn connection(&self) -> u64 {
        self.connection
    }

    pub fn send(&self, text: String) -> bool {
        self.handle.send_on(self.connection, text)
    }
}

/// Builds the tunnel URL, declaring the agent's account in the query.
/// `http`/`https` endpoints are mapped to `ws`/`wss`.
pub fn connection_url(endpoint: &Url, account: &str) -> Result<Url, TransportError> {
    let account = account.trim();
    if account.is_empty() {
        return Err(TransportError::MissingAccount);
    }
    let scheme = match endpoint.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(TransportError::UnsupportedScheme(other.to_string())),
    };

    let mut url = endpoint.clone();
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(TransportError::UnsupportedScheme(endpoint.scheme().to_string()));
    }
    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(name, _)| name != ACCOUNT_QUERY_PARAM)
        .map(|(name, value)| (name.into_owned(), value.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(retained)
        .append_pair(ACCOUNT_QUERY_PARAM, account);
    Ok(url)
}

/// Starts the connection loop. Events are delivered on `events` until
/// `shutdown` fires, after which the task closes the socket and exits.
pub fn spawn_transport(
    url: Url,
    reconnect_delay: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
) -> (TransportHandle, JoinHandle<()>) {
    let handle = TransportHandle::default();
    let task = tokio::spawn(run_transport(
        url,
        reconnect_delay,
        handle.clone(),
        events,
        shutdown,
    ));
    (handle, task)
}

async fn run_transport(
    url: Url,
    reconnect_delay: Duration,
    handle: TransportHandle,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
) {
    let mut lifecycle = Lifecycle::new();
    loop {
        lifecycle.begin_connect();
        tracing::debug!(url = %redacted(&url), "connecting tunnel");
        let connected = tokio::select! {
            _ = shutdown.cancelled() => break,
            connected = tokio_tungstenite::connect_async(url.as_str()) => connected,
        };

        match connected {
            Ok((socket, _)) => {
                lifecycle.opened();
                tracing::info!(url = %redacted(&url), "tunnel open");
                let _ = events.send(TransportEvent::Connected);
                pump(socket, &handle, &events, &shutdown).await;
            }
            Err(err) => {
                tracing::warn!(
                    url = %redacted(&url),
                    attempt = lifecycle.failed_attempts() + 1,
                    error = %err,
                    "tunnel connect failed"
                );
            }
        }

        let outcome = lifecycle.closed();
        if outcome.emit_disconnected {
            tracing::warn!("tunnel closed");
            let _ = events.send(TransportEvent::Disconnected);
        }
        if shutdown.is_cancelled() {
            break;
        }
        if outcome.schedule_reconnect {
            tracing::info!(delay_ms = reconnect_delay.as_millis() as u64, "scheduling reconnect");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
            lifecycle.reconnect_fired();
        }
    }
    handle.clear();
    tracing::info!("tunnel stopped");
}

/// Moves frames between one open socket and the agent until either side
/// closes.
async fn pump(
    socket: TunnelSocket,
    handle: &TransportHandle,
    events: &mpsc::UnboundedSender<TransportEvent>,
    shutdown: &CancellationToken,
) {
    let (mut writer, mut reader) = socket.split();
    let (sender, mut outbound) = mpsc::unbounded_channel::<Message>();
    let connection = handle.install(sender);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = writer.send(Message::Close(None)).await;
                break;
            }
            message = outbound.recv() => {
                let Some(message) = message else {
                    break;
                };
                if let Err(err) = writer.send(message).await {
                    tracing::warn!(error = %err, "tunnel write failed");
                    break;
                }
            }
            inbound = reader.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message { connection, text });
                }
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        let _ = events.send(TransportEvent::Message { connection, text });
                    }
                    Err(_) => tracing::warn!("dropping non-utf8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(
                        code = frame.as_ref().map(|frame| u16::from(frame.code)),
                        reason = frame.as_ref().map(|frame| frame.reason.to_string()),
                        "relay closed tunnel"
                    );
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "tunnel read failed");
                    break;
                }
                None => break,
            },
        }
    }

    handle.clear();
}

fn redacted(url: &Url) -> String {
    let mut shown = url.clone();
    if shown.password().is_some() {
        let _ = shown.set_password(Some("<redacted>"));
    }
    shown.to_string()
}
