//! Account → tunnel session bookkeeping.
//!
//! Each connected agent owns one [`Session`]. A session carries the outbound
//! half of its socket (as a channel drained by the socket writer task), a
//! liveness flag driven by ping/pong, and the per-request queues that inbound
//! frames are demultiplexed into.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use browser_relay_error::RelayError;
use browser_relay_protocol::{RequestEnvelope, ResponseFrame};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::queue::EventQueue;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

const KEY_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-";
const KEY_LENGTH: usize = 24;

/// Instructions for a session's socket writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Ping,
    Close { code: u16, reason: String },
    /// Drop the socket without a close handshake.
    Terminate,
}

#[derive(Debug, Default)]
struct SessionState {
    queues: HashMap<String, Arc<EventQueue>>,
    torn_down: bool,
}

#[derive(Debug)]
pub struct Session {
    id: u64,
    account: String,
    address: Option<String>,
    outbound: mpsc::UnboundedSender<Outbound>,
    alive: AtomicBool,
    state: Mutex<SessionState>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Records a pong from the agent.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn is_torn_down(&self) -> bool {
        self.state.lock().expect("session state lock").torn_down
    }

    pub fn open_queue_count(&self) -> usize {
        self.state.lock().expect("session state lock").queues.len()
    }

    /// Registers a queue for `request_id`. The returned lease removes and
    /// closes the queue when dropped.
    pub fn open_queue(self: &Arc<Self>, request_id: &str) -> Result<QueueLease, RelayError> {
        let queue = Arc::new(EventQueue::new());
        {
            let mut state = self.state.lock().expect("session state lock");
            if state.torn_down {
                return Err(RelayError::NoConnection {
                    account: self.account.clone(),
                });
            }
            state.queues.insert(request_id.to_string(), queue.clone());
        }
        Ok(QueueLease {
            session: self.clone(),
            request_id: request_id.to_string(),
            queue,
        })
    }

    /// Sends an envelope over this session's socket.
    pub fn forward(&self, envelope: &RequestEnvelope) -> Result<(), RelayError> {
        if self.is_torn_down() {
            return Err(RelayError::NoConnection {
                account: self.account.clone(),
            });
        }
        let text = envelope
            .encode()
            .map_err(|err| RelayError::ProtocolError {
                message: err.to_string(),
            })?;
        self.send(Outbound::Text(text))
            .then_some(())
            .ok_or_else(|| RelayError::NoConnection {
                account: self.account.clone(),
            })
    }

    /// Routes one decoded frame into its request queue. Frames for unknown
    /// or finished requests are dropped. A terminal frame detaches the
    /// request id so nothing can follow it.
    pub fn route(&self, frame: ResponseFrame) {
        let queue = {
            let mut state = self.state.lock().expect("session state lock");
            if frame.event.is_terminal() {
                state.queues.remove(&frame.request_id)
            } else {
                state.queues.get(&frame.request_id).cloned()
            }
        };

        match queue {
            Some(queue) => queue.push(frame.event),
            None => {
                tracing::debug!(
                    account = %self.account,
                    request_id = %frame.request_id,
                    event_type = frame.event.kind(),
                    "dropping frame for unknown request"
                );
            }
        }
    }

    fn send(&self, outbound: Outbound) -> bool {
        self.outbound.send(outbound).is_ok()
    }

    fn release_queue(&self, request_id: &str) {
        let queue = self
            .state
            .lock()
            .expect("session state lock")
            .queues
            .remove(request_id);
        if let Some(queue) = queue {
            queue.close();
        }
    }

    /// Closes every open queue and stops the heartbeat. Idempotent.
    fn teardown(&self) {
        let queues = {
            let mut state = self.state.lock().expect("session state lock");
            if state.torn_down {
                return;
            }
            state.torn_down = true;
            std::mem::take(&mut state.queues)
        };
        let open = queues.len();
        for queue in queues.into_values() {
            queue.close();
        }
        if let Some(heartbeat) = self.heartbeat.lock().expect("heartbeat lock").take() {
            heartbeat.abort();
            tracing::info!(account = %self.account, "heartbeat stopped");
        }
        tracing::debug!(account = %self.account, closed_queues = open, "session torn down");
    }
}

/// Keeps a request's queue registered for as long as the lease is held.
#[derive(Debug)]
pub struct QueueLease {
    session: Arc<Session>,
    request_id: String,
    queue: Arc<EventQueue>,
}

impl QueueLease {
    pub fn queue(&self) -> &EventQueue {
        &self.queue
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl Drop for QueueLease {
    fn drop(&mut self) {
        self.session.release_queue(&self.request_id);
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<String, Arc<Session>>,
    account_keys: HashMap<String, String>,
    key_accounts: HashMap<String, String>,
}

#[derive(Debug)]
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    heartbeat_interval: Duration,
    next_session_id: AtomicU64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(HEARTBEAT_INTERVAL)
    }
}

impl SessionRegistry {
    pub fn new(heartbeat_interval: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            heartbeat_interval,
            next_session_id: AtomicU64::new(1),
        }
    }

    /// Accepts a freshly connected transport for `account_hint`.
    ///
    /// Any existing session for the same account is torn down and asked to
    /// close before the new one becomes visible. Returns the session and the
    /// receiver its socket writer must drain.
    pub fn attach(
        &self,
        account_hint: Option<&str>,
        address: Option<String>,
    ) -> Result<(Arc<Session>, mpsc::UnboundedReceiver<Outbound>), RelayError> {
        let Some(account) = account_hint.and_then(normalize_account) else {
            tracing::warn!(address = ?address, "rejecting connection without account");
            return Err(RelayError::AccountRequired);
        };

        let (outbound, receiver) = mpsc::unbounded_channel();
        let session = Arc::new(Session {
            id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            account: account.clone(),
            address,
            outbound,
            alive: AtomicBool::new(true),
            state: Mutex::new(SessionState::default()),
            heartbeat: Mutex::new(None),
        });

        {
            let mut state = self.state.lock().expect("registry lock");
            if let Some(existing) = state.sessions.remove(&account) {
                tracing::warn!(
                    account = %account,
                    "account already connected, replacing previous connection"
                );
                existing.teardown();
                existing.send(Outbound::Close {
                    code: CLOSE_NORMAL,
                    reason: "Replaced by new connection".to_string(),
                });
            }

            if !state.account_keys.contains_key(&account) {
                let key = loop {
                    let candidate = generate_access_key();
                    if !state.key_accounts.contains_key(&candidate) {
                        break candidate;
                    }
                };
                state.key_accounts.insert(key.clone(), account.clone());
                state.account_keys.insert(account.clone(), key);
            }

            state.sessions.insert(account.clone(), session.clone());
        }

        let heartbeat = spawn_heartbeat(&session, self.heartbeat_interval);
        *session.heartbeat.lock().expect("heartbeat lock") = Some(heartbeat);

        tracing::info!(
            account = %account,
            address = ?session.address,
            session_id = session.id,
            "client connected"
        );
        Ok((session, receiver))
    }

    /// Handles a closed transport. A session that was already replaced does
    /// not disturb its successor.
    pub fn detach(&self, session: &Arc<Session>) {
        let removed = {
            let mut state = self.state.lock().expect("registry lock");
            match state.sessions.get(&session.account) {
                Some(current) if current.id == session.id => {
                    state.sessions.remove(&session.account);
                    true
                }
                _ => false,
            }
        };
        if removed {
            tracing::info!(account = %session.account, "client disconnected");
        }
        session.teardown();
    }

    /// Decodes an inbound text frame and routes it. Malformed frames are
    /// logged and dropped.
    pub fn handle_frame(&self, session: &Session, text: &str) {
        match ResponseFrame::decode(text) {
            Ok(frame) => session.route(frame),
            Err(err) => {
                tracing::warn!(
                    account = %session.account,
                    request_id = ?err.request_id(),
                    error = %err,
                    "dropping malformed tunnel frame"
                );
            }
        }
    }

    pub fn live_session(&self, account: &str) -> Option<Arc<Session>> {
        let account = normalize_account(account)?;
        self.state
            .lock()
            .expect("registry lock")
            .sessions
            .get(&account)
            .cloned()
    }

    pub fn forward(&self, account: &str, envelope: &RequestEnvelope) -> Result<(), RelayError> {
        let session = self
            .live_session(account)
            .ok_or_else(|| RelayError::NoConnection {
                account: account.to_string(),
            })?;
        session.forward(envelope)
    }

    /// Connected accounts, sorted.
    pub fn accounts(&self) -> Vec<String> {
        let mut accounts: Vec<String> = self
            .state
            .lock()
            .expect("registry lock")
            .sessions
            .keys()
            .cloned()
            .collect();
        accounts.sort();
        accounts
    }

    pub fn key_for_account(&self, account: &str) -> Option<String> {
        let account = normalize_account(account)?;
        self.state
            .lock()
            .expect("registry lock")
            .account_keys
            .get(&account)
            .cloned()
    }

    pub fn account_for_key(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .expect("registry lock")
            .key_accounts
            .get(key)
            .cloned()
    }

    /// Tears down every session, asking each socket to close.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut state = self.state.lock().expect("registry lock");
            state.sessions.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.teardown();
            session.send(Outbound::Close {
                code: CLOSE_GOING_AWAY,
                reason: "Server shutting down".to_string(),
            });
        }
    }
}

/// Trimmed, lowercased account identity; `None` when empty.
pub fn normalize_account(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

fn generate_access_key() -> String {
    let mut rng = rand::thread_rng();
    (0..KEY_LENGTH)
        .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
        .collect()
}

fn spawn_heartbeat(session: &Arc<Session>, period: Duration) -> JoinHandle<()> {
    let weak: Weak<Session> = Arc::downgrade(session);
    let account = session.account.clone();
    tracing::info!(account = %account, "heartbeat started");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let Some(session) = weak.upgrade() else {
                break;
            };
            if !session.alive.swap(false, Ordering::SeqCst) {
                tracing::warn!(account = %account, "ping unanswered, terminating connection");
                session.send(Outbound::Terminate);
                break;
            }
            if !session.send(Outbound::Ping) {
                break;
            }
        }
    })
}
