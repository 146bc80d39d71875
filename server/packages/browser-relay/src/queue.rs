//! Single-consumer mailbox that carries one request's response events from
//! the tunnel reader to the waiting HTTP handler.

use std::collections::VecDeque;
use std::sync::Mutex;

use browser_relay_error::RelayError;
use browser_relay_protocol::ResponseEvent;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue closed")]
pub struct QueueClosed;

impl From<QueueClosed> for RelayError {
    fn from(_: QueueClosed) -> Self {
        RelayError::QueueClosed
    }
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<ResponseEvent>,
    closed: bool,
}

#[derive(Debug, Default)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event, waking the consumer if it is suspended in `pop`.
    /// A no-op once the queue is closed.
    pub fn push(&self, event: ResponseEvent) {
        {
            let mut state = self.state.lock().expect("event queue lock");
            if state.closed {
                return;
            }
            state.items.push_back(event);
        }
        self.notify.notify_one();
    }

    /// Returns the next event, suspending while the queue is empty.
    ///
    /// Fails immediately once the queue is closed, even if events are still
    /// buffered. Only one `pop` may be outstanding at a time.
    pub async fn pop(&self) -> Result<ResponseEvent, QueueClosed> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().expect("event queue lock");
                if state.closed {
                    return Err(QueueClosed);
                }
                if let Some(event) = state.items.pop_front() {
                    return Ok(event);
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) {
        {
            let mut state = self.state.lock().expect("event queue lock");
            if state.closed {
                return;
            }
            state.closed = true;
            state.items.clear();
        }
        self.notify.notify_waiters();
        // A consumer that has not yet registered picks this permit up and
        // observes `closed` on its next loop.
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().expect("event queue lock").closed
    }
}
