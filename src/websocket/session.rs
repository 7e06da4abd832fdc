//! Connection Sessions
//!
//! Per-WebSocket-connection state: identity, handshake progress, the registry
//! of active operations, and the timer handles for init-timeout and
//! keep-alive. Sessions are mutated by the single inbound message loop plus
//! the completion callbacks of active streams, so every field below is behind
//! its own lock.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::protocol::{Protocol, ServerFrame};
use crate::stream::StreamHandle;

/// Unique identifier for a WebSocket connection
pub type ConnectionId = String;

/// Lifecycle of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Upgrade accepted, handshake not yet complete
    Connecting,
    /// Handshake complete, operations permitted
    Initialized,
    /// Close initiated, operations being cancelled
    Closing,
    /// Terminal
    Closed,
}

/// One entry in the session's operation registry
///
/// An operation is `Pending` from subscribe receipt until the executor
/// returns, reserving its id so duplicates are caught while execution is in
/// flight.
pub enum Operation {
    Pending,
    Active(StreamHandle),
}

#[derive(Default)]
struct SessionTimers {
    init_timeout: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
}

/// State for a single WebSocket connection
pub struct ConnectionSession {
    id: ConnectionId,
    protocol: Protocol,
    sender: mpsc::UnboundedSender<ServerFrame>,
    state: Mutex<SessionState>,
    operations: Mutex<HashMap<String, Operation>>,
    connection_params: Mutex<Option<Value>>,
    timers: Mutex<SessionTimers>,
}

impl ConnectionSession {
    pub fn new(protocol: Protocol, sender: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            protocol,
            sender,
            state: Mutex::new(SessionState::Connecting),
            operations: Mutex::new(HashMap::new()),
            connection_params: Mutex::new(None),
            timers: Mutex::new(SessionTimers::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Queue an outbound frame. Returns false when the socket pump is gone.
    pub fn send(&self, frame: ServerFrame) -> bool {
        self.sender.send(frame).is_ok()
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == SessionState::Initialized
    }

    /// `Connecting → Initialized`. Returns false if the handshake already
    /// happened or the session is shutting down.
    pub fn mark_initialized(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        if *state == SessionState::Connecting {
            *state = SessionState::Initialized;
            true
        } else {
            false
        }
    }

    /// `* → Closing`. Returns false if a close is already underway, making
    /// teardown idempotent across the paths that race into it.
    pub fn begin_close(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        match *state {
            SessionState::Closing | SessionState::Closed => false,
            _ => {
                *state = SessionState::Closing;
                true
            }
        }
    }

    /// `Closing → Closed`
    pub fn finish_close(&self) {
        *self.state.lock().unwrap() = SessionState::Closed;
    }

    pub fn set_connection_params(&self, params: Option<Value>) {
        *self.connection_params.lock().unwrap() = params;
    }

    pub fn connection_params(&self) -> Option<Value> {
        self.connection_params.lock().unwrap().clone()
    }

    /// Reserve an operation id ahead of execution.
    ///
    /// Returns false when the id is already reserved or active, which is the
    /// "subscriber already exists" protocol violation.
    pub fn reserve_operation(&self, operation_id: &str) -> bool {
        let mut operations = self.operations.lock().unwrap();
        if operations.contains_key(operation_id) {
            false
        } else {
            operations.insert(operation_id.to_string(), Operation::Pending);
            true
        }
    }

    /// Attach the consuming task to a reserved operation.
    ///
    /// If the reservation is gone — the client cancelled during execution, or
    /// the stream already finished and removed itself — the handle is stopped
    /// instead of registered.
    pub fn activate_operation(&self, operation_id: &str, handle: StreamHandle) {
        let mut operations = self.operations.lock().unwrap();
        match operations.get_mut(operation_id) {
            Some(slot) => *slot = Operation::Active(handle),
            None => {
                drop(operations);
                handle.stop();
            }
        }
    }

    pub fn remove_operation(&self, operation_id: &str) -> Option<Operation> {
        self.operations.lock().unwrap().remove(operation_id)
    }

    /// Take every operation out of the registry, for teardown
    pub fn drain_operations(&self) -> Vec<Operation> {
        self.operations
            .lock()
            .unwrap()
            .drain()
            .map(|(_, op)| op)
            .collect()
    }

    pub fn operation_count(&self) -> usize {
        self.operations.lock().unwrap().len()
    }

    pub fn set_init_timer(&self, handle: JoinHandle<()>) {
        self.timers.lock().unwrap().init_timeout = Some(handle);
    }

    /// Cancel the init-timeout timer after a successful handshake
    pub fn clear_init_timer(&self) {
        if let Some(handle) = self.timers.lock().unwrap().init_timeout.take() {
            handle.abort();
        }
    }

    pub fn set_keepalive(&self, handle: JoinHandle<()>) {
        self.timers.lock().unwrap().keepalive = Some(handle);
    }

    /// Abort both timers. Safe to call from within a timer task; the abort
    /// takes effect at that task's next suspension point.
    pub fn abort_timers(&self) {
        let mut timers = self.timers.lock().unwrap();
        if let Some(handle) = timers.init_timeout.take() {
            handle.abort();
        }
        if let Some(handle) = timers.keepalive.take() {
            handle.abort();
        }
    }
}
