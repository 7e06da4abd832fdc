//! Connection Dispatcher
//!
//! Owns the registry of active connections, routes inbound frames through the
//! session state machine, and emits outbound frames. The transport layer
//! drives it with exactly three calls: [`begin_connection`]
//! (once per upgrade), [`receive_message`] (once per inbound text frame), and
//! [`close_connection`] (once on socket close).
//!
//! [`begin_connection`]: Dispatcher::begin_connection
//! [`receive_message`]: Dispatcher::receive_message
//! [`close_connection`]: Dispatcher::close_connection

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use super::protocol::{close_code, ClientFrame, Protocol, ServerFrame};
use super::session::{ConnectionId, ConnectionSession, Operation};
use crate::executor::{Executor, ExecutorReply, GraphQLRequest, OperationContext};
use crate::stream::EndReason;

/// Hook run against the connection-init payload.
///
/// `Ok(payload)` becomes the ack payload; `Err(reason)` closes the
/// connection with code 4403.
pub type ConnectionGuard =
    Arc<dyn Fn(Option<&Value>) -> Result<Option<Value>, String> + Send + Sync>;

/// Dispatcher tuning knobs
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum number of concurrent WebSocket connections
    pub max_connections: usize,
    /// Interval between server keep-alive frames
    pub keepalive_interval: Duration,
    /// How long a connection may sit unhandshaken before being closed
    pub init_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            keepalive_interval: Duration::from_secs(30),
            init_timeout: Duration::from_secs(3),
        }
    }
}

/// Errors surfaced to the transport layer
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("too many connections (limit: {0})")]
    TooManyConnections(usize),

    #[error("connection not found")]
    ConnectionNotFound,
}

type ConnectionMap = Arc<RwLock<HashMap<ConnectionId, Arc<ConnectionSession>>>>;

/// Registry of active connections plus the frame-routing state machine
pub struct Dispatcher {
    executor: Arc<dyn Executor>,
    connections: ConnectionMap,
    guard: Option<ConnectionGuard>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(executor: Arc<dyn Executor>, config: DispatcherConfig) -> Self {
        Self {
            executor,
            connections: Arc::new(RwLock::new(HashMap::new())),
            guard: None,
            config,
        }
    }

    /// Install a guard consulted on every connection-init handshake
    pub fn with_guard(mut self, guard: ConnectionGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Register a new connection and start its init-timeout timer.
    ///
    /// Outbound frames are queued on `sender`; the transport encodes them
    /// with the connection's codec and interprets [`ServerFrame::Close`] as a
    /// socket close instruction.
    pub async fn begin_connection(
        &self,
        protocol: Protocol,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) -> Result<ConnectionId, GatewayError> {
        let session = {
            let mut connections = self.connections.write().await;
            if connections.len() >= self.config.max_connections {
                return Err(GatewayError::TooManyConnections(
                    self.config.max_connections,
                ));
            }
            let session = Arc::new(ConnectionSession::new(protocol, sender));
            connections.insert(session.id().to_string(), Arc::clone(&session));
            session
        };

        let registry = self.registry_ref();
        let timer_session = Arc::clone(&session);
        let timeout = self.config.init_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !timer_session.is_initialized() {
                tracing::debug!(
                    connection_id = %timer_session.id(),
                    "No connection_init within timeout"
                );
                registry
                    .terminate(
                        &timer_session,
                        close_code::INIT_TIMEOUT,
                        "connection initialisation timeout",
                    )
                    .await;
            }
        });
        session.set_init_timer(timer);

        tracing::info!(
            connection_id = %session.id(),
            protocol = %protocol.token(),
            "WebSocket connected"
        );
        Ok(session.id().to_string())
    }

    /// Route one inbound text frame through the state machine
    pub async fn receive_message(&self, connection_id: &str, text: &str) {
        let session = {
            let connections = self.connections.read().await;
            connections.get(connection_id).cloned()
        };
        let Some(session) = session else {
            tracing::debug!(connection_id = %connection_id, "Frame for unknown connection");
            return;
        };

        let frame = match session.protocol().codec().decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(
                    connection_id = %connection_id,
                    error = %e,
                    "Undecodable frame"
                );
                self.registry_ref()
                    .terminate(
                        &session,
                        close_code::INVALID_MESSAGE,
                        &format!("invalid message: {e}"),
                    )
                    .await;
                return;
            }
        };

        match frame {
            ClientFrame::ConnectionInit { payload } => {
                self.handle_connection_init(&session, payload).await;
            }
            ClientFrame::Subscribe { id, request } => {
                self.handle_subscribe(&session, id, request).await;
            }
            ClientFrame::Complete { id } => {
                self.handle_complete(&session, &id).await;
            }
            ClientFrame::Ping { payload } => {
                session.send(ServerFrame::Pong { payload });
            }
            ClientFrame::Pong { .. } => {}
            ClientFrame::Terminate => {
                session.send(ServerFrame::Close {
                    code: close_code::NORMAL,
                    reason: "terminated".to_string(),
                });
                self.registry_ref().teardown(&session).await;
            }
        }
    }

    /// Tear a connection down on socket close or transport error
    pub async fn close_connection(&self, connection_id: &str) {
        let session = {
            let connections = self.connections.read().await;
            connections.get(connection_id).cloned()
        };
        if let Some(session) = session {
            self.registry_ref().teardown(&session).await;
        }
    }

    /// Close a connection with an explicit protocol close code
    pub async fn terminate_connection(&self, connection_id: &str, code: u16, reason: &str) {
        let session = {
            let connections = self.connections.read().await;
            connections.get(connection_id).cloned()
        };
        if let Some(session) = session {
            self.registry_ref().terminate(&session, code, reason).await;
        }
    }

    /// Number of registered connections
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of active operations across all connections
    pub async fn operation_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .map(|session| session.operation_count())
            .sum()
    }

    async fn handle_connection_init(
        &self,
        session: &Arc<ConnectionSession>,
        payload: Option<Value>,
    ) {
        if !session.mark_initialized() {
            self.registry_ref()
                .terminate(
                    session,
                    close_code::TOO_MANY_INIT,
                    "too many initialisation requests",
                )
                .await;
            return;
        }

        let ack_payload = match &self.guard {
            Some(guard) => match guard(payload.as_ref()) {
                Ok(ack) => ack,
                Err(reason) => {
                    tracing::debug!(
                        connection_id = %session.id(),
                        reason = %reason,
                        "Connection rejected by guard"
                    );
                    self.registry_ref()
                        .terminate(session, close_code::FORBIDDEN, &reason)
                        .await;
                    return;
                }
            },
            None => None,
        };

        session.set_connection_params(payload);
        session.clear_init_timer();
        session.send(ServerFrame::ConnectionAck {
            payload: ack_payload,
        });
        self.start_keepalive(session);

        tracing::debug!(connection_id = %session.id(), "Connection initialised");
    }

    async fn handle_subscribe(
        &self,
        session: &Arc<ConnectionSession>,
        operation_id: String,
        request: GraphQLRequest,
    ) {
        if !session.is_initialized() {
            self.registry_ref()
                .terminate(session, close_code::UNAUTHORIZED, "unauthorized")
                .await;
            return;
        }

        if !session.reserve_operation(&operation_id) {
            self.registry_ref()
                .terminate(
                    session,
                    close_code::SUBSCRIBER_EXISTS,
                    &format!("subscriber for {operation_id} already exists"),
                )
                .await;
            return;
        }

        tracing::debug!(
            connection_id = %session.id(),
            operation_id = %operation_id,
            "Operation started"
        );

        let ctx =
            OperationContext::websocket(session.id().to_string(), session.connection_params());

        match self.executor.execute(request, ctx).await {
            Err(e) => {
                session.remove_operation(&operation_id);
                session.send(ServerFrame::Error {
                    id: operation_id,
                    errors: e.to_errors(),
                });
            }
            Ok(ExecutorReply::Single(response)) => {
                session.remove_operation(&operation_id);
                session.send(ServerFrame::Next {
                    id: operation_id.clone(),
                    payload: response,
                });
                session.send(ServerFrame::Complete { id: operation_id });
            }
            Ok(ExecutorReply::Stream(stream)) => {
                let value_session = Arc::clone(session);
                let value_op = operation_id.clone();
                let end_session = Arc::clone(session);
                let end_op = operation_id.clone();

                let handle = stream.produce(
                    move |response| {
                        value_session.send(ServerFrame::Next {
                            id: value_op.clone(),
                            payload: response,
                        });
                    },
                    move |reason| {
                        end_session.remove_operation(&end_op);
                        if reason == EndReason::Completed {
                            end_session.send(ServerFrame::Complete { id: end_op });
                        }
                    },
                );

                session.activate_operation(&operation_id, handle);
            }
        }
    }

    async fn handle_complete(&self, session: &Arc<ConnectionSession>, operation_id: &str) {
        if !session.is_initialized() {
            self.registry_ref()
                .terminate(session, close_code::UNAUTHORIZED, "unauthorized")
                .await;
            return;
        }

        // Client-initiated, so no complete frame is echoed back. Stop is
        // dispatched, never awaited, so the message loop stays responsive.
        if let Some(Operation::Active(handle)) = session.remove_operation(operation_id) {
            handle.stop();
        }
        tracing::debug!(
            connection_id = %session.id(),
            operation_id = %operation_id,
            "Operation stopped by client"
        );
    }

    fn start_keepalive(&self, session: &Arc<ConnectionSession>) {
        let registry = self.registry_ref();
        let keepalive_session = Arc::clone(session);
        let interval = self.config.keepalive_interval;

        let timer = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // interval() fires immediately; the ack just went out, so skip it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !keepalive_session.send(ServerFrame::KeepAlive) {
                    tracing::debug!(
                        connection_id = %keepalive_session.id(),
                        "Keep-alive send failed, closing connection"
                    );
                    break;
                }
            }
            registry.teardown(&keepalive_session).await;
        });
        session.set_keepalive(timer);
    }

    /// Clone the registry handle for timer tasks
    fn registry_ref(&self) -> RegistryRef {
        RegistryRef {
            connections: Arc::clone(&self.connections),
        }
    }
}

/// Reference to the connection registry for teardown from spawned tasks
struct RegistryRef {
    connections: ConnectionMap,
}

impl RegistryRef {
    async fn terminate(&self, session: &Arc<ConnectionSession>, code: u16, reason: &str) {
        session.send(ServerFrame::Close {
            code,
            reason: reason.to_string(),
        });
        self.teardown(session).await;
    }

    /// Shared teardown: registry removal, operation cancellation, timers.
    ///
    /// Timer aborts come last because a timer task may itself be the caller;
    /// everything observable is done by the time the abort can land.
    async fn teardown(&self, session: &Arc<ConnectionSession>) {
        if !session.begin_close() {
            return;
        }

        self.connections.write().await.remove(session.id());

        for operation in session.drain_operations() {
            if let Operation::Active(handle) = operation {
                handle.stop();
            }
        }

        session.finish_close();
        tracing::info!(connection_id = %session.id(), "WebSocket disconnected");
        session.abort_timers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::executor::{ExecutorError, GraphQLResponse};
    use crate::stream::EventStream;

    /// Executor whose behavior is keyed on the operation text, recording how
    /// often it ran and wiring each stream's termination to a shared log.
    struct ScriptedExecutor {
        executions: AtomicUsize,
        terminations: Arc<Mutex<Vec<(String, EndReason)>>>,
        feed: Mutex<Option<mpsc::UnboundedReceiver<GraphQLResponse>>>,
    }

    impl ScriptedExecutor {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<GraphQLResponse>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let executor = Arc::new(Self {
                executions: AtomicUsize::new(0),
                terminations: Arc::new(Mutex::new(Vec::new())),
                feed: Mutex::new(Some(rx)),
            });
            (executor, tx)
        }

        fn executions(&self) -> usize {
            self.executions.load(Ordering::SeqCst)
        }

        fn terminations(&self) -> Vec<(String, EndReason)> {
            self.terminations.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(
            &self,
            request: GraphQLRequest,
            _ctx: OperationContext,
        ) -> Result<ExecutorReply, ExecutorError> {
            self.executions.fetch_add(1, Ordering::SeqCst);

            if request.query.starts_with("subscription") {
                let rx = self
                    .feed
                    .lock()
                    .unwrap()
                    .take()
                    .expect("feed already consumed");
                let terminations = Arc::clone(&self.terminations);
                let name = request.query.clone();
                Ok(ExecutorReply::Stream(
                    EventStream::from_channel(rx).on_end(move |reason| {
                        terminations.lock().unwrap().push((name, reason));
                    }),
                ))
            } else if request.query.contains("invalid") {
                Err(ExecutorError::Validation("invalid operation".to_string()))
            } else {
                Ok(ExecutorReply::Single(GraphQLResponse::data(
                    json!({"ping": "pong"}),
                )))
            }
        }
    }

    async fn setup(
        config: DispatcherConfig,
    ) -> (
        Arc<Dispatcher>,
        Arc<ScriptedExecutor>,
        mpsc::UnboundedSender<GraphQLResponse>,
        ConnectionId,
        mpsc::UnboundedReceiver<ServerFrame>,
    ) {
        let (executor, feed) = ScriptedExecutor::new();
        let dispatcher = Arc::new(Dispatcher::new(
            executor.clone() as Arc<dyn Executor>,
            config,
        ));
        let (tx, rx) = mpsc::unbounded_channel();
        let id = dispatcher
            .begin_connection(Protocol::GraphqlTransportWs, tx)
            .await
            .unwrap();
        (dispatcher, executor, feed, id, rx)
    }

    fn long_timeouts() -> DispatcherConfig {
        DispatcherConfig {
            max_connections: 8,
            keepalive_interval: Duration::from_secs(600),
            init_timeout: Duration::from_secs(600),
        }
    }

    async fn init(
        dispatcher: &Dispatcher,
        id: &str,
        rx: &mut mpsc::UnboundedReceiver<ServerFrame>,
    ) {
        dispatcher
            .receive_message(id, r#"{"type": "connection_init"}"#)
            .await;
        assert!(matches!(
            rx.recv().await,
            Some(ServerFrame::ConnectionAck { .. })
        ));
    }

    #[tokio::test]
    async fn test_init_handshake_acks() {
        let (dispatcher, _executor, _feed, id, mut rx) = setup(long_timeouts()).await;
        init(&dispatcher, &id, &mut rx).await;
    }

    #[tokio::test]
    async fn test_subscribe_before_init_rejected_without_executing() {
        let (dispatcher, executor, _feed, id, mut rx) = setup(long_timeouts()).await;

        dispatcher
            .receive_message(
                &id,
                r#"{"type": "subscribe", "id": "1", "payload": {"query": "{ ping }"}}"#,
            )
            .await;

        match rx.recv().await {
            Some(ServerFrame::Close { code, .. }) => {
                assert_eq!(code, close_code::UNAUTHORIZED);
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(executor.executions(), 0);
        assert_eq!(dispatcher.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_query_yields_next_then_complete() {
        let (dispatcher, _executor, _feed, id, mut rx) = setup(long_timeouts()).await;
        init(&dispatcher, &id, &mut rx).await;

        dispatcher
            .receive_message(
                &id,
                r#"{"type": "subscribe", "id": "q1", "payload": {"query": "{ ping }"}}"#,
            )
            .await;

        match rx.recv().await {
            Some(ServerFrame::Next { id, payload }) => {
                assert_eq!(id, "q1");
                assert_eq!(payload.data, Some(json!({"ping": "pong"})));
            }
            other => panic!("expected next, got {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(ServerFrame::Complete { id }) if id == "q1"));
        assert_eq!(dispatcher.operation_count().await, 0);
    }

    #[tokio::test]
    async fn test_validation_failure_sends_error_frame_only() {
        let (dispatcher, _executor, _feed, id, mut rx) = setup(long_timeouts()).await;
        init(&dispatcher, &id, &mut rx).await;

        dispatcher
            .receive_message(
                &id,
                r#"{"type": "subscribe", "id": "bad", "payload": {"query": "{ invalid }"}}"#,
            )
            .await;

        match rx.recv().await {
            Some(ServerFrame::Error { id, errors }) => {
                assert_eq!(id, "bad");
                assert_eq!(errors.len(), 1);
            }
            other => panic!("expected error frame, got {other:?}"),
        }
        // Connection stays open, operation slot is free again
        assert_eq!(dispatcher.connection_count().await, 1);
        assert_eq!(dispatcher.operation_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscription_forwards_values_in_order() {
        let (dispatcher, _executor, feed, id, mut rx) = setup(long_timeouts()).await;
        init(&dispatcher, &id, &mut rx).await;

        dispatcher
            .receive_message(
                &id,
                r#"{"type": "subscribe", "id": "s1", "payload": {"query": "subscription { tick }"}}"#,
            )
            .await;

        for n in 1..=3 {
            feed.send(GraphQLResponse::data(json!({"tick": n})))
                .unwrap();
        }

        for n in 1..=3 {
            match rx.recv().await {
                Some(ServerFrame::Next { id, payload }) => {
                    assert_eq!(id, "s1");
                    assert_eq!(payload.data, Some(json!({"tick": n})));
                }
                other => panic!("expected next, got {other:?}"),
            }
        }

        // Natural completion: drop the feed, expect a complete frame
        drop(feed);
        assert!(matches!(rx.recv().await, Some(ServerFrame::Complete { id }) if id == "s1"));
        assert_eq!(dispatcher.operation_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_operation_id_closes_connection() {
        let (dispatcher, executor, _feed, id, mut rx) = setup(long_timeouts()).await;
        init(&dispatcher, &id, &mut rx).await;

        let subscribe =
            r#"{"type": "subscribe", "id": "dup", "payload": {"query": "subscription { tick }"}}"#;
        dispatcher.receive_message(&id, subscribe).await;
        dispatcher.receive_message(&id, subscribe).await;

        match rx.recv().await {
            Some(ServerFrame::Close { code, reason }) => {
                assert_eq!(code, close_code::SUBSCRIBER_EXISTS);
                assert!(reason.contains("dup"));
            }
            other => panic!("expected close, got {other:?}"),
        }

        // The original operation's termination fired with Cancelled
        tokio::time::sleep(Duration::from_millis(20)).await;
        let terminations = executor.terminations();
        assert_eq!(terminations.len(), 1);
        assert_eq!(terminations[0].1, EndReason::Cancelled);
        assert_eq!(dispatcher.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_client_complete_cancels_without_echo() {
        let (dispatcher, executor, _feed, id, mut rx) = setup(long_timeouts()).await;
        init(&dispatcher, &id, &mut rx).await;

        dispatcher
            .receive_message(
                &id,
                r#"{"type": "subscribe", "id": "s1", "payload": {"query": "subscription { tick }"}}"#,
            )
            .await;
        dispatcher
            .receive_message(&id, r#"{"type": "complete", "id": "s1"}"#)
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let terminations = executor.terminations();
        assert_eq!(terminations.len(), 1);
        assert_eq!(terminations[0].1, EndReason::Cancelled);
        assert_eq!(dispatcher.operation_count().await, 0);

        // No complete echo for a client-initiated stop
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_init_timeout_closes_without_keepalive() {
        let (executor, _feed) = ScriptedExecutor::new();
        let dispatcher = Dispatcher::new(
            executor as Arc<dyn Executor>,
            DispatcherConfig {
                max_connections: 8,
                keepalive_interval: Duration::from_millis(10),
                init_timeout: Duration::from_millis(50),
            },
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _id = dispatcher
            .begin_connection(Protocol::GraphqlTransportWs, tx)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(120)).await;

        // The first (and only) frame is the close; no keep-alive ever started
        match rx.recv().await {
            Some(ServerFrame::Close { code, .. }) => {
                assert_eq!(code, close_code::INIT_TIMEOUT);
            }
            other => panic!("expected close, got {other:?}"),
        }
        assert!(rx.try_recv().is_err());
        assert_eq!(dispatcher.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_keepalive_frames_flow_after_init() {
        let (executor, _feed) = ScriptedExecutor::new();
        let dispatcher = Dispatcher::new(
            executor as Arc<dyn Executor>,
            DispatcherConfig {
                max_connections: 8,
                keepalive_interval: Duration::from_millis(20),
                init_timeout: Duration::from_secs(600),
            },
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = dispatcher
            .begin_connection(Protocol::GraphqlTransportWs, tx)
            .await
            .unwrap();
        init(&dispatcher, &id, &mut rx).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(rx.recv().await, Some(ServerFrame::KeepAlive)));
    }

    #[tokio::test]
    async fn test_duplicate_init_closes_connection() {
        let (dispatcher, _executor, _feed, id, mut rx) = setup(long_timeouts()).await;
        init(&dispatcher, &id, &mut rx).await;

        dispatcher
            .receive_message(&id, r#"{"type": "connection_init"}"#)
            .await;

        match rx.recv().await {
            Some(ServerFrame::Close { code, .. }) => {
                assert_eq!(code, close_code::TOO_MANY_INIT);
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_undecodable_frame_closes_connection() {
        let (dispatcher, _executor, _feed, id, mut rx) = setup(long_timeouts()).await;
        init(&dispatcher, &id, &mut rx).await;

        dispatcher.receive_message(&id, "not json at all").await;

        match rx.recv().await {
            Some(ServerFrame::Close { code, .. }) => {
                assert_eq!(code, close_code::INVALID_MESSAGE);
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (executor, _feed) = ScriptedExecutor::new();
        let dispatcher = Dispatcher::new(
            executor as Arc<dyn Executor>,
            DispatcherConfig {
                max_connections: 1,
                ..long_timeouts()
            },
        );

        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();

        dispatcher
            .begin_connection(Protocol::GraphqlTransportWs, tx1)
            .await
            .unwrap();
        let refused = dispatcher.begin_connection(Protocol::GraphqlWs, tx2).await;
        assert!(matches!(refused, Err(GatewayError::TooManyConnections(1))));
    }

    #[tokio::test]
    async fn test_socket_close_cancels_active_operations() {
        let (dispatcher, executor, _feed, id, mut rx) = setup(long_timeouts()).await;
        init(&dispatcher, &id, &mut rx).await;

        dispatcher
            .receive_message(
                &id,
                r#"{"type": "subscribe", "id": "s1", "payload": {"query": "subscription { tick }"}}"#,
            )
            .await;
        assert_eq!(dispatcher.operation_count().await, 1);

        dispatcher.close_connection(&id).await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let terminations = executor.terminations();
        assert_eq!(terminations.len(), 1);
        assert_eq!(terminations[0].1, EndReason::Cancelled);
        assert_eq!(dispatcher.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_guard_rejection_closes_with_forbidden() {
        let (executor, _feed) = ScriptedExecutor::new();
        let guard: ConnectionGuard = Arc::new(|payload| match payload {
            Some(p) if p.get("token").is_some() => Ok(Some(json!({"ok": true}))),
            _ => Err("missing token".to_string()),
        });
        let dispatcher =
            Dispatcher::new(executor as Arc<dyn Executor>, long_timeouts()).with_guard(guard);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = dispatcher
            .begin_connection(Protocol::GraphqlTransportWs, tx)
            .await
            .unwrap();
        dispatcher
            .receive_message(&id, r#"{"type": "connection_init", "payload": {}}"#)
            .await;

        match rx.recv().await {
            Some(ServerFrame::Close { code, reason }) => {
                assert_eq!(code, close_code::FORBIDDEN);
                assert_eq!(reason, "missing token");
            }
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_legacy_protocol_start_and_terminate() {
        let (executor, feed) = ScriptedExecutor::new();
        let dispatcher = Dispatcher::new(executor as Arc<dyn Executor>, long_timeouts());

        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = dispatcher
            .begin_connection(Protocol::GraphqlWs, tx)
            .await
            .unwrap();

        dispatcher
            .receive_message(&id, r#"{"type": "connection_init"}"#)
            .await;
        assert!(matches!(
            rx.recv().await,
            Some(ServerFrame::ConnectionAck { .. })
        ));

        dispatcher
            .receive_message(
                &id,
                r#"{"type": "start", "id": "s1", "payload": {"query": "subscription { tick }"}}"#,
            )
            .await;
        feed.send(GraphQLResponse::data(json!({"tick": 1}))).unwrap();
        assert!(matches!(rx.recv().await, Some(ServerFrame::Next { id, .. }) if id == "s1"));

        dispatcher
            .receive_message(&id, r#"{"type": "connection_terminate"}"#)
            .await;
        match rx.recv().await {
            Some(ServerFrame::Close { code, .. }) => assert_eq!(code, close_code::NORMAL),
            other => panic!("expected close, got {other:?}"),
        }
        assert_eq!(dispatcher.connection_count().await, 0);
    }
}
