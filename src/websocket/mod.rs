//! GraphQL over WebSocket
//!
//! Subscription transport: one state machine, two wire sub-protocols.
//!
//! ## Architecture
//!
//! - **Dispatcher**: registry of active connections, frame routing, timers
//! - **ConnectionSession**: per-connection identity, handshake state, and
//!   operation registry
//! - **Protocol**: the two sub-protocol codecs selected at upgrade time
//! - **Handler**: axum upgrade negotiation and the socket pump
//!
//! ## Connection lifecycle
//!
//! ```text
//! upgrade ── connection_init ──> initialized ── subscribe/complete ──┐
//!    │              │                  │                            │
//!    │        (init timeout)     (keep-alive tick)             (close/error)
//!    └──────────────┴──────────────────┴────────────────────────> closed
//! ```
//!
//! Clients connect to `/graphql/ws` offering either `graphql-transport-ws`
//! or `graphql-ws` as the sub-protocol; any other offer rejects the upgrade.

mod dispatcher;
mod handler;
mod protocol;
mod session;

pub use dispatcher::{ConnectionGuard, Dispatcher, DispatcherConfig, GatewayError};
pub use handler::graphql_ws_handler;
pub use protocol::{
    close_code, ClientFrame, Protocol, ProtocolError, ServerFrame, WireCodec,
    GRAPHQL_TRANSPORT_WS, GRAPHQL_WS,
};
pub use session::{ConnectionId, ConnectionSession, Operation, SessionState};
