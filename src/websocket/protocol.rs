//! Wire Sub-Protocols
//!
//! Two GraphQL-over-WebSocket framing conventions drive the same connection
//! state machine. Each is a [`WireCodec`] strategy selected during upgrade
//! negotiation from the client's `Sec-WebSocket-Protocol` token:
//!
//! - `graphql-transport-ws`: `connection_init` / `connection_ack` / `ping` /
//!   `pong` / `subscribe` / `next` / `error` / `complete`
//! - `graphql-ws` (legacy Apollo): `connection_init` / `connection_ack` /
//!   `ka` / `start` / `data` / `error` / `complete` / `stop` /
//!   `connection_terminate`
//!
//! Codecs translate raw text to the logical [`ClientFrame`] /
//! [`ServerFrame`] forms; everything above this layer is protocol-agnostic.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::executor::{GraphQLError, GraphQLRequest, GraphQLResponse};

/// Sub-protocol token for the modern graphql-ws convention
pub const GRAPHQL_TRANSPORT_WS: &str = "graphql-transport-ws";
/// Sub-protocol token for the legacy Apollo convention
pub const GRAPHQL_WS: &str = "graphql-ws";

/// Connection close codes shared by both sub-protocols
pub mod close_code {
    /// Message could not be parsed or is invalid for the current state
    pub const INVALID_MESSAGE: u16 = 4400;
    /// Operation received before the init handshake completed
    pub const UNAUTHORIZED: u16 = 4401;
    /// Connection guard rejected the init payload
    pub const FORBIDDEN: u16 = 4403;
    /// No connection_init within the configured window
    pub const INIT_TIMEOUT: u16 = 4408;
    /// Subscribe reused an operation id that is still active
    pub const SUBSCRIBER_EXISTS: u16 = 4409;
    /// More than one connection_init on the same connection
    pub const TOO_MANY_INIT: u16 = 4429;
    /// Connection limit reached
    pub const OVERLOADED: u16 = 1013;
    /// Clean shutdown
    pub const NORMAL: u16 = 1000;
}

/// A supported wire sub-protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Modern `graphql-transport-ws`
    GraphqlTransportWs,
    /// Legacy Apollo `graphql-ws`
    GraphqlWs,
}

impl Protocol {
    /// Match a `Sec-WebSocket-Protocol` token against the supported set
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            GRAPHQL_TRANSPORT_WS => Some(Protocol::GraphqlTransportWs),
            GRAPHQL_WS => Some(Protocol::GraphqlWs),
            _ => None,
        }
    }

    /// The token announced back to the client on upgrade
    pub fn token(&self) -> &'static str {
        match self {
            Protocol::GraphqlTransportWs => GRAPHQL_TRANSPORT_WS,
            Protocol::GraphqlWs => GRAPHQL_WS,
        }
    }

    /// The codec implementing this sub-protocol's framing
    pub fn codec(&self) -> &'static dyn WireCodec {
        match self {
            Protocol::GraphqlTransportWs => &TransportWsCodec,
            Protocol::GraphqlWs => &SubscriptionsWsCodec,
        }
    }
}

/// Logical inbound message, protocol-independent
#[derive(Debug)]
pub enum ClientFrame {
    /// Handshake opener, optionally carrying connection params
    ConnectionInit { payload: Option<Value> },
    /// Start an operation under a connection-scoped id
    Subscribe { id: String, request: GraphQLRequest },
    /// Stop an active operation
    Complete { id: String },
    /// Liveness probe (modern protocol only)
    Ping { payload: Option<Value> },
    /// Liveness reply (modern protocol only)
    Pong { payload: Option<Value> },
    /// Orderly connection shutdown (legacy protocol only)
    Terminate,
}

/// Logical outbound message, protocol-independent
///
/// `Close` is an instruction to the socket pump rather than a JSON frame;
/// codecs never see it.
#[derive(Debug, Clone)]
pub enum ServerFrame {
    ConnectionAck { payload: Option<Value> },
    /// Periodic liveness frame: `ping` on the modern protocol, `ka` on legacy
    KeepAlive,
    Pong { payload: Option<Value> },
    Next { id: String, payload: GraphQLResponse },
    Error { id: String, errors: Vec<GraphQLError> },
    Complete { id: String },
    Close { code: u16, reason: String },
}

/// Codec errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("message type not supported by this sub-protocol")]
    Unsupported,
}

/// Translation between raw text frames and logical messages
pub trait WireCodec: Send + Sync {
    fn decode(&self, text: &str) -> Result<ClientFrame, ProtocolError>;
    fn encode(&self, frame: &ServerFrame) -> Result<String, ProtocolError>;
}

// ---------------------------------------------------------------------------
// graphql-transport-ws
// ---------------------------------------------------------------------------

/// Codec for the modern `graphql-transport-ws` convention
pub struct TransportWsCodec;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TransportWsClient {
    ConnectionInit {
        #[serde(default)]
        payload: Option<Value>,
    },
    Ping {
        #[serde(default)]
        payload: Option<Value>,
    },
    Pong {
        #[serde(default)]
        payload: Option<Value>,
    },
    Subscribe {
        id: String,
        payload: GraphQLRequest,
    },
    Complete {
        id: String,
    },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum TransportWsServer<'a> {
    ConnectionAck {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<&'a Value>,
    },
    Ping,
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<&'a Value>,
    },
    Next {
        id: &'a str,
        payload: &'a GraphQLResponse,
    },
    Error {
        id: &'a str,
        payload: &'a [GraphQLError],
    },
    Complete {
        id: &'a str,
    },
}

impl WireCodec for TransportWsCodec {
    fn decode(&self, text: &str) -> Result<ClientFrame, ProtocolError> {
        let message: TransportWsClient =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        Ok(match message {
            TransportWsClient::ConnectionInit { payload } => ClientFrame::ConnectionInit { payload },
            TransportWsClient::Ping { payload } => ClientFrame::Ping { payload },
            TransportWsClient::Pong { payload } => ClientFrame::Pong { payload },
            TransportWsClient::Subscribe { id, payload } => ClientFrame::Subscribe {
                id,
                request: payload,
            },
            TransportWsClient::Complete { id } => ClientFrame::Complete { id },
        })
    }

    fn encode(&self, frame: &ServerFrame) -> Result<String, ProtocolError> {
        let message = match frame {
            ServerFrame::ConnectionAck { payload } => TransportWsServer::ConnectionAck {
                payload: payload.as_ref(),
            },
            ServerFrame::KeepAlive => TransportWsServer::Ping,
            ServerFrame::Pong { payload } => TransportWsServer::Pong {
                payload: payload.as_ref(),
            },
            ServerFrame::Next { id, payload } => TransportWsServer::Next { id, payload },
            ServerFrame::Error { id, errors } => TransportWsServer::Error { id, payload: errors },
            ServerFrame::Complete { id } => TransportWsServer::Complete { id },
            ServerFrame::Close { .. } => return Err(ProtocolError::Unsupported),
        };

        serde_json::to_string(&message).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// graphql-ws (legacy Apollo subscriptions-transport-ws)
// ---------------------------------------------------------------------------

/// Codec for the legacy Apollo `graphql-ws` convention
pub struct SubscriptionsWsCodec;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SubscriptionsWsClient {
    ConnectionInit {
        #[serde(default)]
        payload: Option<Value>,
    },
    Start {
        id: String,
        payload: GraphQLRequest,
    },
    Stop {
        id: String,
    },
    ConnectionTerminate,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum SubscriptionsWsServer<'a> {
    ConnectionAck {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<&'a Value>,
    },
    #[serde(rename = "ka")]
    KeepAlive,
    Data {
        id: &'a str,
        payload: &'a GraphQLResponse,
    },
    Error {
        id: &'a str,
        payload: &'a [GraphQLError],
    },
    Complete {
        id: &'a str,
    },
}

impl WireCodec for SubscriptionsWsCodec {
    fn decode(&self, text: &str) -> Result<ClientFrame, ProtocolError> {
        let message: SubscriptionsWsClient =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        Ok(match message {
            SubscriptionsWsClient::ConnectionInit { payload } => {
                ClientFrame::ConnectionInit { payload }
            }
            SubscriptionsWsClient::Start { id, payload } => ClientFrame::Subscribe {
                id,
                request: payload,
            },
            SubscriptionsWsClient::Stop { id } => ClientFrame::Complete { id },
            SubscriptionsWsClient::ConnectionTerminate => ClientFrame::Terminate,
        })
    }

    fn encode(&self, frame: &ServerFrame) -> Result<String, ProtocolError> {
        let message = match frame {
            ServerFrame::ConnectionAck { payload } => SubscriptionsWsServer::ConnectionAck {
                payload: payload.as_ref(),
            },
            ServerFrame::KeepAlive => SubscriptionsWsServer::KeepAlive,
            ServerFrame::Next { id, payload } => SubscriptionsWsServer::Data { id, payload },
            ServerFrame::Error { id, errors } => {
                SubscriptionsWsServer::Error { id, payload: errors }
            }
            ServerFrame::Complete { id } => SubscriptionsWsServer::Complete { id },
            // The legacy protocol has no server pong; Close never reaches codecs
            ServerFrame::Pong { .. } | ServerFrame::Close { .. } => {
                return Err(ProtocolError::Unsupported)
            }
        };

        serde_json::to_string(&message).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_protocol_from_token() {
        assert_eq!(
            Protocol::from_token("graphql-transport-ws"),
            Some(Protocol::GraphqlTransportWs)
        );
        assert_eq!(Protocol::from_token("graphql-ws"), Some(Protocol::GraphqlWs));
        assert_eq!(Protocol::from_token("soap"), None);
    }

    #[test]
    fn test_transport_ws_decode_connection_init() {
        let codec = Protocol::GraphqlTransportWs.codec();
        let frame = codec
            .decode(r#"{"type": "connection_init", "payload": {"token": "abc"}}"#)
            .unwrap();
        match frame {
            ClientFrame::ConnectionInit { payload } => {
                assert_eq!(payload, Some(json!({"token": "abc"})));
            }
            other => panic!("expected ConnectionInit, got {other:?}"),
        }
    }

    #[test]
    fn test_transport_ws_decode_subscribe() {
        let codec = Protocol::GraphqlTransportWs.codec();
        let frame = codec
            .decode(
                r#"{"type": "subscribe", "id": "op-1", "payload": {"query": "subscription { tick }"}}"#,
            )
            .unwrap();
        match frame {
            ClientFrame::Subscribe { id, request } => {
                assert_eq!(id, "op-1");
                assert_eq!(request.query, "subscription { tick }");
            }
            other => panic!("expected Subscribe, got {other:?}"),
        }
    }

    #[test]
    fn test_transport_ws_rejects_legacy_start() {
        let codec = Protocol::GraphqlTransportWs.codec();
        let result = codec.decode(r#"{"type": "start", "id": "1", "payload": {"query": "{ x }"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_legacy_decode_start_and_stop() {
        let codec = Protocol::GraphqlWs.codec();

        let frame = codec
            .decode(r#"{"type": "start", "id": "7", "payload": {"query": "subscription { a }"}}"#)
            .unwrap();
        assert!(matches!(frame, ClientFrame::Subscribe { ref id, .. } if id == "7"));

        let frame = codec.decode(r#"{"type": "stop", "id": "7"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Complete { ref id } if id == "7"));
    }

    #[test]
    fn test_legacy_decode_terminate() {
        let codec = Protocol::GraphqlWs.codec();
        let frame = codec.decode(r#"{"type": "connection_terminate"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Terminate));
    }

    #[test]
    fn test_legacy_rejects_modern_subscribe() {
        let codec = Protocol::GraphqlWs.codec();
        let result =
            codec.decode(r#"{"type": "subscribe", "id": "1", "payload": {"query": "{ x }"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_encode_next_differs_by_protocol() {
        let frame = ServerFrame::Next {
            id: "op-1".to_string(),
            payload: GraphQLResponse::data(json!({"tick": 1})),
        };

        let modern = Protocol::GraphqlTransportWs.codec().encode(&frame).unwrap();
        assert!(modern.contains("\"type\":\"next\""));
        assert!(modern.contains("\"id\":\"op-1\""));

        let legacy = Protocol::GraphqlWs.codec().encode(&frame).unwrap();
        assert!(legacy.contains("\"type\":\"data\""));
        assert!(legacy.contains("\"tick\":1"));
    }

    #[test]
    fn test_encode_keep_alive_differs_by_protocol() {
        let modern = Protocol::GraphqlTransportWs
            .codec()
            .encode(&ServerFrame::KeepAlive)
            .unwrap();
        assert_eq!(modern, r#"{"type":"ping"}"#);

        let legacy = Protocol::GraphqlWs
            .codec()
            .encode(&ServerFrame::KeepAlive)
            .unwrap();
        assert_eq!(legacy, r#"{"type":"ka"}"#);
    }

    #[test]
    fn test_encode_ack_without_payload() {
        let encoded = Protocol::GraphqlTransportWs
            .codec()
            .encode(&ServerFrame::ConnectionAck { payload: None })
            .unwrap();
        assert_eq!(encoded, r#"{"type":"connection_ack"}"#);
    }

    #[test]
    fn test_encode_error_frame() {
        let frame = ServerFrame::Error {
            id: "op-9".to_string(),
            errors: vec![GraphQLError::new("unknown field")],
        };
        let encoded = Protocol::GraphqlTransportWs.codec().encode(&frame).unwrap();
        assert!(encoded.contains("\"type\":\"error\""));
        assert!(encoded.contains("unknown field"));
    }

    #[test]
    fn test_decode_garbage_fails() {
        for protocol in [Protocol::GraphqlTransportWs, Protocol::GraphqlWs] {
            assert!(protocol.codec().decode("not json").is_err());
            assert!(protocol.codec().decode(r#"{"type": "mystery"}"#).is_err());
        }
    }
}
