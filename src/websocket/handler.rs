//! WebSocket Transport
//!
//! Handles upgrade negotiation and pumps the socket: inbound text frames go
//! to the dispatcher, outbound logical frames are encoded with the
//! connection's codec and written to the sink.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;

use super::dispatcher::Dispatcher;
use super::protocol::{close_code, Protocol, ServerFrame};
use crate::api::AppState;

/// GraphQL WebSocket upgrade handler
///
/// The requested sub-protocol must be one of the two supported tokens;
/// anything else rejects the upgrade before the handshake.
pub async fn graphql_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> Response {
    let Some(protocol) = negotiate_protocol(&headers) else {
        tracing::debug!("WebSocket upgrade with unsupported sub-protocol");
        return (
            StatusCode::BAD_REQUEST,
            "unsupported websocket sub-protocol; expected graphql-transport-ws or graphql-ws",
        )
            .into_response();
    };

    let dispatcher = Arc::clone(&state.dispatcher);
    ws.protocols([protocol.token()])
        .on_upgrade(move |socket| handle_socket(socket, dispatcher, protocol))
}

/// Pick the first supported token from the `Sec-WebSocket-Protocol` offer
fn negotiate_protocol(headers: &HeaderMap) -> Option<Protocol> {
    let offered = headers.get("sec-websocket-protocol")?.to_str().ok()?;
    offered
        .split(',')
        .map(str::trim)
        .find_map(Protocol::from_token)
}

/// Pump an established WebSocket connection
async fn handle_socket(socket: WebSocket, dispatcher: Arc<Dispatcher>, protocol: Protocol) {
    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();

    let connection_id = match dispatcher.begin_connection(protocol, tx).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %e, "Refused WebSocket connection");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::OVERLOADED,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let codec = protocol.codec();

    // Encode and write outbound frames; a Close frame ends the connection
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                ServerFrame::Close { code, reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
                frame => match codec.encode(&frame) {
                    Ok(text) => {
                        if sink.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode outbound frame");
                    }
                },
            }
        }
    });

    // Feed inbound frames to the dispatcher
    let recv_dispatcher = Arc::clone(&dispatcher);
    let recv_connection = connection_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = source.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    recv_dispatcher
                        .receive_message(&recv_connection, &text)
                        .await;
                }
                Ok(Message::Binary(_)) => {
                    recv_dispatcher
                        .terminate_connection(
                            &recv_connection,
                            close_code::INVALID_MESSAGE,
                            "binary frames are not supported",
                        )
                        .await;
                    break;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    // Transport-level ping/pong is handled by axum
                }
                Ok(Message::Close(_)) => break,
                Err(e) => {
                    tracing::debug!(
                        connection_id = %recv_connection,
                        error = %e,
                        "WebSocket receive error"
                    );
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    dispatcher.close_connection(&connection_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with(offer: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("sec-websocket-protocol", offer.parse().unwrap());
        headers
    }

    #[test]
    fn test_negotiate_picks_supported_token() {
        assert_eq!(
            negotiate_protocol(&headers_with("graphql-transport-ws")),
            Some(Protocol::GraphqlTransportWs)
        );
        assert_eq!(
            negotiate_protocol(&headers_with("graphql-ws")),
            Some(Protocol::GraphqlWs)
        );
    }

    #[test]
    fn test_negotiate_scans_offer_list() {
        assert_eq!(
            negotiate_protocol(&headers_with("soap, graphql-ws")),
            Some(Protocol::GraphqlWs)
        );
    }

    #[test]
    fn test_negotiate_rejects_unknown_or_missing() {
        assert_eq!(negotiate_protocol(&headers_with("soap")), None);
        assert_eq!(negotiate_protocol(&HeaderMap::new()), None);
    }
}
