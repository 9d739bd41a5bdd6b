//! Proxy from the agent's public port to the services inside a sandbox.
//!
//! The terminal is relayed as a WebSocket, frame by frame, until either side closes. The file
//! service is forwarded as plain HTTP with hop-by-hop headers removed. Neither route
//! authenticates; anyone who can reach the agent can reach a running sandbox.

use std::{net::Ipv4Addr, time::Duration};

use axum::{
    body::Body,
    extract::{
        ws::{self, rejection::WebSocketUpgradeRejection, WebSocket, WebSocketUpgrade},
        Path, RawQuery, Request, State,
    },
    http::{header, HeaderMap, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        protocol::{frame::coding::CloseCode, CloseFrame},
    },
    MaybeTlsStream, WebSocketStream,
};

use crate::{registry::SandboxKey, FleetError};

use super::{
    data::{ApiError, GuestHealth},
    state::AgentState,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How long the guest terminal gets to accept the upstream WebSocket.
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout of each guest health check.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Largest request body forwarded to the file service.
const MAX_FORWARDED_BODY: usize = 64 * 1024 * 1024;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP_HEADERS: [&str; 9] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
];

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

//--------------------------------------------------------------------------------------------------
// Functions: Handlers
//--------------------------------------------------------------------------------------------------

/// Handler for `GET /proxy/{workshop_id}/{seat_id}/terminal`
///
/// Connects to the guest terminal first so an unreachable guest fails the request instead of
/// leaving the browser with an upgraded socket that never speaks.
pub async fn terminal_handler(
    State(state): State<AgentState>,
    Path((workshop_id, seat_id)): Path<(String, u32)>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Result<Response, ApiError> {
    let registry = state.get_registry();
    let ip = registry.running_ip(&workshop_id, seat_id).await?;
    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return Ok(rejection.into_response()),
    };

    let config = registry.config();
    let url = guest_terminal_url(
        ip,
        *config.get_terminal_port(),
        config.get_terminal_path(),
        query.as_deref(),
    );

    let mut request = url.as_str().into_client_request().map_err(FleetError::from)?;
    if let Some(protocols) = headers.get(header::SEC_WEBSOCKET_PROTOCOL) {
        request
            .headers_mut()
            .insert(header::SEC_WEBSOCKET_PROTOCOL, protocols.clone());
    }

    let key = SandboxKey::new(workshop_id, seat_id);
    let (upstream, response) =
        match tokio::time::timeout(UPSTREAM_CONNECT_TIMEOUT, connect_async(request)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => {
                return Err(ApiError::Upstream(format!(
                    "terminal of sandbox {key} is unreachable: {e}"
                )))
            }
            Err(_) => {
                return Err(ApiError::Upstream(format!(
                    "terminal of sandbox {key} did not answer within {}s",
                    UPSTREAM_CONNECT_TIMEOUT.as_secs()
                )))
            }
        };

    // Echo the subprotocol the guest picked so the browser accepts the handshake.
    let selected = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    let upgrade = match selected {
        Some(protocol) => upgrade.protocols([protocol]),
        None => upgrade,
    };

    tracing::info!(%key, %url, "relaying terminal session");
    Ok(upgrade.on_upgrade(move |socket| relay(socket, upstream, key)))
}

/// Handler for `* /proxy/{workshop_id}/{seat_id}/files`
pub async fn files_root_handler(
    State(state): State<AgentState>,
    Path((workshop_id, seat_id)): Path<(String, u32)>,
    RawQuery(query): RawQuery,
    request: Request,
) -> Result<Response, ApiError> {
    forward_files(&state, &workshop_id, seat_id, "", query, request).await
}

/// Handler for `* /proxy/{workshop_id}/{seat_id}/files/{*path}`
pub async fn files_handler(
    State(state): State<AgentState>,
    Path((workshop_id, seat_id, path)): Path<(String, u32, String)>,
    RawQuery(query): RawQuery,
    request: Request,
) -> Result<Response, ApiError> {
    forward_files(&state, &workshop_id, seat_id, &path, query, request).await
}

/// Handler for `GET /proxy/{workshop_id}/{seat_id}/health`
///
/// Answers `200` when both guest services respond and `503` otherwise.
pub async fn guest_health_handler(
    State(state): State<AgentState>,
    Path((workshop_id, seat_id)): Path<(String, u32)>,
) -> Result<(StatusCode, Json<GuestHealth>), ApiError> {
    let registry = state.get_registry();
    let ip = registry.running_ip(&workshop_id, seat_id).await?;
    let config = registry.config();

    let (terminal, files) = tokio::join!(
        check_tcp(ip, *config.get_terminal_port()),
        check_files(state.get_guest_client(), ip, *config.get_files_port()),
    );

    let health = GuestHealth {
        healthy: terminal && files,
        terminal,
        files,
    };
    let status = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Ok((status, Json(health)))
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn forward_files(
    state: &AgentState,
    workshop_id: &str,
    seat_id: u32,
    path: &str,
    query: Option<String>,
    request: Request,
) -> Result<Response, ApiError> {
    let registry = state.get_registry();
    let ip = registry.running_ip(workshop_id, seat_id).await?;
    let url = guest_files_url(ip, *registry.config().get_files_port(), path, query.as_deref());

    let (parts, body) = request.into_parts();
    let body = axum::body::to_bytes(body, MAX_FORWARDED_BODY)
        .await
        .map_err(|e| FleetError::InvalidArgument(format!("unreadable request body: {e}")))?;

    let response = state
        .get_guest_client()
        .request(parts.method, url.as_str())
        .headers(end_to_end_headers(&parts.headers))
        .body(body)
        .send()
        .await
        .map_err(|e| {
            ApiError::Upstream(format!(
                "file service of sandbox {workshop_id}/{seat_id} is unreachable: {e}"
            ))
        })?;

    let status = response.status();
    let headers = end_to_end_headers(response.headers());

    let mut proxied = Response::new(Body::from_stream(response.bytes_stream()));
    *proxied.status_mut() = status;
    *proxied.headers_mut() = headers;
    Ok(proxied)
}

/// Copies frames both ways until either side closes or fails.
async fn relay(client: WebSocket, upstream: UpstreamSocket, key: SandboxKey) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_guest = async {
        while let Some(Ok(message)) = client_rx.next().await {
            let closing = matches!(message, ws::Message::Close(_));
            if upstream_tx.send(to_upstream(message)).await.is_err() || closing {
                break;
            }
        }
        let _ = upstream_tx.close().await;
    };

    let guest_to_client = async {
        while let Some(Ok(message)) = upstream_rx.next().await {
            let Some(message) = from_upstream(message) else {
                continue;
            };
            let closing = matches!(message, ws::Message::Close(_));
            if client_tx.send(message).await.is_err() || closing {
                break;
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::select! {
        _ = client_to_guest => tracing::debug!(%key, "client closed terminal session"),
        _ = guest_to_client => tracing::debug!(%key, "guest closed terminal session"),
    }
}

fn to_upstream(message: ws::Message) -> tungstenite::Message {
    match message {
        ws::Message::Text(text) => tungstenite::Message::Text(text.as_str().to_owned().into()),
        ws::Message::Binary(data) => tungstenite::Message::Binary(data),
        ws::Message::Ping(data) => tungstenite::Message::Ping(data),
        ws::Message::Pong(data) => tungstenite::Message::Pong(data),
        ws::Message::Close(frame) => tungstenite::Message::Close(frame.map(|frame| CloseFrame {
            code: CloseCode::from(frame.code),
            reason: frame.reason.as_str().to_owned().into(),
        })),
    }
}

fn from_upstream(message: tungstenite::Message) -> Option<ws::Message> {
    let message = match message {
        tungstenite::Message::Text(text) => ws::Message::Text(text.as_str().to_owned().into()),
        tungstenite::Message::Binary(data) => ws::Message::Binary(data),
        tungstenite::Message::Ping(data) => ws::Message::Ping(data),
        tungstenite::Message::Pong(data) => ws::Message::Pong(data),
        tungstenite::Message::Close(frame) => ws::Message::Close(frame.map(|frame| {
            ws::CloseFrame {
                code: u16::from(frame.code),
                reason: frame.reason.as_str().to_owned().into(),
            }
        })),
        tungstenite::Message::Frame(_) => return None,
    };
    Some(message)
}

/// The guest terminal's WebSocket URL, carrying the client's query string.
fn guest_terminal_url(ip: Ipv4Addr, port: u16, path: &str, query: Option<&str>) -> String {
    let mut url = format!("ws://{ip}:{port}/{}", path.trim_start_matches('/'));
    if let Some(query) = query.filter(|query| !query.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn guest_files_url(ip: Ipv4Addr, port: u16, path: &str, query: Option<&str>) -> String {
    let mut url = format!("http://{ip}:{port}/{}", path.trim_start_matches('/'));
    if let Some(query) = query.filter(|query| !query.is_empty()) {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

fn end_to_end_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_hop_by_hop(name) {
            forwarded.append(name.clone(), value.clone());
        }
    }
    forwarded
}

async fn check_tcp(ip: Ipv4Addr, port: u16) -> bool {
    matches!(
        tokio::time::timeout(HEALTH_CHECK_TIMEOUT, TcpStream::connect((ip, port))).await,
        Ok(Ok(_))
    )
}

async fn check_files(client: &reqwest::Client, ip: Ipv4Addr, port: u16) -> bool {
    client
        .get(format!("http://{ip}:{port}/health"))
        .timeout(HEALTH_CHECK_TIMEOUT)
        .send()
        .await
        .is_ok_and(|response| response.status().is_success())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn test_guest_urls_keep_query() {
        let ip = Ipv4Addr::new(172, 16, 0, 11);

        assert_eq!(
            guest_terminal_url(ip, 7681, "/ws", Some("cols=80&rows=24")),
            "ws://172.16.0.11:7681/ws?cols=80&rows=24"
        );
        assert_eq!(
            guest_terminal_url(ip, 7681, "ws", Some("")),
            "ws://172.16.0.11:7681/ws"
        );
        assert_eq!(
            guest_files_url(ip, 8090, "src/main.rs", None),
            "http://172.16.0.11:8090/src/main.rs"
        );
        assert_eq!(guest_files_url(ip, 8090, "", None), "http://172.16.0.11:8090/");
    }

    #[test]
    fn test_hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(header::HOST, HeaderValue::from_static("agent:8080"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.append(header::ACCEPT, HeaderValue::from_static("text/plain"));
        headers.append(header::ACCEPT, HeaderValue::from_static("*/*"));

        let forwarded = end_to_end_headers(&headers);
        assert_eq!(forwarded.len(), 3);
        assert!(forwarded.get(header::CONNECTION).is_none());
        assert!(forwarded.get(header::HOST).is_none());
        assert_eq!(forwarded.get_all(header::ACCEPT).iter().count(), 2);
    }

    #[test]
    fn test_close_frames_survive_conversion() {
        let close = ws::Message::Close(Some(ws::CloseFrame {
            code: 1000,
            reason: String::from("bye").into(),
        }));

        let upstream = to_upstream(close);
        let tungstenite::Message::Close(Some(frame)) = &upstream else {
            panic!("expected close frame, got {upstream:?}");
        };
        assert_eq!(frame.code, CloseCode::Normal);
        assert_eq!(frame.reason.as_str(), "bye");

        let back = from_upstream(upstream);
        assert!(matches!(
            back,
            Some(ws::Message::Close(Some(ws::CloseFrame { code: 1000, .. })))
        ));
    }

    #[test]
    fn test_text_frames_survive_conversion() {
        let upstream = to_upstream(ws::Message::Text(String::from("ls -la\n").into()));
        assert_eq!(upstream.to_text().ok(), Some("ls -la\n"));

        let back = from_upstream(tungstenite::Message::Text(String::from("total 0\n").into()));
        match back {
            Some(ws::Message::Text(text)) => assert_eq!(text.as_str(), "total 0\n"),
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
