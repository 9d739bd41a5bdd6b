mod common;

use std::{net::Ipv4Addr, time::Duration};

use axum::{
    extract::{
        ws::{self, WebSocket, WebSocketUpgrade},
        RawQuery, State,
    },
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use common::TestAgent;
use fleetcore::registry::Resources;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::mpsc};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::HeaderValue,
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message,
    },
    MaybeTlsStream, WebSocketStream,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const TOKEN: &str = "proxy-secret";

/// Address of seat 1 on the loopback subnet.
const SEAT_IP: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 11);

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Terminal and file services listening where seat 1's sandbox lives.
struct Guest {
    terminal_port: u16,
    files_port: u16,

    /// Close codes the terminal received from the relay.
    closes: mpsc::UnboundedReceiver<Option<u16>>,
}

type ClientSocket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

//--------------------------------------------------------------------------------------------------
// Functions: Guest Services
//--------------------------------------------------------------------------------------------------

async fn start_guest() -> anyhow::Result<Guest> {
    let (closes_tx, closes) = mpsc::unbounded_channel();

    let terminal = Router::new()
        .route("/ws", get(terminal_handler))
        .with_state(closes_tx);
    let files = Router::new()
        .route("/echo", any(echo_handler))
        .route(
            "/start",
            get(|| async { (StatusCode::TEMPORARY_REDIRECT, [(header::LOCATION, "/secret")]) }),
        )
        .route("/secret", get(|| async { "followed-by-agent" }))
        .route("/health", get(|| async { "ok" }));

    let terminal_listener = TcpListener::bind((SEAT_IP, 0)).await?;
    let files_listener = TcpListener::bind((SEAT_IP, 0)).await?;
    let guest = Guest {
        terminal_port: terminal_listener.local_addr()?.port(),
        files_port: files_listener.local_addr()?.port(),
        closes,
    };

    tokio::spawn(async move {
        let _ = axum::serve(terminal_listener, terminal).await;
    });
    tokio::spawn(async move {
        let _ = axum::serve(files_listener, files).await;
    });

    Ok(guest)
}

async fn terminal_handler(
    State(closes): State<mpsc::UnboundedSender<Option<u16>>>,
    RawQuery(query): RawQuery,
    upgrade: WebSocketUpgrade,
) -> Response {
    upgrade
        .protocols(["tty"])
        .on_upgrade(move |socket| echo_terminal(socket, query, closes))
}

/// Greets with the query string, echoes frames, and closes on `bye`.
async fn echo_terminal(
    mut socket: WebSocket,
    query: Option<String>,
    closes: mpsc::UnboundedSender<Option<u16>>,
) {
    let greeting = format!("query={}", query.unwrap_or_default());
    if socket.send(ws::Message::Text(greeting.into())).await.is_err() {
        return;
    }

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            ws::Message::Text(text) if text.as_str() == "bye" => {
                let _ = socket
                    .send(ws::Message::Close(Some(ws::CloseFrame {
                        code: 1000,
                        reason: String::from("done").into(),
                    })))
                    .await;
                return;
            }
            ws::Message::Text(text) => {
                let reply = format!("echo:{}", text.as_str());
                let _ = socket.send(ws::Message::Text(reply.into())).await;
            }
            ws::Message::Binary(data) => {
                let _ = socket.send(ws::Message::Binary(data)).await;
            }
            ws::Message::Close(frame) => {
                let _ = closes.send(frame.map(|frame| frame.code));
                return;
            }
            _ => {}
        }
    }
}

async fn echo_handler(
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
        "query": uri.query(),
        "trace": headers.get("x-trace").and_then(|value| value.to_str().ok()),
        "body": body,
    }))
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn start_agent_with_seat(guest: &Guest) -> anyhow::Result<TestAgent> {
    let agent = TestAgent::start_on_loopback(TOKEN, guest.terminal_port, guest.files_port).await?;
    let sandbox = agent.registry.create("ws-1", 1, Resources::default()).await?;
    assert_eq!(sandbox.ip, SEAT_IP);
    Ok(agent)
}

async fn open_terminal(agent: &TestAgent) -> anyhow::Result<ClientSocket> {
    let mut request = format!("ws://{}/proxy/ws-1/1/terminal?cols=80&rows=24", agent.addr)
        .into_client_request()?;
    request
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("tty"));

    let (socket, response) = connect_async(request).await?;
    assert_eq!(
        response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok()),
        Some("tty")
    );
    Ok(socket)
}

async fn next_message(socket: &mut ClientSocket) -> anyhow::Result<Message> {
    match tokio::time::timeout(RECV_TIMEOUT, socket.next()).await? {
        Some(message) => Ok(message?),
        None => anyhow::bail!("terminal stream ended"),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_terminal_relays_frames_until_guest_closes() -> anyhow::Result<()> {
    let guest = start_guest().await?;
    let agent = start_agent_with_seat(&guest).await?;
    let mut socket = open_terminal(&agent).await?;

    assert_eq!(next_message(&mut socket).await?.to_text()?, "query=cols=80&rows=24");

    socket.send(Message::text("ls -la")).await?;
    assert_eq!(next_message(&mut socket).await?.to_text()?, "echo:ls -la");

    socket.send(Message::binary(vec![0u8, 1, 2, 255])).await?;
    match next_message(&mut socket).await? {
        Message::Binary(data) => assert_eq!(&data[..], &[0u8, 1, 2, 255]),
        other => panic!("expected binary frame, got {other:?}"),
    }

    socket.send(Message::text("bye")).await?;
    match next_message(&mut socket).await? {
        Message::Close(Some(frame)) => {
            assert_eq!(frame.code, CloseCode::Normal);
            assert_eq!(frame.reason.as_str(), "done");
        }
        other => panic!("expected close frame, got {other:?}"),
    }
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_terminal_close_from_client_reaches_guest() -> anyhow::Result<()> {
    let mut guest = start_guest().await?;
    let agent = start_agent_with_seat(&guest).await?;
    let mut socket = open_terminal(&agent).await?;
    next_message(&mut socket).await?;

    socket
        .close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: String::from("client done").into(),
        }))
        .await?;

    let code = tokio::time::timeout(RECV_TIMEOUT, guest.closes.recv()).await?;
    assert_eq!(code, Some(Some(1000)));
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_files_round_trip_with_query_and_body() -> anyhow::Result<()> {
    let guest = start_guest().await?;
    let agent = start_agent_with_seat(&guest).await?;

    let response = reqwest::Client::new()
        .post(format!("{}/proxy/ws-1/1/files/echo?x=1&y=two", agent.url()))
        .header("x-trace", "abc")
        .body("hello guest")
        .send()
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let echoed: Value = response.json().await?;
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["path"], "/echo");
    assert_eq!(echoed["query"], "x=1&y=two");
    assert_eq!(echoed["trace"], "abc");
    assert_eq!(echoed["body"], "hello guest");

    // Guest statuses pass through, including on the files root.
    let response = reqwest::get(format!("{}/proxy/ws-1/1/files", agent.url())).await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_files_redirects_reach_the_browser() -> anyhow::Result<()> {
    let guest = start_guest().await?;
    let agent = start_agent_with_seat(&guest).await?;

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;
    let response = client
        .get(format!("{}/proxy/ws-1/1/files/start", agent.url()))
        .send()
        .await?;

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok()),
        Some("/secret")
    );
    assert_ne!(response.text().await?, "followed-by-agent");
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_guest_health_reports_both_services() -> anyhow::Result<()> {
    let guest = start_guest().await?;
    let agent = start_agent_with_seat(&guest).await?;

    let response = reqwest::get(format!("{}/proxy/ws-1/1/health", agent.url())).await?;
    assert_eq!(response.status(), StatusCode::OK);

    let health: Value = response.json().await?;
    assert_eq!(health["healthy"], true);
    assert_eq!(health["terminal"], true);
    assert_eq!(health["files"], true);
    Ok(())
}
