//! End-to-end tests: a fake relay dials traffic through the agent to a local server

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use relay_agent::{Agent, AgentConfig};
use relay_agent_common::constants::SESSION_HEADER;
use relay_agent_common::{Result, auth_cookie_value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_util::sync::CancellationToken;
use url::Url;

/// A tunnel link as seen by the relay
struct RelayLink {
    path: String,
    session_token: Option<String>,
    ws: WebSocketStream<TcpStream>,
}

/// Relay stand-in accepting tunnel links and handing them to the test
async fn spawn_relay() -> (Url, mpsc::UnboundedReceiver<RelayLink>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut seen = None;
                let ws = accept_hdr_async(
                    stream,
                    |req: &Request, resp: Response| -> std::result::Result<Response, ErrorResponse> {
                        let token = req
                            .headers()
                            .get(SESSION_HEADER)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        seen = Some((req.uri().path().to_string(), token));
                        Ok(resp)
                    },
                )
                .await;

                if let (Ok(ws), Some((path, session_token))) = (ws, seen) {
                    let _ = tx.send(RelayLink {
                        path,
                        session_token,
                        ws,
                    });
                }
            });
        }
    });

    (url, rx)
}

/// Local server answering "hello" and reporting each raw request head
async fn spawn_upstream() -> (SocketAddr, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
                    .await;
            });
        }
    });

    (addr, rx)
}

async fn within<F: std::future::Future>(fut: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

/// Send a raw HTTP request down the link and collect everything until it closes
async fn exchange(ws: &mut WebSocketStream<TcpStream>, request: &'static [u8]) -> String {
    ws.send(Message::Binary(Bytes::from_static(request)))
        .await
        .unwrap();

    let mut response = Vec::new();
    while let Some(Ok(msg)) = ws.next().await {
        match msg {
            Message::Binary(data) => response.extend_from_slice(&data),
            Message::Text(text) => response.extend_from_slice(text.as_bytes()),
            _ => {}
        }
    }
    String::from_utf8(response).unwrap()
}

fn spawn_agent(config: AgentConfig) -> (CancellationToken, JoinHandle<Result<()>>) {
    let cancel = CancellationToken::new();
    let handle = tokio::spawn({
        let cancel = cancel.clone();
        async move { Agent::new(config).proxy(cancel).await }
    });
    (cancel, handle)
}

#[tokio::test]
async fn test_request_travels_from_relay_to_upstream() {
    let (upstream_addr, mut upstream_requests) = spawn_upstream().await;
    let (relay_url, mut links) = spawn_relay().await;

    let config = AgentConfig::new(relay_url, "srv_1", "tok_123")
        .with_upstream(upstream_addr.to_string())
        .with_upstream_secret(Some("secret".to_string()))
        .with_pool_size(2);
    let (cancel, session) = spawn_agent(config);

    let mut link = within(links.recv()).await.unwrap();
    assert_eq!(link.path, "/proxy/ide/srv_1/server");
    assert_eq!(link.session_token.as_deref(), Some("tok_123"));

    let response = within(exchange(
        &mut link.ws,
        b"GET /files HTTP/1.1\r\nHost: ide.test\r\nConnection: close\r\n\r\n",
    ))
    .await;
    assert!(response.starts_with("HTTP/1.1 200 OK"), "got {:?}", response);
    assert!(response.ends_with("hello"));

    let request = within(upstream_requests.recv()).await.unwrap();
    assert!(request.starts_with("GET /files HTTP/1.1"));
    assert!(request.contains(&format!("key={}", auth_cookie_value("secret"))));

    cancel.cancel();
    let err = within(session).await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_link_closed_with_error_is_replaced() {
    let (upstream_addr, _upstream_requests) = spawn_upstream().await;
    let (relay_url, mut links) = spawn_relay().await;

    // A single slot: the replacement dial proves the slot came back
    let config = AgentConfig::new(relay_url, "srv_1", "tok")
        .with_upstream(upstream_addr.to_string())
        .with_pool_size(1);
    let (cancel, session) = spawn_agent(config);

    let mut first = within(links.recv()).await.unwrap();
    first
        .ws
        .close(Some(CloseFrame {
            code: CloseCode::Error,
            reason: "boom".into(),
        }))
        .await
        .unwrap();

    let mut second = within(links.recv()).await.unwrap();
    let response = within(exchange(
        &mut second.ws,
        b"GET / HTTP/1.1\r\nHost: ide.test\r\nConnection: close\r\n\r\n",
    ))
    .await;
    assert!(response.ends_with("hello"));

    cancel.cancel();
    let err = within(session).await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
}

#[tokio::test]
async fn test_without_secret_no_cookie_is_sent() {
    let (upstream_addr, mut upstream_requests) = spawn_upstream().await;
    let (relay_url, mut links) = spawn_relay().await;

    let config = AgentConfig::new(relay_url, "srv_1", "tok")
        .with_upstream(upstream_addr.to_string())
        .with_upstream_secret(Some(String::new()))
        .with_pool_size(1);
    let (cancel, session) = spawn_agent(config);

    let mut link = within(links.recv()).await.unwrap();
    within(exchange(
        &mut link.ws,
        b"GET / HTTP/1.1\r\nHost: ide.test\r\nConnection: close\r\n\r\n",
    ))
    .await;

    let request = within(upstream_requests.recv()).await.unwrap().to_lowercase();
    assert!(!request.contains("cookie:"));

    cancel.cancel();
    within(session).await.unwrap().unwrap_err();
}
