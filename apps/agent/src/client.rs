//! Authenticated REST calls to the relay, plus the latency check

use std::time::Duration;

use futures_util::StreamExt;
use relay_agent_common::constants::SESSION_HEADER;
use relay_agent_common::{
    AccessUrlResponse, AgentError, ApiErrorBody, PingMessage, RegisterServerRequest, Result,
    Server, User, latency_url,
};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use crate::user_agent;
use crate::ws::{client_request, dial};

/// REST client for the relay API
#[derive(Clone)]
pub struct ApiClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl ApiClient {
    pub fn new(base_url: Url, token: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(user_agent())
            .build()
            .map_err(|e| AgentError::fatal_with("build http client", e))?;

        Ok(Self {
            http,
            base_url,
            token: token.into(),
        })
    }

    /// Register this machine under `name`; the relay treats repeats as idempotent
    pub async fn register_server(&self, name: &str) -> Result<Server> {
        let hostname = hostname::get()
            .map_err(|e| AgentError::fatal_with("get hostname", e))?
            .to_string_lossy()
            .into_owned();

        self.request(
            Method::POST,
            "/api/servers",
            Some(&RegisterServerRequest::new(name, hostname)),
        )
        .await
    }

    /// Browser-facing URL of the server
    pub async fn access_url(&self, id: &str) -> Result<String> {
        let response: AccessUrlResponse = self
            .request::<(), _>(Method::GET, &format!("/api/servers/{}/access-url", id), None)
            .await?;
        Ok(response.url)
    }

    pub async fn me(&self) -> Result<User> {
        self.request::<(), _>(Method::GET, "/api/users/me", None)
            .await
    }

    async fn request<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path);
        debug!("{} {}", method, url);

        let mut request = self
            .http
            .request(method, &url)
            .header(SESSION_HEADER, &self.token);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgentError::recoverable_with(format!("request {}", path), e))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| AgentError::recoverable_with(format!("read response of {}", path), e))?;

        if status != StatusCode::OK && status != StatusCode::CREATED {
            return Err(ApiErrorBody::error_for_status(status.as_u16(), &bytes));
        }

        serde_json::from_slice(&bytes).map_err(|e| {
            AgentError::recoverable_with(format!("unmarshal response of {}", path), e)
        })
    }
}

/// Measure websocket latency to the relay
///
/// Returns the measured latency and whether the relay deems it tolerable.
pub async fn ping(relay_url: &Url) -> Result<(Duration, bool)> {
    let url = latency_url(relay_url)?;
    let mut socket = dial(client_request(&url, &[])?)
        .await
        .map_err(|e| e.context("dial latency check"))?;

    let msg = loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => break serde_json::from_str::<PingMessage>(&text)?,
            Some(Ok(Message::Binary(data))) => break serde_json::from_slice::<PingMessage>(&data)?,
            Some(Ok(Message::Close(_))) | None => {
                return Err(AgentError::recoverable("latency check closed before reporting"));
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(AgentError::recoverable_with("read latency check", e)),
        }
    };

    let _ = socket.close(None).await;

    if msg.has_error() {
        return Err(AgentError::upstream(msg.error));
    }
    Ok((msg.latency(), msg.tolerable))
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_agent_common::ErrorKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answer one request with a canned response; yields the raw request
    async fn serve_once(status: &'static str, body: &'static str) -> (Url, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("http://{}", listener.local_addr().unwrap())).unwrap();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_lowercase();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| l.strip_prefix("content-length:"))
                        .and_then(|v| v.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&request).into_owned()
        });

        (url, handle)
    }

    const SERVER_JSON: &str = r#"{"id":"srv_1","user_id":"usr_1","name":"devbox","hostname":"devbox.local","created_at":"2024-03-01T10:00:00Z","last_connection_at":"2024-03-01T10:00:00Z"}"#;

    #[tokio::test]
    async fn test_register_server() {
        let (url, handle) = serve_once("201 Created", SERVER_JSON).await;
        let client = ApiClient::new(url, "tok_123").unwrap();

        let server = client.register_server("devbox").await.unwrap();
        assert_eq!(server.id, "srv_1");

        let request = handle.await.unwrap();
        let lower = request.to_lowercase();
        assert!(request.starts_with("POST /api/servers HTTP/1.1"));
        assert!(lower.contains("session-token: tok_123"));
        assert!(lower.contains(&format!("user-agent: relay-agent/{}", crate::AGENT_VERSION)));
        assert!(request.contains(r#""name":"devbox""#));
        assert!(request.contains(r#""hostname":"#));
    }

    #[tokio::test]
    async fn test_access_url() {
        let (url, handle) = serve_once("200 OK", r#"{"url":"https://devbox.relay.test"}"#).await;
        let client = ApiClient::new(url, "tok").unwrap();

        assert_eq!(
            client.access_url("srv_1").await.unwrap(),
            "https://devbox.relay.test"
        );
        let request = handle.await.unwrap();
        assert!(request.starts_with("GET /api/servers/srv_1/access-url HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_me() {
        let (url, _handle) = serve_once(
            "200 OK",
            r#"{"id":"usr_1","name":"Ada","username":"ada","email":"ada@example.com","created_at":"2024-01-01T00:00:00Z"}"#,
        )
        .await;
        let user = ApiClient::new(url, "tok").unwrap().me().await.unwrap();
        assert_eq!(user.username, "ada");
    }

    #[tokio::test]
    async fn test_error_envelope_is_surfaced() {
        let (url, _handle) = serve_once(
            "409 Conflict",
            r#"{"error":{"msg":"server name already taken"}}"#,
        )
        .await;
        let client = ApiClient::new(url, "tok").unwrap();

        let err = client.register_server("devbox").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamReported);
        assert_eq!(err.to_string(), "server name already taken");
    }

    #[tokio::test]
    async fn test_undecodable_error_reports_status() {
        let (url, _handle) = serve_once("500 Internal Server Error", "oops").await;
        let client = ApiClient::new(url, "tok").unwrap();

        let err = client.me().await.unwrap_err();
        assert_eq!(err.to_string(), "unexpected status code 500");
    }

    #[tokio::test]
    async fn test_ping_rejects_non_upgrade() {
        let (url, _handle) = serve_once("403 Forbidden", r#"{"error":{"msg":"agent too old"}}"#).await;

        // The relay refused the upgrade; its message or status is reported
        let err = ping(&url).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UpstreamReported);
    }
}
