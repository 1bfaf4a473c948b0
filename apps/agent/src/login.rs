//! Login handshake
//!
//! The relay answers a login upgrade with one `auth_url` message, waits for
//! the user to authorize the agent in a browser, and then sends the session
//! `token`. An `error` message may arrive at any point and ends the login.

use std::future::Future;
use std::io;
use std::process::Stdio;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use relay_agent_common::constants::AGENT_VERSION_HEADER;
use relay_agent_common::{AgentError, LoginMessage, Result, login_url};
use tokio::process::Command;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, info};
use url::Url;

use crate::AGENT_VERSION;
use crate::ws::{CloseError, client_request, dial};

/// Where the client is in the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginState {
    AwaitingAuthUrl,
    AwaitingToken,
    Done,
    Failed,
}

/// Client role of the login handshake over one websocket
pub struct LoginClient<S> {
    socket: S,
    state: LoginState,
}

impl<S> LoginClient<S>
where
    S: Stream<Item = std::result::Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin,
{
    pub fn new(socket: S) -> Self {
        Self {
            socket,
            state: LoginState::AwaitingAuthUrl,
        }
    }

    pub fn state(&self) -> LoginState {
        self.state
    }

    /// Read the authorization URL; must be the first read
    pub async fn read_auth_url(&mut self) -> Result<String> {
        self.read_expected(LoginState::AwaitingAuthUrl, LoginState::AwaitingToken)
            .await
    }

    /// Read the session token; must follow a successful [`Self::read_auth_url`]
    pub async fn read_session_token(&mut self) -> Result<String> {
        self.read_expected(LoginState::AwaitingToken, LoginState::Done)
            .await
    }

    /// Close the websocket once the handshake is over
    pub async fn close(mut self) {
        if let Err(e) = self.socket.close().await {
            debug!("Closing login websocket failed: {}", e);
        }
    }

    async fn read_expected(&mut self, expected: LoginState, next: LoginState) -> Result<String> {
        if self.state != expected {
            let state = self.state;
            self.state = LoginState::Failed;
            return Err(AgentError::protocol(format!(
                "read out of order: expected state {:?}, in {:?}",
                expected, state
            )));
        }

        let result = self.next_message().await.and_then(|msg| match (expected, msg) {
            (LoginState::AwaitingAuthUrl, LoginMessage::AuthUrl(url)) => Ok(url),
            (LoginState::AwaitingToken, LoginMessage::Token(token)) => Ok(token),
            (_, LoginMessage::Error(msg)) => Err(AgentError::upstream(msg)),
            (_, other) => Err(AgentError::protocol(format!(
                "unexpected message type {}",
                other.message_type()
            ))),
        });

        self.state = if result.is_ok() { next } else { LoginState::Failed };
        result
    }

    async fn next_message(&mut self) -> Result<LoginMessage> {
        loop {
            match self.socket.next().await {
                Some(Ok(Message::Text(text))) => return LoginMessage::decode(text.as_str()),
                Some(Ok(Message::Binary(_))) => {
                    return Err(AgentError::protocol("unexpected binary message"));
                }
                Some(Ok(Message::Close(frame))) => {
                    let cause = frame.map(|f| CloseError {
                        code: u16::from(f.code),
                        reason: f.reason.as_str().to_string(),
                    });
                    return Err(match cause {
                        Some(cause) => AgentError::recoverable_with("login connection closed", cause),
                        None => AgentError::recoverable("login connection closed"),
                    });
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(AgentError::recoverable_with("read msg", e)),
                None => return Err(AgentError::recoverable("login connection ended")),
            }
        }
    }
}

/// Run the client role to completion, opening the authorization URL with `open`
///
/// Failing to open the URL is not fatal: it is logged for the user to visit.
pub async fn run_handshake<S, F, Fut>(socket: S, open: F) -> Result<String>
where
    S: Stream<Item = std::result::Result<Message, WsError>>
        + Sink<Message, Error = WsError>
        + Unpin,
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = io::Result<()>>,
{
    let mut client = LoginClient::new(socket);

    let url = client
        .read_auth_url()
        .await
        .map_err(|e| e.context("read auth url"))?;

    if let Err(e) = open(url.clone()).await {
        debug!("Could not open browser: {}", e);
        info!("Visit {} to log in", url);
    }

    let token = client
        .read_session_token()
        .await
        .map_err(|e| e.context("read session token"))?;

    client.close().await;
    Ok(token)
}

/// Log in as `server_name`, returning the session token
pub async fn login(relay_url: &Url, server_name: &str) -> Result<String> {
    let url = login_url(relay_url, server_name)?;
    let request = client_request(&url, &[(AGENT_VERSION_HEADER, AGENT_VERSION)])?;
    let socket = dial(request).await.map_err(|e| e.context("login"))?;

    run_handshake(socket, open_browser).await
}

/// Open `url` in the user's default browser
pub async fn open_browser(url: String) -> io::Result<()> {
    let command = if cfg!(target_os = "macos") {
        let mut command = Command::new("open");
        command.arg(url);
        command
    } else if cfg!(target_os = "windows") {
        let mut command = Command::new("cmd");
        command.args(["/C", "start", ""]).arg(url);
        command
    } else {
        let mut command = Command::new("xdg-open");
        command.arg(url);
        command
    };

    run_opener(command).await
}

/// Run an opener command to completion; a non-zero exit counts as failure
async fn run_opener(mut command: Command) -> io::Result<()> {
    let status = command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;

    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!("browser opener exited with {}", status)))
    }
}
