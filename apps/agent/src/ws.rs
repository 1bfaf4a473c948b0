//! Websocket plumbing shared by login, latency check and tunnel links
//!
//! [`WsByteStream`] turns a message-oriented websocket into a plain duplex
//! byte stream so that tunnel links can be spliced with the same bridge that
//! handles TCP connections.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use futures_util::{Sink, Stream};
use relay_agent_common::{AgentError, ApiErrorBody, Result};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;
use url::Url;

/// Websocket connected to the relay
pub type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close codes that mean the peer ended the stream on purpose
/// (1000 normal, 1001 going away, 1005 no status received)
pub fn is_benign_close_code(code: u16) -> bool {
    matches!(code, 1000 | 1001 | 1005)
}

/// The peer closed the websocket with a non-benign code
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("websocket closed with code {code}: {reason}")]
pub struct CloseError {
    pub code: u16,
    pub reason: String,
}

/// Build an upgrade request for `url` carrying extra headers
pub fn client_request(url: &Url, headers: &[(&'static str, &str)]) -> Result<Request> {
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| AgentError::fatal_with(format!("invalid websocket url {}", url), e))?;

    for (name, value) in headers {
        let value = HeaderValue::from_str(value)
            .map_err(|e| AgentError::fatal_with(format!("invalid {} header", name), e))?;
        request.headers_mut().insert(*name, value);
    }

    Ok(request)
}

/// Perform the websocket upgrade; anything but 101 is reported with the relay's message
pub async fn dial(request: Request) -> Result<RelaySocket> {
    let uri = request.uri().clone();
    debug!("Dialing {}", uri);

    match connect_async(request).await {
        Ok((socket, _)) => Ok(socket),
        Err(WsError::Http(response)) => {
            let body = response.body().as_deref().unwrap_or_default();
            Err(ApiErrorBody::error_for_status(
                response.status().as_u16(),
                body,
            ))
        }
        Err(e) => Err(AgentError::recoverable_with(format!("dial {}", uri), e)),
    }
}

/// Duplex byte stream over a websocket
///
/// Binary messages carry the bytes (text messages are accepted too). A close
/// frame with a benign code, a missing close frame, or a dropped connection is
/// end-of-stream; any other close code is an error wrapping [`CloseError`].
/// Writes go out as binary messages.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    pending: Bytes,
    read_closed: bool,
}

impl<S> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            read_closed: false,
        }
    }
}

fn close_to_io(frame: Option<CloseFrame>) -> io::Result<()> {
    match frame {
        Some(frame) if !is_benign_close_code(u16::from(frame.code)) => {
            Err(io::Error::other(CloseError {
                code: u16::from(frame.code),
                reason: frame.reason.as_str().to_string(),
            }))
        }
        _ => Ok(()),
    }
}

fn ws_to_io(err: WsError) -> io::Error {
    match err {
        WsError::Io(e) => e,
        other => io::Error::other(other),
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if !self.pending.is_empty() {
                let n = buf.remaining().min(self.pending.len());
                let chunk = self.pending.split_to(n);
                buf.put_slice(&chunk);
                return Poll::Ready(Ok(()));
            }

            if self.read_closed {
                return Poll::Ready(Ok(()));
            }

            let next = ready!(Pin::new(&mut self.inner).poll_next(cx));
            match next {
                Some(Ok(Message::Binary(data))) => self.pending = data,
                Some(Ok(Message::Text(text))) => self.pending = Bytes::from(text),
                Some(Ok(Message::Close(frame))) => {
                    self.read_closed = true;
                    return Poll::Ready(close_to_io(frame));
                }
                // Pings are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(
                    WsError::ConnectionClosed
                    | WsError::AlreadyClosed
                    | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
                ))
                | None => {
                    self.read_closed = true;
                }
                Some(Err(e)) => {
                    self.read_closed = true;
                    return Poll::Ready(Err(ws_to_io(e)));
                }
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        ready!(Pin::new(&mut self.inner).poll_ready(cx)).map_err(ws_to_io)?;
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(Bytes::copy_from_slice(buf)))
            .map_err(ws_to_io)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(ws_to_io)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match ready!(Pin::new(&mut self.inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Poll::Ready(Ok(())),
            Err(e) => Poll::Ready(Err(ws_to_io(e))),
        }
    }
}
