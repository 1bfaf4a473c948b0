//! Warm pool of outbound tunnel links
//!
//! The relay routes each incoming browser request onto a link the agent has
//! already dialed. The pool keeps up to `capacity` links dialed and waiting;
//! as soon as a link receives its first bytes it gives its slot back and is
//! bridged to the local proxy on its own task, so a long-lived bridge never
//! holds up the next dial.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_agent_common::constants::{DIAL_BACKOFF_MS, FIRST_CHUNK_SIZE, SESSION_HEADER};
use relay_agent_common::{AgentError, Cancelled, Result, generate_link_id, tunnel_url};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_tungstenite::MaybeTlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info_span};
use url::Url;

use crate::bridge::bridge;
use crate::severity::log_failure;
use crate::user_agent;
use crate::ws::{WsByteStream, client_request, dial};

/// Opens new tunnel links
#[async_trait]
pub trait LinkDialer: Send + Sync + 'static {
    type Link: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn dial(&self) -> Result<Self::Link>;
}

/// Dials tunnel links to the relay as websockets
pub struct RelayDialer {
    url: Url,
    session_token: String,
}

impl RelayDialer {
    pub fn new(relay_url: &Url, server_id: &str, session_token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            url: tunnel_url(relay_url, server_id)?,
            session_token: session_token.into(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl LinkDialer for RelayDialer {
    type Link = WsByteStream<MaybeTlsStream<TcpStream>>;

    async fn dial(&self) -> Result<Self::Link> {
        let user_agent = user_agent();
        let request = client_request(
            &self.url,
            &[
                (SESSION_HEADER, self.session_token.as_str()),
                ("User-Agent", user_agent.as_str()),
            ],
        )?;

        let socket = dial(request).await.map_err(|e| e.context("dial relay"))?;
        Ok(WsByteStream::new(socket))
    }
}

/// Bounded pool of tunnel links feeding the local proxy
pub struct TunnelPool<D> {
    dialer: Arc<D>,
    upstream_addr: SocketAddr,
    slots: Arc<Semaphore>,
    capacity: usize,
    dial_backoff: Duration,
}

impl<D: LinkDialer> TunnelPool<D> {
    /// Pool bridging links to the local proxy listening on `upstream_addr`
    pub fn new(dialer: D, upstream_addr: SocketAddr, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            dialer: Arc::new(dialer),
            upstream_addr,
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            dial_backoff: Duration::from_millis(DIAL_BACKOFF_MS),
        }
    }

    /// How long a failed dial keeps its slot before handing it back
    pub fn with_dial_backoff(mut self, backoff: Duration) -> Self {
        self.dial_backoff = backoff;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently held by dialing or waiting links
    pub fn outstanding(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Keep the pool full until `cancel` fires
    ///
    /// Per-link failures are logged and never end the loop. The only way out
    /// is cancellation, reported as a fatal error.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        loop {
            let permit = tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AgentError::cancelled("acquire tunnel slot"));
                }
                permit = self.slots.clone().acquire_owned() => permit
                    .map_err(|e| AgentError::fatal_with("acquire tunnel slot", e))?,
            };

            let link_id = generate_link_id();
            let task = LinkTask {
                dialer: self.dialer.clone(),
                upstream_addr: self.upstream_addr,
                dial_backoff: self.dial_backoff,
                cancel: cancel.clone(),
            };

            tokio::spawn(
                async move {
                    if let Err(e) = task.run(permit).await {
                        log_failure(&e, "tunnel link");
                    }
                }
                .instrument(info_span!("link", link_id = %link_id)),
            );
        }
    }
}

/// Lifecycle of one tunnel link: dial, first read, release slot, bridge
struct LinkTask<D> {
    dialer: Arc<D>,
    upstream_addr: SocketAddr,
    dial_backoff: Duration,
    cancel: CancellationToken,
}

impl<D: LinkDialer> LinkTask<D> {
    async fn run(self, permit: OwnedSemaphorePermit) -> Result<()> {
        let dialed = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(AgentError::recoverable_with("dial relay", Cancelled));
            }
            dialed = self.dialer.dial() => dialed,
        };

        let mut link = match dialed {
            Ok(link) => link,
            Err(e) => {
                // Hold the slot for a moment so an unreachable relay is not hammered
                tokio::select! {
                    _ = tokio::time::sleep(self.dial_backoff) => {}
                    _ = self.cancel.cancelled() => {}
                }
                drop(permit);
                return Err(e);
            }
        };
        debug!("Link dialed, waiting for traffic");

        let mut first = vec![0u8; FIRST_CHUNK_SIZE];
        let read = tokio::select! {
            _ = self.cancel.cancelled() => {
                Err(AgentError::recoverable_with("read first chunk", Cancelled))
            }
            read = link.read(&mut first) => read
                .map_err(|e| AgentError::recoverable_with("read first chunk", e)),
        };
        // The link is routed (or dead); either way its slot goes back now
        drop(permit);

        let n = match read {
            Ok(0) => {
                debug!("Link closed before carrying traffic");
                return Ok(());
            }
            Ok(n) => n,
            Err(e) => return Err(e),
        };
        first.truncate(n);
        debug!(bytes = n, "Link routed");

        let mut local = TcpStream::connect(self.upstream_addr)
            .await
            .map_err(|e| AgentError::recoverable_with("dial local proxy", e))?;
        local
            .write_all(&first)
            .await
            .map_err(|e| AgentError::recoverable_with("write first chunk", e))?;

        bridge(local, link, &self.cancel).await
    }
}
