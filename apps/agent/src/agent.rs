use std::sync::Arc;
use std::time::Duration;

use relay_agent_common::constants::RETRY_INTERVAL_SECS;
use relay_agent_common::{AgentError, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::pool::{LinkDialer, RelayDialer, TunnelPool};
use crate::severity::log_failure;
use crate::upstream::UpstreamProxy;

/// Composition root for one agent process
pub struct Agent {
    config: Arc<AgentConfig>,
}

impl Agent {
    pub fn new(config: AgentConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Run one proxy session against the relay
    ///
    /// Starts the local proxy on an ephemeral loopback port and keeps the
    /// tunnel pool running until `cancel` fires or the pool fails. A clean
    /// end-of-stream counts as a normal end of session. Everything the
    /// session spawned is cancelled before returning.
    pub async fn proxy(&self, cancel: CancellationToken) -> Result<()> {
        let dialer = RelayDialer::new(
            &self.config.relay_url,
            &self.config.server_id,
            self.config.session_token.as_str(),
        )?;
        self.proxy_with(dialer, cancel).await
    }

    /// [`Self::proxy`] with a custom link dialer
    pub async fn proxy_with<D: LinkDialer>(&self, dialer: D, cancel: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| AgentError::fatal_with("listen on local port", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| AgentError::fatal_with("read local proxy address", e))?;

        let session = cancel.child_token();

        let proxy = Arc::new(UpstreamProxy::new(
            self.config.upstream_addr.clone(),
            self.config.upstream_secret.as_deref(),
        ));
        let serve_cancel = session.clone();
        tokio::spawn(async move {
            proxy.serve(listener, serve_cancel).await;
            debug!("Local proxy stopped");
        });

        info!(
            server_id = %self.config.server_id,
            upstream = %self.config.upstream_addr,
            "Proxying through {}",
            local_addr
        );

        let pool = TunnelPool::new(dialer, local_addr, self.config.pool_size);
        let result = pool.run(session.clone()).await;
        session.cancel();

        match result {
            Err(e) if e.is_clean_close() => Ok(()),
            other => other,
        }
    }

    /// Run proxy sessions until `cancel` fires, re-establishing after each failure
    pub async fn keep_alive(&self, cancel: CancellationToken) {
        let retry_interval = Duration::from_secs(RETRY_INTERVAL_SECS);

        loop {
            if let Err(e) = self.proxy(cancel.clone()).await {
                if cancel.is_cancelled() {
                    break;
                }
                log_failure(&e, "proxy session");
            }
            if cancel.is_cancelled() {
                break;
            }

            warn!("connection to relay disrupted, re-establishing");
            tokio::select! {
                _ = tokio::time::sleep(retry_interval) => {}
                _ = cancel.cancelled() => break,
            }
        }

        info!("Agent stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
    use tokio::sync::mpsc;
    use url::Url;

    struct ChannelDialer(mpsc::UnboundedSender<DuplexStream>);

    #[async_trait]
    impl LinkDialer for ChannelDialer {
        type Link = DuplexStream;

        async fn dial(&self) -> Result<DuplexStream> {
            let (agent_end, relay_end) = duplex(64 * 1024);
            self.0
                .send(relay_end)
                .map_err(|_| AgentError::recoverable("test relay gone"))?;
            Ok(agent_end)
        }
    }

    fn config(upstream: &str) -> AgentConfig {
        AgentConfig::new(Url::parse("http://127.0.0.1:1").unwrap(), "srv_1", "tok")
            .with_upstream(upstream)
            .with_pool_size(2)
    }

    #[tokio::test]
    async fn test_proxy_with_routes_to_upstream() {
        // Upstream answering any request with a fixed body
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = upstream.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let _ = stream
                        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                        .await;
                });
            }
        });

        let agent = Agent::new(config(&upstream_addr.to_string()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let session = tokio::spawn({
            let cancel = cancel.clone();
            async move { agent.proxy_with(ChannelDialer(tx), cancel).await }
        });

        let mut link = rx.recv().await.unwrap();
        link.write_all(b"GET / HTTP/1.1\r\nHost: ide.test\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        link.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("ok"));

        cancel.cancel();
        let err = session.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_keep_alive_stops_on_cancel() {
        // Nothing listens on the relay address; the pool retries until cancelled
        let agent = Agent::new(config("127.0.0.1:1"));
        let cancel = CancellationToken::new();

        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { agent.keep_alive(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
