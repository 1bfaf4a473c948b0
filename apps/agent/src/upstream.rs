//! Local reverse proxy in front of the development server
//!
//! Every tunneled request passes through here. When a shared secret is
//! configured the proxy adds a `key` cookie holding the secret's SHA-256 so
//! the local service can tell tunneled traffic from stray local requests.
//! Websocket upgrades get a dedicated upstream connection and are spliced
//! with [`bridge`] once both sides have switched protocols.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{CONNECTION, HeaderValue, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use relay_agent_common::constants::{ACCEPT_BACKOFF_MS, AUTH_COOKIE_NAME};
use relay_agent_common::{
    AgentError, Result, append_cookie, auth_cookie_value, is_upgrade_request, remove_hop_headers,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::bridge;
use crate::severity::log_failure;

pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Single-upstream HTTP reverse proxy
pub struct UpstreamProxy {
    /// Local service address (host:port)
    target: String,

    /// Precomputed `key` cookie value
    auth_cookie: Option<String>,

    client: Client<HttpConnector, Incoming>,
}

impl UpstreamProxy {
    pub fn new(target: impl Into<String>, secret: Option<&str>) -> Self {
        Self {
            target: target.into(),
            auth_cookie: secret.map(auth_cookie_value),
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Accept connections until `cancel` fires
    ///
    /// Each connection is served on its own task; cancellation also tears
    /// down connections that are still open, spliced upgrades included.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) {
        info!(upstream = %self.target, "Local proxy listening on {:?}", listener.local_addr().ok());

        let listener = &listener;
        self.serve_with(move || listener.accept(), cancel).await;
    }

    /// [`Self::serve`] over any source of accepted connections
    ///
    /// Accept errors (e.g. running out of file descriptors) are logged and
    /// retried after a short pause; only cancellation ends the loop.
    async fn serve_with<F, Fut>(self: Arc<Self>, mut accept: F, cancel: CancellationToken)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = io::Result<(TcpStream, SocketAddr)>>,
    {
        let backoff = Duration::from_millis(ACCEPT_BACKOFF_MS);

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    log_failure(
                        &AgentError::recoverable_with("accept local proxy connection", e),
                        "local proxy accept",
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => continue,
                    }
                }
            };

            let proxy = self.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                proxy.serve_connection(stream, peer, cancel).await;
            });
        }
    }

    async fn serve_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        let conn_cancel = cancel.clone();
        let service = service_fn(move |req| {
            let proxy = self.clone();
            let cancel = conn_cancel.clone();
            async move { Ok::<_, Infallible>(proxy.handle(req, peer, cancel).await) }
        });

        let conn = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades();

        tokio::select! {
            result = conn => {
                if let Err(e) = result {
                    debug!("Local proxy connection from {} ended: {}", peer, e);
                }
            }
            _ = cancel.cancelled() => {}
        }
    }

    /// Forward one request and produce the response for the tunnel side
    pub async fn handle(
        &self,
        mut req: Request<Incoming>,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> Response<ProxyBody> {
        if let Some(cookie) = &self.auth_cookie
            && let Err(e) = append_cookie(req.headers_mut(), AUTH_COOKIE_NAME, cookie)
        {
            log_failure(&AgentError::recoverable_with("inject auth cookie", e), "proxy request");
            return error_response(StatusCode::BAD_GATEWAY);
        }

        let upgrade = is_upgrade_request(req.headers());
        let protocol = req.headers().get(UPGRADE).cloned();

        remove_hop_headers(req.headers_mut());
        append_forwarded_for(&mut req, peer);

        let result = match protocol {
            Some(protocol) if upgrade => {
                let headers = req.headers_mut();
                headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
                headers.insert(UPGRADE, protocol);
                self.forward_upgrade(req, cancel).await
            }
            _ => self.forward(req).await,
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                log_failure(&e.context(format!("proxy to {}", self.target)), "proxy request");
                error_response(StatusCode::BAD_GATEWAY)
            }
        }
    }

    async fn forward(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        let path = path_and_query(req.uri());
        *req.uri_mut() = format!("http://{}{}", self.target, path)
            .parse::<Uri>()
            .map_err(|e| AgentError::recoverable_with("build upstream uri", e))?;

        debug!("Forwarding {} {}", req.method(), path);

        let mut response = self
            .client
            .request(req)
            .await
            .map_err(|e| AgentError::recoverable_with("send request", e))?;

        remove_hop_headers(response.headers_mut());
        Ok(response.map(|body| body.boxed()))
    }

    async fn forward_upgrade(
        &self,
        mut req: Request<Incoming>,
        cancel: CancellationToken,
    ) -> Result<Response<ProxyBody>> {
        let path = path_and_query(req.uri());
        *req.uri_mut() = path
            .parse::<Uri>()
            .map_err(|e| AgentError::recoverable_with("build upstream uri", e))?;

        debug!("Forwarding upgrade {} {}", req.method(), path);

        let downstream = hyper::upgrade::on(&mut req);

        let stream = TcpStream::connect(&self.target)
            .await
            .map_err(|e| AgentError::recoverable_with("connect", e))?;
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| AgentError::recoverable_with("handshake", e))?;

        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                debug!("Upstream upgrade connection ended: {}", e);
            }
        });

        let mut response = sender
            .send_request(req)
            .await
            .map_err(|e| AgentError::recoverable_with("send upgrade request", e))?;

        if response.status() != StatusCode::SWITCHING_PROTOCOLS {
            remove_hop_headers(response.headers_mut());
            return Ok(response.map(|body| body.boxed()));
        }

        let upstream = hyper::upgrade::on(&mut response);
        tokio::spawn(async move {
            let spliced = match tokio::try_join!(downstream, upstream) {
                Ok((downstream, upstream)) => {
                    bridge(TokioIo::new(downstream), TokioIo::new(upstream), &cancel).await
                }
                Err(e) => Err(AgentError::recoverable_with("complete upgrade", e)),
            };
            if let Err(e) = spliced {
                log_failure(&e, "upgraded connection");
            }
        });

        Ok(response.map(|body| body.boxed()))
    }
}

fn path_and_query(uri: &Uri) -> String {
    uri.path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string())
}

fn append_forwarded_for(req: &mut Request<Incoming>, peer: SocketAddr) {
    let ip = peer.ip().to_string();
    let value = match req
        .headers()
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{}, {}", prior, ip),
        None => ip,
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        req.headers_mut().insert(X_FORWARDED_FOR, value);
    }
}

fn error_response(status: StatusCode) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(
        status.canonical_reason().unwrap_or("proxy error"),
    ))
    .map_err(|never| match never {})
    .boxed();

    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}
