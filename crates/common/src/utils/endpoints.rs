//! Relay endpoint construction
//!
//! The relay is configured by its HTTP(S) base URL. Websocket endpoints use the
//! matching `ws`/`wss` scheme on the same host.

use url::Url;

use crate::constants::{LATENCY_PATH, LOGIN_PATH, SERVER_NAME_QUERY_PARAM};
use crate::error::{AgentError, Result};

/// Map `http`→`ws` and `https`→`wss`; websocket schemes pass through
fn websocket_url(base: &Url) -> Result<Url> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(AgentError::fatal(format!(
                "unsupported relay url scheme {:?}",
                other
            )));
        }
    };

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| AgentError::fatal(format!("cannot use {} as a websocket url", base)))?;
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

/// `{relay}/login?server_name=<name>`
pub fn login_url(base: &Url, server_name: &str) -> Result<Url> {
    let mut url = websocket_url(base)?;
    url.set_path(LOGIN_PATH);
    url.query_pairs_mut()
        .append_pair(SERVER_NAME_QUERY_PARAM, server_name);
    Ok(url)
}

/// `{relay}/latency`
pub fn latency_url(base: &Url) -> Result<Url> {
    let mut url = websocket_url(base)?;
    url.set_path(LATENCY_PATH);
    Ok(url)
}

/// `{relay}/proxy/ide/{server_id}/server`, appended to any base path
pub fn tunnel_url(base: &Url, server_id: &str) -> Result<Url> {
    let mut url = websocket_url(base)?;
    let path = format!(
        "{}/proxy/ide/{}/server",
        base.path().trim_end_matches('/'),
        server_id
    );
    url.set_path(&path);
    Ok(url)
}
