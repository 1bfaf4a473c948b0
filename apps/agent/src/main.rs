use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use relay_agent::{
    AGENT_VERSION, Agent, AgentConfig, ApiClient, ConfigKey, CredentialStore, login, ping,
};
use relay_agent_common::ErrorKind;
use relay_agent_common::constants::{DEFAULT_RELAY_URL, DEFAULT_UPSTREAM_ADDR};
use relay_agent_common::validation::{server_name_from_hostname, validate_server_name};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

/// CLI arguments for the relay agent
#[derive(Parser, Debug)]
#[command(name = "relay-agent")]
#[command(about = "Expose a local development server through a relay", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register this machine with the relay and start proxying
    Bind {
        /// Server name; derived from the hostname when omitted
        name: Option<String>,

        /// Relay base URL
        #[arg(long, env = "RELAY_AGENT_URL", default_value = DEFAULT_RELAY_URL)]
        relay_url: Url,

        #[command(flatten)]
        upstream: UpstreamArgs,
    },

    /// Register a server without proxying
    Link {
        /// Server name
        name: String,

        /// Relay base URL
        #[arg(long, env = "RELAY_AGENT_URL", default_value = DEFAULT_RELAY_URL)]
        relay_url: Url,
    },

    /// Proxy a previously registered server
    Proxy {
        #[command(flatten)]
        upstream: UpstreamArgs,
    },

    /// Print the agent version
    Version,
}

#[derive(clap::Args, Debug)]
struct UpstreamArgs {
    /// Address of the local server to proxy
    #[arg(long, default_value = DEFAULT_UPSTREAM_ADDR)]
    upstream_addr: String,

    /// Shared secret sent to the local server as the `key` cookie
    #[arg(long, env = "RELAY_AGENT_UPSTREAM_SECRET", hide_env_values = true)]
    upstream_secret: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl-C, shutting down gracefully...");
                cancel.cancel();
            }
        }
    });

    match cli.command {
        Command::Bind {
            name,
            relay_url,
            upstream,
        } => bind(name, relay_url, upstream, cancel).await,
        Command::Link { name, relay_url } => link(name, relay_url, cancel).await,
        Command::Proxy { upstream } => proxy(upstream, cancel).await,
        Command::Version => {
            println!("relay-agent {}", AGENT_VERSION);
            Ok(())
        }
    }
}

async fn bind(
    name: Option<String>,
    relay_url: Url,
    upstream: UpstreamArgs,
    cancel: CancellationToken,
) -> Result<()> {
    let name = resolve_server_name(name)?;
    let store = CredentialStore::new()?;

    let (token, client) = session(&store, &relay_url, &name, true, &cancel).await?;

    let server = interruptible(&cancel, client.register_server(&name))
        .await?
        .context("Failed to register server")?;
    store.write(ConfigKey::ServerId, &server.id)?;
    store.write(ConfigKey::RelayUrl, relay_url.as_str())?;

    let access_url = interruptible(&cancel, client.access_url(&server.id))
        .await?
        .context("Failed to query server")?;

    run_agent(relay_url, server.id, token, upstream, &access_url, cancel).await;
    Ok(())
}

async fn link(name: String, relay_url: Url, cancel: CancellationToken) -> Result<()> {
    validate_server_name(&name)?;
    let store = CredentialStore::new()?;

    if let Some(id) = store.read(ConfigKey::ServerId)? {
        info!("Server already registered as {}", id);
        return Ok(());
    }

    let (_, client) = session(&store, &relay_url, &name, false, &cancel).await?;

    let server = interruptible(&cancel, client.register_server(&name))
        .await?
        .context("Failed to register server")?;
    store
        .write(ConfigKey::ServerId, &server.id)
        .context("Failed to store server id")?;

    info!("Successfully registered server {} ({})", server.name, server.id);
    Ok(())
}

async fn proxy(upstream: UpstreamArgs, cancel: CancellationToken) -> Result<()> {
    let store = CredentialStore::new()?;

    let (Some(token), Some(server_id), Some(relay_url)) = (
        store.read(ConfigKey::SessionToken)?,
        store.read(ConfigKey::ServerId)?,
        store.read(ConfigKey::RelayUrl)?,
    ) else {
        bail!("Failed to read configuration files, have you logged in?");
    };
    let relay_url = Url::parse(&relay_url)
        .with_context(|| format!("Stored relay URL {:?} is invalid", relay_url))?;

    let client = ApiClient::new(relay_url.clone(), &token)?;
    let access_url = interruptible(&cancel, client.access_url(&server_id))
        .await?
        .context("Failed to query server")?;

    run_agent(relay_url, server_id, token, upstream, &access_url, cancel).await;
    Ok(())
}

async fn run_agent(
    relay_url: Url,
    server_id: String,
    token: String,
    upstream: UpstreamArgs,
    access_url: &str,
    cancel: CancellationToken,
) {
    let config = AgentConfig::new(relay_url, server_id, token)
        .with_upstream(upstream.upstream_addr)
        .with_upstream_secret(upstream.upstream_secret);
    debug!("Agent configuration: {:?}", config);

    info!(
        "Proxying {} to the relay, access your server at {}",
        config.upstream_addr, access_url
    );
    Agent::new(config).keep_alive(cancel).await;
}

/// Validate an explicit name, or derive one from the hostname
fn resolve_server_name(name: Option<String>) -> Result<String> {
    match name {
        Some(name) => {
            validate_server_name(&name)?;
            Ok(name)
        }
        None => {
            let hostname = hostname::get().context("Failed to get hostname")?;
            let name = server_name_from_hostname(&hostname.to_string_lossy())?;
            info!("Using server name {}", name);
            Ok(name)
        }
    }
}

async fn check_latency(relay_url: &Url) -> Result<()> {
    let (latency, tolerable) = ping(relay_url)
        .await
        .context("Failed to measure latency to the relay")?;

    if !tolerable {
        bail!(
            "Connection latency to the relay is too high ({} ms) for a usable session",
            latency.as_millis()
        );
    }

    info!("Detected an acceptable latency of {} ms", latency.as_millis());
    Ok(())
}

/// Reuse the stored session if the relay still accepts it, otherwise log in
///
/// A session the relay rejects is deleted before logging in again.
/// `measure_latency` checks the connection before sending the user to a browser.
async fn session(
    store: &CredentialStore,
    relay_url: &Url,
    name: &str,
    measure_latency: bool,
    cancel: &CancellationToken,
) -> Result<(String, ApiClient)> {
    if let Some(token) = store.read(ConfigKey::SessionToken)? {
        let client = ApiClient::new(relay_url.clone(), &token)?;
        match interruptible(cancel, client.me()).await? {
            Ok(user) => {
                info!("Logged in as {}", user.username);
                return Ok((token, client));
            }
            Err(e) if e.kind() == ErrorKind::UpstreamReported => {
                warn!("Stored session was rejected ({}), logging in again", e);
                store.delete(ConfigKey::SessionToken)?;
            }
            Err(e) => return Err(e).context("Failed to verify stored session"),
        }
    }

    if measure_latency {
        interruptible(cancel, check_latency(relay_url)).await??;
    }
    let token = login_and_store(store, relay_url, name, cancel).await?;
    let client = ApiClient::new(relay_url.clone(), &token)?;
    let user = interruptible(cancel, client.me())
        .await?
        .context("Failed to fetch the logged in user")?;
    info!("Logged in as {}", user.username);

    Ok((token, client))
}

async fn login_and_store(
    store: &CredentialStore,
    relay_url: &Url,
    name: &str,
    cancel: &CancellationToken,
) -> Result<String> {
    let token = interruptible(cancel, login(relay_url, name))
        .await?
        .context("Failed to login")?;

    store
        .write(ConfigKey::SessionToken, &token)
        .context("Failed to store session token")?;
    store
        .write(ConfigKey::RelayUrl, relay_url.as_str())
        .context("Failed to store relay URL")?;

    Ok(token)
}

/// Run a setup step, giving up when Ctrl-C is pressed
async fn interruptible<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output> {
    cancel.run_until_cancelled(fut).await.context("Interrupted")
}
