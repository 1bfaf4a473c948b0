/// Number of tunnel links kept dialed and waiting for routed traffic
pub const WARM_POOL_SIZE: usize = 3;

/// Size of the buffer used for the first read of a fresh tunnel link (32 KiB)
pub const FIRST_CHUNK_SIZE: usize = 32 * 1024;

/// Delay before a slot is handed back after a failed relay dial (1 second)
pub const DIAL_BACKOFF_MS: u64 = 1000;

/// Pause after a failed accept on the local proxy listener (100 ms)
pub const ACCEPT_BACKOFF_MS: u64 = 100;

/// Fixed delay between proxy session restarts (1 second)
pub const RETRY_INTERVAL_SECS: u64 = 1;

/// Upper bound on closing one side of a bridge (2 seconds)
pub const CLOSE_TIMEOUT_MS: u64 = 2000;

/// Header carrying the session credential on REST calls and tunnel dials
pub const SESSION_HEADER: &str = "Session-Token";

/// Header carrying the agent version on the login upgrade
pub const AGENT_VERSION_HEADER: &str = "Agent-Version";

/// Query parameter naming the server a login is performed for
pub const SERVER_NAME_QUERY_PARAM: &str = "server_name";

/// Cookie the local service expects the shared-secret digest in
pub const AUTH_COOKIE_NAME: &str = "key";

/// Relay path of the login websocket
pub const LOGIN_PATH: &str = "/login";

/// Relay path of the latency check websocket
pub const LATENCY_PATH: &str = "/latency";

/// Relay used when none is configured
pub const DEFAULT_RELAY_URL: &str = "https://relay.example.com";

/// Local service proxied when none is configured
pub const DEFAULT_UPSTREAM_ADDR: &str = "localhost:8080";

/// Directory (under the user config dir) holding stored credentials
pub const CONFIG_DIR_NAME: &str = "relay-agent";
