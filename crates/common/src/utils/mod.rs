mod cookie;
mod endpoints;
mod headers;
mod id;

pub use cookie::{append_cookie, auth_cookie_value};
pub use endpoints::{latency_url, login_url, tunnel_url};
pub use headers::{HOP_HEADERS, is_upgrade_request, remove_hop_headers};
pub use id::generate_link_id;
