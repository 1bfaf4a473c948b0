//! Validation of user-supplied server names
//!
//! Server names end up in relay URLs and in the browser-facing access URL, so
//! they are restricted to a small, predictable alphabet.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// Lowercase letter followed by up to 50 lowercase letters, digits or underscores
static SERVER_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]{0,50}$").unwrap());

/// Validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error(
        "invalid server name {0:?}: must start with a lowercase letter and contain only lowercase letters, digits and '_' (max 51 characters)"
    )]
    InvalidServerName(String),

    #[error("cannot derive a server name from hostname {0:?}")]
    UnusableHostname(String),
}

/// Validate a server name
///
/// # Examples
///
/// ```
/// use relay_agent_common::validation::validate_server_name;
///
/// assert!(validate_server_name("devbox").is_ok());
/// assert!(validate_server_name("Dev-Box").is_err());
/// ```
pub fn validate_server_name(name: &str) -> Result<(), ValidationError> {
    if !SERVER_NAME_REGEX.is_match(name) {
        return Err(ValidationError::InvalidServerName(
            name.chars().take(60).collect::<String>(), // Limit error message
        ));
    }
    Ok(())
}

/// Derive a server name from a machine hostname
///
/// Takes the first DNS label, lowercased, with `-` replaced by `_`. The result
/// is validated, so hostnames such as `1host` are rejected rather than
/// producing a name the relay would refuse.
pub fn server_name_from_hostname(hostname: &str) -> Result<String, ValidationError> {
    let label = hostname
        .to_lowercase()
        .split('.')
        .next()
        .unwrap_or_default()
        .replace('-', "_");

    validate_server_name(&label)
        .map_err(|_| ValidationError::UnusableHostname(hostname.to_string()))?;
    Ok(label)
}
