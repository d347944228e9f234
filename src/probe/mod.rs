//! Echo probing against monitored endpoints.
//!
//! A probe failure (timeout, unreachable) is an expected outcome, reported
//! as an error value and folded into the tick's loss figure; it never aborts
//! a tick.

mod ping;

pub use ping::ping_once;

use regex::Regex;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;

/// Probe error types. `Timeout` and `Unreachable` are ordinary outcomes.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("target unreachable: {0}")]
    Unreachable(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("command failed: {0}")]
    Command(String),
}

static HOST_LABEL: OnceLock<Regex> = OnceLock::new();

fn host_label_re() -> &'static Regex {
    HOST_LABEL.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").unwrap()
    })
}

/// Whether a string is an acceptable probe target: an IP address or a
/// plausible hostname.
pub fn valid_target(value: &str) -> bool {
    let value = value.trim();
    if value.is_empty() {
        return false;
    }
    if value.parse::<IpAddr>().is_ok() {
        return true;
    }

    let host = value.strip_suffix('.').unwrap_or(value);
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = host.split('.').collect();
    // Four all-numeric labels are a malformed IPv4, not a hostname.
    if labels.len() == 4 && labels.iter().all(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_digit())) {
        return false;
    }
    labels.iter().all(|label| host_label_re().is_match(label))
}

/// Resolve a device address to an IP, via DNS when it is not a literal.
pub async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed: {}", e)))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", address)))
}
