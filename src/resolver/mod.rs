//! Everything the Bridge does *to* the resolver: control commands, one-off
//! DNS probes and host telemetry.

use std::path::Path;

pub mod control;
pub mod host;
pub mod probe;

pub use control::{ResolverControl, ResolverStatus, ServiceState};

const DEFAULT_DNS_PORT: u16 = 53;

/// Listen port from the resolver's `port:` directive, 53 when absent or
/// when the config cannot be read.
pub async fn listen_port(config_path: &Path) -> u16 {
    match tokio::fs::read_to_string(config_path).await {
        Ok(content) => parse_listen_port(&content),
        Err(e) => {
            tracing::debug!("Cannot read resolver config {}: {}", config_path.display(), e);
            DEFAULT_DNS_PORT
        }
    }
}

pub fn parse_listen_port(content: &str) -> u16 {
    content
        .lines()
        .map(|l| l.split('#').next().unwrap_or("").trim())
        .find_map(|l| l.strip_prefix("port:"))
        .and_then(|p| p.trim().trim_matches('"').parse().ok())
        .unwrap_or(DEFAULT_DNS_PORT)
}
