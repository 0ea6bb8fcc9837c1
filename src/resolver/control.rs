use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::exec::{CommandError, CommandRunner};

/// Service state as reported by the control channel. Kept as three states;
/// a stopped resolver is never displayed as running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Running,
    Stopped,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolverStatus {
    pub state: ServiceState,
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Thin wrapper over `unbound-control`.
pub struct ResolverControl {
    runner: Arc<dyn CommandRunner>,
    control_bin: String,
    timeout: Duration,
}

impl ResolverControl {
    pub fn new(runner: Arc<dyn CommandRunner>, control_bin: impl Into<String>, timeout: Duration) -> Self {
        Self { runner, control_bin: control_bin.into(), timeout }
    }

    async fn control(&self, args: &[&str]) -> Result<String, CommandError> {
        let out = self.runner.run(&self.control_bin, args, self.timeout).await?;
        Ok(out.stdout)
    }

    /// Raw `key=value` statistics dump, counters not reset.
    pub async fn stats(&self) -> Result<BTreeMap<String, String>, CommandError> {
        let raw = self.control(&["stats_noreset"]).await?;
        Ok(parse_key_values(&raw))
    }

    pub async fn flush_cache(&self) -> Result<String, CommandError> {
        let out = self.control(&["flush_zone", "."]).await?;
        tracing::info!("Resolver cache flushed");
        Ok(out.trim().to_string())
    }

    /// Re-read configuration in the running resolver.
    pub async fn reload(&self) -> Result<String, CommandError> {
        let out = self.control(&["reload"]).await?;
        tracing::info!("Resolver reloaded");
        Ok(out.trim().to_string())
    }

    pub async fn status(&self) -> ResolverStatus {
        match self.control(&["status"]).await {
            Ok(out) => ResolverStatus {
                state: if out.contains("is running") {
                    ServiceState::Running
                } else {
                    ServiceState::Unknown
                },
                version: parse_version(&out),
                error: None,
            },
            Err(CommandError::Failed { stderr, .. }) if is_connect_failure(&stderr) => ResolverStatus {
                state: ServiceState::Stopped,
                version: None,
                error: Some(stderr),
            },
            Err(e) => {
                tracing::warn!("Resolver status unavailable: {}", e);
                ResolverStatus {
                    state: ServiceState::Unknown,
                    version: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

fn is_connect_failure(stderr: &str) -> bool {
    let s = stderr.to_ascii_lowercase();
    s.contains("connection refused") || s.contains("connect:") || s.contains("no such file")
}

fn parse_version(status: &str) -> Option<String> {
    status
        .lines()
        .find_map(|l| l.trim().strip_prefix("version:"))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Newline-delimited `key=value` pairs; other lines are ignored.
pub fn parse_key_values(raw: &str) -> BTreeMap<String, String> {
    raw.lines()
        .filter_map(|line| {
            let (k, v) = line.trim().split_once('=')?;
            let k = k.trim();
            (!k.is_empty()).then(|| (k.to_string(), v.trim().to_string()))
        })
        .collect()
}
