//! Log Normalizer: reads the resolver's query log from exactly one source and
//! turns it into [`QueryEvent`]s, newest first.

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::config::LogsConfig;
use crate::exec::{CommandError, CommandRunner};

pub mod event;
pub mod parser;

pub use event::{QueryEvent, QueryStatus, QueryType};
pub use parser::parse_line;

/// Raw lines shown by the diagnostics endpoint.
const DEBUG_SAMPLE_LINES: usize = 20;
/// Window used for the parse-success ratio.
const DEBUG_RATIO_LINES: usize = 200;

const JOURNALCTL: &str = "journalctl";

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("journal read failed: {0}")]
    Journal(#[from] CommandError),
}

/// Where the resolver's query log comes from. One per deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSource {
    File(PathBuf),
    Journal(String),
}

impl LogSource {
    pub fn from_config(cfg: &LogsConfig) -> Self {
        match cfg.source.as_str() {
            "journal" => LogSource::Journal(cfg.journal_unit.clone()),
            _ => LogSource::File(cfg.path.clone()),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LogSource::File(_) => "file",
            LogSource::Journal(_) => "journal",
        }
    }

    pub fn location(&self) -> String {
        match self {
            LogSource::File(p) => p.display().to_string(),
            LogSource::Journal(unit) => format!("journal:{unit}"),
        }
    }
}

/// Result of a "last N" read. `error` is set when the source could not be
/// read and the events list is empty because of it rather than because
/// the resolver logged nothing.
#[derive(Debug, Clone, Serialize)]
pub struct LogRead {
    pub source: &'static str,
    pub events: Vec<QueryEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DebugLine {
    pub raw: String,
    pub format: Option<&'static str>,
    pub parsed: Option<QueryEvent>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogDiagnostics {
    pub source: &'static str,
    pub location: String,
    pub found: bool,
    pub lines: Vec<DebugLine>,
    pub sampled: usize,
    pub parsed: usize,
    pub parse_ratio: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct LogReader {
    source: LogSource,
    runner: Arc<dyn CommandRunner>,
    tail_lines: usize,
    journal_lines: usize,
    timeout: Duration,
}

impl LogReader {
    pub fn new(
        source: LogSource,
        runner: Arc<dyn CommandRunner>,
        tail_lines: usize,
        journal_lines: usize,
        timeout: Duration,
    ) -> Self {
        Self { source, runner, tail_lines, journal_lines, timeout }
    }

    pub fn from_config(cfg: &LogsConfig, runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self::new(
            LogSource::from_config(cfg),
            runner,
            cfg.tail_lines,
            cfg.journal_lines,
            timeout,
        )
    }

    pub fn source(&self) -> &LogSource {
        &self.source
    }

    /// Raw physical lines, oldest first, bounded by the tail/journal window.
    pub async fn raw_lines(&self) -> Result<Vec<String>, LogError> {
        match &self.source {
            LogSource::File(path) => {
                let bytes = match tokio::fs::read(path).await {
                    Ok(b) => b,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(LogError::NotFound(path.clone()));
                    }
                    Err(source) => return Err(LogError::Io { path: path.clone(), source }),
                };
                let content = String::from_utf8_lossy(&bytes);
                Ok(tail(&content, self.tail_lines))
            }
            LogSource::Journal(unit) => {
                let count = self.journal_lines.to_string();
                let out = self
                    .runner
                    .run(
                        JOURNALCTL,
                        &["-u", unit, "-n", &count, "--no-pager", "-o", "short"],
                        self.timeout,
                    )
                    .await?;
                Ok(tail(&out.stdout, self.journal_lines))
            }
        }
    }

    /// Up to `limit` most recent events, newest first. Never fails: an
    /// unreadable source yields an empty list with `error` set.
    pub async fn recent(&self, limit: usize) -> LogRead {
        match self.raw_lines().await {
            Ok(lines) => LogRead {
                source: self.source.kind(),
                events: parse_newest_first(&lines, limit),
                error: None,
            },
            Err(e) => {
                tracing::warn!("Log source {} unavailable: {}", self.source.location(), e);
                LogRead {
                    source: self.source.kind(),
                    events: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Everything inside the read window, newest first.
    pub async fn all(&self) -> LogRead {
        self.recent(usize::MAX).await
    }

    /// Last raw lines next to their parse result plus a coarse success ratio.
    /// A missing source is reported as `found: false`, never as an error.
    pub async fn diagnostics(&self) -> LogDiagnostics {
        let lines = match self.raw_lines().await {
            Ok(lines) => lines,
            Err(e) => {
                return LogDiagnostics {
                    source: self.source.kind(),
                    location: self.source.location(),
                    found: false,
                    lines: Vec::new(),
                    sampled: 0,
                    parsed: 0,
                    parse_ratio: 0.0,
                    error: Some(e.to_string()),
                };
            }
        };

        let sample_start = lines.len().saturating_sub(DEBUG_SAMPLE_LINES);
        let sample = lines[sample_start..]
            .iter()
            .map(|raw| {
                let format = parser::format_name(raw);
                DebugLine {
                    raw: raw.clone(),
                    format,
                    parsed: format.and_then(|_| parse_line(raw)),
                }
            })
            .collect();

        let ratio_start = lines.len().saturating_sub(DEBUG_RATIO_LINES);
        let window = &lines[ratio_start..];
        let parsed = window.iter().filter(|l| parse_line(l).is_some()).count();
        let parse_ratio = if window.is_empty() {
            0.0
        } else {
            (parsed as f64 / window.len() as f64 * 1000.0).round() / 1000.0
        };

        LogDiagnostics {
            source: self.source.kind(),
            location: self.source.location(),
            found: true,
            lines: sample,
            sampled: window.len(),
            parsed,
            parse_ratio,
            error: None,
        }
    }
}

/// Last `n` non-empty lines of `content`, oldest first.
fn tail(content: &str, n: usize) -> Vec<String> {
    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].iter().map(|l| l.to_string()).collect()
}

/// Parse from the end of the window backwards so the newest events come first.
pub fn parse_newest_first(lines: &[String], limit: usize) -> Vec<QueryEvent> {
    lines
        .iter()
        .rev()
        .filter_map(|l| parse_line(l))
        .take(limit)
        .collect()
}
