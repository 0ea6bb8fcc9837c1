use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub resolver: ResolverConfig,
    pub logs: LogsConfig,
    pub settings: SettingsConfig,
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Shared bearer secret. `None` disables authentication entirely,
    /// which is only acceptable on a private network.
    #[serde(default)]
    pub token: Option<String>,
    /// `*` allows any origin.
    #[serde(default = "default_cors_allowed_origins")]
    pub cors_allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_control_bin")]
    pub control_bin: String,
    #[serde(default = "default_resolver_config_path")]
    pub config_path: PathBuf,
    #[serde(default = "default_rules_path")]
    pub rules_path: PathBuf,
    #[serde(default = "default_query_addr")]
    pub query_addr: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogsConfig {
    /// `file` or `journal`.
    #[serde(default = "default_log_source")]
    pub source: String,
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
    #[serde(default = "default_journal_unit")]
    pub journal_unit: String,
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    #[serde(default = "default_journal_lines")]
    pub journal_lines: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SettingsConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_fallback_path")]
    pub fallback_path: PathBuf,
    /// When false the embedded database is treated as unavailable and every
    /// local call goes straight to the JSON fallback.
    #[serde(default = "default_true")]
    pub embedded_enabled: bool,
    #[serde(default = "default_remote_timeout")]
    pub remote_connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    /// `name=ip` or `name=ip:port` entries.
    #[serde(default = "default_probe_upstreams")]
    pub upstreams: Vec<String>,
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_external_ip_url")]
    pub external_ip_url: String,
}

impl ResolverConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl SettingsConfig {
    pub fn remote_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_connect_timeout_secs)
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_bind() -> String { "0.0.0.0".to_string() }
fn default_api_port() -> u16 { 8053 }
fn default_cors_allowed_origins() -> Vec<String> { vec!["*".to_string()] }
fn default_control_bin() -> String { "unbound-control".to_string() }
fn default_resolver_config_path() -> PathBuf { PathBuf::from("/etc/unbound/unbound.conf") }
fn default_rules_path() -> PathBuf {
    PathBuf::from("/etc/unbound/unbound.conf.d/resolver-bridge-blocklist.conf")
}
fn default_query_addr() -> String { "127.0.0.1".to_string() }
fn default_command_timeout() -> u64 { 5 }
fn default_log_source() -> String { "file".to_string() }
fn default_log_path() -> PathBuf { PathBuf::from("/var/log/unbound/unbound.log") }
fn default_journal_unit() -> String { "unbound".to_string() }
fn default_tail_lines() -> usize { 5000 }
fn default_journal_lines() -> usize { 1000 }
fn default_db_path() -> PathBuf { PathBuf::from("./resolver-bridge.db") }
fn default_fallback_path() -> PathBuf { PathBuf::from("./resolver-bridge-settings.json") }
fn default_true() -> bool { true }
fn default_remote_timeout() -> u64 { 7 }
fn default_probe_timeout() -> u64 { 3000 }
fn default_external_ip_url() -> String { "https://api.ipify.org".to_string() }
fn default_probe_upstreams() -> Vec<String> {
    vec![
        "Cloudflare=1.1.1.1".to_string(),
        "Google=8.8.8.8".to_string(),
        "Quad9=9.9.9.9".to_string(),
        "OpenDNS=208.67.222.222".to_string(),
    ]
}

/// Minimum accepted length for a configured bearer token.
const MIN_TOKEN_LEN: usize = 16;

pub fn validate(cfg: &Config) -> Result<()> {
    match cfg.api.token.as_deref() {
        None | Some("") => tracing::warn!(
            "No API token configured; authentication is DISABLED. \
             Only run like this on a private network."
        ),
        Some(token) if token.len() < MIN_TOKEN_LEN => anyhow::bail!(
            "CONFIG ERROR: API token must be at least {} characters (current: {})",
            MIN_TOKEN_LEN,
            token.len()
        ),
        Some(_) => {}
    }

    if cfg.logs.source != "file" && cfg.logs.source != "journal" {
        anyhow::bail!(
            "CONFIG ERROR: logs.source must be 'file' or 'journal' (got '{}')",
            cfg.logs.source
        );
    }

    if cfg.logs.tail_lines == 0 || cfg.logs.journal_lines == 0 {
        anyhow::bail!("CONFIG ERROR: logs.tail_lines and logs.journal_lines must be positive");
    }

    if let Some(parent) = cfg.resolver.rules_path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            tracing::warn!(
                "Managed rules directory does not exist yet: {}",
                parent.display()
            );
        }
    }

    tracing::info!("Configuration validation passed");
    Ok(())
}

pub fn load() -> Result<Config> {
    let cfg: Config = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(
            config::Environment::with_prefix("RESOLVER_BRIDGE")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("api.cors_allowed_origins")
                .with_list_parse_key("probe.upstreams")
                .try_parsing(true),
        )
        .set_default("api.bind", "0.0.0.0")?
        .set_default("api.port", 8053)?
        .set_default("api.cors_allowed_origins", vec!["*"])?
        .set_default("resolver.control_bin", "unbound-control")?
        .set_default("resolver.config_path", "/etc/unbound/unbound.conf")?
        .set_default(
            "resolver.rules_path",
            "/etc/unbound/unbound.conf.d/resolver-bridge-blocklist.conf",
        )?
        .set_default("resolver.query_addr", "127.0.0.1")?
        .set_default("resolver.command_timeout_secs", 5)?
        .set_default("logs.source", "file")?
        .set_default("logs.path", "/var/log/unbound/unbound.log")?
        .set_default("logs.journal_unit", "unbound")?
        .set_default("logs.tail_lines", 5000)?
        .set_default("logs.journal_lines", 1000)?
        .set_default("settings.db_path", "./resolver-bridge.db")?
        .set_default("settings.fallback_path", "./resolver-bridge-settings.json")?
        .set_default("settings.embedded_enabled", true)?
        .set_default("settings.remote_connect_timeout_secs", 7)?
        .set_default("probe.upstreams", default_probe_upstreams())?
        .set_default("probe.timeout_ms", 3000)?
        .set_default("probe.external_ip_url", "https://api.ipify.org")?
        .build()?
        .try_deserialize()?;

    validate(&cfg)?;

    Ok(cfg)
}
