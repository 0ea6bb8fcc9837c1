use anyhow::Result;
use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::any::Any;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, Any as AnyOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::SettingsStore;
use crate::error::AppError;
use crate::exec::CommandRunner;
use crate::logs::LogReader;
use crate::resolver::host::HostProbe;
use crate::resolver::probe::ProbeTarget;
use crate::resolver::ResolverControl;
use crate::rules::RuleCompiler;

pub mod handlers;
pub mod middleware;
pub mod router;

/// Header carrying the caller's settings backend descriptor as JSON.
pub const BACKEND_HEADER: &str = "x-bridge-backend";

pub struct AppState {
    pub control: Arc<ResolverControl>,
    pub logs: LogReader,
    pub rules: RuleCompiler,
    pub settings: SettingsStore,
    pub host: HostProbe,
    /// Shared bearer secret; `None` disables auth.
    pub token: Option<String>,
    pub resolver_config_path: PathBuf,
    pub query_addr: IpAddr,
    pub probe_targets: Vec<ProbeTarget>,
    pub probe_timeout: Duration,
}

impl AppState {
    /// Wire every component from configuration. `runner` executes all
    /// external commands (`unbound-control`, `journalctl`, `ip`).
    pub fn from_config(cfg: &Config, runner: Arc<dyn CommandRunner>) -> Result<Arc<Self>> {
        let command_timeout = cfg.resolver.command_timeout();
        let control = Arc::new(ResolverControl::new(
            runner.clone(),
            cfg.resolver.control_bin.clone(),
            command_timeout,
        ));

        let query_addr: IpAddr = cfg.resolver.query_addr.parse().map_err(|e| {
            anyhow::anyhow!("CONFIG ERROR: resolver.query_addr '{}' is not an IP address: {}", cfg.resolver.query_addr, e)
        })?;

        let mut probe_targets = Vec::with_capacity(cfg.probe.upstreams.len());
        for spec in &cfg.probe.upstreams {
            match ProbeTarget::parse(spec) {
                Some(t) => probe_targets.push(t),
                None => tracing::warn!("Ignoring invalid probe upstream '{}'", spec),
            }
        }

        Ok(Arc::new(Self {
            logs: LogReader::from_config(&cfg.logs, runner.clone(), command_timeout),
            rules: RuleCompiler::new(cfg.resolver.rules_path.clone(), control.clone()),
            settings: SettingsStore::from_config(&cfg.settings),
            host: HostProbe::new(runner, cfg.probe.external_ip_url.clone(), command_timeout),
            control,
            token: cfg.api.token.clone().filter(|t| !t.is_empty()),
            resolver_config_path: cfg.resolver.config_path.clone(),
            query_addr,
            probe_targets,
            probe_timeout: cfg.probe.timeout(),
        }))
    }
}

pub async fn serve(cfg: Config, state: Arc<AppState>) -> Result<()> {
    let bind_addr = format!("{}:{}", cfg.api.bind, cfg.api.port);
    let cors = build_cors_layer(&cfg.api.cors_allowed_origins);
    let app = build_app(state, cors);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Control API listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
    Ok(())
}

pub fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origin = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::from(AnyOrigin)
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        if origins.is_empty() {
            tracing::warn!("No valid CORS origins configured; CORS will block all cross-origin requests");
            return CorsLayer::new();
        }
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(BACKEND_HEADER),
        ])
}

/// CORS sits outermost so preflights are answered before the auth check.
pub fn build_app(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .merge(router::routes(state))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let msg = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "handler panicked".to_string()
    };
    tracing::error!("Handler panicked: {}", msg);
    AppError::Internal(msg).into_response()
}
