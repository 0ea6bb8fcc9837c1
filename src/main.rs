use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use resolver_bridge::{api, config, exec::TokioRunner};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("resolver_bridge=info".parse()?)
        )
        .init();

    info!("Starting resolver-bridge v{}", env!("CARGO_PKG_VERSION"));

    let cfg = config::load()?;
    info!("Configuration loaded");

    let state = api::AppState::from_config(&cfg, Arc::new(TokioRunner))?;
    info!(
        "Log source: {}, rules file: {}",
        state.logs.source().location(),
        state.rules.path().display()
    );

    api::serve(cfg, state).await
}
