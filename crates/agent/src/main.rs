mod config;
mod intake;
mod reload;

use std::sync::Arc;

use anyhow::Result;
use diagd_rate_limit::{FilePersistence, PrometheusMetrics, SystemClock};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::AgentSettings;
use crate::reload::Reloader;

fn main() -> Result<()> {
    // Logs go to stderr; stdout carries intake answers.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .json()
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/diagd.yaml".to_string());

    info!(config_path = %config_path, "starting diagd");

    let agent_settings = AgentSettings::load(&config_path)?;
    let persistence = Arc::new(FilePersistence::new(&agent_settings.config.persistence.dir));
    let metrics = Arc::new(PrometheusMetrics::new()?);

    let (registry, store_settings) = reload::build_registry(
        &agent_settings.config,
        persistence,
        metrics.clone(),
        Arc::new(SystemClock),
    )?;
    let registry = Arc::new(registry);
    info!(stores = ?registry.names(), "rate limit stores loaded");

    let reloader = Reloader::spawn(agent_settings, store_settings, Arc::clone(&registry))?;

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    let summary = intake::run(stdin.lock(), stdout.lock(), &registry)?;

    drop(reloader);
    registry.flush_all();

    for name in registry.names() {
        info!(
            store = name,
            consumed = metrics.consumed(name),
            rejected = metrics.rejected(name),
            "rate limit totals"
        );
    }
    info!(
        accepted = summary.accepted,
        throttled = summary.throttled,
        skipped = summary.skipped,
        "diagd stopped"
    );
    Ok(())
}
