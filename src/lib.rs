pub mod config;
pub mod core;
pub mod error;
pub mod providers;
pub mod rates;
pub mod server;

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::providers::CoinGeckoProvider;
use crate::rates::RateCache;
use crate::server::AppState;

pub fn load_config(config_path: Option<&str>) -> Result<AppConfig> {
    match config_path {
        Some(path) => AppConfig::load_from_path(path),
        None => AppConfig::load(),
    }
}

/// Wires the CoinGecko provider into a fresh rate cache.
pub fn build_rate_cache(config: &AppConfig) -> Result<Arc<RateCache>> {
    let coingecko = &config.providers.coingecko;
    let provider = CoinGeckoProvider::from_config(coingecko)?;
    let rates = RateCache::new(Arc::new(provider), &config.rates, coingecko.timeout())
        .context("Invalid rates configuration")?;
    Ok(Arc::new(rates))
}

/// Runs the HTTP service until interrupted.
pub async fn run(config_path: Option<&str>, port: Option<u16>) -> Result<()> {
    info!("xrate starting...");

    let config = load_config(config_path)?;
    debug!(
        freshness_secs = config.rates.freshness_secs,
        anchor = %config.rates.anchor,
        "Loaded config"
    );

    let rates = build_rate_cache(&config)?;

    // Startup should not wait on the oracle
    let warmup = config.rates.warmup.clone();
    let warm_rates = Arc::clone(&rates);
    tokio::spawn(async move {
        warm_rates.warm_up(&warmup).await;
    });

    let port = port.unwrap_or(config.server.port);
    let listener = TcpListener::bind((config.server.bind.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", config.server.bind, port))?;

    server::serve(listener, AppState { rates }).await
}

/// One-shot lookup without starting the server.
pub async fn lookup(config_path: Option<&str>, base: &str, quote: &str) -> Result<f64> {
    let config = load_config(config_path)?;
    let rates = build_rate_cache(&config)?;
    let rate = rates
        .get_rate(base, quote)
        .await
        .with_context(|| format!("Failed to get rate for {base} in {quote}"))?;
    Ok(rate)
}
