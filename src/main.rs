use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

mod api;
mod backtest;
mod config;
mod decision;
mod error;
mod pricing;
mod service;
mod store;

use api::AppState;
use backtest::{BacktestConfig, BacktestEngine};
use config::{Command, Config, EngineConfig};
use service::PricingService;
use store::{HistoricalDataset, MemoryStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;
    let engine = config.engine()?;

    match &config.command {
        Command::Serve { addr, dataset } => serve(addr, dataset.as_deref(), engine).await,
        Command::Backtest {
            dataset,
            backtest_config,
            output,
        } => {
            let cfg = load_backtest_config(backtest_config.as_deref(), engine)?;
            let store = MemoryStore::from_dataset(HistoricalDataset::load(dataset)?);
            let report = tokio::task::spawn_blocking(move || BacktestEngine::new(&store, &cfg).run()).await??;
            info!(
                run_id = %report.run_id,
                bets = report.stats.total_bets,
                roi = report.stats.roi,
                significant = report.significance.significant,
                "Backtest complete"
            );
            let json = serde_json::to_string_pretty(&report)?;
            match output {
                Some(path) => {
                    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
                    info!("Report written to {}", path.display());
                }
                None => println!("{json}"),
            }
            Ok(())
        }
    }
}

async fn serve(addr: &str, dataset: Option<&Path>, engine: EngineConfig) -> Result<()> {
    let store = match dataset {
        Some(path) => MemoryStore::from_dataset(HistoricalDataset::load(path)?),
        None => MemoryStore::default(),
    };
    let app = api::router(AppState {
        service: PricingService::new(store, engine),
    });
    let addr: SocketAddr = addr.parse()?;
    info!("Pricing API listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// The engine section of a backtest file falls back to the command-line
/// engine configuration when omitted.
fn load_backtest_config(path: Option<&Path>, engine: EngineConfig) -> Result<BacktestConfig> {
    let Some(path) = path else {
        return Ok(BacktestConfig {
            engine,
            ..Default::default()
        });
    };
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let value: serde_json::Value =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    let has_engine = value.get("engine").is_some();
    let mut cfg: BacktestConfig = serde_json::from_value(value)?;
    if !has_engine {
        cfg.engine = engine;
    }
    Ok(cfg)
}
