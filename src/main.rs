//! Fee Harvester Control Plane
//!
//! Agentic DLMM fee-harvesting bot for Solana:
//! - Tracks the market regime with hysteresis and a hard dwell time
//! - Scales sizing and exit sensitivity with the aggression ladder
//! - Debounces noise exits while risk exits always fire
//! - Caps per-pool and portfolio capital concentration

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use sol_fee_harvester::agent::{HarvestAgent, ReplaySignalSource};
use sol_fee_harvester::config::AppConfig;
use sol_fee_harvester::engine::HarvestEngine;
use sol_fee_harvester::events::{spawn_event_handler, Event, EventBus};
use sol_fee_harvester::state::EngineState;
use sol_fee_harvester::telemetry::{init_logging, init_metrics, Alert, AlertManager};
use sol_fee_harvester::utils::types::{CycleInputs, Regime};
use sol_fee_harvester::utils::SystemClock;

/// Fee Harvester - admission and suppression control plane
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override log level
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if args.config.exists() {
        AppConfig::load(&args.config)?
    } else {
        AppConfig::default()
    };

    if let Some(level) = args.log_level {
        config.telemetry.log_level = level;
    }

    let _log_guard = init_logging(&config.telemetry)?;

    info!("Starting Fee Harvester v{}", env!("CARGO_PKG_VERSION"));
    if !args.config.exists() {
        warn!("Config file {:?} not found, using defaults", args.config);
    }

    if config.telemetry.enable_metrics {
        init_metrics(config.telemetry.metrics_port)?;
    }

    let config = Arc::new(config);
    let state = Arc::new(EngineState::new());
    let clock = Arc::new(SystemClock);
    let bus = EventBus::default();

    // Forward critical control-plane events to the alert channel
    let alerts = Arc::new(AlertManager::new(&config.telemetry));
    spawn_event_handler(&bus, "alerts", move |event| {
        let alerts = alerts.clone();
        async move {
            match event {
                Event::InvariantViolation { message } => {
                    alerts
                        .send(Alert::critical("Invariant violation", message))
                        .await;
                }
                Event::RegimeCommitted {
                    from,
                    to,
                    total_flips,
                } => {
                    alerts
                        .send(Alert::warning(
                            "Regime flip",
                            format!("{} -> {} (flip #{})", from, to, total_flips),
                        ))
                        .await;
                }
                _ => {}
            }
        }
    });

    let engine = Arc::new(HarvestEngine::new(&config, clock.clone(), bus.sender()));

    // Stand-in for the live classifier/ledger feeds: a scripted neutral to
    // bull transition that exercises hysteresis, dwell and dampening.
    let script: Vec<CycleInputs> = std::iter::repeat(Regime::Neutral)
        .take(12)
        .chain(std::iter::repeat(Regime::Bull).take(24))
        .map(|regime_signal| CycleInputs {
            regime_signal,
            total_equity_usd: 10_000.0,
        })
        .collect();
    let source = Arc::new(ReplaySignalSource::new(script));

    let agent = HarvestAgent::new(
        config.clone(),
        state,
        engine,
        source,
        clock,
        bus.sender(),
    );
    agent.start().await?;

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, gracefully stopping...");
        }
        Err(err) => {
            error!("Error listening for shutdown signal: {}", err);
        }
    }

    agent.stop().await;
    info!("Fee Harvester stopped");
    Ok(())
}
