//! Agent Module
//!
//! The scan-cycle shell around the control plane:
//! - Pulls each cycle's externally-computed signals from a `SignalSource`
//! - Drives the engine's regime pass
//! - Publishes heartbeats and observability state

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::engine::HarvestEngine;
use crate::events::Event;
use crate::state::EngineState;
use crate::telemetry::metrics;
use crate::utils::types::CycleInputs;
use crate::utils::Clock;

/// Provider of per-cycle signals (regime classifier, portfolio ledger).
///
/// Implementations are the boundary to the external collaborators; the
/// agent never computes a signal itself.
pub trait SignalSource: Send + Sync {
    /// Signals for the next scan cycle, or None when the source is drained.
    fn next_cycle(&self) -> Option<CycleInputs>;
}

/// Deterministic scripted source for paper runs and tests
pub struct ReplaySignalSource {
    script: Vec<CycleInputs>,
    index: AtomicUsize,
}

impl ReplaySignalSource {
    pub fn new(script: Vec<CycleInputs>) -> Self {
        Self {
            script,
            index: AtomicUsize::new(0),
        }
    }
}

impl SignalSource for ReplaySignalSource {
    fn next_cycle(&self) -> Option<CycleInputs> {
        let i = self.index.fetch_add(1, Ordering::SeqCst);
        self.script.get(i).cloned()
    }
}

/// Scan-cycle agent that coordinates the control plane
pub struct HarvestAgent {
    config: Arc<AppConfig>,
    state: Arc<EngineState>,
    engine: Arc<HarvestEngine>,
    source: Arc<dyn SignalSource>,
    clock: Arc<dyn Clock>,
    event_tx: broadcast::Sender<Event>,
    running: Arc<RwLock<bool>>,
}

impl HarvestAgent {
    pub fn new(
        config: Arc<AppConfig>,
        state: Arc<EngineState>,
        engine: Arc<HarvestEngine>,
        source: Arc<dyn SignalSource>,
        clock: Arc<dyn Clock>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            config,
            state,
            engine,
            source,
            clock,
            event_tx,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start the scan-cycle loop.
    pub async fn start(&self) -> Result<()> {
        *self.running.write().await = true;
        info!("Harvest agent starting");

        let running = self.running.clone();
        let state = self.state.clone();
        let engine = self.engine.clone();
        let source = self.source.clone();
        let clock = self.clock.clone();
        let event_tx = self.event_tx.clone();
        let interval_secs = self.config.engine.scan_interval_secs;

        // Mirror decision events into the observability counters
        let counter_state = self.state.clone();
        let mut event_rx = self.event_tx.subscribe();
        tokio::spawn(async move {
            loop {
                match event_rx.recv().await {
                    Ok(Event::ExitSuppressed { .. }) => {
                        counter_state
                            .exits_suppressed
                            .fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(Event::TrancheBlocked { .. }) => {
                        counter_state
                            .tranches_blocked
                            .fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(Event::InvariantViolation { .. }) => {
                        counter_state
                            .invariant_violations
                            .fetch_add(1, Ordering::SeqCst);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(interval_secs));

            while *running.read().await {
                interval.tick().await;

                let Some(inputs) = source.next_cycle() else {
                    debug!("Signal source drained, idling");
                    continue;
                };

                let started = std::time::Instant::now();
                let outcome = engine.begin_cycle(inputs.regime_signal);
                debug!(
                    "Cycle: signal={} committed={} stable={} size_mult={:.3}",
                    inputs.regime_signal,
                    engine.current_regime(),
                    outcome.multipliers.stable,
                    outcome.multipliers.size
                );

                let now = clock.now_millis();
                state.record_cycle(now);
                state.set_regime(engine.current_regime(), engine.is_stable());
                state
                    .regime_flips
                    .store(engine.regime().total_flips(), Ordering::SeqCst);
                state.set_deployment(
                    engine.concentration().total_deployed_usd(),
                    inputs.total_equity_usd,
                );
                engine
                    .concentration()
                    .check_invariants(inputs.total_equity_usd);
                metrics::record_regime(engine.current_regime().code(), engine.is_stable());
                metrics::record_cycle(started.elapsed().as_secs_f64() * 1000.0);

                let _ = event_tx.send(Event::Heartbeat { timestamp: now });
            }

            info!("Harvest agent stopped");
        });

        Ok(())
    }

    /// Stop the scan-cycle loop.
    pub async fn stop(&self) {
        *self.running.write().await = false;
        info!("Harvest agent stopping");
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub fn engine(&self) -> &Arc<HarvestEngine> {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::types::Regime;

    #[test]
    fn test_replay_source_drains() {
        let source = ReplaySignalSource::new(vec![
            CycleInputs {
                regime_signal: Regime::Neutral,
                total_equity_usd: 10_000.0,
            },
            CycleInputs {
                regime_signal: Regime::Bull,
                total_equity_usd: 10_000.0,
            },
        ]);

        assert_eq!(source.next_cycle().unwrap().regime_signal, Regime::Neutral);
        assert_eq!(source.next_cycle().unwrap().regime_signal, Regime::Bull);
        assert!(source.next_cycle().is_none());
        assert!(source.next_cycle().is_none());
    }
}
