//! Harvest Engine
//!
//! Controller facade that owns exactly one instance of every control-plane
//! store and wires the per-cycle control flow:
//! - regime update first, then multiplier derivation
//! - exit evaluation: short-circuit check, then re-evaluation bookkeeping,
//!   then the hysteresis gate, then latch updates
//! - tranche admission and deployment bookkeeping
//!
//! All inputs are already-computed values from external collaborators; no
//! operation here suspends or performs I/O.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::concentration::{
    ConcentrationDecision, ConcentrationEngine, DeploymentRequest, TrancheDecision, TrancheRequest,
};
use crate::config::AppConfig;
use crate::events::Event;
use crate::exit::hysteresis::{ExitHysteresisGate, SuppressDecision, SuppressionReason};
use crate::exit::latch::{ExitIntentLatch, ReEvalOutcome};
use crate::exit::ExitClass;
use crate::regime::scaler::{AggressionScaler, ScaledMultipliers};
use crate::regime::{RegimeTracker, RegimeUpdate};
use crate::utils::types::{
    AggressionLevel, HarvestPosition, MtmValuation, PositionMetrics, Regime,
};
use crate::utils::Clock;

/// Result of one scan-cycle regime pass
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub update: RegimeUpdate,
    pub multipliers: ScaledMultipliers,
}

/// Result of one exit-trigger evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum ExitEvaluation {
    /// Active suppression cooldown; nothing was evaluated, logged or counted
    ShortCircuited,
    /// Cooldown expired but nothing materially changed; suppression extended
    CooldownExtended { extensions: u32 },
    /// The gate held the exit back
    Suppressed {
        reason: SuppressionReason,
        newly_latched: bool,
    },
    /// The exit may fire
    Allowed {
        class: ExitClass,
        forced_by_stuck_mtm: bool,
    },
}

/// The admission-and-suppression control plane, assembled.
pub struct HarvestEngine {
    regime: RegimeTracker,
    scaler: AggressionScaler,
    latch: ExitIntentLatch,
    gate: ExitHysteresisGate,
    concentration: ConcentrationEngine,
    event_tx: broadcast::Sender<Event>,
}

impl HarvestEngine {
    pub fn new(
        config: &AppConfig,
        clock: Arc<dyn Clock>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            regime: RegimeTracker::new(config.regime.clone(), clock.clone(), event_tx.clone()),
            scaler: AggressionScaler::new(config.scaling.clone(), clock.clone(), event_tx.clone()),
            latch: ExitIntentLatch::new(config.exit.clone(), clock.clone(), event_tx.clone()),
            gate: ExitHysteresisGate::new(config.exit.clone(), clock.clone()),
            concentration: ConcentrationEngine::new(
                config.concentration.clone(),
                clock,
                event_tx.clone(),
            ),
            event_tx,
        }
    }

    /// Run the regime pass for one scan cycle and derive multipliers.
    pub fn begin_cycle(&self, regime_signal: Regime) -> CycleOutcome {
        let update = self.regime.update(regime_signal);
        let multipliers = self.scaler.multipliers(&self.regime);
        CycleOutcome {
            update,
            multipliers,
        }
    }

    /// Evaluate a detected exit condition for a position.
    ///
    /// The short-circuit path returns before any evaluation, logging or
    /// counting happens; that is what makes suppressed cycles free. Risk
    /// reasons bypass it entirely: an active noise suppression never
    /// swallows a risk exit.
    pub fn evaluate_exit(
        &self,
        position: &HarvestPosition,
        metrics_now: PositionMetrics,
        mtm: &MtmValuation,
        reason: &str,
    ) -> ExitEvaluation {
        if crate::exit::classify(reason) == ExitClass::Noise {
            if self.latch.should_short_circuit(&position.id) {
                return ExitEvaluation::ShortCircuited;
            }

            // A suppressed intent whose cooldown has expired decides between
            // extending and re-evaluating before the gate runs again.
            if self.latch.get(&position.id).map(|i| i.suppressed) == Some(true) {
                match self.latch.check_re_evaluation(&position.id, metrics_now) {
                    ReEvalOutcome::Extended { extensions, .. } => {
                        return ExitEvaluation::CooldownExtended { extensions };
                    }
                    ReEvalOutcome::ReEvaluate { .. } | ReEvalOutcome::Forced => {}
                    // NoIntent/NotSuppressed/CooldownActive cannot occur here
                    _ => {}
                }
            }
        }

        let newly_latched = self.latch.latch(&position.id, reason, metrics_now);

        match self.gate.should_suppress(position, mtm, reason) {
            SuppressDecision::Suppress { reason: why, .. } => {
                self.latch.set_suppressed(&position.id, why.as_str(), None);
                ExitEvaluation::Suppressed {
                    reason: why,
                    newly_latched,
                }
            }
            SuppressDecision::Allow {
                class,
                forced_by_stuck_mtm,
                ..
            } => {
                debug!("Exit allowed for {} ({})", position.id, reason);
                self.latch.resolve(&position.id);
                let _ = self.event_tx.send(Event::ExitAllowed {
                    position_id: position.id.clone(),
                    reason: reason.to_string(),
                });
                ExitEvaluation::Allowed {
                    class,
                    forced_by_stuck_mtm,
                }
            }
        }
    }

    /// Drop all exit-tracking state for a position after its exit executed
    /// (or was manually reset).
    pub fn clear_exit(&self, position_id: &str) {
        self.latch.clear(position_id);
        self.gate.clear(position_id);
    }

    /// Gate an additional capital tranche into a pool.
    pub fn can_add_tranche(
        &self,
        pool: &str,
        level: AggressionLevel,
        ods_value: f64,
        spike_active: bool,
        request: &TrancheRequest,
    ) -> TrancheDecision {
        self.concentration
            .can_add_tranche(pool, level, ods_value, spike_active, request)
    }

    /// Compute the admissible deployment size for a pool.
    pub fn evaluate_concentration(
        &self,
        pool: &str,
        level: AggressionLevel,
        base_size_usd: f64,
        total_equity_usd: f64,
    ) -> ConcentrationDecision {
        self.concentration
            .evaluate_concentration(pool, level, base_size_usd, total_equity_usd)
    }

    /// Record an executed deployment.
    pub fn record_deployment(&self, request: &DeploymentRequest, total_equity_usd: f64) -> bool {
        self.concentration.record_deployment(request, total_equity_usd)
    }

    /// Record capital leaving a pool.
    pub fn record_pool_exit(&self, pool: &str, size_usd: f64, total_equity_usd: f64) -> f64 {
        self.concentration.record_exit(pool, size_usd, total_equity_usd)
    }

    pub fn current_regime(&self) -> Regime {
        self.regime.current()
    }

    pub fn is_stable(&self) -> bool {
        self.regime.is_stable()
    }

    pub fn multipliers(&self) -> ScaledMultipliers {
        self.scaler.multipliers(&self.regime)
    }

    pub fn regime(&self) -> &RegimeTracker {
        &self.regime
    }

    pub fn latch(&self) -> &ExitIntentLatch {
        &self.latch
    }

    pub fn gate(&self) -> &ExitHysteresisGate {
        &self.gate
    }

    pub fn concentration(&self) -> &ConcentrationEngine {
        &self.concentration
    }

    /// Reset every store (test lifecycle).
    pub fn reset(&self) {
        self.regime.reset();
        self.latch.reset();
        self.gate.reset();
        self.concentration.reset();
    }
}
