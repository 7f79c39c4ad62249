//! Aggression Scaler
//!
//! Derives sizing/exit-sensitivity multipliers from the committed regime.
//! Decision ladder per cycle:
//! 1. Flip cooldown active: force the NEUTRAL row
//! 2. Regime not yet stable: dampen multipliers above 1.0; size decreases
//!    pass through unmodified so risk reduction is never delayed
//! 3. Stable: apply the table row, with a defensive stability re-check

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::config::{MultiplierRow, ScalingConfig};
use crate::events::Event;
use crate::telemetry::metrics;
use crate::utils::types::Regime;
use crate::utils::Clock;

use super::RegimeTracker;

/// Multipliers for the current cycle plus how they were derived
#[derive(Debug, Clone)]
pub struct ScaledMultipliers {
    pub regime: Regime,
    pub size: f64,
    pub bin_width: f64,
    pub exit_sensitivity: f64,
    pub score_decay_tolerance: f64,
    /// Table row applied unmodified
    pub is_fully_applied: bool,
    /// At least one multiplier was dampened this cycle
    pub is_dampened: bool,
    pub in_cooldown: bool,
    /// Defensive re-check forced the NEUTRAL row
    pub scaling_blocked: bool,
    pub stable: bool,
}

/// Aggression scaler
///
/// Pure function of the tracker's state; no side effects beyond
/// observability events.
pub struct AggressionScaler {
    config: ScalingConfig,
    clock: Arc<dyn Clock>,
    event_tx: broadcast::Sender<Event>,
}

impl AggressionScaler {
    pub fn new(
        config: ScalingConfig,
        clock: Arc<dyn Clock>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            config,
            clock,
            event_tx,
        }
    }

    fn row_for(&self, regime: Regime) -> &MultiplierRow {
        match regime {
            Regime::Bear => &self.config.bear,
            Regime::Neutral => &self.config.neutral,
            Regime::Bull => &self.config.bull,
        }
    }

    /// Dampen only multipliers above 1.0; decreases are never delayed.
    fn dampen(&self, raw: f64) -> f64 {
        if raw > 1.0 {
            1.0 + (raw - 1.0) * self.config.first_flip_dampening
        } else {
            raw
        }
    }

    /// Derive this cycle's multipliers from the tracker.
    pub fn multipliers(&self, tracker: &RegimeTracker) -> ScaledMultipliers {
        let now = self.clock.now_millis();
        let regime = tracker.current();
        let stable = tracker.is_stable();
        let in_cooldown = now - tracker.last_flip_time() < self.config.regime_flip_cooldown_ms;
        let raw = *self.row_for(regime);
        let neutral = *self.row_for(Regime::Neutral);

        let result = if in_cooldown {
            debug!("Regime flip cooldown active, sizing frozen at NEUTRAL");
            ScaledMultipliers {
                regime,
                size: neutral.size,
                bin_width: neutral.bin_width,
                exit_sensitivity: neutral.exit_sensitivity,
                score_decay_tolerance: neutral.score_decay_tolerance,
                is_fully_applied: false,
                is_dampened: false,
                in_cooldown: true,
                scaling_blocked: false,
                stable,
            }
        } else if !stable {
            let dampened_any = raw.size > 1.0
                || raw.bin_width > 1.0
                || raw.exit_sensitivity > 1.0
                || raw.score_decay_tolerance > 1.0;
            let size = self.dampen(raw.size);
            if dampened_any {
                metrics::record_scaling_dampened();
                let _ = self.event_tx.send(Event::ScalingDampened {
                    regime,
                    raw_size: raw.size,
                    dampened_size: size,
                });
            }
            ScaledMultipliers {
                regime,
                size,
                bin_width: self.dampen(raw.bin_width),
                exit_sensitivity: self.dampen(raw.exit_sensitivity),
                score_decay_tolerance: self.dampen(raw.score_decay_tolerance),
                is_fully_applied: false,
                is_dampened: dampened_any,
                in_cooldown: false,
                scaling_blocked: false,
                stable: false,
            }
        } else {
            let amplifying = raw.size > 1.0
                || raw.bin_width > 1.0
                || raw.exit_sensitivity > 1.0
                || raw.score_decay_tolerance > 1.0;
            // About to return an unmodified amplifying row: re-check
            // stability and fall back to NEUTRAL if it no longer holds.
            if amplifying && !tracker.is_stable() {
                warn!("Stability re-check failed, scaling blocked at NEUTRAL");
                metrics::record_scaling_blocked();
                let _ = self.event_tx.send(Event::ScalingBlocked { regime });
                ScaledMultipliers {
                    regime,
                    size: neutral.size,
                    bin_width: neutral.bin_width,
                    exit_sensitivity: neutral.exit_sensitivity,
                    score_decay_tolerance: neutral.score_decay_tolerance,
                    is_fully_applied: false,
                    is_dampened: false,
                    in_cooldown: false,
                    scaling_blocked: true,
                    stable: false,
                }
            } else {
                ScaledMultipliers {
                    regime,
                    size: raw.size,
                    bin_width: raw.bin_width,
                    exit_sensitivity: raw.exit_sensitivity,
                    score_decay_tolerance: raw.score_decay_tolerance,
                    is_fully_applied: true,
                    is_dampened: false,
                    in_cooldown: false,
                    scaling_blocked: false,
                    stable: true,
                }
            }
        };

        metrics::record_multipliers(
            result.size,
            result.bin_width,
            result.exit_sensitivity,
            result.score_decay_tolerance,
        );
        result
    }
}
