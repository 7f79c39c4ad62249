//! Exit Hysteresis / Cost-Amortization Gate
//!
//! Final gate before an exit transaction is submitted:
//! - RISK exits pass immediately, always
//! - NOISE exits must satisfy the minimum hold time, then accrued fees must
//!   cover the estimated round-trip cost times the amortization factor
//! - A stuck mark-to-market feed cannot trap a position: after enough
//!   consecutive unmoved-valuation cycles the exit is forced through

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ExitConfig;
use crate::telemetry::metrics;
use crate::utils::types::{HarvestPosition, MtmValuation};
use crate::utils::Clock;

use super::{classify, ExitCategory, ExitClass};

/// Why a noise exit was held back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressionReason {
    MinHold,
    CostNotAmortized,
}

impl SuppressionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuppressionReason::MinHold => "min_hold",
            SuppressionReason::CostNotAmortized => "cost_not_amortized",
        }
    }
}

/// Gate verdict for one exit request
#[derive(Debug, Clone, PartialEq)]
pub enum SuppressDecision {
    Allow {
        class: ExitClass,
        category: ExitCategory,
        /// Allowed only because the valuation feed is stuck
        forced_by_stuck_mtm: bool,
    },
    Suppress {
        category: ExitCategory,
        reason: SuppressionReason,
        detail: String,
    },
}

impl SuppressDecision {
    pub fn is_suppressed(&self) -> bool {
        matches!(self, SuppressDecision::Suppress { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct MtmWatch {
    last_value: f64,
    unchanged_cycles: u32,
}

/// Exit hysteresis gate
pub struct ExitHysteresisGate {
    config: ExitConfig,
    clock: Arc<dyn Clock>,
    mtm_watch: DashMap<String, MtmWatch>,
}

impl ExitHysteresisGate {
    pub fn new(config: ExitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            mtm_watch: DashMap::new(),
        }
    }

    /// Decide whether a noise exit must be held back.
    ///
    /// Risk exits return `Allow` unconditionally; that is the one invariant
    /// this component exists to protect.
    pub fn should_suppress(
        &self,
        position: &HarvestPosition,
        mtm: &MtmValuation,
        reason: &str,
    ) -> SuppressDecision {
        let class = classify(reason);
        let category = ExitCategory::parse(reason);

        if class == ExitClass::Risk {
            info!(
                "Risk exit allowed for {} ({}), bypassing all suppression",
                position.id, reason
            );
            metrics::record_exit_allowed();
            return SuppressDecision::Allow {
                class,
                category,
                forced_by_stuck_mtm: false,
            };
        }

        let now = self.clock.now_millis();
        let hold_ms = now - position.entry_time;
        if hold_ms < self.config.min_hold_ms_noise_exit {
            let detail = format!(
                "held {}ms of required {}ms",
                hold_ms, self.config.min_hold_ms_noise_exit
            );
            debug!("Noise exit suppressed for {}: {}", position.id, detail);
            return SuppressDecision::Suppress {
                category,
                reason: SuppressionReason::MinHold,
                detail,
            };
        }

        // Hold time is sufficient from here on; track the valuation so a
        // frozen feed cannot keep the position trapped in cost checks.
        let stuck = self.observe_mtm(&position.id, mtm.value_usd);
        if stuck {
            warn!(
                "MTM unchanged for {} cycles on {}, forcing exit through",
                self.config.mtm_stuck_cycles, position.id
            );
            metrics::record_mtm_stuck_exit();
            metrics::record_exit_allowed();
            return SuppressDecision::Allow {
                class,
                category,
                forced_by_stuck_mtm: true,
            };
        }

        let cost_target = position.round_trip_cost_usd() * self.config.cost_amortization_factor;
        // Sub-cent tolerance so an exactly-amortized position is not held
        // back by float rounding
        if mtm.fees_accrued_usd < cost_target - 1e-9 {
            let detail = format!(
                "fees accrued ${:.2} below cost target ${:.2}",
                mtm.fees_accrued_usd, cost_target
            );
            debug!("Noise exit suppressed for {}: {}", position.id, detail);
            return SuppressDecision::Suppress {
                category,
                reason: SuppressionReason::CostNotAmortized,
                detail,
            };
        }

        metrics::record_exit_allowed();
        SuppressDecision::Allow {
            class,
            category,
            forced_by_stuck_mtm: false,
        }
    }

    /// Update the per-position valuation watch; returns true once the value
    /// has sat still for the configured number of cycles.
    fn observe_mtm(&self, position_id: &str, value_usd: f64) -> bool {
        match self.mtm_watch.get_mut(position_id) {
            Some(mut watch) => {
                if (value_usd - watch.last_value).abs() <= self.config.mtm_stuck_epsilon_usd {
                    watch.unchanged_cycles += 1;
                } else {
                    watch.last_value = value_usd;
                    watch.unchanged_cycles = 0;
                }
                watch.unchanged_cycles >= self.config.mtm_stuck_cycles
            }
            None => {
                self.mtm_watch.insert(
                    position_id.to_string(),
                    MtmWatch {
                        last_value: value_usd,
                        unchanged_cycles: 0,
                    },
                );
                false
            }
        }
    }

    /// Consecutive unmoved-valuation cycles observed for a position
    pub fn stuck_cycles(&self, position_id: &str) -> u32 {
        self.mtm_watch
            .get(position_id)
            .map(|w| w.unchanged_cycles)
            .unwrap_or(0)
    }

    /// Drop the valuation watch for a closed position.
    pub fn clear(&self, position_id: &str) {
        self.mtm_watch.remove(position_id);
    }

    /// Drop all watches (test lifecycle)
    pub fn reset(&self) {
        self.mtm_watch.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    fn gate(clock: Arc<ManualClock>) -> ExitHysteresisGate {
        ExitHysteresisGate::new(ExitConfig::default(), clock)
    }

    fn position(entry_time: i64) -> HarvestPosition {
        HarvestPosition {
            id: "pos-1".to_string(),
            pool: "pool-a".to_string(),
            deployed_usd: 500.0,
            entry_time,
            entry_fees_usd: 1.0,
            expected_exit_fees_usd: 1.0,
            expected_slippage_usd: 1.0,
        }
    }

    fn mtm(fees_accrued: f64) -> MtmValuation {
        MtmValuation {
            value_usd: 500.0,
            fees_accrued_usd: fees_accrued,
        }
    }

    #[test]
    fn test_risk_exit_never_suppressed() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let g = gate(clock.clone());

        // Zero hold, zero fees: risk still passes
        let decision = g.should_suppress(&position(clock.now_millis()), &mtm(0.0), "kill-switch");
        assert!(matches!(
            decision,
            SuppressDecision::Allow { class: ExitClass::Risk, forced_by_stuck_mtm: false, .. }
        ));
    }

    #[test]
    fn test_min_hold_suppresses_noise() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let g = gate(clock.clone());
        let pos = position(clock.now_millis());

        clock.advance(9 * 60 * 1000);
        let decision = g.should_suppress(&pos, &mtm(100.0), "harmonic oscillation");
        assert!(matches!(
            decision,
            SuppressDecision::Suppress { reason: SuppressionReason::MinHold, .. }
        ));
    }

    #[test]
    fn test_cost_amortization_threshold() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let g = gate(clock.clone());
        let pos = position(clock.now_millis());
        clock.advance(11 * 60 * 1000);

        // Cost target: (1 + 1 + 1) * 1.10 = 3.30
        let decision = g.should_suppress(&pos, &mtm(3.0), "harmonic oscillation");
        assert!(matches!(
            decision,
            SuppressDecision::Suppress { reason: SuppressionReason::CostNotAmortized, .. }
        ));

        let decision = g.should_suppress(&pos, &mtm(3.30), "harmonic oscillation");
        assert!(matches!(
            decision,
            SuppressDecision::Allow { forced_by_stuck_mtm: false, .. }
        ));
    }

    #[test]
    fn test_stuck_mtm_forces_exit_through() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut config = ExitConfig::default();
        config.mtm_stuck_cycles = 5;
        let g = ExitHysteresisGate::new(config, clock.clone());
        let pos = position(clock.now_millis());
        clock.advance(11 * 60 * 1000);

        // Fees never amortize and the valuation never moves; the first
        // observation seeds the watch, then five unmoved cycles accumulate
        for _ in 0..5 {
            let decision = g.should_suppress(&pos, &mtm(0.5), "harmonic oscillation");
            assert!(decision.is_suppressed());
        }
        let decision = g.should_suppress(&pos, &mtm(0.5), "harmonic oscillation");
        assert!(matches!(
            decision,
            SuppressDecision::Allow { forced_by_stuck_mtm: true, .. }
        ));
    }

    #[test]
    fn test_moving_mtm_resets_stuck_counter() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let mut config = ExitConfig::default();
        config.mtm_stuck_cycles = 3;
        let g = ExitHysteresisGate::new(config, clock.clone());
        let pos = position(clock.now_millis());
        clock.advance(11 * 60 * 1000);

        g.should_suppress(&pos, &mtm(0.5), "harmonic oscillation");
        g.should_suppress(&pos, &mtm(0.5), "harmonic oscillation");
        assert_eq!(g.stuck_cycles("pos-1"), 1);

        // A real valuation move resets the watch
        let moved = MtmValuation {
            value_usd: 510.0,
            fees_accrued_usd: 0.5,
        };
        g.should_suppress(&pos, &moved, "harmonic oscillation");
        assert_eq!(g.stuck_cycles("pos-1"), 0);
    }

    #[test]
    fn test_min_hold_does_not_count_toward_stuck() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let g = gate(clock.clone());
        let pos = position(clock.now_millis());

        // Still inside min hold: the watch must not advance
        g.should_suppress(&pos, &mtm(0.0), "harmonic oscillation");
        assert_eq!(g.stuck_cycles("pos-1"), 0);
    }

    #[test]
    fn test_unknown_reason_flows_through_noise_checks() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let g = gate(clock.clone());
        let pos = position(clock.now_millis());
        clock.advance(11 * 60 * 1000);

        let decision = g.should_suppress(&pos, &mtm(10.0), "novel condition");
        assert!(matches!(
            decision,
            SuppressDecision::Allow { class: ExitClass::Noise, category: ExitCategory::Unknown, .. }
        ));
    }
}
