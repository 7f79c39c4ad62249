//! Integration Tests for the Fee Harvester Control Plane
//!
//! Drives the assembled engine through full scenarios with a manual clock:
//! regime flips, exit debouncing and capital concentration sequences.

use std::sync::Arc;
use tokio::sync::broadcast;

use sol_fee_harvester::concentration::{
    DeploymentRequest, TrancheBlockReason, TrancheContext, TrancheDecision, TrancheRequest,
};
use sol_fee_harvester::config::AppConfig;
use sol_fee_harvester::engine::{ExitEvaluation, HarvestEngine};
use sol_fee_harvester::events::Event;
use sol_fee_harvester::exit::hysteresis::SuppressionReason;
use sol_fee_harvester::exit::ExitClass;
use sol_fee_harvester::regime::RegimeUpdate;
use sol_fee_harvester::utils::types::{
    AggressionLevel, HarvestPosition, MtmValuation, PositionMetrics, Regime,
};
use sol_fee_harvester::utils::ManualClock;
use sol_fee_harvester::Clock;

const EQUITY: f64 = 10_000.0;

fn engine_with_clock(start_ms: i64) -> (HarvestEngine, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(start_ms));
    let (tx, _rx) = broadcast::channel(1024);
    let engine = HarvestEngine::new(&AppConfig::default(), clock.clone(), tx);
    (engine, clock)
}

fn position(id: &str, entry_time: i64) -> HarvestPosition {
    HarvestPosition {
        id: id.to_string(),
        pool: "pool-a".to_string(),
        deployed_usd: 500.0,
        entry_time,
        entry_fees_usd: 1.0,
        expected_exit_fees_usd: 1.0,
        expected_slippage_usd: 1.0,
    }
}

fn metrics_snapshot() -> PositionMetrics {
    PositionMetrics {
        regime: Regime::Neutral,
        fees_usd: 10.0,
        tier_score: 80.0,
        health_score: 0.5,
    }
}

fn mtm(fees_accrued: f64) -> MtmValuation {
    MtmValuation {
        value_usd: 500.0,
        fees_accrued_usd: fees_accrued,
    }
}

#[test]
fn test_regime_flip_requires_hysteresis_and_dwell() {
    let (engine, clock) = engine_with_clock(0);
    clock.advance(600_000); // past the startup dwell

    // Two bull signals are not enough
    engine.begin_cycle(Regime::Bull);
    engine.begin_cycle(Regime::Bull);
    assert_eq!(engine.current_regime(), Regime::Neutral);

    // The third commits
    let outcome = engine.begin_cycle(Regime::Bull);
    assert!(matches!(outcome.update, RegimeUpdate::Committed { .. }));
    assert_eq!(engine.current_regime(), Regime::Bull);

    // An instant bear barrage cannot flip back inside the dwell window
    for _ in 0..6 {
        clock.advance(10_000);
        engine.begin_cycle(Regime::Bear);
    }
    assert_eq!(engine.current_regime(), Regime::Bull);

    // After the dwell the held candidate commits on the next signal
    clock.advance(300_000);
    let outcome = engine.begin_cycle(Regime::Bear);
    assert!(matches!(outcome.update, RegimeUpdate::Committed { .. }));
    assert_eq!(engine.current_regime(), Regime::Bear);
}

#[test]
fn test_multipliers_walk_cooldown_then_dampened_then_full() {
    let clock = Arc::new(ManualClock::new(0));
    let (tx, _rx) = broadcast::channel(1024);
    let mut config = AppConfig::default();
    config.scaling.bull.size = 1.4;
    let engine = HarvestEngine::new(&config, clock.clone(), tx);
    clock.advance(600_000);

    engine.begin_cycle(Regime::Bull);
    engine.begin_cycle(Regime::Bull);
    let outcome = engine.begin_cycle(Regime::Bull);
    // Fresh flip: inside the 2-minute cooldown, frozen at NEUTRAL
    assert!(outcome.multipliers.in_cooldown);
    assert_eq!(outcome.multipliers.size, 1.0);

    // Past cooldown but not yet stable: dampened
    clock.advance(150_000);
    let outcome = engine.begin_cycle(Regime::Bull);
    assert!(outcome.multipliers.is_dampened);
    assert!((outcome.multipliers.size - (1.0 + 0.4 * 0.85)).abs() < 1e-9);

    // Stable: full table value
    clock.advance(200_000);
    engine.begin_cycle(Regime::Bull);
    let outcome = engine.begin_cycle(Regime::Bull);
    assert!(outcome.multipliers.is_fully_applied);
    assert!((outcome.multipliers.size - 1.4).abs() < 1e-9);
}

#[test]
fn test_noise_exit_debounce_lifecycle() {
    let (engine, clock) = engine_with_clock(1_000_000);
    let pos = position("pos-1", clock.now_millis());

    // Inside min hold: suppressed and latched
    let eval = engine.evaluate_exit(&pos, metrics_snapshot(), &mtm(0.0), "harmonic oscillation");
    assert_eq!(
        eval,
        ExitEvaluation::Suppressed {
            reason: SuppressionReason::MinHold,
            newly_latched: true
        }
    );

    // Every cycle inside the cooldown is short-circuited
    for _ in 0..5 {
        clock.advance(60_000);
        assert_eq!(
            engine.evaluate_exit(&pos, metrics_snapshot(), &mtm(0.0), "harmonic oscillation"),
            ExitEvaluation::ShortCircuited
        );
    }

    // Cooldown expires with nothing changed: extended, three times
    for i in 1..=3u32 {
        clock.advance(15 * 60 * 1000);
        assert_eq!(
            engine.evaluate_exit(&pos, metrics_snapshot(), &mtm(0.0), "harmonic oscillation"),
            ExitEvaluation::CooldownExtended { extensions: i }
        );
    }

    // Fourth expiry: the ceiling forces re-evaluation; fees have amortized
    // by now, so the exit goes through
    clock.advance(15 * 60 * 1000);
    let eval = engine.evaluate_exit(&pos, metrics_snapshot(), &mtm(5.0), "harmonic oscillation");
    assert_eq!(
        eval,
        ExitEvaluation::Allowed {
            class: ExitClass::Noise,
            forced_by_stuck_mtm: false
        }
    );

    engine.clear_exit("pos-1");
    assert!(engine.latch().is_empty());
}

#[test]
fn test_cost_amortization_exact_threshold() {
    let (engine, clock) = engine_with_clock(1_000_000);
    let pos = position("pos-1", clock.now_millis());
    clock.advance(11 * 60 * 1000);

    // Cost target: ($1 + $1 + $1) x 1.10 = $3.30
    let eval = engine.evaluate_exit(&pos, metrics_snapshot(), &mtm(3.0), "score-drop");
    assert_eq!(
        eval,
        ExitEvaluation::Suppressed {
            reason: SuppressionReason::CostNotAmortized,
            newly_latched: true
        }
    );

    let eval = engine.evaluate_exit(
        &position("pos-2", clock.now_millis() - 11 * 60 * 1000),
        metrics_snapshot(),
        &mtm(3.30),
        "score-drop",
    );
    assert_eq!(
        eval,
        ExitEvaluation::Allowed {
            class: ExitClass::Noise,
            forced_by_stuck_mtm: false
        }
    );
}

#[test]
fn test_suppression_window_boundary_is_exact() {
    let (engine, clock) = engine_with_clock(1_000_000);
    let pos = position("pos-1", clock.now_millis());

    engine.evaluate_exit(&pos, metrics_snapshot(), &mtm(0.0), "harmonic oscillation");
    let until = engine
        .latch()
        .get("pos-1")
        .unwrap()
        .suppressed_until
        .unwrap();

    clock.set(until - 1);
    assert!(engine.latch().should_short_circuit("pos-1"));
    clock.set(until);
    assert!(!engine.latch().should_short_circuit("pos-1"));
}

#[test]
fn test_tranche_gating_ladder() {
    let (engine, _clock) = engine_with_clock(1_000_000);

    // A1 with strong density: aggression gate wins
    let d = engine.can_add_tranche(
        "pool-a",
        AggressionLevel::A1,
        3.0,
        true,
        &TrancheRequest::Initial,
    );
    assert_eq!(
        d,
        TrancheDecision::Blocked {
            reason: TrancheBlockReason::AggressionLevelLow
        }
    );

    // A2 with weak density
    let d = engine.can_add_tranche(
        "pool-a",
        AggressionLevel::A2,
        1.0,
        true,
        &TrancheRequest::Initial,
    );
    assert_eq!(
        d,
        TrancheDecision::Blocked {
            reason: TrancheBlockReason::OdsBelowThreshold
        }
    );

    // A2, strong density, active spike, first tranche: allowed at 11.25%
    match engine.can_add_tranche(
        "pool-a",
        AggressionLevel::A2,
        3.0,
        true,
        &TrancheRequest::Initial,
    ) {
        TrancheDecision::Allowed { target_cap_pct } => {
            assert!((target_cap_pct - 11.25).abs() < 1e-9);
        }
        other => panic!("expected Allowed, got {:?}", other),
    }
}

#[test]
fn test_three_tranche_buildup_and_unwind() {
    let (engine, clock) = engine_with_clock(1_000_000);

    let mut sizes = Vec::new();
    for (i, ev) in [10.0, 11.0, 12.0].iter().enumerate() {
        let request = if i == 0 {
            TrancheRequest::Initial
        } else {
            TrancheRequest::Additional(TrancheContext {
                ev_usd: *ev,
                fee_intensity_pct: 4.0,
                volatility_skew_eligible: false,
                adverse_selection_penalty_pct: 2.0,
                expected_fee_rate_usd_per_hour: 1.0,
            })
        };
        let decision = engine.can_add_tranche("pool-a", AggressionLevel::A2, 3.0, true, &request);
        assert!(decision.is_allowed(), "tranche {} blocked: {:?}", i, decision);

        let sized = engine.evaluate_concentration("pool-a", AggressionLevel::A2, 300.0, EQUITY);
        assert!(sized.allowed_size_usd > 0.0);
        sizes.push(sized.allowed_size_usd);
        assert!(engine.record_deployment(
            &DeploymentRequest {
                pool: "pool-a".to_string(),
                tranche_id: format!("t{}", i),
                size_usd: sized.allowed_size_usd,
                level: AggressionLevel::A2,
                ods: 3.0,
                ev_usd: *ev,
                fee_intensity_pct: 4.0,
            },
            EQUITY,
        ));
        clock.advance(300_000);
    }

    // 3 x (300 x 1.5) = 1350 > 1125 cap: the last tranche was clamped
    let deployed = engine.concentration().pool_deployed_usd("pool-a");
    assert!(deployed <= EQUITY * 11.25 / 100.0 + 1e-9);
    assert!(sizes[2] < sizes[0]);

    // Fourth tranche refused outright
    let d = engine.can_add_tranche(
        "pool-a",
        AggressionLevel::A2,
        3.0,
        true,
        &TrancheRequest::Additional(TrancheContext {
            ev_usd: 20.0,
            fee_intensity_pct: 4.0,
            volatility_skew_eligible: false,
            adverse_selection_penalty_pct: 2.0,
            expected_fee_rate_usd_per_hour: 1.0,
        }),
    );
    assert_eq!(
        d,
        TrancheDecision::Blocked {
            reason: TrancheBlockReason::MaxTranchesReached
        }
    );

    // Unwind drops the pool entirely
    engine.record_pool_exit("pool-a", deployed, EQUITY);
    assert_eq!(engine.concentration().pool_count(), 0);
}

#[test]
fn test_regime_flip_emits_event() {
    let clock = Arc::new(ManualClock::new(0));
    let (tx, mut rx) = broadcast::channel(1024);
    let engine = HarvestEngine::new(&AppConfig::default(), clock.clone(), tx);
    clock.advance(600_000);

    engine.begin_cycle(Regime::Bull);
    engine.begin_cycle(Regime::Bull);
    engine.begin_cycle(Regime::Bull);

    let mut committed = false;
    while let Ok(event) = rx.try_recv() {
        if let Event::RegimeCommitted { from, to, .. } = event {
            assert_eq!(from, Regime::Neutral);
            assert_eq!(to, Regime::Bull);
            committed = true;
        }
    }
    assert!(committed);
}

/// Property tests for the core guarantees
#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    use sol_fee_harvester::config::{RegimeConfig, ScalingConfig};
    use sol_fee_harvester::exit::hysteresis::{ExitHysteresisGate, SuppressDecision};
    use sol_fee_harvester::regime::scaler::AggressionScaler;
    use sol_fee_harvester::regime::RegimeTracker;

    fn regime_from(i: u8) -> Regime {
        match i % 3 {
            0 => Regime::Bear,
            1 => Regime::Neutral,
            _ => Regime::Bull,
        }
    }

    proptest! {
        /// Risk exits are never suppressed, including at zero hold and zero
        /// accrued fees.
        #[test]
        fn prop_risk_exits_unsuppressable(
            reason_idx in 0usize..9,
            hold_ms in 0i64..1_200_000,
            fees in 0.0f64..10.0,
        ) {
            let reasons = [
                "kill-switch",
                "regime-flip-to-chaos",
                "fee-bleed-active",
                "ledger-error",
                "emergency",
                "market-crash",
                "insufficient-capital",
                "stop-loss",
                "force-exit",
            ];
            let clock = Arc::new(ManualClock::new(1_000_000));
            let gate = ExitHysteresisGate::new(
                sol_fee_harvester::config::ExitConfig::default(),
                clock.clone(),
            );
            let pos = position("pos-p", clock.now_millis() - hold_ms);
            let decision = gate.should_suppress(&pos, &mtm(fees), reasons[reason_idx]);
            prop_assert!(
                matches!(
                    decision,
                    SuppressDecision::Allow { class: ExitClass::Risk, .. }
                ),
                "expected Allow with Risk class"
            );
        }

        /// No signal sequence commits a flip without 3 consecutive differing
        /// signals and the dwell time both satisfied.
        #[test]
        fn prop_flips_respect_hysteresis_and_dwell(
            signals in proptest::collection::vec((0u8..3, 0i64..120_000), 1..80),
        ) {
            let clock = Arc::new(ManualClock::new(0));
            let (tx, _rx) = broadcast::channel(16);
            let tracker = RegimeTracker::new(RegimeConfig::default(), clock.clone(), tx);

            let mut history: Vec<Regime> = Vec::new();
            let mut last_flip = tracker.last_flip_time();

            for (raw, step_ms) in signals {
                clock.advance(step_ms);
                let signal = regime_from(raw);
                let before = tracker.current();
                history.push(signal);
                let update = tracker.update(signal);

                if let RegimeUpdate::Committed { from, to } = update {
                    // Dwell held
                    prop_assert!(clock.now_millis() - last_flip >= 300_000);
                    prop_assert_eq!(from, before);
                    // The last 3 observations all match the new regime
                    let n = history.len();
                    prop_assert!(n >= 3);
                    for s in &history[n - 3..] {
                        prop_assert_eq!(*s, to);
                    }
                    prop_assert!(to != from);
                    last_flip = clock.now_millis();
                }
            }
        }

        /// While unstable, multipliers above 1.0 are dampened by exactly the
        /// first-flip factor and multipliers at or below 1.0 pass unmodified.
        #[test]
        fn prop_dampening_asymmetry(
            size in 0.5f64..2.0,
            bin_width in 0.5f64..2.0,
            exit_sensitivity in 0.5f64..2.0,
            score_decay in 0.5f64..2.0,
        ) {
            let clock = Arc::new(ManualClock::new(0));
            let (tx, _rx) = broadcast::channel(16);
            let tracker = RegimeTracker::new(RegimeConfig::default(), clock.clone(), tx.clone());
            let mut scaling = ScalingConfig::default();
            scaling.bull.size = size;
            scaling.bull.bin_width = bin_width;
            scaling.bull.exit_sensitivity = exit_sensitivity;
            scaling.bull.score_decay_tolerance = score_decay;
            let scaler = AggressionScaler::new(scaling, clock.clone(), tx);

            clock.advance(600_000);
            tracker.update(Regime::Bull);
            tracker.update(Regime::Bull);
            tracker.update(Regime::Bull);
            clock.advance(150_000); // past flip cooldown, inside stability window
            prop_assert!(!tracker.is_stable());

            let m = scaler.multipliers(&tracker);
            for (raw, got) in [
                (size, m.size),
                (bin_width, m.bin_width),
                (exit_sensitivity, m.exit_sensitivity),
                (score_decay, m.score_decay_tolerance),
            ] {
                if raw > 1.0 {
                    prop_assert!((got - (1.0 + (raw - 1.0) * 0.85)).abs() < 1e-12);
                } else {
                    prop_assert_eq!(got, raw);
                }
            }
        }

        /// Any sequence of clamped deployments and exits keeps the pool
        /// under the hard cap plus tolerance.
        #[test]
        fn prop_pool_cap_never_exceeded(
            ops in proptest::collection::vec((any::<bool>(), 1.0f64..2_000.0), 1..40),
        ) {
            let (engine, clock) = engine_with_clock(1_000_000);
            let mut next_id = 0u32;

            for (is_deploy, size) in ops {
                clock.advance(1_000);
                if is_deploy {
                    let sized = engine.evaluate_concentration(
                        "pool-a",
                        AggressionLevel::A4,
                        size,
                        EQUITY,
                    );
                    if sized.allowed_size_usd > 0.0 {
                        engine.record_deployment(
                            &DeploymentRequest {
                                pool: "pool-a".to_string(),
                                tranche_id: format!("t{}", next_id),
                                size_usd: sized.allowed_size_usd,
                                level: AggressionLevel::A4,
                                ods: 3.0,
                                ev_usd: 10.0,
                                fee_intensity_pct: 4.0,
                            },
                            EQUITY,
                        );
                        next_id += 1;
                    }
                } else {
                    engine.record_pool_exit("pool-a", size, EQUITY);
                }

                let pct = engine.concentration().pool_deployed_usd("pool-a") / EQUITY * 100.0;
                prop_assert!(pct <= 18.0 + 0.1, "pool at {:.3}%", pct);
            }
        }
    }
}
