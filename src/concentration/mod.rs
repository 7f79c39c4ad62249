//! Capital Concentration Engine
//!
//! Per-pool and portfolio-wide admission control for additional capital
//! tranches. Aggression raises the per-pool target cap, but two hard caps
//! bound every decision: 18% of equity per pool, 25% portfolio-wide.
//! Tranches beyond the first pass a battery of decay/EV/fee-intensity
//! checks, and failing the soft ones puts the pool on a re-attempt cooldown.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::ConcentrationConfig;
use crate::events::Event;
use crate::invariants::{self, InvariantViolation, CAP_TOLERANCE_PCT};
use crate::telemetry::metrics;
use crate::utils::helpers::{format_usd, generate_id, pct_of};
use crate::utils::types::AggressionLevel;
use crate::utils::Clock;

/// One recorded capital commitment into a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrancheRecord {
    pub id: String,
    pub size_usd: f64,
    pub entered_at: i64,
    pub level: AggressionLevel,
    /// Opportunity-density value at entry
    pub ods: f64,
    /// Expected value at entry, USD
    pub ev_usd: f64,
    pub fee_intensity_pct: f64,
}

/// Concentration bookkeeping for one pool
#[derive(Debug, Clone)]
pub struct PoolConcentrationState {
    pub pool: String,
    pub total_deployed_usd: f64,
    pub tranches: Vec<TrancheRecord>,
    pub last_tranche_at: i64,
    /// Highest ODS observed while any tranche is open; monotone until the
    /// pool's deployment fully closes
    pub peak_ods: f64,
    /// Re-attempt cooldown after a soft tranche block
    pub blocked_until: i64,
}

/// Extended inputs required for the second and third tranche
#[derive(Debug, Clone, Copy)]
pub struct TrancheContext {
    pub ev_usd: f64,
    pub fee_intensity_pct: f64,
    pub volatility_skew_eligible: bool,
    pub adverse_selection_penalty_pct: f64,
    pub expected_fee_rate_usd_per_hour: f64,
}

/// Tranche admission request.
///
/// The type makes the "only tranches 2 and 3 need extended checks" rule
/// explicit: an `Initial` request against a pool that already holds
/// tranches is blocked rather than silently skipping the checks.
#[derive(Debug, Clone, Copy)]
pub enum TrancheRequest {
    Initial,
    Additional(TrancheContext),
}

/// Why a tranche was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrancheBlockReason {
    AggressionLevelLow,
    MaxTranchesReached,
    CooldownActive,
    IntervalNotElapsed,
    OdsBelowThreshold,
    NoActiveSpike,
    MissingTrancheContext,
    DensityDecayed,
    EvNotImproved,
    FeeIntensityLow,
    AdverseSelectionHigh,
    FeeRateLow,
}

impl TrancheBlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrancheBlockReason::AggressionLevelLow => "aggression_level_low",
            TrancheBlockReason::MaxTranchesReached => "max_tranches_reached",
            TrancheBlockReason::CooldownActive => "cooldown_active",
            TrancheBlockReason::IntervalNotElapsed => "interval_not_elapsed",
            TrancheBlockReason::OdsBelowThreshold => "ods_below_threshold",
            TrancheBlockReason::NoActiveSpike => "no_active_spike",
            TrancheBlockReason::MissingTrancheContext => "missing_tranche_context",
            TrancheBlockReason::DensityDecayed => "density_decayed",
            TrancheBlockReason::EvNotImproved => "ev_not_improved",
            TrancheBlockReason::FeeIntensityLow => "fee_intensity_low",
            TrancheBlockReason::AdverseSelectionHigh => "adverse_selection_high",
            TrancheBlockReason::FeeRateLow => "fee_rate_low",
        }
    }

    /// Soft blocks cool the pool down to prevent immediate re-attempts
    fn triggers_cooldown(&self) -> bool {
        matches!(
            self,
            TrancheBlockReason::DensityDecayed
                | TrancheBlockReason::EvNotImproved
                | TrancheBlockReason::FeeIntensityLow
        )
    }
}

/// Tranche admission verdict
#[derive(Debug, Clone, PartialEq)]
pub enum TrancheDecision {
    Allowed { target_cap_pct: f64 },
    Blocked { reason: TrancheBlockReason },
}

impl TrancheDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, TrancheDecision::Allowed { .. })
    }
}

/// Size clamp applied during admission, kept for auditability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClampReason {
    PoolCapacity,
    PortfolioCapacity,
}

impl ClampReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClampReason::PoolCapacity => "pool_capacity",
            ClampReason::PortfolioCapacity => "portfolio_capacity",
        }
    }
}

/// Final admissible size plus the clamps that produced it
#[derive(Debug, Clone)]
pub struct ConcentrationDecision {
    pub requested_size_usd: f64,
    pub allowed_size_usd: f64,
    pub target_cap_pct: f64,
    pub clamps: Vec<ClampReason>,
}

/// Everything needed to record one executed deployment
#[derive(Debug, Clone)]
pub struct DeploymentRequest {
    pub pool: String,
    /// Natural idempotence key (trade id); replays are no-ops
    pub tranche_id: String,
    pub size_usd: f64,
    pub level: AggressionLevel,
    pub ods: f64,
    pub ev_usd: f64,
    pub fee_intensity_pct: f64,
}

impl DeploymentRequest {
    /// Request with a generated tranche id, for callers that have no
    /// upstream trade id to key idempotence on.
    pub fn with_generated_id(
        pool: &str,
        size_usd: f64,
        level: AggressionLevel,
        ods: f64,
        ev_usd: f64,
        fee_intensity_pct: f64,
    ) -> Self {
        Self {
            pool: pool.to_string(),
            tranche_id: generate_id(),
            size_usd,
            level,
            ods,
            ev_usd,
            fee_intensity_pct,
        }
    }
}

/// Capital concentration engine
pub struct ConcentrationEngine {
    config: ConcentrationConfig,
    clock: Arc<dyn Clock>,
    event_tx: broadcast::Sender<Event>,
    pools: DashMap<String, PoolConcentrationState>,
}

impl ConcentrationEngine {
    pub fn new(
        config: ConcentrationConfig,
        clock: Arc<dyn Clock>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            config,
            clock,
            event_tx,
            pools: DashMap::new(),
        }
    }

    /// Per-pool target cap at an aggression level, percent of equity
    pub fn target_pool_cap_pct(&self, level: AggressionLevel) -> f64 {
        (self.config.base_per_pool_cap_pct * self.config.multiplier_for(level))
            .min(self.config.per_pool_hard_cap_pct)
    }

    /// Gate an additional tranche into a pool.
    pub fn can_add_tranche(
        &self,
        pool: &str,
        level: AggressionLevel,
        ods_value: f64,
        spike_active: bool,
        request: &TrancheRequest,
    ) -> TrancheDecision {
        let now = self.clock.now_millis();
        let decision = self.tranche_decision(pool, level, ods_value, spike_active, request, now);

        match &decision {
            TrancheDecision::Allowed { target_cap_pct } => {
                debug!(
                    "Tranche admitted for {} at {} (target cap {:.2}%)",
                    pool, level, target_cap_pct
                );
                metrics::record_tranche_admitted();
                let _ = self.event_tx.send(Event::TrancheAdmitted {
                    pool: pool.to_string(),
                    level,
                    target_cap_pct: *target_cap_pct,
                });
            }
            TrancheDecision::Blocked { reason } => {
                debug!("Tranche blocked for {}: {}", pool, reason.as_str());
                metrics::record_tranche_blocked(reason.as_str());
                let _ = self.event_tx.send(Event::TrancheBlocked {
                    pool: pool.to_string(),
                    reason: reason.as_str(),
                });
                if reason.triggers_cooldown() {
                    if let Some(mut state) = self.pools.get_mut(pool) {
                        state.blocked_until = now + self.config.block_cooldown_ms;
                    }
                }
            }
        }

        decision
    }

    fn tranche_decision(
        &self,
        pool: &str,
        level: AggressionLevel,
        ods_value: f64,
        spike_active: bool,
        request: &TrancheRequest,
        now: i64,
    ) -> TrancheDecision {
        if level < self.config.min_tranche_level {
            return TrancheDecision::Blocked {
                reason: TrancheBlockReason::AggressionLevelLow,
            };
        }

        // Snapshot what the extended checks need, keeping any higher ODS
        // observation as the new peak.
        let prior = match self.pools.get_mut(pool) {
            Some(mut state) => {
                if ods_value > state.peak_ods {
                    state.peak_ods = ods_value;
                }
                Some((
                    state.tranches.len() as u32,
                    state.last_tranche_at,
                    state.peak_ods,
                    state.blocked_until,
                    state.tranches.last().map(|t| t.ev_usd),
                ))
            }
            None => None,
        };
        let (tranche_count, last_tranche_at, peak_ods, blocked_until, prior_ev) =
            prior.unwrap_or((0, 0, ods_value, 0, None));

        if tranche_count >= self.config.max_tranches_per_pool {
            return TrancheDecision::Blocked {
                reason: TrancheBlockReason::MaxTranchesReached,
            };
        }

        if blocked_until > now {
            return TrancheDecision::Blocked {
                reason: TrancheBlockReason::CooldownActive,
            };
        }

        if tranche_count > 0 && now - last_tranche_at < self.config.min_tranche_interval_ms {
            return TrancheDecision::Blocked {
                reason: TrancheBlockReason::IntervalNotElapsed,
            };
        }

        if ods_value < self.config.min_ods_for_tranche {
            return TrancheDecision::Blocked {
                reason: TrancheBlockReason::OdsBelowThreshold,
            };
        }

        if !spike_active {
            return TrancheDecision::Blocked {
                reason: TrancheBlockReason::NoActiveSpike,
            };
        }

        if tranche_count >= 1 {
            let ctx = match request {
                TrancheRequest::Additional(ctx) => ctx,
                // Conservative: a follow-on tranche without extended inputs
                // is refused, never waved through.
                TrancheRequest::Initial => {
                    return TrancheDecision::Blocked {
                        reason: TrancheBlockReason::MissingTrancheContext,
                    };
                }
            };

            if peak_ods > 0.0 {
                let decay_pct = (peak_ods - ods_value) / peak_ods * 100.0;
                if decay_pct > self.config.ods_decay_tolerance_pct {
                    return TrancheDecision::Blocked {
                        reason: TrancheBlockReason::DensityDecayed,
                    };
                }
            }

            if let Some(prior_ev) = prior_ev {
                let required = prior_ev * (1.0 + self.config.ev_improvement_min_pct / 100.0);
                if ctx.ev_usd < required {
                    return TrancheDecision::Blocked {
                        reason: TrancheBlockReason::EvNotImproved,
                    };
                }
            }

            if !ctx.volatility_skew_eligible
                && ctx.fee_intensity_pct < self.config.fee_intensity_min_pct
            {
                return TrancheDecision::Blocked {
                    reason: TrancheBlockReason::FeeIntensityLow,
                };
            }

            if ctx.adverse_selection_penalty_pct > self.config.adverse_selection_max_pct {
                return TrancheDecision::Blocked {
                    reason: TrancheBlockReason::AdverseSelectionHigh,
                };
            }

            if ctx.expected_fee_rate_usd_per_hour < self.config.min_fee_rate_usd_per_hour {
                return TrancheDecision::Blocked {
                    reason: TrancheBlockReason::FeeRateLow,
                };
            }
        }

        TrancheDecision::Allowed {
            target_cap_pct: self.target_pool_cap_pct(level),
        }
    }

    /// Compute the admissible size for a deployment: scale the base size by
    /// the concentration multiplier, then clamp to remaining per-pool and
    /// portfolio capacity, in that order.
    pub fn evaluate_concentration(
        &self,
        pool: &str,
        level: AggressionLevel,
        base_size_usd: f64,
        total_equity_usd: f64,
    ) -> ConcentrationDecision {
        let target_cap_pct = self.target_pool_cap_pct(level);
        let requested = base_size_usd * self.config.multiplier_for(level);
        let mut allowed = requested;
        let mut clamps = Vec::new();

        let pool_deployed = self.pool_deployed_usd(pool);
        let pool_cap_usd = total_equity_usd * target_cap_pct / 100.0;
        let pool_remaining = (pool_cap_usd - pool_deployed).max(0.0);
        if allowed > pool_remaining {
            allowed = pool_remaining;
            clamps.push(ClampReason::PoolCapacity);
        }

        let total_deployed = self.total_deployed_usd();
        let portfolio_cap_usd = total_equity_usd * self.config.portfolio_cap_pct / 100.0;
        let portfolio_remaining = (portfolio_cap_usd - total_deployed).max(0.0);
        if allowed > portfolio_remaining {
            allowed = portfolio_remaining;
            clamps.push(ClampReason::PortfolioCapacity);
        }

        if !clamps.is_empty() {
            debug!(
                "Deployment size clamped for {}: ${:.2} -> ${:.2} ({:?})",
                pool, requested, allowed, clamps
            );
            metrics::record_size_clamp();
            let _ = self.event_tx.send(Event::SizeClamped {
                pool: pool.to_string(),
                requested_usd: requested,
                allowed_usd: allowed,
                clamps: clamps.iter().map(|c| c.as_str().to_string()).collect(),
            });
        }

        ConcentrationDecision {
            requested_size_usd: requested,
            allowed_size_usd: allowed,
            target_cap_pct,
            clamps,
        }
    }

    /// Record an executed deployment.
    ///
    /// Idempotent by tranche id: replaying the same id changes nothing and
    /// returns false. Cap invariants are checked after the mutation.
    pub fn record_deployment(&self, request: &DeploymentRequest, total_equity_usd: f64) -> bool {
        let now = self.clock.now_millis();
        let pool_deployed_usd;
        {
            let mut state = self
                .pools
                .entry(request.pool.clone())
                .or_insert_with(|| PoolConcentrationState {
                    pool: request.pool.clone(),
                    total_deployed_usd: 0.0,
                    tranches: Vec::new(),
                    last_tranche_at: 0,
                    peak_ods: 0.0,
                    blocked_until: 0,
                });

            if state.tranches.iter().any(|t| t.id == request.tranche_id) {
                debug!(
                    "Deployment {} for {} already recorded, ignoring",
                    request.tranche_id, request.pool
                );
                return false;
            }

            state.total_deployed_usd += request.size_usd;
            state.last_tranche_at = now;
            if request.ods > state.peak_ods {
                state.peak_ods = request.ods;
            }
            state.tranches.push(TrancheRecord {
                id: request.tranche_id.clone(),
                size_usd: request.size_usd,
                entered_at: now,
                level: request.level,
                ods: request.ods,
                ev_usd: request.ev_usd,
                fee_intensity_pct: request.fee_intensity_pct,
            });
            pool_deployed_usd = state.total_deployed_usd;
        }

        let pool_pct = pct_of(pool_deployed_usd, total_equity_usd);
        let total_deployed = self.total_deployed_usd();
        let total_pct = pct_of(total_deployed, total_equity_usd);

        info!(
            "Deployment recorded: {} +{} into {} (pool {:.2}%, portfolio {:.2}%)",
            request.tranche_id,
            format_usd(request.size_usd),
            request.pool,
            pool_pct,
            total_pct
        );
        metrics::record_pool_deployed_pct(&request.pool, pool_pct);
        metrics::record_total_deployed_pct(total_pct);
        let _ = self.event_tx.send(Event::DeploymentRecorded {
            pool: request.pool.clone(),
            size_usd: request.size_usd,
            pool_deployed_pct: pool_pct,
        });

        self.check_invariants(total_equity_usd);
        true
    }

    /// Record capital leaving a pool. Removes the pool once its deployment
    /// reaches zero. Returns the remaining deployed USD.
    pub fn record_exit(&self, pool: &str, size_usd: f64, total_equity_usd: f64) -> f64 {
        let remaining = {
            let Some(mut state) = self.pools.get_mut(pool) else {
                return 0.0;
            };
            state.total_deployed_usd = (state.total_deployed_usd - size_usd).max(0.0);

            // Retire tranche records oldest-first as the exit covers them
            let mut to_cover = size_usd;
            while !state.tranches.is_empty() && state.tranches[0].size_usd <= to_cover {
                to_cover -= state.tranches[0].size_usd;
                state.tranches.remove(0);
            }
            state.total_deployed_usd
        };

        if remaining <= f64::EPSILON {
            self.pools.remove(pool);
            debug!("Pool {} fully exited, concentration state dropped", pool);
            metrics::record_pool_deployed_pct(pool, 0.0);
        } else {
            metrics::record_pool_deployed_pct(pool, pct_of(remaining, total_equity_usd));
        }
        metrics::record_total_deployed_pct(pct_of(self.total_deployed_usd(), total_equity_usd));
        self.check_invariants(total_equity_usd);
        remaining
    }

    /// Assert the hard caps, with the floating-point tolerance.
    pub fn check_invariants(&self, total_equity_usd: f64) {
        if total_equity_usd <= 0.0 {
            return;
        }

        for entry in self.pools.iter() {
            let pct = pct_of(entry.total_deployed_usd, total_equity_usd);
            invariants::enforce(
                pct <= self.config.per_pool_hard_cap_pct + CAP_TOLERANCE_PCT,
                &self.event_tx,
                || InvariantViolation::PoolCapExceeded {
                    pool: entry.pool.clone(),
                    deployed_pct: pct,
                    cap_pct: self.config.per_pool_hard_cap_pct,
                },
            );
        }

        let total_pct = pct_of(self.total_deployed_usd(), total_equity_usd);
        invariants::enforce(
            total_pct <= self.config.portfolio_cap_pct + CAP_TOLERANCE_PCT,
            &self.event_tx,
            || InvariantViolation::PortfolioCapExceeded {
                deployed_pct: total_pct,
                cap_pct: self.config.portfolio_cap_pct,
            },
        );
    }

    pub fn pool_deployed_usd(&self, pool: &str) -> f64 {
        self.pools
            .get(pool)
            .map(|s| s.total_deployed_usd)
            .unwrap_or(0.0)
    }

    /// Portfolio-wide deployed total, summed from ground truth
    pub fn total_deployed_usd(&self) -> f64 {
        self.pools.iter().map(|s| s.total_deployed_usd).sum()
    }

    pub fn pool_tranche_count(&self, pool: &str) -> usize {
        self.pools.get(pool).map(|s| s.tranches.len()).unwrap_or(0)
    }

    pub fn pool_snapshot(&self, pool: &str) -> Option<PoolConcentrationState> {
        self.pools.get(pool).map(|s| s.clone())
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Drop all pool state (test lifecycle)
    pub fn reset(&self) {
        self.pools.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::ManualClock;

    const EQUITY: f64 = 10_000.0;

    fn engine(clock: Arc<ManualClock>) -> ConcentrationEngine {
        let (tx, _rx) = broadcast::channel(64);
        ConcentrationEngine::new(ConcentrationConfig::default(), clock, tx)
    }

    fn deployment(pool: &str, id: &str, size: f64, ods: f64, ev: f64) -> DeploymentRequest {
        DeploymentRequest {
            pool: pool.to_string(),
            tranche_id: id.to_string(),
            size_usd: size,
            level: AggressionLevel::A2,
            ods,
            ev_usd: ev,
            fee_intensity_pct: 4.0,
        }
    }

    fn context(ev: f64) -> TrancheContext {
        TrancheContext {
            ev_usd: ev,
            fee_intensity_pct: 4.0,
            volatility_skew_eligible: false,
            adverse_selection_penalty_pct: 2.0,
            expected_fee_rate_usd_per_hour: 1.0,
        }
    }

    #[test]
    fn test_target_cap_ladder() {
        let clock = Arc::new(ManualClock::new(0));
        let e = engine(clock);
        assert!((e.target_pool_cap_pct(AggressionLevel::A0) - 7.5).abs() < 1e-9);
        assert!((e.target_pool_cap_pct(AggressionLevel::A2) - 11.25).abs() < 1e-9);
        assert!((e.target_pool_cap_pct(AggressionLevel::A3) - 15.0).abs() < 1e-9);
        // A4: 7.5 * 2.5 = 18.75, clipped by the 18% hard cap
        assert!((e.target_pool_cap_pct(AggressionLevel::A4) - 18.0).abs() < 1e-9);
    }

    #[test]
    fn test_low_aggression_blocks() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock);
        let d = e.can_add_tranche(
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
    }

    #[test]
    fn test_low_ods_blocks() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock);
        let d = e.can_add_tranche(
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
    }

    #[test]
    fn test_first_tranche_allowed_with_spike() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock);
        let d = e.can_add_tranche(
            "pool-a",
            AggressionLevel::A2,
            3.0,
            true,
            &TrancheRequest::Initial,
        );
        match d {
            TrancheDecision::Allowed { target_cap_pct } => {
                assert!((target_cap_pct - 11.25).abs() < 1e-9);
            }
            other => panic!("expected Allowed, got {:?}", other),
        }
    }

    #[test]
    fn test_no_spike_blocks() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock);
        let d = e.can_add_tranche(
            "pool-a",
            AggressionLevel::A2,
            3.0,
            false,
            &TrancheRequest::Initial,
        );
        assert_eq!(
            d,
            TrancheDecision::Blocked {
                reason: TrancheBlockReason::NoActiveSpike
            }
        );
    }

    #[test]
    fn test_second_tranche_requires_context() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock.clone());
        e.record_deployment(&deployment("pool-a", "t1", 300.0, 3.0, 10.0), EQUITY);
        clock.advance(300_000);

        let d = e.can_add_tranche(
            "pool-a",
            AggressionLevel::A2,
            3.0,
            true,
            &TrancheRequest::Initial,
        );
        assert_eq!(
            d,
            TrancheDecision::Blocked {
                reason: TrancheBlockReason::MissingTrancheContext
            }
        );
    }

    #[test]
    fn test_interval_gate() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock.clone());
        e.record_deployment(&deployment("pool-a", "t1", 300.0, 3.0, 10.0), EQUITY);

        clock.advance(60_000);
        let d = e.can_add_tranche(
            "pool-a",
            AggressionLevel::A2,
            3.0,
            true,
            &TrancheRequest::Additional(context(11.0)),
        );
        assert_eq!(
            d,
            TrancheDecision::Blocked {
                reason: TrancheBlockReason::IntervalNotElapsed
            }
        );

        clock.advance(240_000);
        let d = e.can_add_tranche(
            "pool-a",
            AggressionLevel::A2,
            3.0,
            true,
            &TrancheRequest::Additional(context(11.0)),
        );
        assert!(d.is_allowed());
    }

    #[test]
    fn test_density_decay_blocks_and_cools_down() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock.clone());
        e.record_deployment(&deployment("pool-a", "t1", 300.0, 4.0, 10.0), EQUITY);
        clock.advance(300_000);

        // Peak is 4.0; 3.2 is a 20% decay, above the 15% tolerance
        let d = e.can_add_tranche(
            "pool-a",
            AggressionLevel::A2,
            3.2,
            true,
            &TrancheRequest::Additional(context(11.0)),
        );
        assert_eq!(
            d,
            TrancheDecision::Blocked {
                reason: TrancheBlockReason::DensityDecayed
            }
        );

        // And the pool is cooling down even for otherwise-good requests
        let d = e.can_add_tranche(
            "pool-a",
            AggressionLevel::A2,
            4.0,
            true,
            &TrancheRequest::Additional(context(11.0)),
        );
        assert_eq!(
            d,
            TrancheDecision::Blocked {
                reason: TrancheBlockReason::CooldownActive
            }
        );

        clock.advance(300_000);
        let d = e.can_add_tranche(
            "pool-a",
            AggressionLevel::A2,
            4.0,
            true,
            &TrancheRequest::Additional(context(11.0)),
        );
        assert!(d.is_allowed());
    }

    #[test]
    fn test_ev_must_improve() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock.clone());
        e.record_deployment(&deployment("pool-a", "t1", 300.0, 3.0, 10.0), EQUITY);
        clock.advance(300_000);

        // Needs at least 10 * 1.05 = 10.5
        let d = e.can_add_tranche(
            "pool-a",
            AggressionLevel::A2,
            3.0,
            true,
            &TrancheRequest::Additional(context(10.2)),
        );
        assert_eq!(
            d,
            TrancheDecision::Blocked {
                reason: TrancheBlockReason::EvNotImproved
            }
        );
    }

    #[test]
    fn test_skew_eligibility_substitutes_fee_intensity() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock.clone());
        e.record_deployment(&deployment("pool-a", "t1", 300.0, 3.0, 10.0), EQUITY);
        clock.advance(300_000);

        let mut ctx = context(11.0);
        ctx.fee_intensity_pct = 1.0;
        let d = e.can_add_tranche(
            "pool-a",
            AggressionLevel::A2,
            3.0,
            true,
            &TrancheRequest::Additional(ctx),
        );
        assert_eq!(
            d,
            TrancheDecision::Blocked {
                reason: TrancheBlockReason::FeeIntensityLow
            }
        );

        // Cooldown from the block above
        clock.advance(300_000);
        ctx.volatility_skew_eligible = true;
        let d = e.can_add_tranche(
            "pool-a",
            AggressionLevel::A2,
            3.0,
            true,
            &TrancheRequest::Additional(ctx),
        );
        assert!(d.is_allowed());
    }

    #[test]
    fn test_adverse_selection_and_fee_rate_gates() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock.clone());
        e.record_deployment(&deployment("pool-a", "t1", 300.0, 3.0, 10.0), EQUITY);
        clock.advance(300_000);

        let mut ctx = context(11.0);
        ctx.adverse_selection_penalty_pct = 9.0;
        let d = e.can_add_tranche(
            "pool-a",
            AggressionLevel::A2,
            3.0,
            true,
            &TrancheRequest::Additional(ctx),
        );
        assert_eq!(
            d,
            TrancheDecision::Blocked {
                reason: TrancheBlockReason::AdverseSelectionHigh
            }
        );

        let mut ctx = context(11.0);
        ctx.expected_fee_rate_usd_per_hour = 0.25;
        let d = e.can_add_tranche(
            "pool-a",
            AggressionLevel::A2,
            3.0,
            true,
            &TrancheRequest::Additional(ctx),
        );
        assert_eq!(
            d,
            TrancheDecision::Blocked {
                reason: TrancheBlockReason::FeeRateLow
            }
        );
    }

    #[test]
    fn test_max_tranches() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock.clone());
        for (i, ev) in [10.0, 11.0, 12.0].iter().enumerate() {
            e.record_deployment(
                &deployment("pool-a", &format!("t{}", i), 300.0, 3.0, *ev),
                EQUITY,
            );
            clock.advance(300_000);
        }

        let d = e.can_add_tranche(
            "pool-a",
            AggressionLevel::A4,
            3.0,
            true,
            &TrancheRequest::Additional(context(20.0)),
        );
        assert_eq!(
            d,
            TrancheDecision::Blocked {
                reason: TrancheBlockReason::MaxTranchesReached
            }
        );
    }

    #[test]
    fn test_evaluate_concentration_clamps_in_order() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock.clone());

        // Pool already at $1,000 of an 11.25% ($1,125) cap
        e.record_deployment(&deployment("pool-a", "t1", 1_000.0, 3.0, 10.0), EQUITY);

        let d = e.evaluate_concentration("pool-a", AggressionLevel::A2, 400.0, EQUITY);
        // Requested 400 * 1.5 = 600, pool remaining 125
        assert!((d.requested_size_usd - 600.0).abs() < 1e-9);
        assert!((d.allowed_size_usd - 125.0).abs() < 1e-9);
        assert_eq!(d.clamps, vec![ClampReason::PoolCapacity]);
    }

    #[test]
    fn test_portfolio_cap_clamps_after_pool_cap() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock.clone());

        // Spread $2,400 across three pools: portfolio remaining is $100
        for (pool, id) in [("pool-a", "t1"), ("pool-b", "t2"), ("pool-c", "t3")] {
            e.record_deployment(&deployment(pool, id, 800.0, 3.0, 10.0), EQUITY);
        }

        let d = e.evaluate_concentration("pool-d", AggressionLevel::A2, 400.0, EQUITY);
        assert!((d.allowed_size_usd - 100.0).abs() < 1e-9);
        assert_eq!(d.clamps, vec![ClampReason::PortfolioCapacity]);
    }

    #[test]
    fn test_record_deployment_is_idempotent() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock.clone());

        assert!(e.record_deployment(&deployment("pool-a", "t1", 300.0, 3.0, 10.0), EQUITY));
        assert!(!e.record_deployment(&deployment("pool-a", "t1", 300.0, 3.0, 10.0), EQUITY));
        assert!((e.pool_deployed_usd("pool-a") - 300.0).abs() < 1e-9);
        assert_eq!(e.pool_tranche_count("pool-a"), 1);
    }

    #[test]
    fn test_record_exit_removes_empty_pool() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let e = engine(clock.clone());
        e.record_deployment(&deployment("pool-a", "t1", 300.0, 3.0, 10.0), EQUITY);

        let remaining = e.record_exit("pool-a", 100.0, EQUITY);
        assert!((remaining - 200.0).abs() < 1e-9);
        assert_eq!(e.pool_count(), 1);

        let remaining = e.record_exit("pool-a", 200.0, EQUITY);
        assert_eq!(remaining, 0.0);
        assert_eq!(e.pool_count(), 0);
        // Peak ODS starts over with the next deployment
        e.record_deployment(&deployment("pool-a", "t2", 100.0, 2.5, 10.0), EQUITY);
        assert!((e.pool_snapshot("pool-a").unwrap().peak_ods - 2.5).abs() < 1e-9);
    }

    #[cfg(not(feature = "strict-invariants"))]
    #[test]
    fn test_cap_breach_is_reported() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let (tx, mut rx) = broadcast::channel(64);
        let e = ConcentrationEngine::new(ConcentrationConfig::default(), clock, tx);

        // A deployment the sizing path would never produce: 20% of equity
        e.record_deployment(&deployment("pool-a", "t1", 2_000.0, 3.0, 10.0), EQUITY);

        let mut saw_violation = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::InvariantViolation { .. }) {
                saw_violation = true;
            }
        }
        assert!(saw_violation);
    }
}
