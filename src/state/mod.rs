//! Shared State Module
//!
//! Read-mostly snapshot of the control plane that the agent loop publishes
//! each cycle for metrics export. Decision state itself lives inside the
//! owning components; nothing here is consulted when making a decision.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::utils::types::Regime;

/// Atomic floating point wrapper using u64 bit representation
#[derive(Debug, Default)]
pub struct AtomicF64 {
    inner: AtomicU64,
}

impl AtomicF64 {
    pub fn new(val: f64) -> Self {
        Self {
            inner: AtomicU64::new(val.to_bits()),
        }
    }

    pub fn load(&self) -> f64 {
        f64::from_bits(self.inner.load(Ordering::SeqCst))
    }

    pub fn store(&self, val: f64) {
        self.inner.store(val.to_bits(), Ordering::SeqCst);
    }
}

/// Central observability state store
pub struct EngineState {
    // Portfolio
    pub total_equity_usd: AtomicF64,
    pub total_deployed_usd: AtomicF64,
    pub total_deployed_pct: AtomicF64,

    // Regime
    pub committed_regime: RwLock<Regime>,
    pub regime_stable: RwLock<bool>,
    pub regime_flips: AtomicU64,

    // Cycle bookkeeping
    pub cycle_count: AtomicU64,
    pub last_cycle_at: AtomicI64,

    // Decision counters
    pub exits_suppressed: AtomicU64,
    pub tranches_blocked: AtomicU64,
    pub invariant_violations: AtomicU64,
}

impl EngineState {
    pub fn new() -> Self {
        Self {
            total_equity_usd: AtomicF64::new(0.0),
            total_deployed_usd: AtomicF64::new(0.0),
            total_deployed_pct: AtomicF64::new(0.0),
            committed_regime: RwLock::new(Regime::Neutral),
            regime_stable: RwLock::new(false),
            regime_flips: AtomicU64::new(0),
            cycle_count: AtomicU64::new(0),
            last_cycle_at: AtomicI64::new(0),
            exits_suppressed: AtomicU64::new(0),
            tranches_blocked: AtomicU64::new(0),
            invariant_violations: AtomicU64::new(0),
        }
    }

    pub fn record_cycle(&self, timestamp: i64) {
        self.cycle_count.fetch_add(1, Ordering::SeqCst);
        self.last_cycle_at.store(timestamp, Ordering::SeqCst);
    }

    pub fn set_regime(&self, regime: Regime, stable: bool) {
        *self.committed_regime.write() = regime;
        *self.regime_stable.write() = stable;
    }

    pub fn set_deployment(&self, deployed_usd: f64, equity_usd: f64) {
        self.total_deployed_usd.store(deployed_usd);
        self.total_equity_usd.store(equity_usd);
        let pct = if equity_usd > 0.0 {
            deployed_usd / equity_usd * 100.0
        } else {
            0.0
        };
        self.total_deployed_pct.store(pct);
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}
