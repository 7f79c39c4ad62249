//! Invariant enforcement
//!
//! Hard caps and the risk-exit guarantee are correctness invariants, not
//! runtime conditions: a breach is a bug. Under the `strict-invariants`
//! feature a violation aborts; production builds log, count and publish the
//! violation instead. The check itself is shared between both modes.

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::error;

use crate::events::Event;
use crate::telemetry::metrics;

/// Floating-point tolerance applied to cap checks, percent of equity
pub const CAP_TOLERANCE_PCT: f64 = 0.1;

#[derive(Debug, Clone, Error)]
pub enum InvariantViolation {
    #[error("pool {pool} deployed {deployed_pct:.3}% of equity exceeds hard cap {cap_pct:.1}%")]
    PoolCapExceeded {
        pool: String,
        deployed_pct: f64,
        cap_pct: f64,
    },

    #[error("portfolio deployed {deployed_pct:.3}% of equity exceeds cap {cap_pct:.1}%")]
    PortfolioCapExceeded { deployed_pct: f64, cap_pct: f64 },

    #[error("risk exit suppression attempted for position {position_id} ({reason})")]
    RiskExitSuppressed { position_id: String, reason: String },
}

/// Check an invariant, handling a violation per build mode.
///
/// Returns `true` when the invariant holds.
pub fn enforce<F>(ok: bool, event_tx: &broadcast::Sender<Event>, violation: F) -> bool
where
    F: FnOnce() -> InvariantViolation,
{
    if ok {
        return true;
    }

    let v = violation();
    metrics::record_invariant_violation();
    let _ = event_tx.send(Event::InvariantViolation {
        message: v.to_string(),
    });

    if cfg!(feature = "strict-invariants") {
        panic!("invariant violated: {}", v);
    }

    error!("invariant violated: {}", v);
    false
}
