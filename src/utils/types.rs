//! Common types used throughout the application

use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse market regime classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Regime {
    Bear,
    Neutral,
    Bull,
}

impl Regime {
    pub fn code(&self) -> u8 {
        match self {
            Regime::Bear => 0,
            Regime::Neutral => 1,
            Regime::Bull => 2,
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Regime::Bear => write!(f, "BEAR"),
            Regime::Neutral => write!(f, "NEUTRAL"),
            Regime::Bull => write!(f, "BULL"),
        }
    }
}

/// Aggression ladder level from the external classifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggressionLevel {
    A0,
    A1,
    A2,
    A3,
    A4,
}

impl AggressionLevel {
    pub fn code(&self) -> u8 {
        match self {
            AggressionLevel::A0 => 0,
            AggressionLevel::A1 => 1,
            AggressionLevel::A2 => 2,
            AggressionLevel::A3 => 3,
            AggressionLevel::A4 => 4,
        }
    }
}

impl fmt::Display for AggressionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggressionLevel::A0 => write!(f, "A0"),
            AggressionLevel::A1 => write!(f, "A1"),
            AggressionLevel::A2 => write!(f, "A2"),
            AggressionLevel::A3 => write!(f, "A3"),
            AggressionLevel::A4 => write!(f, "A4"),
        }
    }
}

/// Mark-to-market valuation of an open position, supplied by the
/// valuation service each cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MtmValuation {
    /// Current position value in USD including accrued fees
    pub value_usd: f64,
    /// Fee revenue accrued since entry
    pub fees_accrued_usd: f64,
}

/// Per-position metrics snapshot from telemetry/scoring.
///
/// Captured at exit detection time and compared against fresh values when a
/// suppression cooldown expires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PositionMetrics {
    pub regime: Regime,
    /// Current fee intensity for the pool, USD basis
    pub fees_usd: f64,
    /// Pool tier score (higher is better)
    pub tier_score: f64,
    /// Position health score, 0.0 to 1.0
    pub health_score: f64,
}

/// An open fee-harvesting position as the exit gate sees it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HarvestPosition {
    /// Trade identifier
    pub id: String,
    /// Pool address
    pub pool: String,
    /// Capital deployed into this position, USD
    pub deployed_usd: f64,
    /// Entry timestamp (millis)
    pub entry_time: i64,
    /// Fees paid on entry, USD
    pub entry_fees_usd: f64,
    /// Estimated fees for the exit transaction, USD
    pub expected_exit_fees_usd: f64,
    /// Estimated exit slippage, USD
    pub expected_slippage_usd: f64,
}

impl HarvestPosition {
    /// Estimated round-trip transaction cost, before the amortization margin
    pub fn round_trip_cost_usd(&self) -> f64 {
        self.entry_fees_usd + self.expected_exit_fees_usd + self.expected_slippage_usd
    }
}

/// One scan cycle's worth of externally-computed signals
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleInputs {
    /// Raw regime observation from the market-regime classifier
    pub regime_signal: Regime,
    /// Total portfolio equity from the ledger, USD
    pub total_equity_usd: f64,
}
