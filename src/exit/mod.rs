//! Exit suppression subsystem
//!
//! Two cooperating pieces:
//! - `latch`: per-position exit-intent state machine (remembers a detected
//!   exit and its suppression/cooldown status)
//! - `hysteresis`: classifies an exit reason as RISK or NOISE and decides
//!   whether a noise exit may fire yet
//!
//! The exit-trigger evaluator is expected to produce an `ExitCategory`
//! directly; `ExitCategory::parse` remains as a compatibility shim for
//! legacy free-text reasons.

pub mod hysteresis;
pub mod latch;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Safety classification of an exit reason.
///
/// Risk exits must always execute; noise exits may be debounced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitClass {
    Risk,
    Noise,
}

/// Exit trigger category, used to select suppression cooldowns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitCategory {
    Harmonic,
    Microstructure,
    Tier4Structural,
    CostAmortization,
    Regime,
    Recovery,
    Unknown,
}

impl ExitCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitCategory::Harmonic => "harmonic",
            ExitCategory::Microstructure => "microstructure",
            ExitCategory::Tier4Structural => "tier4_structural",
            ExitCategory::CostAmortization => "cost_amortization",
            ExitCategory::Regime => "regime",
            ExitCategory::Recovery => "recovery",
            ExitCategory::Unknown => "unknown",
        }
    }

    /// Compatibility shim: derive the category from a legacy free-text
    /// reason. New callers should pass the category explicitly.
    pub fn parse(reason: &str) -> Self {
        let r = reason.to_lowercase();
        if r.contains("harmonic") {
            ExitCategory::Harmonic
        } else if r.contains("microstructure") || r.contains("bin-offset") || r.contains("bin_offset") {
            ExitCategory::Microstructure
        } else if r.contains("tier4") || r.contains("score-drop") || r.contains("score_drop") {
            ExitCategory::Tier4Structural
        } else if r.contains("cost")
            || r.contains("fee-intensity-collapse")
            || r.contains("fee_intensity_collapse")
            || r.contains("hold-timeout")
            || r.contains("hold_timeout")
        {
            ExitCategory::CostAmortization
        } else if r.contains("regime") {
            ExitCategory::Regime
        } else if r.contains("recovery") || r.contains("migration-reversal") || r.contains("migration_reversal") {
            ExitCategory::Recovery
        } else {
            ExitCategory::Unknown
        }
    }
}

impl fmt::Display for ExitCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reasons that always identify a safety-critical exit
const RISK_KEYWORDS: &[&str] = &[
    "kill-switch",
    "kill_switch",
    "regime-flip-to-chaos",
    "regime_flip_to_chaos",
    "fee-bleed",
    "fee_bleed",
    "ledger-error",
    "ledger_error",
    "emergency",
    "market-crash",
    "market_crash",
    "insufficient-capital",
    "insufficient_capital",
    "stop-loss",
    "stop_loss",
    "force-exit",
    "force_exit",
];

/// Classify an exit reason as RISK or NOISE.
///
/// Unclassified reasons degrade to NOISE: they remain suppression-eligible
/// and flow through the same hold-time and cost checks.
pub fn classify(reason: &str) -> ExitClass {
    let r = reason.to_lowercase();
    if RISK_KEYWORDS.iter().any(|k| r.contains(k)) {
        ExitClass::Risk
    } else {
        ExitClass::Noise
    }
}
