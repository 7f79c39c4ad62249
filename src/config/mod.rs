//! Configuration module
//!
//! Handles loading and validation of the application configuration.
//! Every admission/suppression threshold lives here so tuning is a config
//! change, not a code change.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::utils::types::AggressionLevel;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub regime: RegimeConfig,
    #[serde(default)]
    pub scaling: ScalingConfig,
    #[serde(default)]
    pub exit: ExitConfig,
    #[serde(default)]
    pub concentration: ConcentrationConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        config.validate()?;
        info!("Configuration loaded from {:?}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.regime.confirmation_cycles >= 1,
            "confirmation_cycles must be at least 1"
        );
        anyhow::ensure!(
            self.regime.min_dwell_ms >= 0 && self.regime.stability_window_ms >= 0,
            "regime windows must be non-negative"
        );
        anyhow::ensure!(
            self.scaling.first_flip_dampening > 0.0 && self.scaling.first_flip_dampening <= 1.0,
            "first_flip_dampening must be in (0, 1]"
        );
        anyhow::ensure!(
            self.exit.cost_amortization_factor >= 1.0,
            "cost_amortization_factor must be at least 1.0"
        );
        anyhow::ensure!(
            self.exit.mtm_stuck_cycles >= 1,
            "mtm_stuck_cycles must be at least 1"
        );
        anyhow::ensure!(
            self.concentration.base_per_pool_cap_pct > 0.0
                && self.concentration.base_per_pool_cap_pct
                    <= self.concentration.per_pool_hard_cap_pct,
            "base_per_pool_cap_pct must be positive and at most the hard cap"
        );
        anyhow::ensure!(
            self.concentration.per_pool_hard_cap_pct <= self.concentration.portfolio_cap_pct,
            "per_pool_hard_cap_pct must not exceed the portfolio cap"
        );
        anyhow::ensure!(
            self.concentration.max_tranches_per_pool >= 1,
            "max_tranches_per_pool must be at least 1"
        );
        anyhow::ensure!(
            self.concentration.min_ods_for_tranche > 0.0,
            "min_ods_for_tranche must be positive"
        );
        Ok(())
    }
}

/// Scan-cycle driver settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,
}

fn default_scan_interval() -> u64 { 30 }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: default_scan_interval(),
        }
    }
}

/// Regime stability tracker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeConfig {
    /// Consecutive differing signals required before a flip may commit
    #[serde(default = "default_confirmation_cycles")]
    pub confirmation_cycles: u32,
    /// Minimum time a committed regime must persist before the next flip
    #[serde(default = "default_min_dwell_ms")]
    pub min_dwell_ms: i64,
    /// Wall-clock age required (with the cycle count) for `is_stable`
    #[serde(default = "default_stability_window_ms")]
    pub stability_window_ms: i64,
    /// Re-confirmation cycles required (with the window) for `is_stable`
    #[serde(default = "default_stability_cycles")]
    pub stability_cycles: u32,
}

fn default_confirmation_cycles() -> u32 { 3 }
fn default_min_dwell_ms() -> i64 { 5 * 60 * 1000 }
fn default_stability_window_ms() -> i64 { 5 * 60 * 1000 }
fn default_stability_cycles() -> u32 { 3 }

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            confirmation_cycles: default_confirmation_cycles(),
            min_dwell_ms: default_min_dwell_ms(),
            stability_window_ms: default_stability_window_ms(),
            stability_cycles: default_stability_cycles(),
        }
    }
}

/// One regime's row of sizing/sensitivity multipliers
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MultiplierRow {
    #[serde(default = "default_multiplier")]
    pub size: f64,
    #[serde(default = "default_multiplier")]
    pub bin_width: f64,
    #[serde(default = "default_multiplier")]
    pub exit_sensitivity: f64,
    #[serde(default = "default_multiplier")]
    pub score_decay_tolerance: f64,
}

fn default_multiplier() -> f64 { 1.0 }

impl Default for MultiplierRow {
    fn default() -> Self {
        Self {
            size: 1.0,
            bin_width: 1.0,
            exit_sensitivity: 1.0,
            score_decay_tolerance: 1.0,
        }
    }
}

/// Aggression scaler settings
///
/// The per-regime rows ship flat (1.0) pending reactivation of
/// regime-dependent scaling; the table shape is kept so reactivating is a
/// config edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfig {
    /// Freeze size scaling at the NEUTRAL row for this long after a flip
    #[serde(default = "default_flip_cooldown_ms")]
    pub regime_flip_cooldown_ms: i64,
    /// Dampening applied to >1.0 multipliers while the regime is unstable
    #[serde(default = "default_first_flip_dampening")]
    pub first_flip_dampening: f64,
    #[serde(default)]
    pub bear: MultiplierRow,
    #[serde(default)]
    pub neutral: MultiplierRow,
    #[serde(default)]
    pub bull: MultiplierRow,
}

fn default_flip_cooldown_ms() -> i64 { 2 * 60 * 1000 }
fn default_first_flip_dampening() -> f64 { 0.85 }

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            regime_flip_cooldown_ms: default_flip_cooldown_ms(),
            first_flip_dampening: default_first_flip_dampening(),
            bear: MultiplierRow::default(),
            neutral: MultiplierRow::default(),
            bull: MultiplierRow::default(),
        }
    }
}

/// Exit latch / hysteresis gate settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    /// Minimum hold before a noise exit may fire
    #[serde(default = "default_min_hold_ms")]
    pub min_hold_ms_noise_exit: i64,
    /// Accrued fees must cover round-trip cost times this factor
    #[serde(default = "default_cost_amortization_factor")]
    pub cost_amortization_factor: f64,
    /// Suppression cooldown for harmonic/microstructure/cost/unknown intents
    #[serde(default = "default_cooldown_default_ms")]
    pub suppression_cooldown_default_ms: i64,
    /// Suppression cooldown for tier-structural and regime intents
    #[serde(default = "default_cooldown_structural_ms")]
    pub suppression_cooldown_structural_ms: i64,
    /// Suppression cooldown for recovery intents
    #[serde(default)]
    pub suppression_cooldown_recovery_ms: i64,
    /// Cooldown extensions allowed before re-evaluation is forced
    #[serde(default = "default_max_extensions")]
    pub max_cooldown_extensions: u32,
    /// Fee increase (pct of detection value) that triggers re-evaluation
    #[serde(default = "default_reeval_fee_increase_pct")]
    pub reeval_fee_increase_pct: f64,
    /// Further tier-score degradation (pct) that triggers re-evaluation
    #[serde(default = "default_reeval_tier_degrade_pct")]
    pub reeval_tier_degrade_pct: f64,
    /// Absolute health-score improvement that triggers re-evaluation
    #[serde(default = "default_reeval_health_improve")]
    pub reeval_health_improve: f64,
    /// Consecutive unmoved-MTM cycles before an exit is forced through
    #[serde(default = "default_mtm_stuck_cycles")]
    pub mtm_stuck_cycles: u32,
    /// Value delta below which MTM counts as unmoved, USD
    #[serde(default = "default_mtm_stuck_epsilon")]
    pub mtm_stuck_epsilon_usd: f64,
}

fn default_min_hold_ms() -> i64 { 10 * 60 * 1000 }
fn default_cost_amortization_factor() -> f64 { 1.10 }
fn default_cooldown_default_ms() -> i64 { 15 * 60 * 1000 }
fn default_cooldown_structural_ms() -> i64 { 5 * 60 * 1000 }
fn default_max_extensions() -> u32 { 3 }
fn default_reeval_fee_increase_pct() -> f64 { 20.0 }
fn default_reeval_tier_degrade_pct() -> f64 { 10.0 }
fn default_reeval_health_improve() -> f64 { 0.15 }
fn default_mtm_stuck_cycles() -> u32 { 50 }
fn default_mtm_stuck_epsilon() -> f64 { 0.01 }

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            min_hold_ms_noise_exit: default_min_hold_ms(),
            cost_amortization_factor: default_cost_amortization_factor(),
            suppression_cooldown_default_ms: default_cooldown_default_ms(),
            suppression_cooldown_structural_ms: default_cooldown_structural_ms(),
            suppression_cooldown_recovery_ms: 0,
            max_cooldown_extensions: default_max_extensions(),
            reeval_fee_increase_pct: default_reeval_fee_increase_pct(),
            reeval_tier_degrade_pct: default_reeval_tier_degrade_pct(),
            reeval_health_improve: default_reeval_health_improve(),
            mtm_stuck_cycles: default_mtm_stuck_cycles(),
            mtm_stuck_epsilon_usd: default_mtm_stuck_epsilon(),
        }
    }
}

/// Capital concentration engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcentrationConfig {
    /// Base per-pool cap, percent of total equity
    #[serde(default = "default_base_per_pool_cap")]
    pub base_per_pool_cap_pct: f64,
    /// Hard per-pool cap, percent of total equity
    #[serde(default = "default_per_pool_hard_cap")]
    pub per_pool_hard_cap_pct: f64,
    /// Portfolio-wide deployment cap, percent of total equity
    #[serde(default = "default_portfolio_cap")]
    pub portfolio_cap_pct: f64,
    /// Concentration multipliers per aggression level A0..A4
    #[serde(default = "default_concentration_multipliers")]
    pub multipliers: [f64; 5],
    /// Minimum aggression level for additional tranches
    #[serde(default = "default_min_tranche_level")]
    pub min_tranche_level: AggressionLevel,
    #[serde(default = "default_max_tranches")]
    pub max_tranches_per_pool: u32,
    #[serde(default = "default_min_tranche_interval_ms")]
    pub min_tranche_interval_ms: i64,
    /// Minimum opportunity-density value for a tranche
    #[serde(default = "default_min_ods")]
    pub min_ods_for_tranche: f64,
    /// Max ODS decay from the observed peak, percent
    #[serde(default = "default_ods_decay_tolerance")]
    pub ods_decay_tolerance_pct: f64,
    /// Required EV improvement over the prior tranche, percent
    #[serde(default = "default_ev_improvement_min")]
    pub ev_improvement_min_pct: f64,
    /// Fee intensity floor when volatility-skew eligibility is absent
    #[serde(default = "default_fee_intensity_min")]
    pub fee_intensity_min_pct: f64,
    /// Adverse-selection penalty ceiling, percent
    #[serde(default = "default_adverse_selection_max")]
    pub adverse_selection_max_pct: f64,
    /// Expected fee rate floor, USD per hour
    #[serde(default = "default_min_fee_rate")]
    pub min_fee_rate_usd_per_hour: f64,
    /// Re-attempt cooldown after a density/EV/fee-intensity block
    #[serde(default = "default_block_cooldown_ms")]
    pub block_cooldown_ms: i64,
}

fn default_base_per_pool_cap() -> f64 { 7.5 }
fn default_per_pool_hard_cap() -> f64 { 18.0 }
fn default_portfolio_cap() -> f64 { 25.0 }
fn default_concentration_multipliers() -> [f64; 5] { [1.0, 1.0, 1.5, 2.0, 2.5] }
fn default_min_tranche_level() -> AggressionLevel { AggressionLevel::A2 }
fn default_max_tranches() -> u32 { 3 }
fn default_min_tranche_interval_ms() -> i64 { 5 * 60 * 1000 }
fn default_min_ods() -> f64 { 2.0 }
fn default_ods_decay_tolerance() -> f64 { 15.0 }
fn default_ev_improvement_min() -> f64 { 5.0 }
fn default_fee_intensity_min() -> f64 { 3.0 }
fn default_adverse_selection_max() -> f64 { 8.0 }
fn default_min_fee_rate() -> f64 { 0.50 }
fn default_block_cooldown_ms() -> i64 { 5 * 60 * 1000 }

impl ConcentrationConfig {
    pub fn multiplier_for(&self, level: AggressionLevel) -> f64 {
        self.multipliers[level.code() as usize]
    }
}

impl Default for ConcentrationConfig {
    fn default() -> Self {
        Self {
            base_per_pool_cap_pct: default_base_per_pool_cap(),
            per_pool_hard_cap_pct: default_per_pool_hard_cap(),
            portfolio_cap_pct: default_portfolio_cap(),
            multipliers: default_concentration_multipliers(),
            min_tranche_level: default_min_tranche_level(),
            max_tranches_per_pool: default_max_tranches(),
            min_tranche_interval_ms: default_min_tranche_interval_ms(),
            min_ods_for_tranche: default_min_ods(),
            ods_decay_tolerance_pct: default_ods_decay_tolerance(),
            ev_improvement_min_pct: default_ev_improvement_min(),
            fee_intensity_min_pct: default_fee_intensity_min(),
            adverse_selection_max_pct: default_adverse_selection_max(),
            min_fee_rate_usd_per_hour: default_min_fee_rate(),
            block_cooldown_ms: default_block_cooldown_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    pub log_file: Option<String>,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
    #[serde(default)]
    pub enable_alerts: bool,
    pub alert_webhook: Option<String>,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

fn default_log_level() -> String { "info".to_string() }
fn default_metrics_port() -> u16 { 9090 }
fn default_true() -> bool { true }

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            log_file: None,
            metrics_port: default_metrics_port(),
            enable_metrics: true,
            enable_alerts: false,
            alert_webhook: None,
            telegram: TelegramConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub enabled: bool,
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
}
