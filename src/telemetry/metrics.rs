//! Prometheus metrics export

use anyhow::Result;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

pub fn init_metrics(port: u16) -> Result<()> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    register_metrics();
    info!("Prometheus metrics server started on {}", addr);
    Ok(())
}

fn register_metrics() {
    // Regime metrics
    describe_gauge!("fee_harvester_regime", "Committed regime (0=bear 1=neutral 2=bull)");
    describe_gauge!("fee_harvester_regime_stable", "Whether the committed regime is stable");
    describe_counter!("fee_harvester_regime_flips_total", "Committed regime flips");
    describe_counter!(
        "fee_harvester_regime_dwell_blocks_total",
        "Flip commits deferred by the dwell guard"
    );

    // Scaling metrics
    describe_gauge!("fee_harvester_size_multiplier", "Current size multiplier");
    describe_gauge!("fee_harvester_bin_width_multiplier", "Current bin-width multiplier");
    describe_gauge!(
        "fee_harvester_exit_sensitivity_multiplier",
        "Current exit-sensitivity multiplier"
    );
    describe_gauge!(
        "fee_harvester_score_decay_tolerance_multiplier",
        "Current score-decay-tolerance multiplier"
    );
    describe_counter!("fee_harvester_scaling_dampened_total", "Cycles with dampened scaling");
    describe_counter!("fee_harvester_scaling_blocked_total", "Defensive scaling blocks");

    // Exit metrics
    describe_counter!("fee_harvester_exits_latched_total", "New exit intents latched");
    describe_counter!("fee_harvester_exits_suppressed_total", "Exit suppressions by type");
    describe_counter!(
        "fee_harvester_exit_cooldown_extensions_total",
        "Suppression cooldown extensions"
    );
    describe_counter!(
        "fee_harvester_exit_reevals_forced_total",
        "Re-evaluations forced by the extension ceiling"
    );
    describe_counter!("fee_harvester_exits_allowed_total", "Exits allowed through the gate");
    describe_counter!(
        "fee_harvester_mtm_stuck_exits_total",
        "Exits forced by the stuck-valuation escape hatch"
    );

    // Concentration metrics
    describe_counter!("fee_harvester_tranches_admitted_total", "Tranche admissions");
    describe_counter!("fee_harvester_tranches_blocked_total", "Tranche blocks by reason");
    describe_gauge!("fee_harvester_pool_deployed_pct", "Deployed percent of equity per pool");
    describe_gauge!("fee_harvester_total_deployed_pct", "Portfolio deployed percent of equity");
    describe_counter!("fee_harvester_size_clamps_total", "Admission size clamps");

    // System metrics
    describe_counter!("fee_harvester_invariant_violations_total", "Invariant violations observed");
    describe_counter!("fee_harvester_cycles_total", "Scan cycles processed");
    describe_histogram!("fee_harvester_cycle_duration_ms", "Scan cycle processing time");
}

pub fn record_regime(code: u8, stable: bool) {
    gauge!("fee_harvester_regime").set(code as f64);
    gauge!("fee_harvester_regime_stable").set(if stable { 1.0 } else { 0.0 });
}

pub fn record_regime_flip() {
    counter!("fee_harvester_regime_flips_total").increment(1);
}

pub fn record_dwell_block() {
    counter!("fee_harvester_regime_dwell_blocks_total").increment(1);
}

pub fn record_multipliers(size: f64, bin_width: f64, exit_sensitivity: f64, score_decay: f64) {
    gauge!("fee_harvester_size_multiplier").set(size);
    gauge!("fee_harvester_bin_width_multiplier").set(bin_width);
    gauge!("fee_harvester_exit_sensitivity_multiplier").set(exit_sensitivity);
    gauge!("fee_harvester_score_decay_tolerance_multiplier").set(score_decay);
}

pub fn record_scaling_dampened() {
    counter!("fee_harvester_scaling_dampened_total").increment(1);
}

pub fn record_scaling_blocked() {
    counter!("fee_harvester_scaling_blocked_total").increment(1);
}

pub fn record_exit_latched() {
    counter!("fee_harvester_exits_latched_total").increment(1);
}

pub fn record_exit_suppressed(suppression_type: &'static str) {
    counter!("fee_harvester_exits_suppressed_total", "type" => suppression_type).increment(1);
}

pub fn record_cooldown_extension() {
    counter!("fee_harvester_exit_cooldown_extensions_total").increment(1);
}

pub fn record_reeval_forced() {
    counter!("fee_harvester_exit_reevals_forced_total").increment(1);
}

pub fn record_exit_allowed() {
    counter!("fee_harvester_exits_allowed_total").increment(1);
}

pub fn record_mtm_stuck_exit() {
    counter!("fee_harvester_mtm_stuck_exits_total").increment(1);
}

pub fn record_tranche_admitted() {
    counter!("fee_harvester_tranches_admitted_total").increment(1);
}

pub fn record_tranche_blocked(reason: &'static str) {
    counter!("fee_harvester_tranches_blocked_total", "reason" => reason).increment(1);
}

pub fn record_pool_deployed_pct(pool: &str, pct: f64) {
    gauge!("fee_harvester_pool_deployed_pct", "pool" => pool.to_string()).set(pct);
}

pub fn record_total_deployed_pct(pct: f64) {
    gauge!("fee_harvester_total_deployed_pct").set(pct);
}

pub fn record_size_clamp() {
    counter!("fee_harvester_size_clamps_total").increment(1);
}

pub fn record_invariant_violation() {
    counter!("fee_harvester_invariant_violations_total").increment(1);
}

pub fn record_cycle(duration_ms: f64) {
    counter!("fee_harvester_cycles_total").increment(1);
    histogram!("fee_harvester_cycle_duration_ms").record(duration_ms);
}
