//! Regime Stability Tracker
//!
//! Converts the noisy per-cycle regime signal into a stable, committed
//! regime:
//! - Input hysteresis: a differing signal must repeat on consecutive cycles
//!   before it may commit
//! - Dwell guard: a committed regime must persist a minimum wall-clock time
//!   before the next flip, regardless of signal pattern
//! - Two-factor stability: cycle count AND wall-clock age, since cycle
//!   cadence can itself be irregular

pub mod scaler;

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::RegimeConfig;
use crate::events::Event;
use crate::telemetry::metrics;
use crate::utils::types::Regime;
use crate::utils::Clock;

/// Committed regime state
#[derive(Debug, Clone)]
pub struct RegimeState {
    pub current: Regime,
    pub previous: Option<Regime>,
    /// When the current regime was committed (millis)
    pub entered_at: i64,
    /// Cycles the committed regime has been re-confirmed
    pub consecutive_cycles: u32,
    pub last_flip_time: i64,
    pub total_flips: u64,
}

/// Confirmation state for a differing signal
#[derive(Debug, Clone, Default)]
pub struct InputHysteresisState {
    pub pending: Option<Regime>,
    pub pending_cycles: u32,
    pub last_signaled: Option<Regime>,
}

/// Outcome of one `update` call
#[derive(Debug, Clone, PartialEq)]
pub enum RegimeUpdate {
    /// Signal matched the committed regime
    Confirmed { consecutive_cycles: u32 },
    /// Differing signal still building confirmation
    Pending { candidate: Regime, pending_cycles: u32 },
    /// Confirmation reached but the dwell guard deferred the commit
    DwellBlocked { candidate: Regime, remaining_ms: i64 },
    /// Flip committed
    Committed { from: Regime, to: Regime },
}

/// Regime stability tracker
///
/// Sole owner of `RegimeState` and `InputHysteresisState`; everything else
/// reads through accessors.
pub struct RegimeTracker {
    config: RegimeConfig,
    clock: Arc<dyn Clock>,
    event_tx: broadcast::Sender<Event>,
    state: RwLock<RegimeState>,
    hysteresis: RwLock<InputHysteresisState>,
}

impl RegimeTracker {
    pub fn new(
        config: RegimeConfig,
        clock: Arc<dyn Clock>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        let now = clock.now_millis();
        Self {
            config,
            clock,
            event_tx,
            state: RwLock::new(RegimeState {
                current: Regime::Neutral,
                previous: None,
                entered_at: now,
                consecutive_cycles: 0,
                // The dwell guard also covers the first flip after startup
                last_flip_time: now,
                total_flips: 0,
            }),
            hysteresis: RwLock::new(InputHysteresisState::default()),
        }
    }

    /// Consume one regime observation.
    pub fn update(&self, signal: Regime) -> RegimeUpdate {
        let now = self.clock.now_millis();
        let mut state = self.state.write();
        let mut hyst = self.hysteresis.write();
        hyst.last_signaled = Some(signal);

        if signal == state.current {
            state.consecutive_cycles += 1;
            hyst.pending = None;
            hyst.pending_cycles = 0;
            return RegimeUpdate::Confirmed {
                consecutive_cycles: state.consecutive_cycles,
            };
        }

        if hyst.pending == Some(signal) {
            hyst.pending_cycles += 1;
        } else {
            hyst.pending = Some(signal);
            hyst.pending_cycles = 1;
        }

        if hyst.pending_cycles < self.config.confirmation_cycles {
            debug!(
                "Regime candidate {} pending ({}/{})",
                signal, hyst.pending_cycles, self.config.confirmation_cycles
            );
            let _ = self.event_tx.send(Event::RegimePending {
                candidate: signal,
                pending_cycles: hyst.pending_cycles,
            });
            return RegimeUpdate::Pending {
                candidate: signal,
                pending_cycles: hyst.pending_cycles,
            };
        }

        // Confirmation reached: the dwell guard is a hard block that no
        // signal pattern can bypass. Keep the candidate and retry next cycle.
        let since_flip = now - state.last_flip_time;
        if since_flip < self.config.min_dwell_ms {
            let remaining_ms = self.config.min_dwell_ms - since_flip;
            debug!(
                "Regime flip {} -> {} deferred by dwell guard ({}ms remaining)",
                state.current, signal, remaining_ms
            );
            metrics::record_dwell_block();
            let _ = self.event_tx.send(Event::RegimeDwellBlocked {
                candidate: signal,
                remaining_ms,
            });
            return RegimeUpdate::DwellBlocked {
                candidate: signal,
                remaining_ms,
            };
        }

        let from = state.current;
        state.previous = Some(from);
        state.current = signal;
        state.consecutive_cycles = 1;
        state.entered_at = now;
        state.last_flip_time = now;
        state.total_flips += 1;
        hyst.pending = None;
        hyst.pending_cycles = 0;

        info!(
            "Regime flip committed: {} -> {} (flip #{})",
            from, signal, state.total_flips
        );
        metrics::record_regime_flip();
        let _ = self.event_tx.send(Event::RegimeCommitted {
            from,
            to: signal,
            total_flips: state.total_flips,
        });

        RegimeUpdate::Committed { from, to: signal }
    }

    /// Two-factor stability: enough re-confirmations AND enough wall-clock
    /// time in the committed regime. Either signal alone is gameable.
    pub fn is_stable(&self) -> bool {
        let now = self.clock.now_millis();
        let state = self.state.read();
        state.consecutive_cycles >= self.config.stability_cycles
            && now - state.entered_at >= self.config.stability_window_ms
    }

    pub fn current(&self) -> Regime {
        self.state.read().current
    }

    pub fn last_flip_time(&self) -> i64 {
        self.state.read().last_flip_time
    }

    pub fn time_in_regime_ms(&self) -> i64 {
        self.clock.now_millis() - self.state.read().entered_at
    }

    pub fn total_flips(&self) -> u64 {
        self.state.read().total_flips
    }

    pub fn snapshot(&self) -> RegimeState {
        self.state.read().clone()
    }

    pub fn hysteresis_snapshot(&self) -> InputHysteresisState {
        self.hysteresis.read().clone()
    }

    /// Reset to a fresh NEUTRAL state (test lifecycle)
    pub fn reset(&self) {
        let now = self.clock.now_millis();
        *self.state.write() = RegimeState {
            current: Regime::Neutral,
            previous: None,
            entered_at: now,
            consecutive_cycles: 0,
            last_flip_time: now,
            total_flips: 0,
        };
        *self.hysteresis.write() = InputHysteresisState::default();
    }
}
