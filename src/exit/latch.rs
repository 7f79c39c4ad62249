//! Exit Intent Latch
//!
//! Per-position state machine that remembers a detected exit condition so
//! the evaluator does not re-derive it every cycle:
//!
//! LATCHED -> SUPPRESSED -> (cooldown expiry) -> re-evaluate
//!   -> SUPPRESSED again (extended) | RESOLVED
//!
//! PENDING_REEVAL is entered once the extension ceiling is exceeded, which
//! forces re-evaluation regardless of metric comparison: no intent stays
//! suppressed forever.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::ExitConfig;
use crate::events::Event;
use crate::invariants::{self, InvariantViolation};
use crate::telemetry::metrics;
use crate::utils::helpers::safe_div;
use crate::utils::types::PositionMetrics;
use crate::utils::Clock;

use super::{classify, ExitCategory, ExitClass};

/// Intent lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentState {
    Latched,
    Suppressed,
    PendingReeval,
    Resolved,
}

/// A remembered exit condition for one position
#[derive(Debug, Clone)]
pub struct ExitIntent {
    pub position_id: String,
    pub reason: String,
    pub category: ExitCategory,
    pub class: ExitClass,
    pub detected_at: i64,
    pub state: IntentState,
    pub suppressed: bool,
    pub suppression_type: Option<&'static str>,
    pub suppressed_until: Option<i64>,
    pub cooldown_extensions: u32,
    /// Snapshot taken at detection, compared on cooldown expiry
    pub detection_metrics: PositionMetrics,
    pub was_ever_suppressed: bool,
}

/// Outcome of a cooldown-expiry check
#[derive(Debug, Clone, PartialEq)]
pub enum ReEvalOutcome {
    NoIntent,
    NotSuppressed,
    CooldownActive { remaining_ms: i64 },
    /// Nothing materially changed; cooldown extended
    Extended { extensions: u32, until: i64 },
    /// At least one axis materially changed
    ReEvaluate { changes: Vec<&'static str> },
    /// Extension ceiling reached; re-evaluation forced
    Forced,
}

/// Exit intent latch, keyed by position identifier.
///
/// At most one intent exists per position.
pub struct ExitIntentLatch {
    config: ExitConfig,
    clock: Arc<dyn Clock>,
    event_tx: broadcast::Sender<Event>,
    intents: DashMap<String, ExitIntent>,
}

impl ExitIntentLatch {
    pub fn new(
        config: ExitConfig,
        clock: Arc<dyn Clock>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            config,
            clock,
            event_tx,
            intents: DashMap::new(),
        }
    }

    /// Suppression cooldown for a category
    pub fn cooldown_for(&self, category: ExitCategory) -> i64 {
        match category {
            ExitCategory::Harmonic
            | ExitCategory::Microstructure
            | ExitCategory::CostAmortization
            | ExitCategory::Unknown => self.config.suppression_cooldown_default_ms,
            ExitCategory::Tier4Structural | ExitCategory::Regime => {
                self.config.suppression_cooldown_structural_ms
            }
            ExitCategory::Recovery => self.config.suppression_cooldown_recovery_ms,
        }
    }

    /// Record a detected exit condition.
    ///
    /// Creates a new intent if none exists or the reason differs from the
    /// existing one. Returns whether this was a new latch; repeats with the
    /// same reason are silent.
    pub fn latch(&self, position_id: &str, reason: &str, metrics_now: PositionMetrics) -> bool {
        if let Some(existing) = self.intents.get(position_id) {
            if existing.reason == reason {
                return false;
            }
        }

        let category = ExitCategory::parse(reason);
        let class = classify(reason);
        let intent = ExitIntent {
            position_id: position_id.to_string(),
            reason: reason.to_string(),
            category,
            class,
            detected_at: self.clock.now_millis(),
            state: IntentState::Latched,
            suppressed: false,
            suppression_type: None,
            suppressed_until: None,
            cooldown_extensions: 0,
            detection_metrics: metrics_now,
            was_ever_suppressed: false,
        };

        info!(
            "Exit intent latched for {} ({}, {})",
            position_id,
            reason,
            category.as_str()
        );
        metrics::record_exit_latched();
        let _ = self.event_tx.send(Event::ExitLatched {
            position_id: position_id.to_string(),
            reason: reason.to_string(),
            category: category.as_str(),
        });

        self.intents.insert(position_id.to_string(), intent);
        true
    }

    /// Transition an intent to SUPPRESSED with a category-selected cooldown
    /// (or an explicit override).
    ///
    /// Idempotent: an already-suppressed intent is left untouched and not
    /// re-logged. Risk-classified intents are never suppressed.
    pub fn set_suppressed(
        &self,
        position_id: &str,
        suppression_type: &'static str,
        cooldown_ms: Option<i64>,
    ) -> bool {
        let Some(mut intent) = self.intents.get_mut(position_id) else {
            return false;
        };

        if intent.class == ExitClass::Risk {
            invariants::enforce(false, &self.event_tx, || {
                InvariantViolation::RiskExitSuppressed {
                    position_id: position_id.to_string(),
                    reason: intent.reason.clone(),
                }
            });
            return false;
        }

        if intent.state == IntentState::Suppressed {
            return false;
        }

        let now = self.clock.now_millis();
        let cooldown = cooldown_ms.unwrap_or_else(|| self.cooldown_for(intent.category));
        let fresh_round = intent.state == IntentState::PendingReeval;

        intent.state = IntentState::Suppressed;
        intent.suppressed = true;
        intent.suppression_type = Some(suppression_type);
        intent.suppressed_until = Some(now + cooldown);
        intent.was_ever_suppressed = true;
        if fresh_round {
            // A forced re-evaluation that still decides to suppress starts a
            // fresh extension round.
            intent.cooldown_extensions = 0;
        }

        info!(
            "Exit suppressed for {} ({}) for {}ms",
            position_id, suppression_type, cooldown
        );
        metrics::record_exit_suppressed(suppression_type);
        let _ = self.event_tx.send(Event::ExitSuppressed {
            position_id: position_id.to_string(),
            suppression_type: suppression_type.to_string(),
            until: now + cooldown,
        });
        true
    }

    /// True while an intent's suppression cooldown is active.
    ///
    /// Callers must treat `true` as "perform no exit evaluation at all this
    /// cycle". This function itself emits no logs and touches no counters
    /// for the same reason: the point of the latch is to make suppressed
    /// cycles free.
    pub fn should_short_circuit(&self, position_id: &str) -> bool {
        match self.intents.get(position_id) {
            Some(intent) => {
                intent.suppressed
                    && intent
                        .suppressed_until
                        .map(|until| self.clock.now_millis() < until)
                        .unwrap_or(false)
            }
            None => false,
        }
    }

    /// Once the cooldown has expired, decide between extending the
    /// suppression and re-evaluating, by comparing current metrics against
    /// the detection snapshot along four axes.
    pub fn check_re_evaluation(
        &self,
        position_id: &str,
        current: PositionMetrics,
    ) -> ReEvalOutcome {
        let Some(mut intent) = self.intents.get_mut(position_id) else {
            return ReEvalOutcome::NoIntent;
        };

        if !intent.suppressed {
            return ReEvalOutcome::NotSuppressed;
        }

        let now = self.clock.now_millis();
        let until = intent.suppressed_until.unwrap_or(now);
        if now < until {
            return ReEvalOutcome::CooldownActive {
                remaining_ms: until - now,
            };
        }

        // Ceiling first: a maxed-out intent re-evaluates no matter what the
        // metrics say.
        if intent.cooldown_extensions >= self.config.max_cooldown_extensions {
            intent.state = IntentState::PendingReeval;
            intent.suppressed = false;
            intent.suppressed_until = None;
            info!(
                "Re-evaluation forced for {} after {} extensions",
                position_id, intent.cooldown_extensions
            );
            metrics::record_reeval_forced();
            let _ = self.event_tx.send(Event::ExitReEvaluationForced {
                position_id: position_id.to_string(),
            });
            return ReEvalOutcome::Forced;
        }

        let changes = self.material_changes(&intent.detection_metrics, &current);
        if !changes.is_empty() {
            intent.state = IntentState::Latched;
            intent.suppressed = false;
            intent.suppressed_until = None;
            debug!(
                "Re-evaluating exit for {}: changed {:?}",
                position_id, changes
            );
            return ReEvalOutcome::ReEvaluate { changes };
        }

        // Nothing materially changed: extend the cooldown.
        intent.cooldown_extensions += 1;
        let cooldown = self.cooldown_for(intent.category);
        let until = now + cooldown;
        intent.suppressed_until = Some(until);
        debug!(
            "Suppression extended for {} ({}/{})",
            position_id, intent.cooldown_extensions, self.config.max_cooldown_extensions
        );
        metrics::record_cooldown_extension();
        let _ = self.event_tx.send(Event::ExitCooldownExtended {
            position_id: position_id.to_string(),
            extensions: intent.cooldown_extensions,
        });
        ReEvalOutcome::Extended {
            extensions: intent.cooldown_extensions,
            until,
        }
    }

    fn material_changes(
        &self,
        detected: &PositionMetrics,
        current: &PositionMetrics,
    ) -> Vec<&'static str> {
        let mut changes = Vec::new();

        if current.regime != detected.regime {
            changes.push("regime_changed");
        }

        let fee_increase_pct =
            safe_div(current.fees_usd - detected.fees_usd, detected.fees_usd) * 100.0;
        if fee_increase_pct >= self.config.reeval_fee_increase_pct
            || (detected.fees_usd == 0.0 && current.fees_usd > 0.0)
        {
            changes.push("fees_increased");
        }

        let tier_degrade_pct =
            safe_div(detected.tier_score - current.tier_score, detected.tier_score) * 100.0;
        if tier_degrade_pct >= self.config.reeval_tier_degrade_pct {
            changes.push("tier_score_degraded");
        }

        if current.health_score - detected.health_score >= self.config.reeval_health_improve {
            changes.push("health_improved");
        }

        changes
    }

    /// Mark an intent resolved once its exit has been allowed through.
    /// The intent stays until `clear` confirms execution.
    pub fn resolve(&self, position_id: &str) -> bool {
        match self.intents.get_mut(position_id) {
            Some(mut intent) => {
                intent.state = IntentState::Resolved;
                intent.suppressed = false;
                intent.suppressed_until = None;
                true
            }
            None => false,
        }
    }

    /// Remove an intent (on exit execution or manual reset).
    pub fn clear(&self, position_id: &str) -> bool {
        if self.intents.remove(position_id).is_some() {
            debug!("Exit intent cleared for {}", position_id);
            true
        } else {
            false
        }
    }

    pub fn get(&self, position_id: &str) -> Option<ExitIntent> {
        self.intents.get(position_id).map(|i| i.clone())
    }

    pub fn len(&self) -> usize {
        self.intents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intents.is_empty()
    }

    /// Drop all intents (test lifecycle)
    pub fn reset(&self) {
        self.intents.clear();
    }
}
