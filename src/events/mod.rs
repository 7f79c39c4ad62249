//! Event Bus for Internal Communication
//!
//! Broadcast-based event system carrying the control plane's observability
//! events: every regime transition, suppression, tranche block and invariant
//! violation is published here fire-and-forget.

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::utils::types::{AggressionLevel, Regime};

/// Events emitted by the control plane
#[derive(Debug, Clone)]
pub enum Event {
    // Regime tracker
    RegimePending {
        candidate: Regime,
        pending_cycles: u32,
    },
    RegimeDwellBlocked {
        candidate: Regime,
        remaining_ms: i64,
    },
    RegimeCommitted {
        from: Regime,
        to: Regime,
        total_flips: u64,
    },

    // Aggression scaler
    ScalingDampened {
        regime: Regime,
        raw_size: f64,
        dampened_size: f64,
    },
    ScalingBlocked {
        regime: Regime,
    },

    // Exit intents
    ExitLatched {
        position_id: String,
        reason: String,
        category: &'static str,
    },
    ExitSuppressed {
        position_id: String,
        suppression_type: String,
        until: i64,
    },
    ExitCooldownExtended {
        position_id: String,
        extensions: u32,
    },
    ExitReEvaluationForced {
        position_id: String,
    },
    ExitAllowed {
        position_id: String,
        reason: String,
    },

    // Capital concentration
    TrancheAdmitted {
        pool: String,
        level: AggressionLevel,
        target_cap_pct: f64,
    },
    TrancheBlocked {
        pool: String,
        reason: &'static str,
    },
    DeploymentRecorded {
        pool: String,
        size_usd: f64,
        pool_deployed_pct: f64,
    },
    SizeClamped {
        pool: String,
        requested_usd: f64,
        allowed_usd: f64,
        clamps: Vec<String>,
    },

    // System
    InvariantViolation {
        message: String,
    },
    Heartbeat {
        timestamp: i64,
    },
}

/// Event bus for broadcasting events to multiple subscribers
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    capacity: usize,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Get a sender for publishing events
    pub fn sender(&self) -> broadcast::Sender<Event> {
        self.sender.clone()
    }

    /// Subscribe to events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publish an event
    pub fn publish(&self, event: Event) {
        match self.sender.send(event) {
            Ok(count) => {
                debug!("Event sent to {} receivers", count);
            }
            Err(_) => {
                // No receivers - fine during startup/shutdown
                debug!("No event receivers");
            }
        }
    }

    /// Get number of active receivers
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Get channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Event processor that handles events from the bus
pub struct EventProcessor {
    receiver: broadcast::Receiver<Event>,
    name: String,
}

impl EventProcessor {
    /// Create a new event processor
    pub fn new(bus: &EventBus, name: &str) -> Self {
        Self {
            receiver: bus.subscribe(),
            name: name.to_string(),
        }
    }

    /// Process next event (blocking)
    pub async fn next(&mut self) -> Option<Event> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                warn!(
                    "Event processor '{}' lagged by {} messages",
                    self.name, count
                );
                self.receiver.recv().await.ok()
            }
            Err(broadcast::error::RecvError::Closed) => {
                debug!("Event bus closed for processor '{}'", self.name);
                None
            }
        }
    }

    /// Try to receive event without blocking
    pub fn try_next(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }
}

/// Helper to create typed event handlers
pub fn spawn_event_handler<F, Fut>(
    bus: &EventBus,
    name: &str,
    mut handler: F,
) -> tokio::task::JoinHandle<()>
where
    F: FnMut(Event) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let mut processor = EventProcessor::new(bus, name);
    let name = name.to_string();

    tokio::spawn(async move {
        debug!("Event handler '{}' started", name);
        while let Some(event) = processor.next().await {
            handler(event).await;
        }
        debug!("Event handler '{}' stopped", name);
    })
}
