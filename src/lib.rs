//! Fee Harvester Control Plane Library
//!
//! Admission-and-suppression control plane for an automated DLMM
//! fee-harvesting engine: regime stability tracking, aggression scaling,
//! exit-intent latching/debouncing and capital concentration control.

pub mod agent;
pub mod concentration;
pub mod config;
pub mod engine;
pub mod events;
pub mod exit;
pub mod invariants;
pub mod regime;
pub mod state;
pub mod telemetry;
pub mod utils;

// Re-export main types
pub use agent::{HarvestAgent, ReplaySignalSource, SignalSource};
pub use concentration::{ConcentrationEngine, TrancheDecision, TrancheRequest};
pub use config::AppConfig;
pub use engine::{ExitEvaluation, HarvestEngine};
pub use events::{Event, EventBus};
pub use regime::{RegimeTracker, RegimeUpdate};
pub use state::EngineState;
pub use utils::types::{AggressionLevel, Regime};
pub use utils::{Clock, ManualClock, SystemClock};
