//! Self-heal supervision of terminal deliverables.

mod monitor;
mod state;

pub use monitor::{HealPolicy, SelfHealMonitor};
pub use state::{HealRecord, HealState, HealTransition};
