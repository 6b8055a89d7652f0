//! Core data model: phases, entities, units, output records and statuses.

mod entity;
mod phase;
mod record;
mod status;

pub use entity::{EntityId, ProcessingUnit};
pub use phase::Phase;
pub use record::OutputRecord;
pub use status::{DateStatus, RunStatus};
