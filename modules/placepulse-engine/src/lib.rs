pub mod allocate;
pub mod coordinator;
pub mod cost;
pub mod escalation;
pub mod reconcile;
pub mod stages;
pub mod store;
pub mod traits;

pub use coordinator::Coordinator;
pub use cost::{CostTracker, UnitCost};
pub use escalation::{resolve, Confidence, LadderStep, Resolution, StepOutcome, StepReport};
pub use store::{MemoryRunStore, PgRunStore, RunStore};
