pub mod lodging_census;
pub mod search_footprint;
pub mod visitor_allocation;

pub use lodging_census::LodgingCensusStage;
pub use search_footprint::SearchFootprintStage;
pub use visitor_allocation::VisitorAllocationStage;

use async_trait::async_trait;

use placepulse_common::{AuditRun, StageResult};

/// One unit of work in an audit run.
///
/// A stage reads the run document (for upstream payloads), calls providers,
/// and returns exactly one StageResult. Errors from individual providers are
/// captured in the result's partial-error list; an `Err` from `execute`
/// means the stage as a whole has no usable output and will be marked
/// failed.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Stage names that must be `done` before this stage may start.
    fn depends_on(&self) -> &'static [&'static str] {
        &[]
    }

    /// Whether this stage parks in `awaiting_confirmation` for human review
    /// instead of completing directly.
    fn needs_confirmation(&self) -> bool {
        false
    }

    async fn execute(&self, run: &AuditRun) -> anyhow::Result<StageResult>;
}
