//! Run coordinator.
//!
//! Drives the per-stage state machine
//! `pending → running → {done | awaiting_confirmation | failed}` and owns
//! every write to the run document. A stage with partial provider failures
//! still reaches done; only a stage whose mandatory upstream input is
//! missing fails, and a failure blocks its direct dependents while
//! independent siblings continue.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};
use uuid::Uuid;

use placepulse_common::{AuditRun, Destination, PlacePulseError, StageStatus};

use crate::stages::Stage;
use crate::store::RunStore;

type Result<T> = std::result::Result<T, PlacePulseError>;

pub struct Coordinator<S> {
    store: S,
    stages: Vec<Arc<dyn Stage>>,
}

impl<S: RunStore> Coordinator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            stages: Vec::new(),
        }
    }

    /// Register a stage. Registration order is the preferred execution order
    /// for `advance`; dependency gating is authoritative either way.
    pub fn register(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.push(stage);
        self
    }

    fn stage(&self, name: &str) -> Result<Arc<dyn Stage>> {
        self.stages
            .iter()
            .find(|s| s.name() == name)
            .cloned()
            .ok_or_else(|| PlacePulseError::UnknownStage(name.to_string()))
    }

    pub async fn create_run(&self, destination: Destination) -> Result<AuditRun> {
        let run = AuditRun::new(destination);
        self.store.insert_run(&run).await?;
        info!(run_id = %run.id, destination = run.destination.slug.as_str(), "Audit run created");
        Ok(run)
    }

    pub async fn get_run(&self, id: Uuid) -> Result<AuditRun> {
        self.store
            .get_run(id)
            .await?
            .ok_or(PlacePulseError::RunNotFound(id))
    }

    /// Execute one stage, gated on its upstream stages being done.
    pub async fn start_stage(&self, run_id: Uuid, stage_name: &str) -> Result<AuditRun> {
        let stage = self.stage(stage_name)?;
        let run = self.get_run(run_id).await?;

        for upstream in stage.depends_on() {
            match run.stage_status(upstream) {
                StageStatus::Done => {}
                StageStatus::Failed => {
                    // Mandatory input is gone. This stage fails too, which
                    // blocks its own dependents; siblings are unaffected.
                    warn!(stage = stage_name, upstream, "Upstream failed; marking stage failed");
                    return self
                        .store
                        .set_stage_status(run_id, stage_name, StageStatus::Failed)
                        .await;
                }
                _ => {
                    return Err(PlacePulseError::DependencyNotReady {
                        stage: stage_name.to_string(),
                        upstream: upstream.to_string(),
                    })
                }
            }
        }

        let run = self
            .store
            .set_stage_status(run_id, stage_name, StageStatus::Running)
            .await?;
        info!(run_id = %run_id, stage = stage_name, "Stage running");

        match stage.execute(&run).await {
            Ok(result) => {
                let status = if stage.needs_confirmation() {
                    StageStatus::AwaitingConfirmation
                } else {
                    StageStatus::Done
                };
                info!(
                    run_id = %run_id,
                    stage = stage_name,
                    ?status,
                    partial_errors = result.partial_errors.len(),
                    cost_cents = result.costs.grand_total(),
                    "Stage complete"
                );
                self.store.merge_stage_result(run_id, result, status).await
            }
            Err(e) => {
                warn!(run_id = %run_id, stage = stage_name, error = %e, "Stage failed");
                self.store
                    .set_stage_status(run_id, stage_name, StageStatus::Failed)
                    .await
            }
        }
    }

    /// Accept a reviewer-confirmed subset for a parked stage.
    pub async fn confirm_stage(
        &self,
        run_id: Uuid,
        stage_name: &str,
        confirmed: serde_json::Value,
    ) -> Result<AuditRun> {
        // Validate the stage exists before touching the store.
        let _ = self.stage(stage_name)?;
        let run = self
            .store
            .merge_confirmation(run_id, stage_name, confirmed)
            .await?;
        info!(run_id = %run_id, stage = stage_name, "Stage confirmed");
        Ok(run)
    }

    /// Start every pending stage whose upstreams are done, wave by wave,
    /// until nothing more can progress. Stages with no dependency relation
    /// run concurrently within a wave; the merge-on-write store keeps their
    /// completions from clobbering each other. Stages already parked,
    /// failed, or done are left alone. Returns the final run.
    pub async fn advance(&self, run_id: Uuid) -> Result<AuditRun> {
        loop {
            let run = self.get_run(run_id).await?;

            let wave: Vec<&str> = self
                .stages
                .iter()
                .filter(|stage| run.stage_status(stage.name()) == StageStatus::Pending)
                .filter(|stage| {
                    let ready = stage
                        .depends_on()
                        .iter()
                        .all(|up| run.stage_status(up) == StageStatus::Done);
                    let blocked = stage
                        .depends_on()
                        .iter()
                        .any(|up| run.stage_status(up) == StageStatus::Failed);
                    ready || blocked
                })
                .map(|stage| stage.name())
                .collect();

            if wave.is_empty() {
                return self.get_run(run_id).await;
            }

            let results = join_all(
                wave.into_iter()
                    .map(|name| self.start_stage(run_id, name)),
            )
            .await;
            for outcome in results {
                outcome?;
            }
        }
    }
}
