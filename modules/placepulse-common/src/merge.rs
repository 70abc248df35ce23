//! Run-document merge discipline.
//!
//! Every stage write is read-current-document / merge-one-key / write-back,
//! never a blind overwrite of the whole document. Stages completing out of
//! order or concurrently can never clobber each other's keys: a merge only
//! ever gains or replaces the key it owns.

use chrono::Utc;

use crate::error::PlacePulseError;
use crate::types::{AuditRun, StageResult, StageStatus};

impl AuditRun {
    /// Record a stage status transition.
    pub fn set_stage_status(&mut self, stage: &str, status: StageStatus) {
        self.statuses.insert(stage.to_string(), status);
        self.updated_at = Utc::now();
    }

    /// Merge one completed StageResult into the document.
    ///
    /// Replaces that stage's key only; unrelated stage keys are untouched.
    /// Cost entries merge additively per provider, and the grand total is
    /// recomputed from the merged ledger (not incrementally accumulated).
    pub fn merge_stage_result(&mut self, result: StageResult, status: StageStatus) {
        self.statuses.insert(result.stage.clone(), status);
        self.costs.merge(&result.costs);
        self.total_cost_cents = self.costs.grand_total();
        self.stages.insert(result.stage.clone(), result);
        self.updated_at = Utc::now();
    }

    /// Apply a reviewer-confirmed subset to a stage parked in
    /// `AwaitingConfirmation`, then mark it done.
    ///
    /// The confirmed value is merged key-over-key onto the computed payload:
    /// confirmed keys win, computed keys not under review survive.
    pub fn merge_confirmation(
        &mut self,
        stage: &str,
        confirmed: serde_json::Value,
    ) -> Result<(), PlacePulseError> {
        if self.stage_status(stage) != StageStatus::AwaitingConfirmation {
            return Err(PlacePulseError::Validation(format!(
                "stage {stage} is not awaiting confirmation"
            )));
        }
        let result = self
            .stages
            .get_mut(stage)
            .ok_or_else(|| PlacePulseError::Validation(format!("stage {stage} has no payload")))?;

        match (&mut result.payload, confirmed) {
            (serde_json::Value::Object(computed), serde_json::Value::Object(reviewed)) => {
                for (k, v) in reviewed {
                    computed.insert(k, v);
                }
            }
            (payload, reviewed) => *payload = reviewed,
        }

        self.statuses
            .insert(stage.to_string(), StageStatus::Done);
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::types::{AuditRun, Commune, Destination, StageResult, StageStatus};

    fn destination() -> Destination {
        Destination {
            slug: "annecy".into(),
            name: "Annecy".into(),
            epci_code: Some("247400740".into()),
            communes: vec![Commune {
                code: "74010".into(),
                name: "Annecy".into(),
            }],
            domains: vec!["lac-annecy.com".into()],
            categories: vec!["hotel".into()],
            center_lat: 45.9,
            center_lng: 6.12,
            radius_km: 15.0,
        }
    }

    fn result(stage: &str, provider: &str) -> StageResult {
        let mut r = StageResult::new(stage, json!({ "value": stage }));
        r.costs.record(provider, 2, 1);
        r
    }

    #[test]
    fn merge_never_loses_unrelated_keys() {
        let mut run = AuditRun::new(destination());
        run.merge_stage_result(result("search_footprint", "rank_index"), StageStatus::Done);
        run.merge_stage_result(result("lodging_census", "registry"), StageStatus::Done);

        assert!(run.stages.contains_key("search_footprint"));
        assert!(run.stages.contains_key("lodging_census"));
    }

    #[test]
    fn merge_order_is_commutative() {
        let mut ab = AuditRun::new(destination());
        let mut ba = ab.clone();

        ab.merge_stage_result(result("a", "p1"), StageStatus::Done);
        ab.merge_stage_result(result("b", "p2"), StageStatus::Done);
        ba.merge_stage_result(result("b", "p2"), StageStatus::Done);
        ba.merge_stage_result(result("a", "p1"), StageStatus::Done);

        assert_eq!(ab.stages, ba.stages);
        assert_eq!(ab.costs, ba.costs);
        assert_eq!(ab.total_cost_cents, ba.total_cost_cents);
    }

    #[test]
    fn rerun_replaces_one_key_and_accumulates_costs() {
        let mut run = AuditRun::new(destination());
        run.merge_stage_result(result("a", "p1"), StageStatus::Done);
        run.merge_stage_result(result("b", "p2"), StageStatus::Done);

        let mut rerun = StageResult::new("a", json!({ "value": "fresh" }));
        rerun.costs.record("p1", 1, 1);
        run.merge_stage_result(rerun, StageStatus::Done);

        assert_eq!(run.stages["a"].payload, json!({ "value": "fresh" }));
        assert_eq!(run.stages["b"].payload, json!({ "value": "b" }));
        // 2 calls from the first run of "a", 1 from the re-run.
        assert_eq!(run.costs.0["p1"].calls, 3);
        assert_eq!(run.total_cost_cents, run.costs.grand_total());
    }

    #[test]
    fn confirmation_merges_subset_over_computed_payload() {
        let mut run = AuditRun::new(destination());
        let r = StageResult::new(
            "lodging_census",
            json!({ "hotel": { "both": 4 }, "camping": { "both": 2 } }),
        );
        run.merge_stage_result(r, StageStatus::AwaitingConfirmation);

        run.merge_confirmation("lodging_census", json!({ "hotel": { "both": 3 } }))
            .unwrap();

        assert_eq!(run.stage_status("lodging_census"), StageStatus::Done);
        let payload = run.stage_payload("lodging_census").unwrap();
        assert_eq!(payload["hotel"]["both"], 3);
        // Keys not under review survive.
        assert_eq!(payload["camping"]["both"], 2);
    }

    #[test]
    fn confirmation_requires_awaiting_state() {
        let mut run = AuditRun::new(destination());
        run.merge_stage_result(result("a", "p1"), StageStatus::Done);
        assert!(run.merge_confirmation("a", json!({})).is_err());
    }
}
