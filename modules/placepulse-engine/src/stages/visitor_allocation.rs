//! Visitor-allocation stage.
//!
//! Statistics providers publish overnight stays for the intercommunal unit
//! or the department, never per commune. This stage resolves the aggregate
//! through an escalation ladder (EPCI first, department as the coarser
//! fallback), then splits it across communes proportionally to the lodging
//! counts the census stage confirmed. The split coefficients start from
//! fixed nightly-stay equivalences and are adjusted by the destination's
//! classified profile when a classifier is wired in.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use placepulse_common::{AuditRun, PartialError, StageResult};
use placepulse_providers::{classifier, statbase, ProviderError};

use crate::allocate::{allocate, default_coefficients, ChildCounts};
use crate::cost::{CostTracker, UnitCost};
use crate::escalation::{resolve, LadderStep, StepReport};
use crate::stages::lodging_census;
use crate::stages::Stage;
use crate::traits::{CapacitySource, LabelSource};

pub const STAGE: &str = "visitor_allocation";

const METRIC: &str = "overnight_stays";

const PROFILES: &[&str] = &["seaside", "mountain", "urban", "rural"];

const PROFILE_INSTRUCTIONS: &str = "Classify the dominant tourism profile of this French \
destination from its name and commune list: 'seaside', 'mountain', 'urban', or 'rural'.";

pub struct VisitorAllocationStage {
    statbase: Option<Arc<dyn CapacitySource>>,
    classifier: Option<Arc<dyn LabelSource>>,
    budget_limit_cents: u64,
}

impl VisitorAllocationStage {
    pub fn new(
        statbase: Option<Arc<dyn CapacitySource>>,
        classifier: Option<Arc<dyn LabelSource>>,
        budget_limit_cents: u64,
    ) -> Self {
        Self {
            statbase,
            classifier,
            budget_limit_cents,
        }
    }
}

// ---------------------------------------------------------------------------
// Ladder
// ---------------------------------------------------------------------------

/// One overnight-stays lookup at a fixed geographic level. Suppressed cells
/// and explicit zeros are both ambiguous at a given level, so they advance
/// the ladder rather than settling the metric.
struct StatStep {
    source: Option<Arc<dyn CapacitySource>>,
    level: &'static str,
    code: Option<String>,
}

#[async_trait]
impl LadderStep<u64> for StatStep {
    fn provider(&self) -> &str {
        statbase::PROVIDER
    }

    fn variant(&self) -> &str {
        self.level
    }

    async fn attempt(&self, _correction: Option<&str>) -> StepReport<u64> {
        let (Some(source), Some(code)) = (&self.source, &self.code) else {
            return StepReport::skipped();
        };
        match source.overnight_stays(self.level, code).await {
            Ok(Some(v)) if v > 0 => StepReport::value(v),
            Ok(_) => StepReport::empty(),
            Err(ProviderError::NotFound) => StepReport::empty(),
            Err(ProviderError::Config(_)) => StepReport::skipped(),
            Err(e) => StepReport::failed(e.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Coefficients
// ---------------------------------------------------------------------------

/// Profile-specific multipliers over the default nightly-stay equivalences.
fn profile_coefficients(profile: &str) -> BTreeMap<String, f64> {
    let mut coefficients = default_coefficients();
    let adjust = |c: &mut BTreeMap<String, f64>, category: &str, factor: f64| {
        if let Some(v) = c.get_mut(category) {
            *v *= factor;
        }
    };
    match profile {
        "seaside" => {
            adjust(&mut coefficients, "camping", 1.3);
            adjust(&mut coefficients, "residence", 1.2);
        }
        "mountain" => {
            adjust(&mut coefficients, "residence", 1.4);
            adjust(&mut coefficients, "gite", 1.3);
        }
        "urban" => {
            adjust(&mut coefficients, "hotel", 1.2);
            adjust(&mut coefficients, "camping", 0.5);
        }
        "rural" => {
            adjust(&mut coefficients, "gite", 1.5);
            adjust(&mut coefficients, "chambre_hote", 1.4);
            adjust(&mut coefficients, "hotel", 0.8);
        }
        _ => {}
    }
    coefficients
}

/// Read the confirmed per-commune counts out of the census payload.
fn census_children(payload: &serde_json::Value) -> anyhow::Result<Vec<ChildCounts>> {
    let communes = payload
        .get("communes")
        .and_then(|v| v.as_object())
        .ok_or_else(|| anyhow::anyhow!("census payload has no communes map"))?;

    let mut children = Vec::with_capacity(communes.len());
    for (code, counts) in communes {
        let counts = counts
            .as_object()
            .ok_or_else(|| anyhow::anyhow!("census counts for commune {code} are not an object"))?;
        let sub_counts: BTreeMap<String, u64> = counts
            .iter()
            .map(|(category, n)| (category.clone(), n.as_u64().unwrap_or(0)))
            .collect();
        children.push(ChildCounts {
            child_id: code.clone(),
            sub_counts,
        });
    }
    Ok(children)
}

fn department_code(commune_code: &str) -> Option<String> {
    // Corsican departments (2A/2B) keep their letter; everything else is the
    // leading two digits.
    commune_code.get(..2).map(str::to_string)
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[async_trait]
impl Stage for VisitorAllocationStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn depends_on(&self) -> &'static [&'static str] {
        &[lodging_census::STAGE]
    }

    async fn execute(&self, run: &AuditRun) -> anyhow::Result<StageResult> {
        let census = run
            .stage_payload(lodging_census::STAGE)
            .ok_or_else(|| anyhow::anyhow!("lodging census payload missing from run"))?;
        let children = census_children(census)?;

        let dest = &run.destination;
        let costs = CostTracker::new(self.budget_limit_cents);
        let mut partial_errors: Vec<PartialError> = Vec::new();

        let ladder: Vec<Box<dyn LadderStep<u64>>> = vec![
            Box::new(StatStep {
                source: self.statbase.clone(),
                level: "epci",
                code: dest.epci_code.clone(),
            }),
            Box::new(StatStep {
                source: self.statbase.clone(),
                level: "departement",
                code: dest.communes.first().and_then(|c| department_code(&c.code)),
            }),
        ];
        let resolution = resolve(METRIC, &ladder, &costs).await?;
        partial_errors.extend(resolution.errors.iter().cloned());
        let aggregate = resolution.value.unwrap_or(0);

        let mut profile: Option<String> = None;
        if let Some(classifier_source) = &self.classifier {
            if !costs.has_budget(UnitCost::for_provider(classifier::PROVIDER)) {
                warn!("Spend ceiling reached; using default coefficients");
                partial_errors.push(PartialError::new(
                    classifier::PROVIDER,
                    "spend ceiling reached; profile classification skipped",
                ));
            } else {
                let item = format!(
                    "{} ({} communes: {})",
                    dest.name,
                    dest.communes.len(),
                    dest.communes
                        .iter()
                        .map(|c| c.name.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                costs.record(classifier::PROVIDER);
                match classifier_source
                    .classify_batch(PROFILE_INSTRUCTIONS, &[item], PROFILES)
                    .await
                {
                    Ok(labels) => profile = labels.into_iter().next(),
                    Err(e) => {
                        warn!(error = %e, "Profile classification failed; using default coefficients");
                        partial_errors.push(PartialError::new(classifier::PROVIDER, e.to_string()));
                    }
                }
            }
        }
        let coefficients = match &profile {
            Some(p) => profile_coefficients(p),
            None => default_coefficients(),
        };

        let allocations = allocate(aggregate, &children, &coefficients);
        info!(
            aggregate,
            communes = allocations.len(),
            profile = profile.as_deref().unwrap_or("default"),
            "Overnight stays allocated"
        );

        let mut result = StageResult::new(
            STAGE,
            json!({
                "aggregate": aggregate,
                "confidence": resolution.confidence,
                "provenance": resolution.provenance,
                "attempts": resolution.attempts,
                "profile": profile,
                "coefficients": coefficients,
                "allocations": allocations,
            }),
        );
        result.partial_errors = partial_errors;
        result.costs = costs.snapshot();
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_adjusts_only_named_categories() {
        let base = default_coefficients();
        let seaside = profile_coefficients("seaside");
        assert!(seaside["camping"] > base["camping"]);
        assert_eq!(seaside["hotel"], base["hotel"]);

        let unknown = profile_coefficients("lunar");
        assert_eq!(unknown, base);
    }

    #[test]
    fn census_children_reads_the_communes_map() {
        let payload = json!({
            "communes": {
                "74056": { "hotel": 3, "camping": 1 },
                "74058": { "hotel": 0 },
            }
        });
        let children = census_children(&payload).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].child_id, "74056");
        assert_eq!(children[0].sub_counts["hotel"], 3);
    }

    #[test]
    fn census_without_communes_is_an_error() {
        assert!(census_children(&json!({})).is_err());
        assert!(census_children(&json!({ "communes": [] })).is_err());
    }

    #[test]
    fn department_comes_from_the_commune_prefix() {
        assert_eq!(department_code("74056").as_deref(), Some("74"));
        assert_eq!(department_code("2A004").as_deref(), Some("2A"));
        assert_eq!(department_code("7").is_none(), true);
    }
}
