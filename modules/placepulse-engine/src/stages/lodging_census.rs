//! Lodging-census stage.
//!
//! Counts lodging establishments per category by reconciling two sources
//! with no shared identifier: the business registry (queried per commune)
//! and the listings provider (queried over the destination circle). One
//! commune failing its registry query degrades the census; it does not
//! abort the other communes or the listings side. The merged counts park
//! for human confirmation before anything downstream consumes them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use placepulse_common::{AuditRun, CandidateEntity, PartialError, StageResult};
use placepulse_providers::{places, registry};

use crate::cost::{CostTracker, UnitCost};
use crate::reconcile::{reconcile, ReconcileConfig};
use crate::stages::Stage;
use crate::traits::{ListingsSource, RegistrySource};

pub const STAGE: &str = "lodging_census";

pub struct LodgingCensusStage {
    registry: Option<Arc<dyn RegistrySource>>,
    listings: Option<Arc<dyn ListingsSource>>,
    config: ReconcileConfig,
    budget_limit_cents: u64,
}

impl LodgingCensusStage {
    pub fn new(
        registry: Option<Arc<dyn RegistrySource>>,
        listings: Option<Arc<dyn ListingsSource>>,
        budget_limit_cents: u64,
    ) -> Self {
        Self {
            registry,
            listings,
            config: ReconcileConfig::default(),
            budget_limit_cents,
        }
    }
}

#[async_trait]
impl Stage for LodgingCensusStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    fn needs_confirmation(&self) -> bool {
        true
    }

    async fn execute(&self, run: &AuditRun) -> anyhow::Result<StageResult> {
        if self.registry.is_none() && self.listings.is_none() {
            anyhow::bail!("no establishment source configured");
        }

        let dest = &run.destination;
        let costs = CostTracker::new(self.budget_limit_cents);
        let mut partial_errors: Vec<PartialError> = Vec::new();
        let mut ceiling_hit = false;

        let mut categories_payload = serde_json::Map::new();
        // commune code → category → registry count
        let mut commune_counts: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
        let mut review_payload = serde_json::Map::new();

        for category in &dest.categories {
            let mut registry_entities: Vec<CandidateEntity> = Vec::new();
            if let Some(source) = &self.registry {
                for commune in &dest.communes {
                    if !costs.has_budget(UnitCost::for_provider(registry::PROVIDER)) {
                        ceiling_hit = true;
                        break;
                    }
                    costs.record(registry::PROVIDER);
                    match source.establishments(&commune.code, category).await {
                        Ok(entities) => {
                            commune_counts
                                .entry(commune.code.clone())
                                .or_default()
                                .insert(category.clone(), entities.len());
                            registry_entities.extend(entities);
                        }
                        Err(e) => {
                            warn!(
                                commune = commune.code.as_str(),
                                category = category.as_str(),
                                error = %e,
                                "Registry query failed; commune under-counted"
                            );
                            partial_errors.push(PartialError::new(
                                registry::PROVIDER,
                                format!("{}/{category}: {e}", commune.code),
                            ));
                        }
                    }
                }
            }

            let mut listing_entities: Vec<CandidateEntity> = Vec::new();
            if let Some(source) = &self.listings {
                if !costs.has_budget(UnitCost::for_provider(places::PROVIDER)) {
                    ceiling_hit = true;
                } else {
                    costs.record(places::PROVIDER);
                    match source
                        .census(category, dest.center_lat, dest.center_lng, dest.radius_km)
                        .await
                    {
                        Ok(entities) => listing_entities = entities,
                        Err(e) => {
                            warn!(category = category.as_str(), error = %e, "Listings census failed");
                            partial_errors.push(PartialError::new(
                                places::PROVIDER,
                                format!("{category}: {e}"),
                            ));
                        }
                    }
                }
            }

            let recon = reconcile(&registry_entities, &listing_entities, &self.config);
            info!(
                category = category.as_str(),
                registry = registry_entities.len(),
                listings = listing_entities.len(),
                both = recon.both,
                total = recon.total,
                "Category reconciled"
            );

            categories_payload.insert(
                category.clone(),
                json!({
                    "registry_only": recon.a_only,
                    "listings_only": recon.b_only,
                    "both": recon.both,
                    "total": recon.total,
                }),
            );

            // Deduplicated roster for the reviewer: every registry entity,
            // plus the listings entities no registry record claimed.
            let matched_b = recon.matched_b();
            let roster: Vec<&CandidateEntity> = registry_entities
                .iter()
                .chain(
                    listing_entities
                        .iter()
                        .enumerate()
                        .filter(|(i, _)| !matched_b.contains(i))
                        .map(|(_, e)| e),
                )
                .collect();
            review_payload.insert(
                category.clone(),
                json!(roster
                    .iter()
                    .map(|e| json!({
                        "name": e.name,
                        "source": e.source,
                        "postal_code": e.postal_code,
                    }))
                    .collect::<Vec<_>>()),
            );
        }

        if ceiling_hit {
            warn!("Spend ceiling reached; census incomplete");
            partial_errors.push(PartialError::new(
                "budget",
                "spend ceiling reached; remaining queries skipped",
            ));
        }

        let mut result = StageResult::new(
            STAGE,
            json!({
                "categories": categories_payload,
                "communes": commune_counts,
                "establishments": review_payload,
            }),
        );
        result.partial_errors = partial_errors;
        result.costs = costs.snapshot();
        Ok(result)
    }
}
