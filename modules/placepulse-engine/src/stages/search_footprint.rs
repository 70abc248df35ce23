//! Search-footprint stage.
//!
//! For each domain the destination claims, resolve its organic-search
//! footprint through an escalation ladder: the bare domain, the www variant,
//! a SERP validation pass that may surface the domain actually ranking for
//! the destination, and one retry with that corrected domain. The labels on
//! top are advisory; a domain with live top-3 positions is never reported as
//! a gap, whatever the classifier says.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{stream, StreamExt};
use serde_json::json;
use tracing::warn;
use url::Url;

use placepulse_common::{AuditRun, PartialError, StageResult};
use placepulse_providers::{classifier, rank_index, serp, DomainFootprint, ProviderError, SerpResult};

use crate::cost::{CostTracker, UnitCost};
use crate::escalation::{resolve, LadderStep, Resolution, StepReport};
use crate::stages::Stage;
use crate::traits::{FootprintSource, LabelSource, SerpSource};

pub const STAGE: &str = "search_footprint";

const DOMAIN_CONCURRENCY: usize = 3;
const SERP_VALIDATION_RESULTS: usize = 5;

const LABELS: &[&str] = &["established", "emerging", "gap"];

const LABEL_INSTRUCTIONS: &str = "You are auditing the web presence of a tourism destination. \
For each domain and its organic-search metrics, label the presence: \
'established' (clearly visible in search), 'emerging' (some visibility, \
still weak), or 'gap' (effectively invisible).";

/// Hosts that rank for almost any destination query and never identify the
/// destination's own site.
const AGGREGATOR_HOSTS: &[&str] = &[
    "booking.com",
    "tripadvisor",
    "facebook.com",
    "instagram.com",
    "wikipedia.org",
    "google.com",
    "pagesjaunes.fr",
];

pub struct SearchFootprintStage {
    rank_index: Option<Arc<dyn FootprintSource>>,
    serp: Option<Arc<dyn SerpSource>>,
    classifier: Option<Arc<dyn LabelSource>>,
    budget_limit_cents: u64,
}

impl SearchFootprintStage {
    pub fn new(
        rank_index: Option<Arc<dyn FootprintSource>>,
        serp: Option<Arc<dyn SerpSource>>,
        classifier: Option<Arc<dyn LabelSource>>,
        budget_limit_cents: u64,
    ) -> Self {
        Self {
            rank_index,
            serp,
            classifier,
            budget_limit_cents,
        }
    }
}

// ---------------------------------------------------------------------------
// Ladder steps
// ---------------------------------------------------------------------------

/// One rank-index lookup for a fixed domain variant, or for the corrected
/// domain an earlier validation step produced.
struct RankStep {
    source: Option<Arc<dyn FootprintSource>>,
    domain: String,
    use_correction: bool,
    variant: &'static str,
}

#[async_trait]
impl LadderStep<DomainFootprint> for RankStep {
    fn provider(&self) -> &str {
        rank_index::PROVIDER
    }

    fn variant(&self) -> &str {
        self.variant
    }

    async fn attempt(&self, correction: Option<&str>) -> StepReport<DomainFootprint> {
        let Some(source) = &self.source else {
            return StepReport::skipped();
        };
        let domain = if self.use_correction {
            match correction {
                Some(c) => c.to_string(),
                // No earlier step corrected the query; nothing to retry.
                None => return StepReport::skipped(),
            }
        } else {
            self.domain.clone()
        };

        match source.domain_footprint(&domain).await {
            Ok(f) if f.is_meaningfully_empty() => StepReport::empty(),
            Ok(f) => StepReport::value(f),
            Err(ProviderError::NotFound) => StepReport::empty(),
            Err(ProviderError::Config(_)) => StepReport::skipped(),
            Err(e) => StepReport::failed(e.to_string()),
        }
    }
}

/// SERP pass over the destination's official-site query. Never yields a
/// footprint itself; its job is to surface the domain that actually ranks,
/// handing it to the corrected-retry rung as a query correction.
struct DomainValidationStep {
    source: Option<Arc<dyn SerpSource>>,
    query: String,
    original_domain: String,
}

#[async_trait]
impl LadderStep<DomainFootprint> for DomainValidationStep {
    fn provider(&self) -> &str {
        serp::PROVIDER
    }

    fn variant(&self) -> &str {
        "validate"
    }

    async fn attempt(&self, _correction: Option<&str>) -> StepReport<DomainFootprint> {
        let Some(source) = &self.source else {
            return StepReport::skipped();
        };
        match source.search(&self.query, SERP_VALIDATION_RESULTS).await {
            Ok(results) => match ranking_host(&results, &self.original_domain) {
                Some(host) => StepReport::empty().with_correction(host),
                None => StepReport::empty(),
            },
            Err(ProviderError::NotFound) => StepReport::empty(),
            Err(ProviderError::Config(_)) => StepReport::skipped(),
            Err(e) => StepReport::failed(e.to_string()),
        }
    }
}

/// First organic host that is neither the domain already tried nor a generic
/// aggregator.
fn ranking_host(results: &[SerpResult], original_domain: &str) -> Option<String> {
    for r in results {
        let Ok(parsed) = Url::parse(&r.url) else {
            continue;
        };
        let Some(host) = parsed.host_str() else {
            continue;
        };
        let host = host.strip_prefix("www.").unwrap_or(host);
        if host == original_domain || is_aggregator(host) {
            continue;
        }
        return Some(host.to_string());
    }
    None
}

/// Label-boundary match: a bare brand entry ("tripadvisor") matches any of
/// the host's dot-separated labels, a full-domain entry ("booking.com")
/// matches the host itself or any subdomain of it. Plain substring or
/// suffix checks would miss `tripadvisor.fr` and catch `notbooking.com`.
fn is_aggregator(host: &str) -> bool {
    AGGREGATOR_HOSTS.iter().any(|a| {
        if a.contains('.') {
            host == *a || host.ends_with(&format!(".{a}"))
        } else {
            host.split('.').any(|label| label == *a)
        }
    })
}

// ---------------------------------------------------------------------------
// Labeling
// ---------------------------------------------------------------------------

fn label_item(domain: &str, footprint: Option<&DomainFootprint>) -> String {
    match footprint {
        Some(f) => format!(
            "{domain}: keywords={}, traffic={}, top3_positions={}",
            f.organic_keywords, f.organic_traffic, f.top3_positions
        ),
        None => format!("{domain}: no measurable footprint"),
    }
}

/// Hard deterministic override on the advisory label: live top-3 positions
/// contradict a gap, always.
fn apply_label_override(domain: &str, label: String, footprint: Option<&DomainFootprint>) -> String {
    if label == "gap" {
        if let Some(f) = footprint {
            if f.top3_positions > 0 {
                warn!(
                    domain,
                    top3 = f.top3_positions,
                    "Classifier said gap but domain ranks; overriding to established"
                );
                return "established".to_string();
            }
        }
    }
    label
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

#[async_trait]
impl Stage for SearchFootprintStage {
    fn name(&self) -> &'static str {
        STAGE
    }

    async fn execute(&self, run: &AuditRun) -> anyhow::Result<StageResult> {
        let dest = &run.destination;
        let costs = CostTracker::new(self.budget_limit_cents);
        let validation_query = format!("{} site officiel", dest.name);

        let outcomes: Vec<Result<(String, Resolution<DomainFootprint>), _>> =
            stream::iter(dest.domains.iter().cloned().map(|domain| {
                let costs = &costs;
                let rank = self.rank_index.clone();
                let serp_source = self.serp.clone();
                let query = validation_query.clone();
                async move {
                    let ladder: Vec<Box<dyn LadderStep<DomainFootprint>>> = vec![
                        Box::new(RankStep {
                            source: rank.clone(),
                            domain: domain.clone(),
                            use_correction: false,
                            variant: "bare",
                        }),
                        Box::new(RankStep {
                            source: rank.clone(),
                            domain: format!("www.{domain}"),
                            use_correction: false,
                            variant: "www",
                        }),
                        Box::new(DomainValidationStep {
                            source: serp_source,
                            query,
                            original_domain: domain.clone(),
                        }),
                        Box::new(RankStep {
                            source: rank,
                            domain: String::new(),
                            use_correction: true,
                            variant: "corrected",
                        }),
                    ];
                    let resolution = resolve(&domain, &ladder, costs).await?;
                    Ok::<_, placepulse_common::PlacePulseError>((domain, resolution))
                }
            }))
            .buffer_unordered(DOMAIN_CONCURRENCY)
            .collect()
            .await;

        let mut partial_errors: Vec<PartialError> = Vec::new();
        let mut resolutions: BTreeMap<String, Resolution<DomainFootprint>> = BTreeMap::new();
        for outcome in outcomes {
            let (domain, resolution) = outcome?;
            partial_errors.extend(resolution.errors.iter().cloned());
            resolutions.insert(domain, resolution);
        }

        // Advisory labels, in the deterministic key order of the map.
        let mut labels: BTreeMap<String, String> = BTreeMap::new();
        if let Some(classifier_source) = &self.classifier {
            let domains: Vec<&String> = resolutions.keys().collect();
            let items: Vec<String> = domains
                .iter()
                .map(|d| label_item(d, resolutions[d.as_str()].value.as_ref()))
                .collect();
            if !items.is_empty() {
                if !costs.has_budget(UnitCost::for_provider(classifier::PROVIDER)) {
                    warn!("Spend ceiling reached; skipping footprint labeling");
                    partial_errors.push(PartialError::new(
                        classifier::PROVIDER,
                        "spend ceiling reached; labeling skipped",
                    ));
                } else {
                    costs.record(classifier::PROVIDER);
                    match classifier_source
                        .classify_batch(LABEL_INSTRUCTIONS, &items, LABELS)
                        .await
                    {
                        Ok(raw) => {
                            for (domain, label) in domains.iter().zip(raw) {
                                let footprint = resolutions[domain.as_str()].value.as_ref();
                                labels.insert(
                                    (*domain).clone(),
                                    apply_label_override(domain, label, footprint),
                                );
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Footprint labeling failed; reporting unlabeled");
                            partial_errors
                                .push(PartialError::new(classifier::PROVIDER, e.to_string()));
                        }
                    }
                }
            }
        }

        let mut domains_payload = serde_json::Map::new();
        for (domain, resolution) in &resolutions {
            domains_payload.insert(
                domain.clone(),
                json!({
                    "footprint": resolution.value,
                    "confidence": resolution.confidence,
                    "provenance": resolution.provenance,
                    "attempts": resolution.attempts,
                    "label": labels.get(domain),
                }),
            );
        }

        let mut result = StageResult::new(STAGE, json!({ "domains": domains_payload }));
        result.partial_errors = partial_errors;
        result.costs = costs.snapshot();
        Ok(result)
    }
}
