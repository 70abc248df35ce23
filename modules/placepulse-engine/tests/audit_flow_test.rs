//! End-to-end pipeline tests over the in-memory store: stage gating,
//! confirmation parking, partial-failure tolerance, and re-run behavior.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use placepulse_common::{
    AuditRun, CandidateEntity, Commune, Destination, StageResult, StageStatus,
};
use placepulse_providers::{DomainFootprint, ProviderError, SerpResult};

use placepulse_engine::stages::{
    LodgingCensusStage, SearchFootprintStage, Stage, VisitorAllocationStage,
};
use placepulse_engine::traits::{
    CapacitySource, FootprintSource, LabelSource, ListingsSource, RegistrySource, SerpSource,
};
use placepulse_engine::{Coordinator, MemoryRunStore};

// ---------------------------------------------------------------------------
// Mock sources
// ---------------------------------------------------------------------------

/// Footprints by exact domain; anything else reports not-found.
struct MockFootprint {
    by_domain: HashMap<String, DomainFootprint>,
}

#[async_trait]
impl FootprintSource for MockFootprint {
    async fn domain_footprint(&self, domain: &str) -> Result<DomainFootprint, ProviderError> {
        match self.by_domain.get(domain) {
            Some(f) => Ok(f.clone()),
            None => Err(ProviderError::NotFound),
        }
    }
}

struct MockSerp {
    results: Vec<SerpResult>,
}

#[async_trait]
impl SerpSource for MockSerp {
    async fn search(&self, _query: &str, _max: usize) -> Result<Vec<SerpResult>, ProviderError> {
        Ok(self.results.clone())
    }
}

/// Registry entities keyed by (commune, category); a listed commune code
/// fails its query outright.
struct MockRegistry {
    by_commune: HashMap<(String, String), Vec<CandidateEntity>>,
    failing_communes: Vec<String>,
}

#[async_trait]
impl RegistrySource for MockRegistry {
    async fn establishments(
        &self,
        commune_code: &str,
        category: &str,
    ) -> Result<Vec<CandidateEntity>, ProviderError> {
        if self.failing_communes.iter().any(|c| c == commune_code) {
            return Err(ProviderError::Timeout);
        }
        Ok(self
            .by_commune
            .get(&(commune_code.to_string(), category.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

struct MockListings {
    by_category: HashMap<String, Vec<CandidateEntity>>,
}

#[async_trait]
impl ListingsSource for MockListings {
    async fn census(
        &self,
        category: &str,
        _lat: f64,
        _lng: f64,
        _radius_km: f64,
    ) -> Result<Vec<CandidateEntity>, ProviderError> {
        Ok(self.by_category.get(category).cloned().unwrap_or_default())
    }
}

/// Publishes an aggregate at the EPCI level only.
struct MockCapacity {
    epci_value: u64,
}

#[async_trait]
impl CapacitySource for MockCapacity {
    async fn overnight_stays(&self, level: &str, _code: &str) -> Result<Option<u64>, ProviderError> {
        if level == "epci" {
            Ok(Some(self.epci_value))
        } else {
            Ok(None)
        }
    }
}

/// Answers every item with the same label.
struct MockLabeler {
    label: &'static str,
}

#[async_trait]
impl LabelSource for MockLabeler {
    async fn classify_batch(
        &self,
        _instructions: &str,
        items: &[String],
        _labels: &[&str],
    ) -> Result<Vec<String>, ProviderError> {
        Ok(items.iter().map(|_| self.label.to_string()).collect())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn destination() -> Destination {
    Destination {
        slug: "lac-destination".to_string(),
        name: "Lac Destination".to_string(),
        epci_code: Some("247400000".to_string()),
        communes: vec![
            Commune {
                code: "74056".to_string(),
                name: "Bourg-du-Lac".to_string(),
            },
            Commune {
                code: "74058".to_string(),
                name: "Rivage".to_string(),
            },
        ],
        domains: vec!["example.fr".to_string()],
        categories: vec!["hotel".to_string()],
        center_lat: 45.9,
        center_lng: 6.1,
        radius_km: 10.0,
    }
}

fn hotel(source: &str, name: &str, postal: &str) -> CandidateEntity {
    let mut e = CandidateEntity::new(source, name, "hotel");
    e.postal_code = Some(postal.to_string());
    e
}

/// Footprint source where the bare domain has nothing and the www variant
/// ranks. Exercises the bare → www escalation.
fn footprint_source() -> Arc<dyn FootprintSource> {
    let mut by_domain = HashMap::new();
    by_domain.insert(
        "www.example.fr".to_string(),
        DomainFootprint {
            domain: "www.example.fr".to_string(),
            organic_keywords: 40,
            organic_traffic: 900,
            top3_positions: 2,
            not_indexed: false,
        },
    );
    Arc::new(MockFootprint { by_domain })
}

fn registry_source(failing: &[&str]) -> Arc<dyn RegistrySource> {
    let mut by_commune = HashMap::new();
    by_commune.insert(
        ("74056".to_string(), "hotel".to_string()),
        vec![
            hotel("registry", "HOTEL DU LAC SARL", "74410"),
            hotel("registry", "AUBERGE DES CIMES", "74410"),
        ],
    );
    by_commune.insert(
        ("74058".to_string(), "hotel".to_string()),
        vec![hotel("registry", "HOTEL BELLEVUE", "74290")],
    );
    Arc::new(MockRegistry {
        by_commune,
        failing_communes: failing.iter().map(|s| s.to_string()).collect(),
    })
}

fn listings_source() -> Arc<dyn ListingsSource> {
    let mut by_category = HashMap::new();
    by_category.insert(
        "hotel".to_string(),
        vec![
            hotel("places", "Hôtel du Lac", "74410"),
            hotel("places", "Le Refuge Moderne", "74290"),
        ],
    );
    Arc::new(MockListings { by_category })
}

fn coordinator(
    registry_failing: &[&str],
) -> Coordinator<Arc<MemoryRunStore>> {
    let store = Arc::new(MemoryRunStore::new());
    Coordinator::new(store)
        .register(Arc::new(SearchFootprintStage::new(
            Some(footprint_source()),
            Some(Arc::new(MockSerp { results: vec![] })),
            Some(Arc::new(MockLabeler { label: "gap" })),
            0,
        )))
        .register(Arc::new(LodgingCensusStage::new(
            Some(registry_source(registry_failing)),
            Some(listings_source()),
            0,
        )))
        .register(Arc::new(VisitorAllocationStage::new(
            Some(Arc::new(MockCapacity { epci_value: 1000 })),
            Some(Arc::new(MockLabeler { label: "urban" })),
            0,
        )))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pipeline_parks_at_confirmation_then_completes() {
    let coordinator = coordinator(&[]);
    let run = coordinator.create_run(destination()).await.unwrap();
    let run = coordinator.advance(run.id).await.unwrap();

    // Census parks; allocation cannot start behind it.
    assert_eq!(run.stage_status("search_footprint"), StageStatus::Done);
    assert_eq!(
        run.stage_status("lodging_census"),
        StageStatus::AwaitingConfirmation
    );
    assert_eq!(run.stage_status("visitor_allocation"), StageStatus::Pending);

    // The www variant measured the domain; the classifier's "gap" was
    // overridden because the domain holds top-3 positions.
    let footprint = run.stage_payload("search_footprint").unwrap();
    let domain = &footprint["domains"]["example.fr"];
    assert_eq!(domain["confidence"], "measured");
    assert_eq!(domain["provenance"], "rank_index");
    assert_eq!(domain["label"], "established");
    assert_eq!(domain["attempts"]["rank_index"], 2);

    // Registry 3, listings 2, one fuzzy duplicate.
    let census = run.stage_payload("lodging_census").unwrap();
    assert_eq!(census["categories"]["hotel"]["both"], 1);
    assert_eq!(census["categories"]["hotel"]["registry_only"], 2);
    assert_eq!(census["categories"]["hotel"]["listings_only"], 1);
    assert_eq!(census["categories"]["hotel"]["total"], 4);
    assert_eq!(census["communes"]["74056"]["hotel"], 2);
    assert_eq!(census["communes"]["74058"]["hotel"], 1);

    // Reviewer bumps one commune's count, confirms.
    let confirmed = json!({
        "communes": {
            "74056": { "hotel": 3 },
            "74058": { "hotel": 1 },
        }
    });
    coordinator
        .confirm_stage(run.id, "lodging_census", confirmed)
        .await
        .unwrap();

    let run = coordinator.advance(run.id).await.unwrap();
    assert_eq!(run.stage_status("lodging_census"), StageStatus::Done);
    assert_eq!(run.stage_status("visitor_allocation"), StageStatus::Done);

    // Aggregate split 3:1 on the confirmed counts; the split sums exactly.
    let allocation = run.stage_payload("visitor_allocation").unwrap();
    assert_eq!(allocation["aggregate"], 1000);
    assert_eq!(allocation["confidence"], "measured");
    assert_eq!(allocation["profile"], "urban");
    let shares: Vec<u64> = allocation["allocations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["share_amount"].as_u64().unwrap())
        .collect();
    assert_eq!(shares, vec![750, 250]);

    // Grand total is recomputed from the merged ledger.
    assert_eq!(run.total_cost_cents, run.costs.grand_total());
    assert!(run.total_cost_cents > 0);
}

#[tokio::test]
async fn one_failing_commune_degrades_the_census_without_failing_the_stage() {
    let coordinator = coordinator(&["74058"]);
    let run = coordinator.create_run(destination()).await.unwrap();
    let run = coordinator.advance(run.id).await.unwrap();

    assert_eq!(
        run.stage_status("lodging_census"),
        StageStatus::AwaitingConfirmation
    );
    let result = &run.stages["lodging_census"];
    assert_eq!(result.partial_errors.len(), 1);
    assert_eq!(result.partial_errors[0].provider, "registry");

    // The failed commune is absent, not zeroed.
    let census = run.stage_payload("lodging_census").unwrap();
    assert_eq!(census["communes"]["74056"]["hotel"], 2);
    assert!(census["communes"].get("74058").is_none());
}

#[tokio::test]
async fn allocation_cannot_start_before_census_confirms() {
    let coordinator = coordinator(&[]);
    let run = coordinator.create_run(destination()).await.unwrap();
    let run = coordinator.advance(run.id).await.unwrap();
    assert_eq!(
        run.stage_status("lodging_census"),
        StageStatus::AwaitingConfirmation
    );

    let err = coordinator
        .start_stage(run.id, "visitor_allocation")
        .await
        .unwrap_err();
    assert!(err.to_string().contains("lodging_census"));
}

#[tokio::test]
async fn rerunning_a_stage_replaces_its_payload_and_accumulates_costs() {
    let coordinator = coordinator(&[]);
    let run = coordinator.create_run(destination()).await.unwrap();
    let run = coordinator.advance(run.id).await.unwrap();

    let first_payload = run.stage_payload("search_footprint").unwrap().clone();
    let first_rank_calls = run.costs.0["rank_index"].calls;
    let census_status = run.stage_status("lodging_census");

    let run = coordinator
        .start_stage(run.id, "search_footprint")
        .await
        .unwrap();

    // Deterministic sources: same payload, doubled spend, siblings intact.
    assert_eq!(run.stage_payload("search_footprint").unwrap(), &first_payload);
    assert_eq!(run.costs.0["rank_index"].calls, first_rank_calls * 2);
    assert_eq!(run.stage_status("lodging_census"), census_status);
    assert_eq!(run.total_cost_cents, run.costs.grand_total());
}

#[tokio::test]
async fn census_stops_at_the_spend_ceiling_with_a_partial_error() {
    // 1 cent covers exactly one registry call; the second commune and the
    // listings census are skipped, not attempted.
    let stage = LodgingCensusStage::new(Some(registry_source(&[])), Some(listings_source()), 1);
    let run = AuditRun::new(destination());

    let result = stage.execute(&run).await.unwrap();

    assert_eq!(result.costs.0["registry"].calls, 1);
    assert!(!result.costs.0.contains_key("places"));
    assert!(result
        .partial_errors
        .iter()
        .any(|e| e.message.contains("ceiling")));
    assert_eq!(result.payload["communes"]["74056"]["hotel"], 2);
    assert!(result.payload["communes"].get("74058").is_none());
}

/// Stage that sleeps before reporting, for observing wave concurrency.
struct SlowStage {
    name: &'static str,
}

#[async_trait]
impl Stage for SlowStage {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn execute(&self, _run: &AuditRun) -> anyhow::Result<StageResult> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(StageResult::new(self.name, json!({ "done": self.name })))
    }
}

#[tokio::test(start_paused = true)]
async fn independent_stages_run_concurrently_and_both_land() {
    let coordinator = Coordinator::new(Arc::new(MemoryRunStore::new()))
        .register(Arc::new(SlowStage { name: "left" }))
        .register(Arc::new(SlowStage { name: "right" }));
    let run = coordinator.create_run(destination()).await.unwrap();

    let start = tokio::time::Instant::now();
    let run = coordinator.advance(run.id).await.unwrap();

    // One wave of two 50ms stages, not two sequential waves.
    assert!(start.elapsed() < Duration::from_millis(95));
    assert_eq!(run.stage_status("left"), StageStatus::Done);
    assert_eq!(run.stage_status("right"), StageStatus::Done);
    assert_eq!(run.stages["left"].payload, json!({ "done": "left" }));
    assert_eq!(run.stages["right"].payload, json!({ "done": "right" }));
}

#[tokio::test]
async fn unknown_stage_is_rejected() {
    let coordinator = coordinator(&[]);
    let run = coordinator.create_run(destination()).await.unwrap();
    assert!(coordinator.start_stage(run.id, "nope").await.is_err());
}
