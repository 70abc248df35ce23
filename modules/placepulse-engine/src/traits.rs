//! Trait abstractions for stage dependencies.
//!
//! Every external provider sits behind one of these, so stages run against
//! mocks in tests: no network, no database. Production wiring implements
//! them on the concrete clients from `placepulse-providers`.

use async_trait::async_trait;

use placepulse_common::CandidateEntity;
use placepulse_providers::{
    ClassifierClient, DomainFootprint, PlacesClient, RankIndexClient, RegistryClient, SerpClient,
    SerpResult, StatBaseClient,
};

type ProviderResult<T> = Result<T, placepulse_providers::ProviderError>;

// ---------------------------------------------------------------------------
// Metric sources
// ---------------------------------------------------------------------------

/// Organic-search footprint of one domain.
#[async_trait]
pub trait FootprintSource: Send + Sync {
    async fn domain_footprint(&self, domain: &str) -> ProviderResult<DomainFootprint>;
}

/// Live organic search results.
#[async_trait]
pub trait SerpSource: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> ProviderResult<Vec<SerpResult>>;
}

/// Aggregate overnight stays at a given geographic level.
#[async_trait]
pub trait CapacitySource: Send + Sync {
    async fn overnight_stays(&self, level: &str, code: &str) -> ProviderResult<Option<u64>>;
}

// ---------------------------------------------------------------------------
// Entity sources
// ---------------------------------------------------------------------------

/// Registry-side establishments of one category in one commune.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    async fn establishments(
        &self,
        commune_code: &str,
        category: &str,
    ) -> ProviderResult<Vec<CandidateEntity>>;
}

/// Listings-side establishments of one category over a circle.
#[async_trait]
pub trait ListingsSource: Send + Sync {
    async fn census(
        &self,
        category: &str,
        center_lat: f64,
        center_lng: f64,
        radius_km: f64,
    ) -> ProviderResult<Vec<CandidateEntity>>;
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Batch labeling with a fixed label set. Advisory: callers apply their own
/// deterministic overrides to the output.
#[async_trait]
pub trait LabelSource: Send + Sync {
    async fn classify_batch(
        &self,
        instructions: &str,
        items: &[String],
        labels: &[&str],
    ) -> ProviderResult<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Production impls
// ---------------------------------------------------------------------------

#[async_trait]
impl FootprintSource for RankIndexClient {
    async fn domain_footprint(&self, domain: &str) -> ProviderResult<DomainFootprint> {
        self.domain_footprint(domain).await
    }
}

#[async_trait]
impl SerpSource for SerpClient {
    async fn search(&self, query: &str, max_results: usize) -> ProviderResult<Vec<SerpResult>> {
        self.search(query, max_results).await
    }
}

#[async_trait]
impl CapacitySource for StatBaseClient {
    async fn overnight_stays(&self, level: &str, code: &str) -> ProviderResult<Option<u64>> {
        self.overnight_stays(level, code).await
    }
}

#[async_trait]
impl RegistrySource for RegistryClient {
    async fn establishments(
        &self,
        commune_code: &str,
        category: &str,
    ) -> ProviderResult<Vec<CandidateEntity>> {
        self.establishments(commune_code, category).await
    }
}

#[async_trait]
impl ListingsSource for PlacesClient {
    async fn census(
        &self,
        category: &str,
        center_lat: f64,
        center_lng: f64,
        radius_km: f64,
    ) -> ProviderResult<Vec<CandidateEntity>> {
        let hits = self.census(category, center_lat, center_lng, radius_km).await?;
        Ok(hits
            .into_iter()
            .map(|h| {
                let mut e = CandidateEntity::new(placepulse_providers::places::PROVIDER, h.name, category);
                e.postal_code = h.postal_code;
                e.address = h.address;
                e.lat = Some(h.lat);
                e.lng = Some(h.lng);
                e
            })
            .collect())
    }
}

#[async_trait]
impl LabelSource for ClassifierClient {
    async fn classify_batch(
        &self,
        instructions: &str,
        items: &[String],
        labels: &[&str],
    ) -> ProviderResult<Vec<String>> {
        self.classify_batch(instructions, items, labels).await
    }
}
