//! Mapping/POI provider.
//!
//! The second establishment census, from the listings world: names as the
//! public writes them, coordinates always present, no legal identifiers.
//!
//! The provider caps results per rectangle query. When a cell comes back at
//! the ceiling we split it into four quadrants and re-query, down to a hard
//! depth cap — a leaf cell still at the ceiling is logged as a visible
//! under-count rather than recursing forever over a dense city block.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{ProviderError, Result};
use crate::pacer::Pacer;

pub const PROVIDER: &str = "places";

const BASE_URL: &str = "https://places.googleapis.example/v1";

/// Max results the provider returns for one rectangle query.
const RESULTS_CEILING: usize = 60;

/// Hard cap on quadrant splits. 4 levels turns one cell into up to 256,
/// enough for any commune-scale census.
const MAX_SPLIT_DEPTH: u32 = 4;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceHit {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Deserialize)]
struct PlacesResponse {
    #[serde(default)]
    places: Vec<PlaceHit>,
}

#[derive(Debug, Clone, Copy)]
struct BBox {
    min_lat: f64,
    max_lat: f64,
    min_lng: f64,
    max_lng: f64,
}

impl BBox {
    fn around(center_lat: f64, center_lng: f64, radius_km: f64) -> Self {
        let lat_delta = radius_km / 111.0;
        let lng_delta = radius_km / (111.0 * center_lat.to_radians().cos());
        Self {
            min_lat: center_lat - lat_delta,
            max_lat: center_lat + lat_delta,
            min_lng: center_lng - lng_delta,
            max_lng: center_lng + lng_delta,
        }
    }

    fn split(self) -> [BBox; 4] {
        let mid_lat = (self.min_lat + self.max_lat) / 2.0;
        let mid_lng = (self.min_lng + self.max_lng) / 2.0;
        [
            BBox { max_lat: mid_lat, max_lng: mid_lng, ..self },
            BBox { max_lat: mid_lat, min_lng: mid_lng, ..self },
            BBox { min_lat: mid_lat, max_lng: mid_lng, ..self },
            BBox { min_lat: mid_lat, min_lng: mid_lng, ..self },
        ]
    }
}

pub struct PlacesClient {
    api_key: String,
    client: reqwest::Client,
    pacer: Arc<Pacer>,
    base_url: String,
}

impl PlacesClient {
    pub fn new(api_key: &str, pacer: Arc<Pacer>) -> Self {
        Self {
            api_key: api_key.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
            pacer,
            base_url: BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    /// One rectangle query.
    async fn search_cell(&self, category: &str, bbox: BBox) -> Result<Vec<PlaceHit>> {
        let _permit = self
            .pacer
            .admit(PROVIDER)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let body = serde_json::json!({
            "category": category,
            "bounds": {
                "low": { "latitude": bbox.min_lat, "longitude": bbox.min_lng },
                "high": { "latitude": bbox.max_lat, "longitude": bbox.max_lng },
            },
            "maxResults": RESULTS_CEILING,
        });

        let resp = self
            .client
            .post(format!("{}/places:searchArea", self.base_url))
            .header("X-API-KEY", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let data: PlacesResponse = resp.json().await?;
        Ok(data.places)
    }

    /// Census one category over a circle, splitting saturated cells.
    ///
    /// Results are deduplicated by place id (quadrants overlap at edges).
    pub async fn census(
        &self,
        category: &str,
        center_lat: f64,
        center_lng: f64,
        radius_km: f64,
    ) -> Result<Vec<PlaceHit>> {
        info!(category, radius_km, "Places census starting");

        let mut pending = vec![(BBox::around(center_lat, center_lng, radius_km), 0u32)];
        let mut seen: HashSet<String> = HashSet::new();
        let mut hits: Vec<PlaceHit> = Vec::new();
        let mut cells = 0u32;

        while let Some((bbox, depth)) = pending.pop() {
            cells += 1;
            let cell_hits = self.search_cell(category, bbox).await?;
            let saturated = cell_hits.len() >= RESULTS_CEILING;

            if saturated && depth < MAX_SPLIT_DEPTH {
                for quadrant in bbox.split() {
                    pending.push((quadrant, depth + 1));
                }
                continue;
            }
            if saturated {
                warn!(
                    category,
                    depth,
                    "Cell still saturated at max split depth; census may under-count"
                );
            }

            for hit in cell_hits {
                if seen.insert(hit.id.clone()) {
                    hits.push(hit);
                }
            }
        }

        info!(category, cells, count = hits.len(), "Places census complete");
        Ok(hits)
    }
}
