//! Business-establishment registry (SIRENE-style).
//!
//! One of the two independent censuses of physical establishments. Names
//! come back in registry form ("HOTEL DU LAC SARL"), addresses are partial,
//! coordinates often missing — reconciliation against the listings source
//! happens downstream.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use placepulse_common::CandidateEntity;

use crate::error::{ProviderError, Result};
use crate::pacer::Pacer;

pub const PROVIDER: &str = "registry";

const BASE_URL: &str = "https://api.registre-etablissements.fr/v3";

#[derive(Debug, Deserialize)]
struct RegistryResponse {
    #[serde(default)]
    establishments: Vec<RegistryRow>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryRow {
    #[serde(default)]
    denomination: String,
    #[serde(default)]
    postal_code: Option<String>,
    #[serde(default)]
    street_address: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
}

pub struct RegistryClient {
    api_key: String,
    client: reqwest::Client,
    pacer: Arc<Pacer>,
    base_url: String,
}

impl RegistryClient {
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

    /// Fetch active establishments of one category in one commune.
    ///
    /// A 404 means the registry has no rows for this commune/category pair —
    /// ambiguous emptiness, surfaced as `NotFound` for the caller to weigh.
    pub async fn establishments(
        &self,
        commune_code: &str,
        category: &str,
    ) -> Result<Vec<CandidateEntity>> {
        let _permit = self
            .pacer
            .admit(PROVIDER)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        info!(commune_code, category, "Registry establishment query");

        let url = format!("{}/establishments", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("commune", commune_code), ("category", category)])
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let data: RegistryResponse = resp.json().await?;
        let entities: Vec<CandidateEntity> = data
            .establishments
            .into_iter()
            .filter(|r| !r.denomination.trim().is_empty())
            .map(|r| {
                let mut e = CandidateEntity::new(PROVIDER, r.denomination, category);
                e.postal_code = r.postal_code;
                e.address = r.street_address;
                e.lat = r.latitude;
                e.lng = r.longitude;
                e
            })
            .collect();

        info!(
            commune_code,
            category,
            count = entities.len(),
            "Registry query complete"
        );
        Ok(entities)
    }
}
