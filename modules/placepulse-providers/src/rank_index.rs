//! Organic-search footprint provider.
//!
//! Reports how visible a domain is in organic search: keyword counts,
//! estimated traffic, top-3 positions. The index only covers domains above a
//! crawl threshold, so "no data" here never proves the domain has no
//! presence — that judgment belongs to the escalation resolver.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{ProviderError, Result};
use crate::pacer::Pacer;

pub const PROVIDER: &str = "rank_index";

const BASE_URL: &str = "https://api.rankindex.io/v2";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainFootprint {
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub organic_keywords: u64,
    #[serde(default)]
    pub organic_traffic: u64,
    #[serde(default)]
    pub top3_positions: u32,
    /// Explicit index-coverage flag. Absent in older API versions, in which
    /// case emptiness falls back to the all-zero check.
    #[serde(default)]
    pub not_indexed: bool,
}

impl DomainFootprint {
    /// Provider-specific emptiness rule: an explicit not-indexed flag, or
    /// every numeric field zero.
    pub fn is_meaningfully_empty(&self) -> bool {
        self.not_indexed
            || (self.organic_keywords == 0 && self.organic_traffic == 0 && self.top3_positions == 0)
    }
}

pub struct RankIndexClient {
    api_key: String,
    client: reqwest::Client,
    pacer: Arc<Pacer>,
    base_url: String,
}

impl RankIndexClient {
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

    /// Fetch the organic footprint of one domain.
    pub async fn domain_footprint(&self, domain: &str) -> Result<DomainFootprint> {
        let _permit = self
            .pacer
            .admit(PROVIDER)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        info!(domain, "Rank index lookup");

        let url = format!("{}/domain-overview", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("domain", domain)])
            .header("X-API-KEY", &self.api_key)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let footprint: DomainFootprint = resp.json().await?;
        info!(
            domain,
            keywords = footprint.organic_keywords,
            traffic = footprint.organic_traffic,
            "Rank index lookup complete"
        );
        Ok(footprint)
    }
}
