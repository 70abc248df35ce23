//! Live organic-results search (Serper).
//!
//! Used two ways: to validate an uncertain domain guess (which real domain
//! ranks for "<destination> site officiel"?) before retrying the rank index
//! with the corrected domain, and as the deterministic hard-override check —
//! a domain confirmed in the top results must never be reported as a gap.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::error::{ProviderError, Result};
use crate::pacer::Pacer;

pub const PROVIDER: &str = "serp";

#[derive(Debug, Clone)]
pub struct SerpResult {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

#[derive(Debug, serde::Deserialize)]
struct SerpResponse {
    #[serde(default)]
    organic: Vec<RawResult>,
}

#[derive(Debug, serde::Deserialize)]
struct RawResult {
    #[serde(default)]
    link: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    snippet: String,
}

pub struct SerpClient {
    api_key: String,
    client: reqwest::Client,
    pacer: Arc<Pacer>,
    base_url: String,
}

impl SerpClient {
    pub fn new(api_key: &str, pacer: Arc<Pacer>) -> Self {
        Self {
            api_key: api_key.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
            pacer,
            base_url: "https://google.serper.dev".to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    pub async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SerpResult>> {
        let _permit = self
            .pacer
            .admit(PROVIDER)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        info!(query, max_results, "SERP search");

        let body = serde_json::json!({
            "q": query,
            "num": max_results,
        });

        let resp = self
            .client
            .post(format!("{}/search", self.base_url))
            .header("X-API-KEY", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let data: SerpResponse = resp.json().await?;
        let results: Vec<SerpResult> = data
            .organic
            .into_iter()
            .map(|r| SerpResult {
                url: r.link,
                title: r.title,
                snippet: r.snippet,
            })
            .collect();

        info!(query, count = results.len(), "SERP search complete");
        Ok(results)
    }
}
