//! National statistics database.
//!
//! Publishes tourism aggregates (overnight stays, bed capacity) — but often
//! only at the intercommunal (EPCI) or departmental level, which is why the
//! allocation engine exists. Coverage is patchy: small EPCIs are suppressed
//! for statistical secrecy, so the resolver falls back to coarser levels.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::error::{ProviderError, Result};
use crate::pacer::Pacer;

pub const PROVIDER: &str = "statbase";

const BASE_URL: &str = "https://api.statbase.fr/v1";

#[derive(Debug, Deserialize)]
struct SeriesResponse {
    #[serde(default)]
    value: Option<u64>,
    /// Set when the series exists but the cell is suppressed (secrecy rules).
    #[serde(default)]
    suppressed: bool,
}

pub struct StatBaseClient {
    api_key: String,
    client: reqwest::Client,
    pacer: Arc<Pacer>,
    base_url: String,
}

impl StatBaseClient {
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

    /// Annual overnight stays for a geographic unit.
    ///
    /// `level` is the series granularity ("epci" or "departement"); `code`
    /// the unit's code at that level. `Ok(None)` means the series exists but
    /// carries no usable figure (missing or suppressed cell).
    pub async fn overnight_stays(&self, level: &str, code: &str) -> Result<Option<u64>> {
        let _permit = self
            .pacer
            .admit(PROVIDER)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        info!(level, code, "StatBase overnight-stays query");

        let url = format!("{}/tourism/overnight-stays", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&[("level", level), ("code", code)])
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let data: SeriesResponse = resp.json().await?;
        if data.suppressed {
            info!(level, code, "StatBase cell suppressed");
            return Ok(None);
        }

        info!(level, code, value = ?data.value, "StatBase query complete");
        Ok(data.value)
    }
}
