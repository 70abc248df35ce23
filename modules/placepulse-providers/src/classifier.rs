//! LLM classification service.
//!
//! Batch labeling for judgment calls no deterministic rule covers:
//! categorizing free-text items, adjusting allocation coefficients to a
//! destination profile. The service's output is advisory — callers apply
//! their own hard override rules afterwards wherever a deterministic rule
//! exists.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ProviderError, Result};
use crate::pacer::Pacer;

pub const PROVIDER: &str = "classifier";

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MODEL: &str = "claude-3-5-haiku-latest";

/// Items per request. Beyond this the model starts dropping or merging
/// entries, so larger inputs are chunked.
pub const MAX_BATCH: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct LabeledItem {
    /// Zero-based index of the input item.
    pub index: usize,
    /// One of the allowed labels, verbatim.
    pub label: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

pub struct ClassifierClient {
    api_key: String,
    http: reqwest::Client,
    pacer: Arc<Pacer>,
    base_url: String,
}

impl ClassifierClient {
    pub fn new(api_key: &str, pacer: Arc<Pacer>) -> Self {
        Self {
            api_key: api_key.to_string(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .expect("Failed to build HTTP client"),
            pacer,
            base_url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: &str) -> Self {
        self.base_url = url.to_string();
        self
    }

    /// Label every item with one of `labels`. Output preserves input order;
    /// inputs larger than `MAX_BATCH` are chunked transparently.
    pub async fn classify_batch(
        &self,
        instructions: &str,
        items: &[String],
        labels: &[&str],
    ) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(items.len());
        for chunk in items.chunks(MAX_BATCH) {
            out.extend(self.classify_chunk(instructions, chunk, labels).await?);
        }
        Ok(out)
    }

    async fn classify_chunk(
        &self,
        instructions: &str,
        items: &[String],
        labels: &[&str],
    ) -> Result<Vec<String>> {
        let _permit = self
            .pacer
            .admit(PROVIDER)
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let schema = schema_for!(Vec<LabeledItem>);
        let numbered: String = items
            .iter()
            .enumerate()
            .map(|(i, item)| format!("{i}. {item}\n"))
            .collect();

        let prompt = format!(
            "{instructions}\n\nAllowed labels: {labels:?}\n\nItems:\n{numbered}\n\
             Respond with ONLY a JSON array matching this schema, one entry per item:\n{}",
            serde_json::to_string(&schema)?
        );

        debug!(items = items.len(), "Classifier request");

        let request = ChatRequest {
            model: MODEL,
            max_tokens: 2048,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let resp = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status.as_u16(), body));
        }

        let data: ChatResponse = resp.json().await?;
        let text = data
            .content
            .first()
            .map(|b| b.text.as_str())
            .unwrap_or_default();

        let labeled = parse_labeled(text, items.len())?;
        Ok(labeled)
    }
}

/// Parse the model's JSON array, tolerating markdown code fences, and check
/// it covers every input index exactly once.
fn parse_labeled(text: &str, expected: usize) -> Result<Vec<String>> {
    let trimmed = text
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    let entries: Vec<LabeledItem> = serde_json::from_str(trimmed)?;
    let by_index: HashMap<usize, String> =
        entries.into_iter().map(|e| (e.index, e.label)).collect();

    (0..expected)
        .map(|i| {
            by_index
                .get(&i)
                .cloned()
                .ok_or_else(|| ProviderError::Parse(format!("missing label for item {i}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_output_in_order() {
        let text = "```json\n[{\"index\":1,\"label\":\"b\"},{\"index\":0,\"label\":\"a\"}]\n```";
        assert_eq!(parse_labeled(text, 2).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn missing_index_is_a_parse_error() {
        let text = "[{\"index\":0,\"label\":\"a\"}]";
        assert!(parse_labeled(text, 2).is_err());
    }
}
