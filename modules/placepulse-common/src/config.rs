use std::env;

use tracing::info;

/// Application configuration loaded from environment variables.
///
/// Provider API keys are optional: a missing key disables that provider
/// family (its escalation steps are skipped), it never aborts a run.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,

    // Providers
    pub rank_index_api_key: Option<String>,
    pub serp_api_key: Option<String>,
    pub registry_api_key: Option<String>,
    pub statbase_api_key: Option<String>,
    pub places_api_key: Option<String>,

    // Classification service
    pub anthropic_api_key: Option<String>,

    // Spend ceiling per run, in cents. 0 = unlimited.
    pub budget_limit_cents: u64,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if required vars are missing.
    pub fn from_env() -> Self {
        Self {
            database_url: required_env("DATABASE_URL"),
            rank_index_api_key: optional_env("RANK_INDEX_API_KEY"),
            serp_api_key: optional_env("SERP_API_KEY"),
            registry_api_key: optional_env("REGISTRY_API_KEY"),
            statbase_api_key: optional_env("STATBASE_API_KEY"),
            places_api_key: optional_env("PLACES_API_KEY"),
            anthropic_api_key: optional_env("ANTHROPIC_API_KEY"),
            budget_limit_cents: env::var("BUDGET_LIMIT_CENTS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .expect("BUDGET_LIMIT_CENTS must be a number"),
        }
    }

    /// Log which provider families are configured, without leaking keys.
    pub fn log_redacted(&self) {
        info!(
            rank_index = self.rank_index_api_key.is_some(),
            serp = self.serp_api_key.is_some(),
            registry = self.registry_api_key.is_some(),
            statbase = self.statbase_api_key.is_some(),
            places = self.places_api_key.is_some(),
            classifier = self.anthropic_api_key.is_some(),
            budget_limit_cents = self.budget_limit_cents,
            "Configured providers"
        );
    }
}

fn required_env(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| panic!("{key} environment variable is required"))
}

fn optional_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}
