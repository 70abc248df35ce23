use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Stage lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Done,
    /// Parked until an external reviewer confirms a subset of the output.
    AwaitingConfirmation,
    Failed,
}

/// A non-fatal error captured during a stage. The stage still completes;
/// the error travels with the result instead of aborting sibling work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialError {
    pub provider: String,
    pub message: String,
}

impl PartialError {
    pub fn new(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cost ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEntry {
    pub calls: u32,
    pub unit_cost_cents: u64,
    pub total_cents: u64,
}

/// Per-provider call costs. Merging is additive per provider key; the grand
/// total is always recomputed from the merged entries, never accumulated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CostLedger(pub BTreeMap<String, CostEntry>);

impl CostLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, provider: &str, calls: u32, unit_cost_cents: u64) {
        let entry = self.0.entry(provider.to_string()).or_insert(CostEntry {
            calls: 0,
            unit_cost_cents,
            total_cents: 0,
        });
        entry.calls += calls;
        entry.total_cents = entry.calls as u64 * entry.unit_cost_cents;
    }

    /// Additive merge per provider key.
    pub fn merge(&mut self, other: &CostLedger) {
        for (provider, incoming) in &other.0 {
            let entry = self.0.entry(provider.clone()).or_insert(CostEntry {
                calls: 0,
                unit_cost_cents: incoming.unit_cost_cents,
                total_cents: 0,
            });
            entry.calls += incoming.calls;
            entry.total_cents = entry.calls as u64 * entry.unit_cost_cents;
        }
    }

    pub fn grand_total(&self) -> u64 {
        self.0.values().map(|e| e.total_cents).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Stage result
// ---------------------------------------------------------------------------

/// Output of one stage execution. Immutable once merged into the run
/// document; a re-run produces a new StageResult that replaces the old one
/// for that stage key only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub partial_errors: Vec<PartialError>,
    #[serde(default)]
    pub costs: CostLedger,
}

impl StageResult {
    pub fn new(stage: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            stage: stage.into(),
            payload,
            partial_errors: Vec::new(),
            costs: CostLedger::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Destination
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commune {
    /// INSEE-style commune code.
    pub code: String,
    pub name: String,
}

/// The geography under audit: its communes, the web domains claimed by the
/// destination, and the establishment categories to census.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub slug: String,
    pub name: String,
    /// Parent intercommunal unit, when aggregates are only published there.
    pub epci_code: Option<String>,
    pub communes: Vec<Commune>,
    pub domains: Vec<String>,
    pub categories: Vec<String>,
    pub center_lat: f64,
    pub center_lng: f64,
    pub radius_km: f64,
}

// ---------------------------------------------------------------------------
// Audit run
// ---------------------------------------------------------------------------

/// One audit execution for one destination. Owned by the run coordinator and
/// mutated only through the merge operations in `merge.rs`. Never deleted,
/// only superseded by re-running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRun {
    pub id: Uuid,
    pub destination: Destination,
    #[serde(default)]
    pub statuses: BTreeMap<String, StageStatus>,
    /// Merged result document, keyed by stage name.
    #[serde(default)]
    pub stages: BTreeMap<String, StageResult>,
    #[serde(default)]
    pub costs: CostLedger,
    #[serde(default)]
    pub total_cost_cents: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuditRun {
    pub fn new(destination: Destination) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            destination,
            statuses: BTreeMap::new(),
            stages: BTreeMap::new(),
            costs: CostLedger::new(),
            total_cost_cents: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn stage_status(&self, stage: &str) -> StageStatus {
        self.statuses
            .get(stage)
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    pub fn stage_payload(&self, stage: &str) -> Option<&serde_json::Value> {
        self.stages.get(stage).map(|r| &r.payload)
    }
}

// ---------------------------------------------------------------------------
// Candidate entity
// ---------------------------------------------------------------------------

/// One real-world establishment as seen by one source. Immutable once
/// fetched; two sources routinely describe the same establishment under
/// different names and partial addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateEntity {
    pub source: String,
    pub name: String,
    pub normalized_name: String,
    pub category: String,
    pub postal_code: Option<String>,
    pub address: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl CandidateEntity {
    pub fn new(source: impl Into<String>, name: impl Into<String>, category: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source: source.into(),
            normalized_name: normalize_name(&name),
            name,
            category: category.into(),
            postal_code: None,
            address: None,
            lat: None,
            lng: None,
        }
    }
}

/// Legal-form suffixes dropped during name normalization. French registries
/// append these; listing providers rarely do.
const LEGAL_FORMS: &[&str] = &[
    "sarl", "sas", "sasu", "sa", "eurl", "sci", "snc", "scop", "cie",
];

/// Normalize an establishment name for comparison: case-fold, strip
/// diacritics, drop legal-form tokens (plain or dotted), collapse
/// punctuation into spaces.
pub fn normalize_name(raw: &str) -> String {
    // Lowercase first so the accent table sees every accented char in one
    // case ("HÔTEL" and "Hôtel" fold identically).
    let folded: String = raw
        .chars()
        .flat_map(char::to_lowercase)
        .flat_map(fold_char)
        .collect();
    let mut tokens: Vec<&str> = folded
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty() && !LEGAL_FORMS.contains(t))
        .collect();
    strip_dotted_legal_form(&mut tokens);
    tokens.join(" ")
}

fn fold_char(c: char) -> impl Iterator<Item = char> {
    let mapped: &str = match c {
        'à' | 'â' | 'ä' | 'á' => "a",
        'é' | 'è' | 'ê' | 'ë' => "e",
        'î' | 'ï' | 'í' => "i",
        'ô' | 'ö' | 'ó' => "o",
        'ù' | 'û' | 'ü' | 'ú' => "u",
        'ç' => "c",
        'ÿ' => "y",
        'ñ' => "n",
        'œ' => "oe",
        'æ' => "ae",
        _ => {
            return vec![c].into_iter();
        }
    };
    mapped.chars().collect::<Vec<_>>().into_iter()
}

/// "S.A.S." tokenizes into single letters. When a trailing run of
/// single-letter tokens spells a legal form, drop it (longest run first, so
/// a real trailing initial before the suffix survives).
fn strip_dotted_legal_form(tokens: &mut Vec<&str>) {
    let tail = tokens.iter().rev().take_while(|t| t.len() == 1).count();
    for k in (2..=tail).rev() {
        let spelled: String = tokens[tokens.len() - k..].concat();
        if LEGAL_FORMS.contains(&spelled.as_str()) {
            tokens.truncate(tokens.len() - k);
            return;
        }
    }
}
