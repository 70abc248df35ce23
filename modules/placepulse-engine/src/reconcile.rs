//! Fuzzy entity reconciliation.
//!
//! Two independent registries describe the same physical establishments with
//! no shared identifier: the business registry writes "HOTEL DU LAC SARL",
//! the listings provider writes "Hôtel du Lac". An exact join under-counts
//! duplicates; a bipartite optimal matching is overkill for establishment
//! names, which rarely cluster into ambiguous near-ties within one category
//! and geography. A weighted similarity score with greedy first-fit matching
//! sits in between.

use std::collections::HashSet;

use serde::Serialize;
use tracing::debug;

use placepulse_common::CandidateEntity;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    /// A pair scoring at or above this is a duplicate.
    pub threshold: f64,
    pub exact_bonus: f64,
    pub substring_bonus: f64,
    pub edit_bonus: f64,
    pub multi_token_bonus: f64,
    pub single_token_bonus: f64,
    pub postal_bonus: f64,
    pub address_bonus: f64,
    /// Levenshtein distance at or below this earns the edit bonus.
    pub max_edit_distance: usize,
    /// Substring containment only counts when both names are at least this
    /// long, to avoid trivial short-token false positives.
    pub min_substring_len: usize,
    /// A single shared token only counts when both names have at most this
    /// many significant tokens.
    pub max_short_name_tokens: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            exact_bonus: 1.0,
            substring_bonus: 0.6,
            edit_bonus: 0.4,
            multi_token_bonus: 0.6,
            single_token_bonus: 0.3,
            postal_bonus: 0.2,
            address_bonus: 0.1,
            max_edit_distance: 2,
            min_substring_len: 6,
            max_short_name_tokens: 2,
        }
    }
}

/// Articles and connectives that carry no identity.
const STOP_WORDS: &[&str] = &[
    "le", "la", "les", "l", "de", "du", "des", "d", "et", "au", "aux", "a", "en",
];

/// Category-generic words: every hotel name contains "hotel".
const GENERIC_WORDS: &[&str] = &[
    "hotel", "camping", "residence", "gite", "gites", "chambre", "chambres", "hote", "hotes",
    "auberge", "village", "club", "restaurant", "spa",
];

fn significant_tokens(normalized: &str) -> Vec<&str> {
    normalized
        .split(' ')
        .filter(|t| !t.is_empty() && !STOP_WORDS.contains(t) && !GENERIC_WORDS.contains(t))
        .collect()
}

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Weighted similarity between two entities from different sources.
pub fn pair_score(a: &CandidateEntity, b: &CandidateEntity, cfg: &ReconcileConfig) -> f64 {
    let na = a.normalized_name.as_str();
    let nb = b.normalized_name.as_str();
    if na.is_empty() || nb.is_empty() {
        return 0.0;
    }

    let mut score = 0.0;

    // Name similarity family — strongest applicable signal only.
    if na == nb {
        score += cfg.exact_bonus;
    } else if na.len() >= cfg.min_substring_len
        && nb.len() >= cfg.min_substring_len
        && (na.contains(nb) || nb.contains(na))
    {
        score += cfg.substring_bonus;
    } else if strsim::levenshtein(na, nb) <= cfg.max_edit_distance {
        score += cfg.edit_bonus;
    }

    // Token overlap on significant words.
    let ta = significant_tokens(na);
    let tb: HashSet<&str> = significant_tokens(nb).into_iter().collect();
    let shared = ta.iter().filter(|t| tb.contains(**t)).count();
    if shared >= 2 {
        score += cfg.multi_token_bonus;
    } else if shared == 1
        && ta.len() <= cfg.max_short_name_tokens
        && tb.len() <= cfg.max_short_name_tokens
    {
        // One shared word is weak evidence on long names.
        score += cfg.single_token_bonus;
    }

    // Location corroboration.
    if let (Some(pa), Some(pb)) = (&a.postal_code, &b.postal_code) {
        if pa == pb {
            score += cfg.postal_bonus;
            if shared_leading_address_token(a, b) {
                score += cfg.address_bonus;
            }
        }
    }

    score
}

fn shared_leading_address_token(a: &CandidateEntity, b: &CandidateEntity) -> bool {
    match (&a.address, &b.address) {
        (Some(aa), Some(ab)) => {
            let first = |s: &str| -> Option<String> {
                s.split_whitespace().next().map(str::to_lowercase)
            };
            match (first(aa), first(ab)) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            }
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct MatchDecision {
    pub a_index: usize,
    pub b_index: usize,
    pub score: f64,
}

#[derive(Debug, Serialize)]
pub struct Reconciliation {
    pub a_only: usize,
    pub b_only: usize,
    pub both: usize,
    pub total: usize,
    pub decisions: Vec<MatchDecision>,
}

impl Reconciliation {
    /// Indices of B entities that were matched to some A entity.
    pub fn matched_b(&self) -> HashSet<usize> {
        self.decisions.iter().map(|d| d.b_index).collect()
    }
}

/// Merge two candidate lists into deduplicated provenance counts.
///
/// Greedy first-fit: A entities in input order, each taking the first
/// not-yet-matched B entity whose score clears the threshold. Guarantees
/// `total = a_only + b_only + both` by construction.
pub fn reconcile(
    list_a: &[CandidateEntity],
    list_b: &[CandidateEntity],
    cfg: &ReconcileConfig,
) -> Reconciliation {
    let mut b_taken = vec![false; list_b.len()];
    let mut decisions = Vec::new();

    for (ai, a) in list_a.iter().enumerate() {
        for (bi, b) in list_b.iter().enumerate() {
            if b_taken[bi] {
                continue;
            }
            let score = pair_score(a, b, cfg);
            if score >= cfg.threshold {
                debug!(
                    a = a.name.as_str(),
                    b = b.name.as_str(),
                    score,
                    "Duplicate pair"
                );
                b_taken[bi] = true;
                decisions.push(MatchDecision { a_index: ai, b_index: bi, score });
                break;
            }
        }
    }

    let both = decisions.len();
    let a_only = list_a.len() - both;
    let b_only = b_taken.iter().filter(|t| !**t).count();

    Reconciliation {
        a_only,
        b_only,
        both,
        total: a_only + b_only + both,
        decisions,
    }
}
