use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::{info, warn};

use placepulse_common::CostLedger;

/// Estimated cost per call in cents, by provider.
pub struct UnitCost;

impl UnitCost {
    pub const RANK_INDEX: u64 = 2;
    pub const SERP: u64 = 1;
    pub const REGISTRY: u64 = 1; // free tier but metered, round up
    pub const STATBASE: u64 = 1;
    pub const PLACES: u64 = 3; // rectangle queries are priced per cell
    pub const CLASSIFIER: u64 = 1; // ~0.3 per batch, round up

    pub fn for_provider(provider: &str) -> u64 {
        match provider {
            "rank_index" => Self::RANK_INDEX,
            "serp" => Self::SERP,
            "registry" => Self::REGISTRY,
            "statbase" => Self::STATBASE,
            "places" => Self::PLACES,
            "classifier" => Self::CLASSIFIER,
            _ => 1,
        }
    }
}

/// Tracks per-provider call counts and spend against a budget limit.
/// Thread-safe for concurrent ladders within one stage.
pub struct CostTracker {
    /// Limit in cents. 0 = unlimited.
    limit_cents: u64,
    calls: Mutex<BTreeMap<String, u32>>,
    spent_cents: AtomicU64,
}

impl CostTracker {
    pub fn new(limit_cents: u64) -> Self {
        Self {
            limit_cents,
            calls: Mutex::new(BTreeMap::new()),
            spent_cents: AtomicU64::new(0),
        }
    }

    /// Record one call to a provider. Every attempt counts — success, empty,
    /// or error — because the provider bills for all of them. Returns false
    /// if the budget is now exceeded (the call is still recorded).
    pub fn record(&self, provider: &str) -> bool {
        let unit = UnitCost::for_provider(provider);
        {
            let mut calls = self.calls.lock().expect("cost tracker poisoned");
            *calls.entry(provider.to_string()).or_default() += 1;
        }
        let spent = self.spent_cents.fetch_add(unit, Ordering::Relaxed) + unit;
        if self.limit_cents > 0 && spent > self.limit_cents {
            warn!(provider, spent, limit = self.limit_cents, "Budget exceeded");
            return false;
        }
        true
    }

    /// Check if there's budget remaining for an operation.
    pub fn has_budget(&self, cost_cents: u64) -> bool {
        if self.limit_cents == 0 {
            return true;
        }
        self.spent_cents.load(Ordering::Relaxed) + cost_cents <= self.limit_cents
    }

    pub fn total_spent(&self) -> u64 {
        self.spent_cents.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.limit_cents > 0
    }

    /// Materialize the tracked calls as a ledger for merging into the run.
    pub fn snapshot(&self) -> CostLedger {
        let calls = self.calls.lock().expect("cost tracker poisoned");
        let mut ledger = CostLedger::new();
        for (provider, count) in calls.iter() {
            ledger.record(provider, *count, UnitCost::for_provider(provider));
        }
        ledger
    }

    pub fn log_status(&self) {
        if self.is_active() {
            info!(
                spent_cents = self.total_spent(),
                limit_cents = self.limit_cents,
                "Budget status"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_budget_always_has_budget() {
        let tracker = CostTracker::new(0);
        assert!(tracker.has_budget(1000));
        assert!(tracker.record("serp"));
        assert!(!tracker.is_active());
    }

    #[test]
    fn snapshot_prices_calls_per_provider() {
        let tracker = CostTracker::new(0);
        tracker.record("rank_index");
        tracker.record("rank_index");
        tracker.record("serp");

        let ledger = tracker.snapshot();
        assert_eq!(ledger.0["rank_index"].calls, 2);
        assert_eq!(ledger.0["rank_index"].total_cents, 2 * UnitCost::RANK_INDEX);
        assert_eq!(ledger.grand_total(), 2 * UnitCost::RANK_INDEX + UnitCost::SERP);
    }

    #[test]
    fn exceeded_budget_still_records() {
        let tracker = CostTracker::new(2);
        assert!(tracker.record("serp"));
        assert!(tracker.record("serp"));
        assert!(!tracker.record("serp"));
        assert_eq!(tracker.total_spent(), 3);
        assert_eq!(tracker.snapshot().0["serp"].calls, 3);
    }
}
