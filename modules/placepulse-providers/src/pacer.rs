//! Per-provider call pacing.
//!
//! One central gate instead of ad-hoc sleeps at call sites: every outbound
//! call first asks the pacer for a permit. The pacer enforces a minimum
//! inter-call spacing per provider (a next-free-slot clock, so a burst of
//! logically-parallel work queues up at the provider's tolerated rate) and
//! an optional max in-flight count. Different providers are independent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct PacerConfig {
    /// Minimum spacing between consecutive calls to the same provider.
    pub min_spacing: Duration,
    /// Maximum concurrent in-flight calls to the same provider.
    pub max_in_flight: Option<usize>,
}

impl Default for PacerConfig {
    fn default() -> Self {
        Self {
            min_spacing: Duration::from_millis(200),
            max_in_flight: None,
        }
    }
}

struct Lane {
    spacing: Duration,
    /// Earliest instant the next call may start.
    next_slot: tokio::sync::Mutex<Instant>,
    slots: Option<Arc<Semaphore>>,
}

impl Lane {
    fn new(cfg: PacerConfig) -> Self {
        Self {
            spacing: cfg.min_spacing,
            next_slot: tokio::sync::Mutex::new(Instant::now()),
            slots: cfg.max_in_flight.map(|n| Arc::new(Semaphore::new(n))),
        }
    }
}

/// Held for the duration of one provider call. Dropping it releases the
/// in-flight slot; the spacing reservation is consumed at acquisition.
pub struct Permit {
    _slot: Option<OwnedSemaphorePermit>,
}

/// Shared across all runs and stages: the per-provider rate budget is the one
/// resource concurrent callers contend on, regardless of who issued the call.
pub struct Pacer {
    lanes: Mutex<HashMap<String, Arc<Lane>>>,
    default: PacerConfig,
}

impl Pacer {
    pub fn new(default: PacerConfig) -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
            default,
        }
    }

    /// Override pacing for one provider. Later calls to `admit` for that
    /// provider use this configuration; an existing lane is replaced.
    pub fn configure(&self, provider: &str, cfg: PacerConfig) {
        let mut lanes = self.lanes.lock().expect("pacer lane map poisoned");
        lanes.insert(provider.to_string(), Arc::new(Lane::new(cfg)));
    }

    fn lane(&self, provider: &str) -> Arc<Lane> {
        let mut lanes = self.lanes.lock().expect("pacer lane map poisoned");
        lanes
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Lane::new(self.default)))
            .clone()
    }

    /// Wait until the provider's rate budget admits one more call.
    pub async fn admit(&self, provider: &str) -> Result<Permit> {
        let lane = self.lane(provider);

        let slot = match &lane.slots {
            Some(sem) => Some(
                sem.clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| anyhow::anyhow!("pacer semaphore closed for {provider}"))?,
            ),
            None => None,
        };

        // Claim the next free slot, then wait outside the lock so queued
        // callers each reserve their own slot in arrival order.
        let my_slot = {
            let mut next = lane.next_slot.lock().await;
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + lane.spacing;
            slot
        };

        let wait = my_slot.saturating_duration_since(Instant::now());
        if !wait.is_zero() {
            debug!(provider, wait_ms = wait.as_millis() as u64, "Pacing call");
        }
        tokio::time::sleep_until(my_slot).await;

        Ok(Permit { _slot: slot })
    }
}
