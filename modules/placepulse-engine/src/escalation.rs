//! Source-escalation resolver.
//!
//! One logical metric may be reported by several providers with different
//! coverage, and none of them can distinguish "this entity has zero
//! presence" from "I have no data for this entity". The resolver walks an
//! ordered ladder of (provider, query-variant) steps strictly in sequence —
//! each step only runs because the previous one came back empty — and stops
//! at the first confident value. Only exhausting the whole ladder earns the
//! right to report a zero.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use placepulse_common::{PartialError, PlacePulseError};

use crate::cost::{CostTracker, UnitCost};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// A provider reported a confident non-empty value.
    Measured,
    /// Every ladder step was attempted and returned empty or failed.
    ConfirmedZero,
    /// The ladder was not fully walked (provider family unconfigured, or the
    /// spend ceiling stopped it), so absence is unproven.
    Unmeasured,
}

/// Classification of one ladder step's raw response.
#[derive(Debug)]
pub enum StepOutcome<T> {
    /// Confident non-empty measurement. Stops the ladder.
    Value(T),
    /// Well-formed response with no data. Ambiguous — advance the ladder.
    Empty,
    /// Transport or provider failure. Not evidence of absence; advance.
    Failed(String),
    /// Provider unconfigured or step not applicable. No call was made.
    Skipped,
}

/// One step's report: the classified outcome, plus an optional corrected
/// query that later steps substitute for their own variant (e.g. a validated
/// domain replacing an uncertain guess).
#[derive(Debug)]
pub struct StepReport<T> {
    pub outcome: StepOutcome<T>,
    pub correction: Option<String>,
}

impl<T> StepReport<T> {
    pub fn value(v: T) -> Self {
        Self { outcome: StepOutcome::Value(v), correction: None }
    }

    pub fn empty() -> Self {
        Self { outcome: StepOutcome::Empty, correction: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self { outcome: StepOutcome::Failed(message.into()), correction: None }
    }

    pub fn skipped() -> Self {
        Self { outcome: StepOutcome::Skipped, correction: None }
    }

    pub fn with_correction(mut self, corrected: impl Into<String>) -> Self {
        self.correction = Some(corrected.into());
        self
    }
}

// ---------------------------------------------------------------------------
// LadderStep
// ---------------------------------------------------------------------------

/// One (provider, query-variant) rung. Implementations own the
/// provider-specific emptiness rule; the resolver loop stays
/// provider-agnostic.
#[async_trait]
pub trait LadderStep<T>: Send + Sync {
    fn provider(&self) -> &str;
    fn variant(&self) -> &str;

    /// Execute the step. `correction` carries a substituted query from an
    /// earlier step's success, if any.
    async fn attempt(&self, correction: Option<&str>) -> StepReport<T>;
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct Resolution<T> {
    pub metric: String,
    pub value: Option<T>,
    pub confidence: Confidence,
    /// The provider that supplied the accepted value, if any.
    pub provenance: Option<String>,
    /// Attempted calls per provider. Skipped steps are absent: no call, no
    /// cost.
    pub attempts: BTreeMap<String, u32>,
    pub errors: Vec<PartialError>,
}

/// Walk the ladder strictly in order. Never parallel: step N+1's necessity
/// depends on step N's emptiness.
pub async fn resolve<T>(
    metric: &str,
    ladder: &[Box<dyn LadderStep<T>>],
    costs: &CostTracker,
) -> Result<Resolution<T>, PlacePulseError> {
    if ladder.is_empty() {
        return Err(PlacePulseError::Config(format!(
            "escalation ladder for {metric} has no steps"
        )));
    }

    let mut attempts: BTreeMap<String, u32> = BTreeMap::new();
    let mut errors: Vec<PartialError> = Vec::new();
    let mut correction: Option<String> = None;
    let mut ceiling_hit = false;

    for step in ladder {
        let provider = step.provider().to_string();
        let variant = step.variant().to_string();

        if !costs.has_budget(UnitCost::for_provider(&provider)) {
            warn!(metric, provider, variant, "Spend ceiling reached; stopping ladder");
            errors.push(PartialError::new(
                provider,
                "spend ceiling reached before attempt",
            ));
            ceiling_hit = true;
            break;
        }

        let report = step.attempt(correction.as_deref()).await;

        if let Some(corrected) = report.correction {
            debug!(metric, provider, corrected, "Step produced a query correction");
            correction = Some(corrected);
        }

        match report.outcome {
            StepOutcome::Skipped => {
                debug!(metric, provider, variant, "Step skipped");
                continue;
            }
            StepOutcome::Value(v) => {
                *attempts.entry(provider.clone()).or_default() += 1;
                costs.record(&provider);
                info!(metric, provider, variant, "Confident value");
                return Ok(Resolution {
                    metric: metric.to_string(),
                    value: Some(v),
                    confidence: Confidence::Measured,
                    provenance: Some(provider),
                    attempts,
                    errors,
                });
            }
            StepOutcome::Empty => {
                *attempts.entry(provider.clone()).or_default() += 1;
                costs.record(&provider);
                debug!(metric, provider, variant, "Empty — escalating");
            }
            StepOutcome::Failed(message) => {
                *attempts.entry(provider.clone()).or_default() += 1;
                costs.record(&provider);
                warn!(metric, provider, variant, error = %message, "Step failed — escalating");
                errors.push(PartialError::new(provider, message));
            }
        }
    }

    // A zero is only confirmed by walking the whole ladder; an all-skipped
    // or ceiling-stopped ladder proved nothing.
    let confidence = if attempts.is_empty() || ceiling_hit {
        Confidence::Unmeasured
    } else {
        Confidence::ConfirmedZero
    };
    info!(metric, ?confidence, "Ladder exhausted");

    Ok(Resolution {
        metric: metric.to_string(),
        value: None,
        confidence,
        provenance: None,
        attempts,
        errors,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    /// Step scripted with a fixed report; records its execution order.
    struct Scripted {
        provider: &'static str,
        variant: &'static str,
        report: Mutex<Option<StepReport<u64>>>,
        log: std::sync::Arc<Mutex<Vec<&'static str>>>,
        saw_correction: std::sync::Arc<Mutex<Option<Option<String>>>>,
    }

    impl Scripted {
        fn new(
            provider: &'static str,
            variant: &'static str,
            report: StepReport<u64>,
            log: std::sync::Arc<Mutex<Vec<&'static str>>>,
        ) -> Box<dyn LadderStep<u64>> {
            Box::new(Self {
                provider,
                variant,
                report: Mutex::new(Some(report)),
                log,
                saw_correction: Default::default(),
            })
        }
    }

    #[async_trait]
    impl LadderStep<u64> for Scripted {
        fn provider(&self) -> &str {
            self.provider
        }

        fn variant(&self) -> &str {
            self.variant
        }

        async fn attempt(&self, correction: Option<&str>) -> StepReport<u64> {
            self.log.lock().unwrap().push(self.variant);
            *self.saw_correction.lock().unwrap() = Some(correction.map(str::to_string));
            self.report.lock().unwrap().take().expect("step attempted twice")
        }
    }

    fn log() -> std::sync::Arc<Mutex<Vec<&'static str>>> {
        std::sync::Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn timeout_then_empty_is_confirmed_zero() {
        let order = log();
        let ladder = vec![
            Scripted::new("a", "bare", StepReport::failed("timed out"), order.clone()),
            Scripted::new("b", "www", StepReport::empty(), order.clone()),
        ];
        let costs = CostTracker::new(0);

        let res = resolve("metric", &ladder, &costs).await.unwrap();
        assert_eq!(res.confidence, Confidence::ConfirmedZero);
        assert!(res.value.is_none());
        assert!(res.provenance.is_none());
        // Both attempts counted, even the failed one.
        assert_eq!(res.attempts["a"], 1);
        assert_eq!(res.attempts["b"], 1);
        assert_eq!(res.errors.len(), 1);
        assert_eq!(*order.lock().unwrap(), vec!["bare", "www"]);
    }

    #[tokio::test]
    async fn first_confident_value_stops_the_ladder() {
        let order = log();
        let ladder = vec![
            Scripted::new("a", "bare", StepReport::empty(), order.clone()),
            Scripted::new("b", "www", StepReport::value(42), order.clone()),
            Scripted::new("c", "never", StepReport::value(99), order.clone()),
        ];
        let costs = CostTracker::new(0);

        let res = resolve("metric", &ladder, &costs).await.unwrap();
        assert_eq!(res.confidence, Confidence::Measured);
        assert_eq!(res.value, Some(42));
        assert_eq!(res.provenance.as_deref(), Some("b"));
        // Third step never ran.
        assert_eq!(*order.lock().unwrap(), vec!["bare", "www"]);
        assert!(!res.attempts.contains_key("c"));
    }

    #[tokio::test]
    async fn empty_ladder_is_a_configuration_error() {
        let ladder: Vec<Box<dyn LadderStep<u64>>> = Vec::new();
        let costs = CostTracker::new(0);
        assert!(resolve("metric", &ladder, &costs).await.is_err());
    }

    #[tokio::test]
    async fn all_steps_skipped_yields_unmeasured() {
        let order = log();
        let ladder = vec![
            Scripted::new("a", "bare", StepReport::skipped(), order.clone()),
            Scripted::new("a", "www", StepReport::skipped(), order.clone()),
        ];
        let costs = CostTracker::new(0);

        let res = resolve("metric", &ladder, &costs).await.unwrap();
        assert_eq!(res.confidence, Confidence::Unmeasured);
        assert!(res.attempts.is_empty());
        assert_eq!(costs.total_spent(), 0);
    }

    #[tokio::test]
    async fn correction_flows_to_later_steps() {
        let order = log();
        let validator = Scripted::new(
            "serp",
            "validate",
            StepReport::empty().with_correction("corrected.example"),
            order.clone(),
        );

        let seen = std::sync::Arc::new(Mutex::new(None));
        let retry: Box<dyn LadderStep<u64>> = Box::new(Scripted {
            provider: "a",
            variant: "corrected",
            report: Mutex::new(Some(StepReport::value(7))),
            log: order.clone(),
            saw_correction: seen.clone(),
        });

        let ladder = vec![
            Scripted::new("a", "bare", StepReport::empty(), order.clone()),
            validator,
            retry,
        ];
        let costs = CostTracker::new(0);

        let res = resolve("metric", &ladder, &costs).await.unwrap();
        assert_eq!(res.value, Some(7));
        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(Some("corrected.example".to_string()))
        );
        assert_eq!(*order.lock().unwrap(), vec!["bare", "validate", "corrected"]);
    }

    #[tokio::test]
    async fn spend_ceiling_stops_the_ladder_without_claiming_zero() {
        let order = log();
        let ladder = vec![
            Scripted::new("serp", "first", StepReport::empty(), order.clone()),
            Scripted::new("serp", "second", StepReport::empty(), order.clone()),
        ];
        // One serp call fits in a 1-cent ceiling; the second does not.
        let costs = CostTracker::new(1);

        let res = resolve("metric", &ladder, &costs).await.unwrap();
        assert_eq!(res.confidence, Confidence::Unmeasured);
        assert!(res.value.is_none());
        assert_eq!(res.attempts["serp"], 1);
        assert_eq!(res.errors.len(), 1);
        assert!(res.errors[0].message.contains("ceiling"));
        assert_eq!(*order.lock().unwrap(), vec!["first"]);
    }

    #[tokio::test]
    async fn attempts_feed_the_cost_tracker() {
        let order = log();
        let ladder = vec![
            Scripted::new("rank_index", "bare", StepReport::empty(), order.clone()),
            Scripted::new("rank_index", "www", StepReport::empty(), order.clone()),
        ];
        let costs = CostTracker::new(0);

        let _ = resolve("metric", &ladder, &costs).await.unwrap();
        assert_eq!(costs.snapshot().0["rank_index"].calls, 2);
    }
}
