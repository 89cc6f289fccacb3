//! Configuration for the review engine.
//!
//! A single explicit [`ReviewConfig`] is threaded through the orchestrator
//! constructor; per-tenant overrides are registered on the orchestrator.
//! Nothing is read from ambient state.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, ReviewError};

/// An exact fraction used for rollup thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fraction {
    pub numerator: u32,
    pub denominator: u32,
}

impl Fraction {
    pub const fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Whether `count` out of `total` is strictly more than this fraction.
    ///
    /// Compared over integers (`count * den > num * total`), so there is no
    /// rounding: with 1/3, one of two is over, one of three is not.
    pub fn exceeded_by(&self, count: usize, total: usize) -> bool {
        if total == 0 {
            return false;
        }
        (count as u64) * (self.denominator as u64) > (self.numerator as u64) * (total as u64)
    }
}

/// Thresholds for rolling per-criterion ratings into one overall rating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupPolicy {
    /// Overall is red when more than this share of criteria are red.
    pub red_fraction: Fraction,

    /// Overall is at least amber when more than this share are amber.
    pub amber_fraction: Fraction,
}

impl Default for RollupPolicy {
    fn default() -> Self {
        Self {
            red_fraction: Fraction::new(1, 3),
            amber_fraction: Fraction::new(1, 3),
        }
    }
}

/// Engine configuration. Durations are stored in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// Job deadline when the request does not carry one.
    pub default_deadline_ms: u64,

    /// Share of the job deadline given to classification.
    pub identify_fraction: f64,

    /// Share of the job deadline given to citation verification.
    pub verify_fraction: f64,

    /// Per evaluation task (retrieval plus model call, including the retry).
    pub task_timeout_ms: u64,

    /// Per knowledge-source search call.
    pub search_timeout_ms: u64,

    /// Per language-model call.
    pub llm_timeout_ms: u64,

    /// Per authoritative-source lookup.
    pub lookup_timeout_ms: u64,

    /// Classification confidence below this fails the job with
    /// `ClassificationAmbiguous`.
    pub classification_threshold: f64,

    /// How many candidates to surface on an ambiguous classification.
    pub candidate_count: usize,

    /// Concurrent evaluation tasks across all jobs (W).
    pub evaluation_workers: usize,

    /// Concurrent citation lookups across all jobs (V).
    pub verification_workers: usize,

    /// Excerpts requested from each knowledge source.
    pub search_limit: usize,

    /// Excerpts kept in the model context.
    pub max_context_excerpts: usize,

    /// Characters of excerpt text kept in the model context.
    pub max_context_chars: usize,

    /// Token-overlap similarity at which asserted text counts as supported.
    pub match_threshold: f64,

    /// Confidence is `low` when more than this share of citations were
    /// removed.
    pub removed_citation_fraction: f64,

    /// Retry a task once after its own timeout, when the job deadline
    /// leaves room. Off by default: a timeout is terminal for the task.
    pub retry_timeouts: bool,

    /// Jurisdiction authoritative documents must belong to. `None` skips
    /// the check.
    pub jurisdiction: Option<String>,

    pub rollup: RollupPolicy,

    /// Progress events buffered per subscriber before the oldest drop.
    pub event_buffer: usize,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: 300_000,
            identify_fraction: 0.10,
            verify_fraction: 0.20,
            task_timeout_ms: 120_000,
            search_timeout_ms: 10_000,
            llm_timeout_ms: 45_000,
            lookup_timeout_ms: 10_000,
            classification_threshold: 0.6,
            candidate_count: 3,
            evaluation_workers: 4,
            verification_workers: 8,
            search_limit: 8,
            max_context_excerpts: 12,
            max_context_chars: 12_000,
            match_threshold: 0.6,
            removed_citation_fraction: 0.25,
            retry_timeouts: false,
            jurisdiction: None,
            rollup: RollupPolicy::default(),
            event_buffer: 256,
        }
    }
}

impl ReviewConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline_ms = deadline.as_millis() as u64;
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_search_timeout(mut self, timeout: Duration) -> Self {
        self.search_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_classification_threshold(mut self, threshold: f64) -> Self {
        self.classification_threshold = threshold;
        self
    }

    pub fn with_evaluation_workers(mut self, workers: usize) -> Self {
        self.evaluation_workers = workers;
        self
    }

    pub fn with_verification_workers(mut self, workers: usize) -> Self {
        self.verification_workers = workers;
        self
    }

    pub fn with_jurisdiction(mut self, jurisdiction: impl Into<String>) -> Self {
        self.jurisdiction = Some(jurisdiction.into());
        self
    }

    pub fn with_rollup(mut self, rollup: RollupPolicy) -> Self {
        self.rollup = rollup;
        self
    }

    pub fn with_retry_timeouts(mut self, retry: bool) -> Self {
        self.retry_timeouts = retry;
        self
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.default_deadline_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_millis(self.search_timeout_ms)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_timeout_ms)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    /// Classification sub-deadline for a job deadline.
    pub fn identify_budget(&self, deadline: Duration) -> Duration {
        deadline.mul_f64(self.identify_fraction)
    }

    /// Verification sub-deadline for a job deadline.
    pub fn verify_budget(&self, deadline: Duration) -> Duration {
        deadline.mul_f64(self.verify_fraction)
    }

    /// Check ranges and the timeout layering
    /// (job deadline > stage budget > per-call timeout).
    pub fn validate(&self) -> Result<()> {
        fn fraction_ok(value: f64) -> bool {
            value > 0.0 && value < 1.0
        }
        fn unit_ok(value: f64) -> bool {
            (0.0..=1.0).contains(&value)
        }

        if !fraction_ok(self.identify_fraction) || !fraction_ok(self.verify_fraction) {
            return Err(ReviewError::Config(
                "stage fractions must be between 0 and 1 (exclusive)".into(),
            ));
        }
        if self.identify_fraction + self.verify_fraction >= 1.0 {
            return Err(ReviewError::Config(
                "identify and verify fractions must leave time for processing".into(),
            ));
        }
        if !unit_ok(self.classification_threshold)
            || !unit_ok(self.match_threshold)
            || !unit_ok(self.removed_citation_fraction)
        {
            return Err(ReviewError::Config("thresholds must be within 0..=1".into()));
        }
        if self.evaluation_workers == 0 || self.verification_workers == 0 {
            return Err(ReviewError::Config("worker pools need at least one slot".into()));
        }
        if self.candidate_count == 0 || self.event_buffer == 0 {
            return Err(ReviewError::Config(
                "candidate_count and event_buffer must be positive".into(),
            ));
        }
        for (name, fraction) in [
            ("red_fraction", self.rollup.red_fraction),
            ("amber_fraction", self.rollup.amber_fraction),
        ] {
            if fraction.denominator == 0 || fraction.numerator > fraction.denominator {
                return Err(ReviewError::Config(format!("{name} must be a proper fraction")));
            }
        }

        let deadline = self.default_deadline();
        if self.task_timeout() >= deadline {
            return Err(ReviewError::Config(
                "task timeout must be shorter than the job deadline".into(),
            ));
        }
        if self.llm_timeout() >= self.task_timeout() || self.search_timeout() >= self.task_timeout()
        {
            return Err(ReviewError::Config(
                "call timeouts must be shorter than the task timeout".into(),
            ));
        }
        if self.lookup_timeout() >= self.verify_budget(deadline) {
            return Err(ReviewError::Config(
                "lookup timeout must be shorter than the verification budget".into(),
            ));
        }
        Ok(())
    }
}
