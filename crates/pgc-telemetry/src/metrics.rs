//! Metrics collection and reporting

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram, Unit};
use pgc_core::{Decision, Outcome};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Register descriptions for every metric the service emits.
///
/// Call once after installing a recorder.
pub fn describe_metrics() {
    describe_counter!("pgc_decisions_total", "Authorization decisions by outcome");
    describe_histogram!(
        "pgc_decision_latency_us",
        Unit::Microseconds,
        "Time to produce a single decision"
    );
    describe_counter!("pgc_cache_lookups_total", "Enforcement cache lookups by result");
    describe_counter!("pgc_cache_evictions_total", "Entries evicted from the enforcement cache");
    describe_counter!("pgc_batches_total", "Batch evaluations by strategy");
    describe_histogram!("pgc_batch_size", "Contexts per batch evaluation");
    describe_counter!("pgc_refresh_total", "Rule-set refreshes by result");
    describe_counter!("pgc_rules_rejected_total", "Rules rejected during ingestion by stage");
    describe_gauge!("pgc_rule_set_version", "Version of the active rule set");
    tracing::debug!("Metric descriptions registered");
}

/// In-process decision counters, cheap to clone and share
#[derive(Clone)]
pub struct DecisionMetrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    decisions: AtomicU64,
    permits: AtomicU64,
    denies: AtomicU64,
    errors: AtomicU64,
    cache_hits: AtomicU64,
    penalized: AtomicU64,
    total_latency_us: AtomicU64,
    batches: AtomicU64,
    batched_decisions: AtomicU64,
}

impl DecisionMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                decisions: AtomicU64::new(0),
                permits: AtomicU64::new(0),
                denies: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                penalized: AtomicU64::new(0),
                total_latency_us: AtomicU64::new(0),
                batches: AtomicU64::new(0),
                batched_decisions: AtomicU64::new(0),
            }),
        }
    }

    /// Record a finished decision here and through the metrics facade
    pub fn record_decision(&self, decision: &Decision) {
        let inner = &self.inner;
        inner.decisions.fetch_add(1, Ordering::Relaxed);

        let bucket = match decision.outcome {
            Outcome::Permit => &inner.permits,
            Outcome::Deny => &inner.denies,
            Outcome::Error => &inner.errors,
        };
        bucket.fetch_add(1, Ordering::Relaxed);

        if decision.cache_hit {
            inner.cache_hits.fetch_add(1, Ordering::Relaxed);
        }
        if decision.governance_penalty > 0.0 {
            inner.penalized.fetch_add(1, Ordering::Relaxed);
        }

        let latency_us = (decision.latency_ms * 1000.0).max(0.0);
        inner
            .total_latency_us
            .fetch_add(latency_us as u64, Ordering::Relaxed);

        counter!("pgc_decisions_total", "outcome" => decision.outcome.as_str()).increment(1);
        histogram!("pgc_decision_latency_us").record(latency_us);
    }

    /// Record a completed batch
    pub fn record_batch(&self, strategy: &'static str, size: usize) {
        self.inner.batches.fetch_add(1, Ordering::Relaxed);
        self.inner
            .batched_decisions
            .fetch_add(size as u64, Ordering::Relaxed);

        counter!("pgc_batches_total", "strategy" => strategy).increment(1);
        histogram!("pgc_batch_size").record(size as f64);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = &self.inner;
        MetricsSnapshot {
            decisions: inner.decisions.load(Ordering::Relaxed),
            permits: inner.permits.load(Ordering::Relaxed),
            denies: inner.denies.load(Ordering::Relaxed),
            errors: inner.errors.load(Ordering::Relaxed),
            cache_hits: inner.cache_hits.load(Ordering::Relaxed),
            penalized: inner.penalized.load(Ordering::Relaxed),
            total_latency_us: inner.total_latency_us.load(Ordering::Relaxed),
            batches: inner.batches.load(Ordering::Relaxed),
            batched_decisions: inner.batched_decisions.load(Ordering::Relaxed),
        }
    }
}

impl Default for DecisionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of current metrics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub decisions: u64,
    pub permits: u64,
    pub denies: u64,
    pub errors: u64,
    pub cache_hits: u64,
    pub penalized: u64,
    pub total_latency_us: u64,
    pub batches: u64,
    pub batched_decisions: u64,
}

impl MetricsSnapshot {
    /// Average latency per decision
    pub fn avg_latency_us(&self) -> u64 {
        if self.decisions == 0 {
            0
        } else {
            self.total_latency_us / self.decisions
        }
    }

    /// Share of decisions answered from the cache
    pub fn cache_hit_rate(&self) -> f64 {
        if self.decisions == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.decisions as f64
        }
    }

    /// Share of decisions that ended in an error
    pub fn error_rate(&self) -> f64 {
        if self.decisions == 0 {
            0.0
        } else {
            self.errors as f64 / self.decisions as f64
        }
    }
}
