//! Batch evaluation
//!
//! Small batches fan out as concurrent tasks, large ones run one context at a
//! time. Every item runs in its own task either way, so a panic in one item
//! is contained to that item's decision. Decisions come back in input order.

use futures::future::join_all;
use pgc_core::{Decision, Outcome, RequestContext};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, warn};

use crate::coordinator::DecisionCoordinator;

/// How a batch is executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStrategy {
    /// Parallel up to the configured threshold, sequential beyond it
    #[default]
    Auto,
    Parallel,
    Sequential,
}

impl BatchStrategy {
    /// Name used in summaries and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStrategy::Auto => "auto",
            BatchStrategy::Parallel => "parallel",
            BatchStrategy::Sequential => "sequential",
        }
    }
}

/// Batch thresholds and time limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Largest batch `Auto` runs in parallel
    pub parallel_threshold: usize,

    /// Limit for a single item
    pub decision_timeout: Duration,

    /// Limit for the whole batch unless the caller supplies one
    pub deadline: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            parallel_threshold: 10,
            decision_timeout: Duration::from_secs(1),
            deadline: Duration::from_secs(5),
        }
    }
}

/// Aggregate view of a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub permit_count: usize,
    pub deny_count: usize,
    pub error_count: usize,
    pub average_latency_ms: f64,
    pub cache_hit_rate: f64,
    /// Strategy actually used, never `Auto`
    pub strategy: BatchStrategy,
    pub total_latency_ms: f64,
}

impl BatchSummary {
    fn from_decisions(decisions: &[Decision], strategy: BatchStrategy, total_latency_ms: f64) -> Self {
        let count = |outcome: Outcome| decisions.iter().filter(|d| d.outcome == outcome).count();
        let total = decisions.len();

        let (average_latency_ms, cache_hit_rate) = if total == 0 {
            (0.0, 0.0)
        } else {
            let latency: f64 = decisions.iter().map(|d| d.latency_ms).sum();
            let hits = decisions.iter().filter(|d| d.cache_hit).count();
            (latency / total as f64, hits as f64 / total as f64)
        };

        Self {
            total,
            permit_count: count(Outcome::Permit),
            deny_count: count(Outcome::Deny),
            error_count: count(Outcome::Error),
            average_latency_ms,
            cache_hit_rate,
            strategy,
            total_latency_ms,
        }
    }
}

/// Decisions in input order plus their summary
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResponse {
    pub decisions: Vec<Decision>,
    pub batch_summary: BatchSummary,
}

impl DecisionCoordinator {
    /// Decide a batch of requests.
    ///
    /// Items still unfinished when `deadline` (or the configured batch
    /// deadline) passes become `Error` decisions.
    pub async fn evaluate_batch(
        self: &Arc<Self>,
        contexts: Vec<RequestContext>,
        strategy: BatchStrategy,
        deadline: Option<Duration>,
    ) -> BatchResponse {
        let started = Instant::now();
        let config = self.config().batch;
        let deadline_at = tokio::time::Instant::now() + deadline.unwrap_or(config.deadline);

        let strategy = match strategy {
            BatchStrategy::Auto if contexts.len() <= config.parallel_threshold => BatchStrategy::Parallel,
            BatchStrategy::Auto => BatchStrategy::Sequential,
            other => other,
        };

        let contexts: Vec<RequestContext> = contexts
            .into_iter()
            .map(|mut ctx| {
                ctx.request_id
                    .get_or_insert_with(|| uuid::Uuid::new_v4().to_string());
                ctx
            })
            .collect();

        debug!(size = contexts.len(), strategy = strategy.as_str(), "Evaluating batch");

        let decisions = match strategy {
            BatchStrategy::Sequential => self.run_sequential(contexts, deadline_at).await,
            _ => self.run_parallel(contexts, deadline_at).await,
        };

        let total_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.metrics().record_batch(strategy.as_str(), decisions.len());

        BatchResponse {
            batch_summary: BatchSummary::from_decisions(&decisions, strategy, total_latency_ms),
            decisions,
        }
    }

    async fn run_parallel(
        self: &Arc<Self>,
        contexts: Vec<RequestContext>,
        deadline_at: tokio::time::Instant,
    ) -> Vec<Decision> {
        let item_deadline = deadline_at.min(tokio::time::Instant::now() + self.config().batch.decision_timeout);

        let futures = contexts.into_iter().map(|ctx| {
            let request_id = request_id_of(&ctx);
            let handle = self.spawn_item(ctx);
            async move { self.settle(request_id, handle, item_deadline, deadline_at).await }
        });

        join_all(futures).await
    }

    async fn run_sequential(
        self: &Arc<Self>,
        contexts: Vec<RequestContext>,
        deadline_at: tokio::time::Instant,
    ) -> Vec<Decision> {
        let mut decisions = Vec::with_capacity(contexts.len());

        for ctx in contexts {
            let request_id = request_id_of(&ctx);
            let now = tokio::time::Instant::now();
            if now >= deadline_at {
                decisions.push(self.unfinished(request_id, "deadline exceeded"));
                continue;
            }

            let item_deadline = deadline_at.min(now + self.config().batch.decision_timeout);
            let handle = self.spawn_item(ctx);
            decisions.push(self.settle(request_id, handle, item_deadline, deadline_at).await);
        }

        decisions
    }

    fn spawn_item(self: &Arc<Self>, ctx: RequestContext) -> JoinHandle<Decision> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.evaluate(ctx).await })
    }

    /// Wait for one item, turning panics and timeouts into decisions
    async fn settle(
        &self,
        request_id: String,
        mut handle: JoinHandle<Decision>,
        item_deadline: tokio::time::Instant,
        deadline_at: tokio::time::Instant,
    ) -> Decision {
        match tokio::time::timeout_at(item_deadline, &mut handle).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => self.failed(request_id, e),
            Err(_) => {
                handle.abort();
                let reason = if tokio::time::Instant::now() >= deadline_at {
                    "deadline exceeded".to_string()
                } else {
                    format!(
                        "decision timed out after {}ms",
                        self.config().batch.decision_timeout.as_millis()
                    )
                };
                self.unfinished(request_id, reason)
            }
        }
    }

    fn unfinished(&self, request_id: String, reason: impl Into<String>) -> Decision {
        let reason = reason.into();
        warn!(request_id = %request_id, "Batch item unfinished: {}", reason);
        let decision = Decision::error(request_id, reason, self.active_version());
        self.metrics().record_decision(&decision);
        decision
    }

    /// A crashed item is denied, never permitted
    fn failed(&self, request_id: String, err: JoinError) -> Decision {
        let detail = if err.is_panic() {
            panic_message(err.into_panic())
        } else {
            "task cancelled".to_string()
        };
        error!(request_id = %request_id, "Batch item failed: {}", detail);

        let decision = Decision::new(
            request_id,
            Outcome::Deny,
            format!("evaluation failed: {}", detail),
            self.active_version(),
        );
        self.metrics().record_decision(&decision);
        decision
    }

    fn active_version(&self) -> u64 {
        self.manager().active_rule_set().map_or(0, |rs| rs.version())
    }
}

fn request_id_of(ctx: &RequestContext) -> String {
    ctx.request_id.clone().unwrap_or_default()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {}", message)
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decision(outcome: Outcome, latency_ms: f64, cache_hit: bool) -> Decision {
        let mut d = Decision::new("r", outcome, "", 1).with_latency_ms(latency_ms);
        d.cache_hit = cache_hit;
        d
    }

    #[test]
    fn test_summary_counts() {
        let decisions = vec![
            decision(Outcome::Permit, 1.0, false),
            decision(Outcome::Permit, 2.0, true),
            decision(Outcome::Deny, 3.0, false),
            decision(Outcome::Error, 2.0, false),
        ];
        let summary = BatchSummary::from_decisions(&decisions, BatchStrategy::Parallel, 9.0);

        assert_eq!(summary.total, 4);
        assert_eq!(summary.permit_count, 2);
        assert_eq!(summary.deny_count, 1);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.average_latency_ms, 2.0);
        assert_eq!(summary.cache_hit_rate, 0.25);
        assert_eq!(summary.total_latency_ms, 9.0);
    }

    #[test]
    fn test_empty_summary() {
        let summary = BatchSummary::from_decisions(&[], BatchStrategy::Sequential, 0.0);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.average_latency_ms, 0.0);
        assert_eq!(summary.cache_hit_rate, 0.0);
    }

    #[test]
    fn test_strategy_serialization() {
        assert_eq!(serde_json::to_value(BatchStrategy::Sequential).unwrap(), "sequential");
        let parsed: BatchStrategy = serde_json::from_value(serde_json::json!("parallel")).unwrap();
        assert_eq!(parsed, BatchStrategy::Parallel);
    }

    #[test]
    fn test_panic_messages() {
        assert_eq!(panic_message(Box::new("boom")), "panic: boom");
        assert_eq!(panic_message(Box::new("boom".to_string())), "panic: boom");
        assert_eq!(panic_message(Box::new(7u8)), "panic");
    }
}
