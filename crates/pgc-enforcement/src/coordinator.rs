//! Decision coordinator
//!
//! Turns one request context into one decision: resolve the active rule set,
//! consult the cache, evaluate the target query in a request-scoped
//! evaluator, score penalties and remember the answer.

use chrono::Utc;
use pgc_core::{fingerprint, Atom, Decision, Outcome, RequestContext, Result, RuleSet};
use pgc_policy::{Evaluator, EvaluatorLimits, PolicyManager};
use pgc_telemetry::DecisionMetrics;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::batch::BatchConfig;
use crate::cache::EnforcementCache;
use crate::penalty::PenaltyScorer;

/// Coordinator tuning
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Bounds for each request-scoped evaluator
    pub limits: EvaluatorLimits,

    /// Batch strategy threshold and time limits
    pub batch: BatchConfig,
}

/// Produces decisions against the manager's active rule set
pub struct DecisionCoordinator {
    manager: Arc<PolicyManager>,
    cache: Arc<EnforcementCache>,
    scorer: PenaltyScorer,
    metrics: DecisionMetrics,
    config: CoordinatorConfig,
}

impl DecisionCoordinator {
    /// Create a coordinator
    pub fn new(
        manager: Arc<PolicyManager>,
        cache: Arc<EnforcementCache>,
        scorer: PenaltyScorer,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            manager,
            cache,
            scorer,
            metrics: DecisionMetrics::new(),
            config,
        }
    }

    /// The policy manager decisions are made against
    pub fn manager(&self) -> &Arc<PolicyManager> {
        &self.manager
    }

    /// The decision cache
    pub fn cache(&self) -> &Arc<EnforcementCache> {
        &self.cache
    }

    /// Decision counters
    pub fn metrics(&self) -> &DecisionMetrics {
        &self.metrics
    }

    /// Coordinator tuning
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Decide one request.
    ///
    /// Never fails: a missing rule set, a malformed context or an
    /// inconclusive evaluation yields an `Error` decision, which is not
    /// cached.
    pub async fn evaluate(&self, context: RequestContext) -> Decision {
        let started = Instant::now();
        let request_id = context
            .request_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let decision = match self.manager.active_or_refresh().await {
            Ok(rule_set) => self.decide(&request_id, &context, rule_set),
            Err(e) => {
                warn!(request_id = %request_id, "No rule set available: {}", e);
                Decision::error(&request_id, format!("no active rule set: {}", e), 0)
            }
        };

        let decision = decision.with_latency_ms(started.elapsed().as_secs_f64() * 1000.0);
        self.metrics.record_decision(&decision);
        decision
    }

    fn decide(&self, request_id: &str, context: &RequestContext, rule_set: Arc<RuleSet>) -> Decision {
        let version = rule_set.version();

        let key = match fingerprint(version, context) {
            Ok(key) => key,
            Err(e) => {
                return Decision::error(request_id, format!("context could not be serialized: {}", e), version)
            }
        };

        if let Some(cached) = self.cache.get(&key) {
            return Decision {
                request_id: request_id.to_string(),
                decided_at: Utc::now(),
                cache_hit: true,
                ..cached
            };
        }

        let (permitted, goal) = match self.query(context, &rule_set) {
            Ok(answer) => answer,
            Err(e) => {
                debug!(request_id = %request_id, "Decision failed: {}", e);
                return Decision::error(request_id, e.to_string(), version);
            }
        };

        let decision = if permitted {
            Decision::new(
                request_id,
                Outcome::Permit,
                format!("permitted by rule set v{}: {}", version, goal),
                version,
            )
        } else {
            Decision::new(request_id, Outcome::Deny, format!("no rule permits {}", goal), version)
        };

        let penalty = self.scorer.score(context, &rule_set);
        if !penalty.unsafe_patterns.is_empty() {
            warn!(
                request_id = %request_id,
                patterns = ?penalty.unsafe_patterns,
                "Unsafe patterns in request context"
            );
        }
        let decision = decision.with_penalty(penalty.total);

        self.cache.put(key, decision.clone());
        decision
    }

    /// Run the target query in a fresh evaluator
    fn query(&self, context: &RequestContext, rule_set: &Arc<RuleSet>) -> Result<(bool, Atom)> {
        let facts = context.to_facts()?;
        let [user, action, resource] = context.target_triple()?;
        let goal = Atom::fact(
            self.manager.config().target_predicate.as_str(),
            vec![user, action, resource],
        );

        let mut evaluator = Evaluator::with_limits(Arc::clone(rule_set), self.config.limits);
        evaluator
            .assert_facts(facts)
            .map_err(|e| pgc_core::Error::evaluation(e.to_string()))?;
        let result = evaluator
            .query(&goal)
            .map_err(|e| pgc_core::Error::evaluation(e.to_string()))?;

        Ok((result.has_result, goal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::penalty::PenaltyConfig;
    use pgc_core::RawRule;
    use pgc_policy::{FormatRouter, IntegrityGate, ManagerConfig, StaticRuleSource};

    fn coordinator_with(source: Arc<StaticRuleSource>) -> DecisionCoordinator {
        let manager = PolicyManager::new(
            source,
            FormatRouter::new().unwrap(),
            IntegrityGate::default(),
            ManagerConfig::default(),
        );
        DecisionCoordinator::new(
            Arc::new(manager),
            Arc::new(EnforcementCache::default()),
            PenaltyScorer::new(PenaltyConfig::default()).unwrap(),
            CoordinatorConfig::default(),
        )
    }

    fn admin_rules() -> Arc<StaticRuleSource> {
        Arc::new(StaticRuleSource::new(vec![RawRule::new(
            "admins",
            r#"permit(U, A, R) :- hasRole(U, "admin")."#,
        )]))
    }

    fn request(role: &str) -> RequestContext {
        RequestContext::new()
            .with_user("id", "alice")
            .with_user("role", role)
            .with_action("type", "delete")
            .with_resource("id", "doc1")
    }

    #[tokio::test]
    async fn test_admin_is_permitted() {
        let coordinator = coordinator_with(admin_rules());
        let decision = coordinator.evaluate(request("admin")).await;

        assert_eq!(decision.outcome, Outcome::Permit);
        assert_eq!(decision.rule_set_version, 1);
        assert!(decision.reason.contains("permit(\"alice\", \"delete\", \"doc1\")"));
        assert!(!decision.cache_hit);
    }

    #[tokio::test]
    async fn test_viewer_is_denied() {
        let coordinator = coordinator_with(admin_rules());
        let decision = coordinator.evaluate(request("viewer")).await;

        assert_eq!(decision.outcome, Outcome::Deny);
        assert!(decision.reason.starts_with("no rule permits"));
    }

    #[tokio::test]
    async fn test_repeated_request_is_served_from_cache() {
        let coordinator = coordinator_with(admin_rules());

        let first = coordinator.evaluate(request("admin").with_request_id("r1")).await;
        let second = coordinator.evaluate(request("admin").with_request_id("r2")).await;

        assert!(!first.cache_hit);
        assert!(second.cache_hit);
        assert_eq!(second.request_id, "r2");
        assert_eq!(second.outcome, first.outcome);
        assert_eq!(second.reason, first.reason);
        assert_eq!(coordinator.cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn test_other_groups_cannot_lend_attributes_to_the_subject() {
        let coordinator = coordinator_with(admin_rules());

        let via_environment = request("viewer")
            .with_environment("id", "alice")
            .with_environment("role", "admin");
        let decision = coordinator.evaluate(via_environment).await;
        assert_eq!(decision.outcome, Outcome::Deny);

        let via_resource = RequestContext::new()
            .with_user("id", "alice")
            .with_user("role", "viewer")
            .with_action("type", "update")
            .with_resource("id", "alice")
            .with_resource("role", "admin");
        let decision = coordinator.evaluate(via_resource).await;
        assert_eq!(decision.outcome, Outcome::Deny);
    }

    #[tokio::test]
    async fn test_environment_conditions_ignore_subject_attributes() {
        let rules = [
            ("rego", "package authz\nallow { input.environment.region == \"eu\" }"),
            ("cedar", r#"permit(principal, action, resource) when { context.region == "eu" };"#),
            ("json", r#"{"effect": "permit", "environment": {"region": "eu"}}"#),
        ];

        for (id, text) in rules {
            let source = Arc::new(StaticRuleSource::new(vec![RawRule::new(id, text)]));
            let coordinator = coordinator_with(source);

            let elsewhere = request("viewer")
                .with_user("region", "eu")
                .with_environment("region", "us");
            let decision = coordinator.evaluate(elsewhere).await;
            assert_eq!(decision.outcome, Outcome::Deny, "{} rule", id);

            let missing = request("viewer").with_user("region", "eu");
            let decision = coordinator.evaluate(missing).await;
            assert_eq!(decision.outcome, Outcome::Deny, "{} rule", id);

            let inside = request("viewer").with_environment("region", "eu");
            let decision = coordinator.evaluate(inside).await;
            assert_eq!(decision.outcome, Outcome::Permit, "{} rule", id);
        }
    }

    #[tokio::test]
    async fn test_cache_is_keyed_by_rule_set_version() {
        let source = admin_rules();
        let coordinator = coordinator_with(Arc::clone(&source));

        let before = coordinator.evaluate(request("viewer")).await;
        assert_eq!(before.outcome, Outcome::Deny);

        source.set_rules(vec![RawRule::new("everyone", "permit(U, A, R).")]);
        coordinator.manager().refresh(true).await.unwrap();

        let after = coordinator.evaluate(request("viewer")).await;
        assert_eq!(after.outcome, Outcome::Permit);
        assert_eq!(after.rule_set_version, 2);
        assert!(!after.cache_hit);
    }

    #[tokio::test]
    async fn test_malformed_context_is_an_uncached_error() {
        let coordinator = coordinator_with(admin_rules());
        let ctx = request("admin").with_user("groups", serde_json::json!(["a", "b"]));

        let first = coordinator.evaluate(ctx.clone()).await;
        let second = coordinator.evaluate(ctx).await;

        assert_eq!(first.outcome, Outcome::Error);
        assert!(first.reason.contains("user.groups"));
        assert!(!second.cache_hit);
        assert!(coordinator.cache().is_empty());
    }

    #[tokio::test]
    async fn test_missing_identifier_is_an_error() {
        let coordinator = coordinator_with(admin_rules());
        let ctx = RequestContext::new()
            .with_user("role", "admin")
            .with_action("type", "delete")
            .with_resource("id", "doc1");

        let decision = coordinator.evaluate(ctx).await;
        assert_eq!(decision.outcome, Outcome::Error);
        assert!(decision.reason.contains("user"));
    }

    #[tokio::test]
    async fn test_upstream_failure_before_first_refresh() {
        let source = admin_rules();
        source.fail_with("connection refused");
        let coordinator = coordinator_with(Arc::clone(&source));

        let decision = coordinator.evaluate(request("admin")).await;
        assert_eq!(decision.outcome, Outcome::Error);
        assert_eq!(decision.rule_set_version, 0);

        source.recover();
        let decision = coordinator.evaluate(request("admin")).await;
        assert_eq!(decision.outcome, Outcome::Permit);
    }

    #[tokio::test]
    async fn test_penalty_does_not_change_outcome() {
        let coordinator = coordinator_with(admin_rules());
        let ctx = request("viewer").with_resource("path", "../../etc/passwd");

        let decision = coordinator.evaluate(ctx).await;
        assert_eq!(decision.outcome, Outcome::Deny);
        assert_eq!(decision.governance_penalty, 0.5);
    }

    #[tokio::test]
    async fn test_identical_requests_get_identical_answers() {
        let coordinator = coordinator_with(admin_rules());
        coordinator.manager().refresh(true).await.unwrap();

        let mut answers = Vec::new();
        for _ in 0..5 {
            coordinator.cache().clear();
            let d = coordinator.evaluate(request("admin")).await;
            answers.push((d.outcome, d.reason, d.governance_penalty, d.rule_set_version));
        }
        assert!(answers.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_generated_request_ids_are_unique() {
        let coordinator = coordinator_with(admin_rules());
        let a = coordinator.evaluate(request("admin")).await;
        let b = coordinator.evaluate(request("admin")).await;
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(coordinator.metrics().snapshot().decisions, 2);
    }
}
