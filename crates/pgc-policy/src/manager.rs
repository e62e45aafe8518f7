//! Policy manager: ingestion, versioning and publication of rule sets
//!
//! A refresh fetches raw rules, runs each through detection, conversion,
//! signature verification and syntax validation, and publishes the
//! survivors as a new immutable [`RuleSet`]. Readers take an `Arc` snapshot
//! under a short read lock and are never blocked by a refresh in progress.

use parking_lot::RwLock;
use pgc_core::{Clause, Program, RawRule, Rule, RuleSet, VerificationStatus};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::convert::ConversionError;
use crate::integrity::IntegrityGate;
use crate::router::FormatRouter;
use crate::source::{RuleSource, SourceError};

/// Ingestion step at which a rule was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStage {
    Duplicate,
    Conversion,
    Signature,
    Syntax,
}

impl IngestStage {
    /// Label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestStage::Duplicate => "duplicate",
            IngestStage::Conversion => "conversion",
            IngestStage::Signature => "signature",
            IngestStage::Syntax => "syntax",
        }
    }
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rule dropped during ingestion
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rule '{rule_id}' rejected at {stage}: {reason}")]
pub struct IngestRejection {
    pub rule_id: String,
    pub stage: IngestStage,
    pub reason: String,
}

impl IngestRejection {
    fn new(rule_id: &str, stage: IngestStage, reason: impl fmt::Display) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            stage,
            reason: reason.to_string(),
        }
    }
}

/// Refresh failures; the previous snapshot stays active
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    #[error("upstream fetch failed: {0}")]
    Upstream(String),
}

impl From<SourceError> for RefreshError {
    fn from(err: SourceError) -> Self {
        Self::Upstream(err.to_string())
    }
}

/// Per-refresh ingestion statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshStats {
    /// Rule-set version this refresh published
    pub version: u64,
    pub total_fetched: usize,
    pub converted: usize,
    pub signature_verified: usize,
    pub rejected: usize,
    pub rejected_duplicate: usize,
    pub rejected_conversion: usize,
    pub rejected_signature: usize,
    pub rejected_syntax: usize,
}

impl RefreshStats {
    fn record_rejection(&mut self, stage: IngestStage) {
        self.rejected += 1;
        match stage {
            IngestStage::Duplicate => self.rejected_duplicate += 1,
            IngestStage::Conversion => self.rejected_conversion += 1,
            IngestStage::Signature => self.rejected_signature += 1,
            IngestStage::Syntax => self.rejected_syntax += 1,
        }
    }
}

/// Policy manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Minimum time between non-forced refreshes
    pub refresh_interval: Duration,

    /// Head predicate of permit rules converted from alternate formats
    pub target_predicate: String,

    /// Credential passed to the rule source
    pub auth_token: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(300),
            target_predicate: "permit".to_string(),
            auth_token: String::new(),
        }
    }
}

/// A rule that passed every ingestion step
#[derive(Debug)]
struct Ingested {
    rule: Rule,
    program: Program,
}

/// State owned by whichever caller holds the refresh lock
#[derive(Debug, Default)]
struct RefreshState {
    last_success: Option<Instant>,
    last_outcome: Option<Result<Arc<RuleSet>, RefreshError>>,
    next_version: u64,
    rule_versions: HashMap<String, (String, u64)>,
}

/// Fetches, validates and publishes rule sets
pub struct PolicyManager {
    source: Arc<dyn RuleSource>,
    router: FormatRouter,
    gate: IntegrityGate,
    config: ManagerConfig,
    current: RwLock<Option<Arc<RuleSet>>>,
    last_stats: RwLock<Option<RefreshStats>>,
    refresh: Mutex<RefreshState>,
    completed: AtomicU64,
}

impl PolicyManager {
    /// Create a manager; no rule set is active until the first refresh
    pub fn new(
        source: Arc<dyn RuleSource>,
        router: FormatRouter,
        gate: IntegrityGate,
        config: ManagerConfig,
    ) -> Self {
        Self {
            source,
            router,
            gate,
            config,
            current: RwLock::new(None),
            last_stats: RwLock::new(None),
            refresh: Mutex::new(RefreshState::default()),
            completed: AtomicU64::new(0),
        }
    }

    /// Manager configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The last successfully published snapshot, without waiting
    pub fn active_rule_set(&self) -> Option<Arc<RuleSet>> {
        self.current.read().clone()
    }

    /// Statistics of the last completed refresh
    pub fn last_stats(&self) -> Option<RefreshStats> {
        self.last_stats.read().clone()
    }

    /// The active snapshot, forcing the first refresh if none exists yet
    pub async fn active_or_refresh(&self) -> Result<Arc<RuleSet>, RefreshError> {
        match self.active_rule_set() {
            Some(rule_set) => Ok(rule_set),
            None => self.refresh(true).await,
        }
    }

    /// Fetch and publish a new rule set.
    ///
    /// Without `force`, a refresh within the configured interval of the last
    /// successful one returns the current snapshot. Callers that waited for
    /// another caller's refresh get its result instead of fetching again.
    pub async fn refresh(&self, force: bool) -> Result<Arc<RuleSet>, RefreshError> {
        let observed = self.completed.load(Ordering::Acquire);
        let mut state = self.refresh.lock().await;

        if self.completed.load(Ordering::Acquire) != observed {
            if let Some(outcome) = state.last_outcome.clone() {
                debug!("Joined in-flight refresh");
                return outcome;
            }
        }

        if !force {
            let fresh = state
                .last_success
                .is_some_and(|at| at.elapsed() < self.config.refresh_interval);
            if let (true, Some(current)) = (fresh, self.active_rule_set()) {
                return Ok(current);
            }
        }

        let outcome = self.run_refresh(&mut state).await;

        state.last_outcome = Some(outcome.clone());
        self.completed.fetch_add(1, Ordering::Release);
        outcome
    }

    async fn run_refresh(&self, state: &mut RefreshState) -> Result<Arc<RuleSet>, RefreshError> {
        let started = Instant::now();

        let raw_rules = match self.source.fetch_verified_rules(&self.config.auth_token).await {
            Ok(rules) => rules,
            Err(e) => {
                warn!(
                    source = %self.source.describe(),
                    error = %e,
                    "Rule refresh failed, keeping previous rule set"
                );
                metrics::counter!("pgc_refresh_total", "result" => "failure").increment(1);
                return Err(e.into());
            }
        };

        state.next_version += 1;
        let version = state.next_version;

        let mut stats = RefreshStats {
            version,
            total_fetched: raw_rules.len(),
            ..RefreshStats::default()
        };

        let mut seen = HashSet::new();
        let mut ingested = Vec::with_capacity(raw_rules.len());

        for raw in &raw_rules {
            let result = if seen.insert(raw.id.as_str()) {
                self.ingest(raw, &mut stats)
            } else {
                Err(IngestRejection::new(&raw.id, IngestStage::Duplicate, "duplicate rule id"))
            };

            match result {
                Ok(rule) => ingested.push(rule),
                Err(rejection) => {
                    warn!(
                        rule_id = %rejection.rule_id,
                        stage = %rejection.stage,
                        reason = %rejection.reason,
                        "Rule rejected"
                    );
                    metrics::counter!("pgc_rules_rejected_total", "stage" => rejection.stage.as_str())
                        .increment(1);
                    stats.record_rejection(rejection.stage);
                }
            }
        }

        let rule_set = Arc::new(assemble(version, ingested, &mut state.rule_versions));

        *self.current.write() = Some(Arc::clone(&rule_set));
        *self.last_stats.write() = Some(stats.clone());
        state.last_success = Some(Instant::now());

        metrics::counter!("pgc_refresh_total", "result" => "success").increment(1);
        info!(
            version,
            rules = rule_set.len(),
            fetched = stats.total_fetched,
            rejected = stats.rejected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Published rule set"
        );

        Ok(rule_set)
    }

    /// Detect, convert, verify and validate one raw rule
    fn ingest(&self, raw: &RawRule, stats: &mut RefreshStats) -> Result<Ingested, IngestRejection> {
        let framework = self.router.detect(&raw.content, raw.framework);

        let outcome = self
            .router
            .convert(&raw.content, framework, &self.config.target_predicate)
            .map_err(|e| {
                let stage = match e {
                    ConversionError::Syntax(_) => IngestStage::Syntax,
                    _ => IngestStage::Conversion,
                };
                IngestRejection::new(&raw.id, stage, e)
            })?;
        stats.converted += 1;

        let status = self
            .gate
            .check(&raw.content, raw.signature.as_deref())
            .map_err(|e| IngestRejection::new(&raw.id, IngestStage::Signature, e))?;
        if status == VerificationStatus::Verified {
            stats.signature_verified += 1;
        }

        let program = self
            .router
            .validate_syntax(&outcome.canonical)
            .map_err(|e| IngestRejection::new(&raw.id, IngestStage::Syntax, e))?;

        debug!(rule_id = %raw.id, %framework, "Ingested rule");

        Ok(Ingested {
            rule: Rule {
                id: raw.id.clone(),
                content_hash: self.router.content_hash(&outcome.canonical),
                content: outcome.canonical,
                framework,
                version: 0,
                verification_status: status,
                signature: raw.signature.clone(),
                source_principle_ids: raw.source_principle_ids.iter().cloned().collect::<BTreeSet<_>>(),
                imports: outcome.imports,
            },
            program,
        })
    }
}

impl fmt::Debug for PolicyManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyManager")
            .field("source", &self.source.describe())
            .field("router", &self.router)
            .field("config", &self.config)
            .field("active_version", &self.active_rule_set().map(|r| r.version()))
            .finish()
    }
}

/// Assign per-rule versions and build the snapshot
fn assemble(
    version: u64,
    ingested: Vec<Ingested>,
    rule_versions: &mut HashMap<String, (String, u64)>,
) -> RuleSet {
    let mut rules = Vec::with_capacity(ingested.len());
    let mut clauses: Vec<Clause> = Vec::new();

    for Ingested { mut rule, program } in ingested {
        let rule_version = match rule_versions.get(&rule.id) {
            Some((hash, v)) if *hash == rule.content_hash => *v,
            Some((_, v)) => v + 1,
            None => 1,
        };
        rule_versions.insert(rule.id.clone(), (rule.content_hash.clone(), rule_version));
        rule.version = rule_version;

        clauses.extend(program.clauses);
        rules.push(rule);
    }

    RuleSet::new(version, rules, clauses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StaticRuleSource;
    use ed25519_dalek::{Signer, SigningKey};
    use pgc_core::Framework;

    const ADMIN_RULE: &str = "permit(U, A, R) :- hasRole(U, \"admin\").";

    fn manager(source: Arc<StaticRuleSource>) -> PolicyManager {
        manager_with_gate(source, IntegrityGate::default())
    }

    fn manager_with_gate(source: Arc<StaticRuleSource>, gate: IntegrityGate) -> PolicyManager {
        PolicyManager::new(source, FormatRouter::new().unwrap(), gate, ManagerConfig::default())
    }

    #[tokio::test]
    async fn test_refresh_publishes_rule_set() {
        let source = Arc::new(StaticRuleSource::new(vec![
            RawRule::new("admin", ADMIN_RULE).with_principle("p-2").with_principle("p-1"),
            RawRule::new(
                "rego-reader",
                "package authz\nallow { input.action.type == \"read\" }",
            ),
        ]));
        let manager = manager(source);
        assert!(manager.active_rule_set().is_none());

        let rule_set = manager.refresh(true).await.unwrap();
        assert_eq!(rule_set.version(), 1);
        assert_eq!(rule_set.len(), 2);
        assert_eq!(rule_set.clauses().len(), 2);

        let admin = rule_set.rule("admin").unwrap();
        assert_eq!(admin.version, 1);
        assert!(admin.hash_is_consistent());
        assert_eq!(admin.verification_status, VerificationStatus::Pending);
        assert_eq!(
            admin.source_principle_ids.iter().collect::<Vec<_>>(),
            vec!["p-1", "p-2"]
        );

        let rego = rule_set.rule("rego-reader").unwrap();
        assert_eq!(rego.framework, Framework::AlternateA);
        assert_eq!(rego.content, "permit(U, A, R) :- actionHasType(A, \"read\").\n");

        let stats = manager.last_stats().unwrap();
        assert_eq!(stats.total_fetched, 2);
        assert_eq!(stats.converted, 2);
        assert_eq!(stats.rejected, 0);
    }

    #[tokio::test]
    async fn test_malformed_rule_is_rejected() {
        let source = Arc::new(StaticRuleSource::new(vec![
            RawRule::new("good", ADMIN_RULE),
            RawRule::new("bad", "permit(U, A, R) :- hasRole(U, \"admin\""),
        ]));
        let manager = manager(source);

        let rule_set = manager.refresh(true).await.unwrap();
        assert_eq!(rule_set.len(), 1);
        assert!(rule_set.rule("bad").is_none());

        let stats = manager.last_stats().unwrap();
        assert_eq!(stats.total_fetched, 2);
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.rejected_syntax, 1);
    }

    #[tokio::test]
    async fn test_unsupported_and_duplicate_rules_are_rejected() {
        let source = Arc::new(StaticRuleSource::new(vec![
            RawRule::new("a", ADMIN_RULE),
            RawRule::new("a", "other(\"x\")."),
            RawRule::new("forbid", "forbid(principal, action, resource);"),
        ]));
        let manager = manager(source);

        let rule_set = manager.refresh(true).await.unwrap();
        assert_eq!(rule_set.len(), 1);

        let stats = manager.last_stats().unwrap();
        assert_eq!(stats.rejected_duplicate, 1);
        assert_eq!(stats.rejected_conversion, 1);
    }

    #[tokio::test]
    async fn test_signatures() {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let public = hex::encode(signing_key.verifying_key().as_bytes());
        let good = hex::encode(signing_key.sign(ADMIN_RULE.as_bytes()).to_bytes());

        let source = Arc::new(StaticRuleSource::new(vec![
            RawRule::new("signed", ADMIN_RULE).with_signature(good.clone()),
            RawRule::new("tampered", "permit(U, A, R).").with_signature(good),
            RawRule::new("unsigned", "trusted(\"svc\")."),
        ]));

        let manager = manager_with_gate(Arc::clone(&source), IntegrityGate::new(Some(public.clone()), false));
        let rule_set = manager.refresh(true).await.unwrap();
        assert_eq!(
            rule_set.rules().iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["signed", "unsigned"]
        );
        assert_eq!(
            rule_set.rule("signed").unwrap().verification_status,
            VerificationStatus::Verified
        );
        let stats = manager.last_stats().unwrap();
        assert_eq!(stats.signature_verified, 1);
        assert_eq!(stats.rejected_signature, 1);

        let strict = manager_with_gate(source, IntegrityGate::new(Some(public), true));
        let rule_set = strict.refresh(true).await.unwrap();
        assert_eq!(rule_set.len(), 1);
        assert_eq!(strict.last_stats().unwrap().rejected_signature, 2);
    }

    #[tokio::test]
    async fn test_upstream_failure_keeps_previous_snapshot() {
        let source = Arc::new(StaticRuleSource::new(vec![RawRule::new("admin", ADMIN_RULE)]));
        let manager = manager(Arc::clone(&source));

        let first = manager.refresh(true).await.unwrap();
        source.fail_with("connection refused");

        let err = manager.refresh(true).await.unwrap_err();
        assert!(matches!(err, RefreshError::Upstream(_)));

        let active = manager.active_rule_set().unwrap();
        assert!(Arc::ptr_eq(&first, &active));
        assert_eq!(manager.last_stats().unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_rule_versions_track_content_changes() {
        let source = Arc::new(StaticRuleSource::new(vec![
            RawRule::new("admin", ADMIN_RULE),
            RawRule::new("other", "trusted(\"svc\")."),
        ]));
        let manager = manager(Arc::clone(&source));
        manager.refresh(true).await.unwrap();

        source.set_rules(vec![
            RawRule::new("admin", "permit(U, A, R) :- hasRole(U, \"owner\")."),
            RawRule::new("other", "trusted(\"svc\")."),
        ]);
        let second = manager.refresh(true).await.unwrap();

        assert_eq!(second.version(), 2);
        assert_eq!(second.rule("admin").unwrap().version, 2);
        assert_eq!(second.rule("other").unwrap().version, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_forced_refresh_respects_interval() {
        let source = Arc::new(StaticRuleSource::new(vec![RawRule::new("admin", ADMIN_RULE)]));
        let manager = manager(Arc::clone(&source));

        let first = manager.refresh(true).await.unwrap();
        let again = manager.refresh(false).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(source.fetch_count(), 1);

        tokio::time::advance(Duration::from_secs(301)).await;
        let later = manager.refresh(false).await.unwrap();
        assert_eq!(later.version(), 2);
        assert_eq!(source.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_active_or_refresh_forces_first_refresh() {
        let source = Arc::new(StaticRuleSource::new(vec![RawRule::new("admin", ADMIN_RULE)]));
        let manager = manager(Arc::clone(&source));

        let rule_set = manager.active_or_refresh().await.unwrap();
        assert_eq!(rule_set.version(), 1);
        manager.active_or_refresh().await.unwrap();
        assert_eq!(source.fetch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_coalesce() {
        let source = Arc::new(
            StaticRuleSource::new(vec![RawRule::new("admin", ADMIN_RULE)])
                .with_delay(Duration::from_millis(50)),
        );
        let manager = Arc::new(manager(Arc::clone(&source)));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move { manager.refresh(true).await })
            })
            .collect();

        let mut versions = Vec::new();
        for handle in handles {
            versions.push(handle.await.unwrap().unwrap().version());
        }

        assert_eq!(source.fetch_count(), 1);
        assert!(versions.iter().all(|v| *v == 1));
    }

    #[tokio::test]
    async fn test_readers_see_whole_snapshots() {
        let all: Vec<RawRule> = (0..20)
            .map(|i| RawRule::new(format!("r{}", i), format!("fact{}(\"x\").", i)))
            .collect();
        let source = Arc::new(StaticRuleSource::new(all.clone()));
        let manager = Arc::new(manager(Arc::clone(&source)));
        manager.refresh(true).await.unwrap();

        let reader = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                for _ in 0..200 {
                    let snapshot = manager.active_rule_set().unwrap();
                    let expected = if snapshot.version() % 2 == 1 { 20 } else { 10 };
                    assert_eq!(snapshot.len(), expected);
                    assert_eq!(snapshot.clauses().len(), expected);
                    tokio::task::yield_now().await;
                }
            })
        };

        for round in 0..20 {
            let rules = if round % 2 == 0 { all[..10].to_vec() } else { all.clone() };
            source.set_rules(rules);
            manager.refresh(true).await.unwrap();
            tokio::task::yield_now().await;
        }

        reader.await.unwrap();
    }
}
