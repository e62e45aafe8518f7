//! Server configuration
//!
//! Layered with the `config` crate: built-in defaults, then an optional YAML
//! file, then `PGC_`-prefixed environment variables with `__` between
//! section and key (`PGC_POLICY__REFRESH_INTERVAL_SECS=60`).

use pgc_enforcement::{BatchConfig, CacheConfig, CoordinatorConfig, PenaltyConfig, DEFAULT_UNSAFE_PATTERNS};
use pgc_policy::{EvaluatorLimits, IntegrityGate, ManagerConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PgcConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub policy: PolicyConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub cache: CacheSection,

    #[serde(default)]
    pub batch: BatchSection,

    #[serde(default)]
    pub penalty: PenaltySection,
}

impl PgcConfig {
    /// Load configuration, treating a missing file as empty
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&PgcConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PGC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Policy manager settings
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            refresh_interval: Duration::from_secs(self.policy.refresh_interval_secs),
            target_predicate: self.policy.target_predicate.clone(),
            auth_token: self.upstream.auth_token.clone(),
        }
    }

    /// Signature policy
    pub fn integrity_gate(&self) -> IntegrityGate {
        IntegrityGate::new(self.policy.public_key.clone(), self.policy.require_signatures)
    }

    /// Decision cache bounds
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            capacity: self.cache.capacity,
            ttl: Duration::from_secs(self.cache.ttl_secs),
        }
    }

    /// Evaluator limits and batch settings
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            limits: EvaluatorLimits {
                max_iterations: self.policy.max_iterations,
                max_facts: self.policy.max_derived_facts,
            },
            batch: BatchConfig {
                parallel_threshold: self.batch.parallel_threshold,
                decision_timeout: Duration::from_millis(self.batch.decision_timeout_ms),
                deadline: Duration::from_millis(self.batch.deadline_ms),
            },
        }
    }

    /// Penalty weights
    pub fn penalty_config(&self) -> PenaltyConfig {
        let p = &self.penalty;
        PenaltyConfig {
            unsafe_patterns: p.patterns.clone(),
            unsafe_pattern_penalty: p.unsafe_pattern_penalty,
            max_payload_bytes: p.max_payload_bytes,
            payload_penalty: p.payload_penalty,
            stale_after: Duration::from_secs(p.stale_after_secs),
            staleness_penalty: p.staleness_penalty,
        }
    }
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum request body size in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,

    /// Maximum contexts accepted in one batch request
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            max_body_bytes: default_max_body_bytes(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

/// Rule ingestion and evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Head predicate queried for every decision
    #[serde(default = "default_target_predicate")]
    pub target_predicate: String,

    #[serde(default)]
    pub require_signatures: bool,

    /// Hex Ed25519 verifying key for signed rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    #[serde(default = "default_max_derived_facts")]
    pub max_derived_facts: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
            target_predicate: default_target_predicate(),
            require_signatures: false,
            public_key: None,
            max_iterations: default_max_iterations(),
            max_derived_facts: default_max_derived_facts(),
        }
    }
}

/// Where rules come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamKind {
    /// Rule store HTTP endpoint
    Http,
    /// Directory of YAML/JSON rule files
    #[default]
    File,
    /// No upstream; an empty rule set that denies everything
    Static,
}

/// Upstream rule store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub kind: UpstreamKind,

    /// Rule store URL, required for `http`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Bearer credential passed to the rule store
    #[serde(default)]
    pub auth_token: String,

    /// Rule file or directory for `file`
    #[serde(default = "default_rules_directory")]
    pub directory: String,

    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,

    /// Permit plain HTTP and private addresses (development only)
    #[serde(default)]
    pub allow_insecure: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            kind: UpstreamKind::default(),
            endpoint: None,
            auth_token: String::new(),
            directory: default_rules_directory(),
            timeout_secs: default_upstream_timeout(),
            allow_insecure: false,
        }
    }
}

/// Decision cache bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,

    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

/// Batch execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSection {
    #[serde(default = "default_parallel_threshold")]
    pub parallel_threshold: usize,

    #[serde(default = "default_decision_timeout")]
    pub decision_timeout_ms: u64,

    #[serde(default = "default_deadline")]
    pub deadline_ms: u64,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            parallel_threshold: default_parallel_threshold(),
            decision_timeout_ms: default_decision_timeout(),
            deadline_ms: default_deadline(),
        }
    }
}

/// Penalty heuristics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PenaltySection {
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,

    #[serde(default = "default_unsafe_pattern_penalty")]
    pub unsafe_pattern_penalty: f64,

    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    #[serde(default = "default_payload_penalty")]
    pub payload_penalty: f64,

    #[serde(default = "default_stale_after")]
    pub stale_after_secs: u64,

    #[serde(default = "default_staleness_penalty")]
    pub staleness_penalty: f64,
}

impl Default for PenaltySection {
    fn default() -> Self {
        Self {
            patterns: default_patterns(),
            unsafe_pattern_penalty: default_unsafe_pattern_penalty(),
            max_payload_bytes: default_max_payload_bytes(),
            payload_penalty: default_payload_penalty(),
            stale_after_secs: default_stale_after(),
            staleness_penalty: default_staleness_penalty(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_max_batch_size() -> usize {
    1000
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_target_predicate() -> String {
    "permit".to_string()
}

fn default_max_iterations() -> usize {
    EvaluatorLimits::default().max_iterations
}

fn default_max_derived_facts() -> usize {
    EvaluatorLimits::default().max_facts
}

fn default_rules_directory() -> String {
    "./rules".to_string()
}

fn default_upstream_timeout() -> u64 {
    5
}

fn default_cache_capacity() -> usize {
    10_000
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_parallel_threshold() -> usize {
    10
}

fn default_decision_timeout() -> u64 {
    1000
}

fn default_deadline() -> u64 {
    5000
}

fn default_patterns() -> Vec<String> {
    DEFAULT_UNSAFE_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn default_unsafe_pattern_penalty() -> f64 {
    0.5
}

fn default_max_payload_bytes() -> usize {
    4096
}

fn default_payload_penalty() -> f64 {
    0.1
}

fn default_stale_after() -> u64 {
    600
}

fn default_staleness_penalty() -> f64 {
    0.2
}
