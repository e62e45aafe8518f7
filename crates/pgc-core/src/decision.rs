//! Authorization decisions and decision fingerprints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::context::RequestContext;

/// Outcome of a single authorization decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Permit,
    Deny,
    Error,
}

impl Outcome {
    /// Lowercase name used in metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Permit => "permit",
            Outcome::Deny => "deny",
            Outcome::Error => "error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of evaluating one request context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    /// Request this decision answers
    pub request_id: String,

    /// Permit, deny or error
    pub outcome: Outcome,

    /// Human-readable explanation
    pub reason: String,

    /// Accumulated heuristic penalty (never negative)
    pub governance_penalty: f64,

    /// Time spent producing this answer
    pub latency_ms: f64,

    /// When the decision was produced
    pub decided_at: DateTime<Utc>,

    /// Rule-set version the decision was computed against (0 if none)
    pub rule_set_version: u64,

    /// Whether the answer came from the enforcement cache
    #[serde(default)]
    pub cache_hit: bool,
}

impl Decision {
    /// Create a decision with zero penalty and latency
    pub fn new(
        request_id: impl Into<String>,
        outcome: Outcome,
        reason: impl Into<String>,
        rule_set_version: u64,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            outcome,
            reason: reason.into(),
            governance_penalty: 0.0,
            latency_ms: 0.0,
            decided_at: Utc::now(),
            rule_set_version,
            cache_hit: false,
        }
    }

    /// Create an error decision
    pub fn error(request_id: impl Into<String>, reason: impl Into<String>, rule_set_version: u64) -> Self {
        Self::new(request_id, Outcome::Error, reason, rule_set_version)
    }

    /// Set the governance penalty, clamped at zero
    pub fn with_penalty(mut self, penalty: f64) -> Self {
        self.governance_penalty = if penalty.is_finite() { penalty.max(0.0) } else { 0.0 };
        self
    }

    /// Set the latency in milliseconds
    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Errors are not stable answers and must never be cached
    pub fn is_cacheable(&self) -> bool {
        self.outcome != Outcome::Error
    }

    /// Check if this decision permits the request
    pub fn is_permit(&self) -> bool {
        self.outcome == Outcome::Permit
    }
}

/// Cache key for a decision: digest of the rule-set version and the context
pub fn fingerprint(rule_set_version: u64, context: &RequestContext) -> Result<String, serde_json::Error> {
    let mut hasher = Sha256::new();
    hasher.update(rule_set_version.to_be_bytes());
    hasher.update(context.canonical_bytes()?);
    Ok(format!("{:x}", hasher.finalize()))
}
