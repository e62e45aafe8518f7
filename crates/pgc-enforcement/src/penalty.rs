//! Governance penalty heuristics
//!
//! Penalties annotate a decision without changing its outcome. Three signals
//! contribute:
//!
//! - unsafe markers (SQL or script injection) in any string attribute, one
//!   weight per distinct marker found
//! - a serialized context larger than the configured payload limit
//! - a rule set older than the staleness threshold

use aho_corasick::AhoCorasick;
use chrono::Utc;
use pgc_core::{RequestContext, Result, RuleSet};
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::Duration;

/// Markers scanned for by default, matched case-insensitively
pub const DEFAULT_UNSAFE_PATTERNS: &[&str] = &[
    "' or '1'='1",
    "\" or \"1\"=\"1",
    "union select",
    "drop table",
    "; --",
    "<script",
    "javascript:",
    "onerror=",
    "../",
    "${jndi:",
];

/// Penalty weights and thresholds
#[derive(Debug, Clone, PartialEq)]
pub struct PenaltyConfig {
    pub unsafe_patterns: Vec<String>,
    pub unsafe_pattern_penalty: f64,
    pub max_payload_bytes: usize,
    pub payload_penalty: f64,
    pub stale_after: Duration,
    pub staleness_penalty: f64,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            unsafe_patterns: DEFAULT_UNSAFE_PATTERNS.iter().map(|p| p.to_string()).collect(),
            unsafe_pattern_penalty: 0.5,
            max_payload_bytes: 4096,
            payload_penalty: 0.1,
            stale_after: Duration::from_secs(600),
            staleness_penalty: 0.2,
        }
    }
}

/// What contributed to a penalty
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PenaltyBreakdown {
    /// Distinct unsafe markers found, in configuration order
    pub unsafe_patterns: Vec<String>,
    pub oversized_payload: bool,
    pub stale_rule_set: bool,
    pub total: f64,
}

/// Scores request contexts against the penalty heuristics
#[derive(Debug, Clone)]
pub struct PenaltyScorer {
    config: PenaltyConfig,
    matcher: Option<AhoCorasick>,
}

impl PenaltyScorer {
    /// Build the marker automaton
    pub fn new(config: PenaltyConfig) -> Result<Self> {
        let matcher = if config.unsafe_patterns.is_empty() {
            None
        } else {
            let matcher = AhoCorasick::builder()
                .ascii_case_insensitive(true)
                .build(&config.unsafe_patterns)
                .map_err(|e| {
                    pgc_core::Error::config(format!("Failed to build unsafe pattern matcher: {}", e))
                })?;
            Some(matcher)
        };

        Ok(Self { config, matcher })
    }

    /// Penalty configuration
    pub fn config(&self) -> &PenaltyConfig {
        &self.config
    }

    /// Score one context evaluated against `rule_set`
    pub fn score(&self, context: &RequestContext, rule_set: &RuleSet) -> PenaltyBreakdown {
        let mut breakdown = PenaltyBreakdown::default();

        let matched = self.unsafe_matches(context);
        breakdown.total += matched.len() as f64 * self.config.unsafe_pattern_penalty;
        breakdown.unsafe_patterns = matched
            .into_iter()
            .map(|index| self.config.unsafe_patterns[index].clone())
            .collect();

        let payload_bytes = context.canonical_bytes().map(|b| b.len()).unwrap_or(0);
        if payload_bytes > self.config.max_payload_bytes {
            breakdown.oversized_payload = true;
            breakdown.total += self.config.payload_penalty;
        }

        let age = (Utc::now() - rule_set.generated_at()).to_std().unwrap_or(Duration::ZERO);
        if age > self.config.stale_after {
            breakdown.stale_rule_set = true;
            breakdown.total += self.config.staleness_penalty;
        }

        breakdown
    }

    fn unsafe_matches(&self, context: &RequestContext) -> BTreeSet<usize> {
        let mut matched = BTreeSet::new();
        let Some(matcher) = &self.matcher else {
            return matched;
        };

        for (_, group) in context.groups() {
            for value in group.values() {
                if let Some(text) = value.as_str() {
                    matched.extend(matcher.find_iter(text).map(|m| m.pattern().as_usize()));
                }
            }
        }
        matched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn scorer() -> PenaltyScorer {
        PenaltyScorer::new(PenaltyConfig::default()).unwrap()
    }

    fn fresh_rule_set() -> RuleSet {
        RuleSet::new(1, Vec::new(), Vec::new())
    }

    #[test]
    fn test_clean_context_has_no_penalty() {
        let ctx = RequestContext::new()
            .with_user("id", "alice")
            .with_resource("id", "doc1");
        let breakdown = scorer().score(&ctx, &fresh_rule_set());
        assert_eq!(breakdown, PenaltyBreakdown::default());
    }

    #[test]
    fn test_distinct_unsafe_patterns_are_counted_once() {
        let ctx = RequestContext::new()
            .with_user("id", "alice")
            .with_resource("query", "1 UNION SELECT password; --")
            .with_environment("referrer", "x union select y");

        let breakdown = scorer().score(&ctx, &fresh_rule_set());
        assert_eq!(breakdown.unsafe_patterns, vec!["union select", "; --"]);
        assert_eq!(breakdown.total, 1.0);
    }

    #[test]
    fn test_non_string_values_are_not_scanned() {
        let ctx = RequestContext::new().with_user("clearance_level", 3);
        assert_eq!(scorer().score(&ctx, &fresh_rule_set()).total, 0.0);
    }

    #[test]
    fn test_oversized_payload() {
        let ctx = RequestContext::new().with_resource("body", "a".repeat(5000));
        let breakdown = scorer().score(&ctx, &fresh_rule_set());
        assert!(breakdown.oversized_payload);
        assert!((breakdown.total - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_stale_rule_set() {
        let stale = fresh_rule_set().with_generated_at(Utc::now() - ChronoDuration::seconds(601));
        let ctx = RequestContext::new().with_user("id", "alice");
        let breakdown = scorer().score(&ctx, &stale);
        assert!(breakdown.stale_rule_set);
        assert!((breakdown.total - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_no_patterns_configured() {
        let scorer = PenaltyScorer::new(PenaltyConfig {
            unsafe_patterns: Vec::new(),
            ..PenaltyConfig::default()
        })
        .unwrap();
        let ctx = RequestContext::new().with_user("name", "<script>");
        assert_eq!(scorer.score(&ctx, &fresh_rule_set()).total, 0.0);
    }
}
