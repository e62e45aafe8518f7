//! Rule and rule-set definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fmt;

use crate::term::Clause;

/// The authoring format a rule arrived in before conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    /// Canonical Horn-clause form
    #[serde(alias = "datalog")]
    Canonical,

    /// Rego-style `package`/`input.` policies
    #[serde(alias = "rego")]
    AlternateA,

    /// Cedar-style `permit(...) when {...};` statements
    #[serde(alias = "cedar")]
    AlternateB,

    /// JSON policy documents
    #[serde(alias = "json")]
    AlternateC,
}

impl Framework {
    /// All frameworks, canonical first
    pub const ALL: [Framework; 4] = [
        Framework::Canonical,
        Framework::AlternateA,
        Framework::AlternateB,
        Framework::AlternateC,
    ];

    /// Short lowercase name used in logs and metrics labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Canonical => "canonical",
            Framework::AlternateA => "rego",
            Framework::AlternateB => "cedar",
            Framework::AlternateC => "json",
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification state of an ingested rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum VerificationStatus {
    /// No signature was attached and none was required
    #[default]
    Pending,
    /// Signature checked successfully
    Verified,
    /// Signature check failed
    Failed,
}

/// A rule as delivered by the upstream rule store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRule {
    /// Opaque identifier
    pub id: String,

    /// Rule text in any supported framework
    pub content: String,

    /// Framework hint supplied by the upstream store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<Framework>,

    /// Upstream provenance identifiers
    #[serde(default, alias = "source_principle_ids")]
    pub source_principle_ids: Vec<String>,

    /// Hex-encoded detached signature over `content`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl RawRule {
    /// Create an unsigned raw rule without a framework hint
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            framework: None,
            source_principle_ids: Vec::new(),
            signature: None,
        }
    }

    /// Set the framework hint
    pub fn with_framework(mut self, framework: Framework) -> Self {
        self.framework = Some(framework);
        self
    }

    /// Attach a signature
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }

    /// Add a provenance identifier
    pub fn with_principle(mut self, principle_id: impl Into<String>) -> Self {
        self.source_principle_ids.push(principle_id.into());
        self
    }
}

/// One validated governance rule in canonical form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// Opaque identifier
    pub id: String,

    /// Canonical rule text
    pub content: String,

    /// Format the rule arrived in
    pub framework: Framework,

    /// Bumped whenever `content` changes for this id
    pub version: u64,

    /// Signature verification state
    pub verification_status: VerificationStatus,

    /// Detached signature over the upstream content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,

    /// SHA-256 of `content`
    pub content_hash: String,

    /// Upstream provenance identifiers
    pub source_principle_ids: BTreeSet<String>,

    /// Import dependencies discovered during conversion
    #[serde(default)]
    pub imports: Vec<String>,
}

impl Rule {
    /// Check that the stored hash matches the current content
    pub fn hash_is_consistent(&self) -> bool {
        self.content_hash == content_hash(&self.content)
    }
}

/// Compute the hex SHA-256 digest of rule text
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// An immutable, versioned snapshot of validated rules.
///
/// Rule sets are shared as `Arc<RuleSet>` and never mutated after
/// construction; a refresh publishes a new snapshot instead.
#[derive(Debug, Clone)]
pub struct RuleSet {
    version: u64,
    rules: Vec<Rule>,
    generated_at: DateTime<Utc>,
    clauses: Vec<Clause>,
}

impl RuleSet {
    /// Build a snapshot from rules and their already-compiled clauses
    pub fn new(version: u64, rules: Vec<Rule>, clauses: Vec<Clause>) -> Self {
        Self {
            version,
            rules,
            generated_at: Utc::now(),
            clauses,
        }
    }

    /// Override the generation timestamp
    pub fn with_generated_at(mut self, generated_at: DateTime<Utc>) -> Self {
        self.generated_at = generated_at;
        self
    }

    /// Refresh counter this snapshot was produced by
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Rules in ingestion order
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// When this snapshot was assembled
    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// Compiled clauses of all rules, in rule order
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// Number of rules
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Check if the snapshot holds no rules
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Look up a rule by id
    pub fn rule(&self, id: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_rule_deserialization() {
        let yaml = r#"
- id: admin-delete
  content: 'permit(U, A, R) :- hasRole(U, "admin").'
  framework: datalog
  sourcePrincipleIds: [p-1, p-2]
- id: rego-rule
  content: "package authz"
  framework: rego
  signature: "abcd"
"#;

        let rules: Vec<RawRule> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].framework, Some(Framework::Canonical));
        assert_eq!(rules[0].source_principle_ids, vec!["p-1", "p-2"]);
        assert_eq!(rules[1].framework, Some(Framework::AlternateA));
        assert_eq!(rules[1].signature.as_deref(), Some("abcd"));
    }

    #[test]
    fn test_content_hash_is_stable() {
        let a = content_hash("trusted(\"svc\").\n");
        let b = content_hash("trusted(\"svc\").\n");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_hash("trusted(\"other\").\n"));
    }
}
