//! PGC Core
//!
//! Core types and utilities shared across the Policy Governance Compiler.
//!
//! This crate provides:
//! - The canonical rule model (terms, atoms, clauses, programs)
//! - Versioned, immutable rule-set snapshots
//! - Request contexts and their deterministic conversion into facts
//! - Decisions and decision fingerprints
//! - Error types and result handling

pub mod context;
pub mod decision;
pub mod error;
pub mod rule;
pub mod term;

pub use context::{attribute_predicate, AttributeGroup, ContextError, RequestContext};
pub use decision::{fingerprint, Decision, Outcome};
pub use error::{Error, Result};
pub use rule::{content_hash, Framework, RawRule, Rule, RuleSet, VerificationStatus};
pub use term::{Atom, Clause, Program, Term, Value};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::context::{ContextError, RequestContext};
    pub use crate::decision::{Decision, Outcome};
    pub use crate::error::{Error, Result};
    pub use crate::rule::{Framework, RawRule, Rule, RuleSet, VerificationStatus};
    pub use crate::term::{Atom, Clause, Program, Term, Value};
}
