//! PGC Policy
//!
//! Everything between the upstream rule store and a request-scoped answer:
//!
//! - [`router`]: detects a rule's authoring format and converts it to
//!   canonical clauses through a per-framework strategy table
//! - [`syntax`]: tokenizer and parser for the canonical clause language
//! - [`integrity`]: Ed25519 signature checks and the signature policy
//! - [`engine`]: bottom-up fixed-point evaluation of clauses over facts
//! - [`manager`]: refresh, validation and atomic publication of rule sets
//! - [`source`]: upstream rule sources

pub mod convert;
pub mod engine;
pub mod integrity;
pub mod manager;
pub mod router;
pub mod source;
pub mod syntax;

pub use convert::{ConversionError, Detection, RuleConverter};
pub use engine::{Binding, EvalError, Evaluator, EvaluatorLimits, QueryResult};
pub use integrity::{verify_signature, IntegrityError, IntegrityGate};
pub use manager::{
    IngestRejection, IngestStage, ManagerConfig, PolicyManager, RefreshError, RefreshStats,
};
pub use router::{ConversionOutcome, FormatRouter};
pub use source::{FileRuleSource, RuleSource, SourceError, StaticRuleSource};
pub use syntax::{parse_atom, parse_program, SyntaxError};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::engine::{Evaluator, EvaluatorLimits, QueryResult};
    pub use crate::integrity::IntegrityGate;
    pub use crate::manager::{ManagerConfig, PolicyManager, RefreshError};
    pub use crate::router::FormatRouter;
    pub use crate::source::{RuleSource, StaticRuleSource};
}
