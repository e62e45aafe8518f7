//! Error types for the Policy Governance Compiler
//!
//! Component boundaries carry their own error enums (syntax, conversion,
//! evaluation, source); this is the shared type for construction-time and
//! request-path failures that cross crates.

/// Result type alias using PGC's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Shared error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A converter or the rule pipeline could not be built
    #[error("policy error: {0}")]
    Policy(String),

    /// The request context cannot be turned into facts
    #[error("context error: {0}")]
    Context(#[from] crate::context::ContextError),

    /// The evaluator gave up or rejected its input
    #[error("evaluation error: {0}")]
    Evaluation(String),

    /// Invalid settings
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    pub fn evaluation(msg: impl Into<String>) -> Self {
        Self::Evaluation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the caller's input, not the service, is at fault
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Context(_))
    }
}
