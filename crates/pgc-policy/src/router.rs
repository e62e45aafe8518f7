//! Format detection and conversion into canonical rules
//!
//! The router owns one [`RuleConverter`] per [`Framework`]. Detection asks
//! each converter to recognize the text, strongest evidence first; conversion
//! dispatches through the same table and prints the resulting program, which
//! makes canonical output byte-stable.

use pgc_core::{Framework, Program, Result};
use std::collections::HashMap;
use tracing::debug;

use crate::convert::{
    CanonicalConverter, CedarConverter, ConversionError, Detection, JsonPolicyConverter,
    RegoConverter, RuleConverter,
};
use crate::syntax::{is_predicate, parse_program, SyntaxError};

/// Order in which converters are asked to recognize text.
///
/// Canonical precedes the Cedar and Rego heuristics so clause text that
/// happens to mention `principal` or `input.` is not misrouted.
const DETECTION_ORDER: [Framework; 4] = [
    Framework::AlternateC,
    Framework::Canonical,
    Framework::AlternateB,
    Framework::AlternateA,
];

/// Result of converting one rule
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionOutcome {
    /// Framework the text was converted from
    pub framework: Framework,

    /// Canonical text
    pub canonical: String,

    /// Import dependencies declared by the rule
    pub imports: Vec<String>,

    /// Parsed clauses of `canonical`
    pub program: Program,
}

/// Strategy table of format converters
pub struct FormatRouter {
    converters: HashMap<Framework, Box<dyn RuleConverter>>,
}

impl FormatRouter {
    /// Create a router with every built-in converter registered
    pub fn new() -> Result<Self> {
        let mut router = Self::empty();
        router.register(Box::new(CanonicalConverter::new()));
        router.register(Box::new(RegoConverter::new()?));
        router.register(Box::new(CedarConverter::new()?));
        router.register(Box::new(JsonPolicyConverter::new()));
        Ok(router)
    }

    /// Create a router without converters
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    /// Register a converter, replacing any previous one for its framework
    pub fn register(&mut self, converter: Box<dyn RuleConverter>) {
        self.converters.insert(converter.framework(), converter);
    }

    /// Frameworks with a registered converter
    pub fn frameworks(&self) -> Vec<Framework> {
        let mut frameworks: Vec<Framework> = self.converters.keys().copied().collect();
        frameworks.sort();
        frameworks
    }

    /// Guess the framework of `text`, falling back to `hint`, then canonical
    pub fn detect(&self, text: &str, hint: Option<Framework>) -> Framework {
        for strength in [Detection::Strong, Detection::Weak] {
            for framework in DETECTION_ORDER {
                let recognized = self
                    .converters
                    .get(&framework)
                    .and_then(|c| c.detect(text))
                    .is_some_and(|d| d == strength);
                if recognized {
                    return framework;
                }
            }
        }

        hint.unwrap_or(Framework::Canonical)
    }

    /// Convert `text` from `from` into canonical form.
    ///
    /// Permit rules produced from alternate formats are named `rule_name`.
    pub fn convert(
        &self,
        text: &str,
        from: Framework,
        rule_name: &str,
    ) -> std::result::Result<ConversionOutcome, ConversionError> {
        if !is_predicate(rule_name) {
            return Err(ConversionError::Malformed {
                framework: from,
                detail: format!("'{}' is not a valid rule name", rule_name),
            });
        }

        let converter = self
            .converters
            .get(&from)
            .ok_or(ConversionError::MissingConverter(from))?;

        let program = converter.convert(text, rule_name)?;
        if program.clauses.is_empty() {
            return Err(ConversionError::Empty);
        }

        let canonical = program.to_string();
        debug!(
            framework = %from,
            clauses = program.clauses.len(),
            imports = program.imports.len(),
            "Converted rule"
        );

        Ok(ConversionOutcome {
            framework: from,
            imports: program.imports.clone(),
            canonical,
            program,
        })
    }

    /// Parse canonical text
    pub fn validate_syntax(&self, text: &str) -> std::result::Result<Program, SyntaxError> {
        parse_program(text)
    }

    /// SHA-256 hex digest of rule text
    pub fn content_hash(&self, text: &str) -> String {
        pgc_core::content_hash(text)
    }
}

impl std::fmt::Debug for FormatRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormatRouter")
            .field("frameworks", &self.frameworks())
            .finish()
    }
}
