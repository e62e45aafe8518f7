//! Converters from alternate authoring formats into canonical clauses
//!
//! Each converter turns one framework's text into a [`Program`] whose rule
//! heads have the `(U, A, R)` signature used by the decision query. The
//! router prints the program to obtain canonical text.

pub mod cedar;
pub mod json_policy;
pub mod rego;

use pgc_core::{attribute_predicate, Atom, Clause, Framework, Program, Term, Value};
use std::collections::BTreeMap;

use crate::syntax::{parse_program, SyntaxError};

pub use cedar::CedarConverter;
pub use json_policy::JsonPolicyConverter;
pub use rego::RegoConverter;

/// Errors raised while converting a rule into canonical form
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversionError {
    #[error("syntax error: {0}")]
    Syntax(#[from] SyntaxError),

    #[error("unsupported construct in {framework} rule: {detail}")]
    Unsupported { framework: Framework, detail: String },

    #[error("malformed {framework} rule: {detail}")]
    Malformed { framework: Framework, detail: String },

    #[error("no converter registered for {0}")]
    MissingConverter(Framework),

    #[error("rule produced no clauses")]
    Empty,
}

impl ConversionError {
    pub(crate) fn unsupported(framework: Framework, detail: impl Into<String>) -> Self {
        Self::Unsupported {
            framework,
            detail: detail.into(),
        }
    }

    pub(crate) fn malformed(framework: Framework, detail: impl Into<String>) -> Self {
        Self::Malformed {
            framework,
            detail: detail.into(),
        }
    }
}

/// How strongly a converter recognizes a piece of text
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Detection {
    /// Structural markers that only this format uses
    Strong,
    /// Plausible, but only if nothing else claims the text
    Weak,
}

/// A strategy for turning one framework's rules into canonical clauses
pub trait RuleConverter: Send + Sync {
    /// Framework this converter handles
    fn framework(&self) -> Framework;

    /// Structural recognition of this converter's format
    fn detect(&self, text: &str) -> Option<Detection>;

    /// Convert rule text, naming permit rules `rule_name`
    fn convert(&self, text: &str, rule_name: &str) -> Result<Program, ConversionError>;
}

/// Canonical text is parsed as-is; printing it normalizes layout
#[derive(Debug, Default)]
pub struct CanonicalConverter;

impl CanonicalConverter {
    pub fn new() -> Self {
        Self
    }
}

impl RuleConverter for CanonicalConverter {
    fn framework(&self) -> Framework {
        Framework::Canonical
    }

    fn detect(&self, text: &str) -> Option<Detection> {
        if text.contains(":-") {
            return Some(Detection::Strong);
        }

        let mut lines = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('%'))
            .peekable();

        if lines.peek().is_none() || text.contains('{') || text.contains(';') {
            return None;
        }

        lines.all(|l| l.ends_with('.')).then_some(Detection::Weak)
    }

    fn convert(&self, text: &str, _rule_name: &str) -> Result<Program, ConversionError> {
        Ok(parse_program(text)?)
    }
}

/// Variable standing for the environment group's identifier
const ENVIRONMENT_VAR: &str = "E";

/// Head variable for an attribute group name
pub(crate) fn group_variable(group: &str) -> Option<&'static str> {
    match group {
        "user" | "subject" | "principal" => Some("U"),
        "action" => Some("A"),
        "resource" => Some("R"),
        "environment" | "env" | "context" => Some(ENVIRONMENT_VAR),
        _ => None,
    }
}

/// Context group name for a head variable
fn variable_group(var: &str) -> &'static str {
    match var {
        "U" => "user",
        "A" => "action",
        "R" => "resource",
        _ => "environment",
    }
}

/// Accumulates the body of one permit clause over the `(U, A, R)` head
#[derive(Debug, Clone)]
pub(crate) struct ClauseBuilder {
    framework: Framework,
    bindings: BTreeMap<&'static str, Value>,
    body: Vec<Atom>,
    fresh: usize,
}

impl ClauseBuilder {
    pub(crate) fn new(framework: Framework) -> Self {
        Self {
            framework,
            bindings: BTreeMap::new(),
            body: Vec::new(),
            fresh: 0,
        }
    }

    /// Fix a group variable to a concrete identifier
    pub(crate) fn bind(&mut self, var: &'static str, value: Value) -> Result<(), ConversionError> {
        match self.bindings.get(var) {
            Some(existing) if *existing != value => Err(ConversionError::malformed(
                self.framework,
                format!(
                    "{} identifier compared to both {} and {}",
                    variable_group(var),
                    existing,
                    value
                ),
            )),
            _ => {
                self.bindings.insert(var, value);
                Ok(())
            }
        }
    }

    /// Require `has<Attribute>(var, value)`
    pub(crate) fn has(
        &mut self,
        var: &'static str,
        attribute: &str,
        value: Value,
    ) -> Result<(), ConversionError> {
        let predicate = self.predicate(var, attribute)?;
        self.body
            .push(Atom::new(predicate, vec![Term::var(var), Term::Const(value)]));
        Ok(())
    }

    /// Require two attributes to carry the same value
    pub(crate) fn join(
        &mut self,
        left: (&'static str, &str),
        right: (&'static str, &str),
    ) -> Result<(), ConversionError> {
        self.fresh += 1;
        let shared = Term::var(format!("V{}", self.fresh));
        let lhs = self.predicate(left.0, left.1)?;
        let rhs = self.predicate(right.0, right.1)?;
        self.body
            .push(Atom::new(lhs, vec![Term::var(left.0), shared.clone()]));
        self.body.push(Atom::new(rhs, vec![Term::var(right.0), shared]));
        Ok(())
    }

    /// Require a helper rule over the same subject, action and resource
    pub(crate) fn call(&mut self, predicate: &str) {
        self.body.push(Atom::new(predicate, head_terms()));
    }

    /// Finish the clause, substituting bound identifiers everywhere
    ///
    /// `E` is not part of the head, so a clause that mentions it is guarded
    /// by `environment(E)` to tie it to the request's environment group.
    pub(crate) fn build(mut self, head_predicate: &str) -> Clause {
        let environment = Term::var(ENVIRONMENT_VAR);
        let mentioned = self.bindings.contains_key(ENVIRONMENT_VAR)
            || self.body.iter().any(|atom| atom.args.contains(&environment));
        if mentioned {
            self.body
                .insert(0, Atom::new(variable_group(ENVIRONMENT_VAR), vec![environment]));
        }

        let substitute = |term: Term| match term {
            Term::Var(name) => match self.bindings.get(name.as_str()) {
                Some(value) => Term::Const(value.clone()),
                None => Term::Var(name),
            },
            constant => constant,
        };
        let rewrite = |atom: Atom| {
            Atom::new(atom.predicate, atom.args.into_iter().map(&substitute).collect())
        };

        let head = rewrite(Atom::new(head_predicate, head_terms()));
        let body = self.body.iter().cloned().map(&rewrite).collect();
        Clause::rule(head, body)
    }

    fn predicate(&self, var: &'static str, attribute: &str) -> Result<String, ConversionError> {
        attribute_predicate(variable_group(var), attribute)
            .map_err(|e| ConversionError::malformed(self.framework, e.to_string()))
    }
}

fn head_terms() -> Vec<Term> {
    vec![Term::var("U"), Term::var("A"), Term::var("R")]
}

/// Parse a literal written in an alternate format: quoted string, integer or bool
pub(crate) fn parse_literal(framework: Framework, text: &str) -> Result<Value, ConversionError> {
    let text = text.trim();
    if text.starts_with('"') {
        return serde_json::from_str::<String>(text)
            .map(Value::Str)
            .map_err(|e| ConversionError::malformed(framework, format!("bad string literal {}: {}", text, e)));
    }
    match text {
        "true" => Ok(Value::Bool(true)),
        "false" => Ok(Value::Bool(false)),
        _ => text
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| ConversionError::malformed(framework, format!("expected a literal, found '{}'", text))),
    }
}

/// Split on `sep` outside of quotes, parentheses and braces
pub(crate) fn split_top_level(text: &str, sep: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut rest = text;

    while let Some(c) = rest.chars().next() {
        if !in_string && depth == 0 && rest.starts_with(sep) {
            parts.push(std::mem::take(&mut current));
            rest = &rest[sep.len()..];
            continue;
        }

        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else {
            match c {
                '"' => in_string = true,
                '(' | '{' | '[' => depth += 1,
                ')' | '}' | ']' => depth -= 1,
                _ => {}
            }
        }

        current.push(c);
        rest = &rest[c.len_utf8()..];
    }

    parts.push(current);
    parts
}

/// Byte offset of the bracket closing the one at `open`, skipping quoted text
pub(crate) fn matching_close(text: &str, open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[open..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '(' | '{' | '[' => depth += 1,
            ')' | '}' | ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(open + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Remove line comments starting with `marker`, ignoring markers inside strings
pub(crate) fn strip_comments(text: &str, marker: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for line in text.lines() {
        let mut in_string = false;
        let mut escaped = false;
        let mut cut = line.len();
        for (i, c) in line.char_indices() {
            if in_string {
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    in_string = false;
                }
            } else if c == '"' {
                in_string = true;
            } else if line[i..].starts_with(marker) {
                cut = i;
                break;
            }
        }
        out.push_str(&line[..cut]);
        out.push('\n');
    }
    out
}
