//! Rego-style policies
//!
//! Supported subset:
//!
//! ```text
//! package authz
//! import data.roles
//! default allow = false
//!
//! allow if {
//!     input.user.role == "admin"
//!     is_owner
//! }
//!
//! is_owner { input.resource.owner == input.user.id }
//! ```
//!
//! `allow` blocks become the permit rule; other blocks become helper rules
//! with the same `(U, A, R)` signature. Comparing `input.<group>.id` to a
//! literal fixes that group's identifier in the head.

use pgc_core::{Framework, Program, Result};
use regex::Regex;

use super::{
    group_variable, matching_close, parse_literal, split_top_level, strip_comments, ClauseBuilder,
    ConversionError, Detection, RuleConverter,
};

const FRAMEWORK: Framework = Framework::AlternateA;

/// Operators that need negation or ordering, which the clause model lacks
const UNSUPPORTED_OPERATORS: [&str; 5] = ["!=", "<=", ">=", "<", ">"];

enum Operand {
    Input(&'static str, String),
    Literal(pgc_core::Value),
}

/// Converter for the Rego-style subset
pub struct RegoConverter {
    package_line: Regex,
    import_line: Regex,
    default_line: Regex,
    block_header: Regex,
    input_ref: Regex,
    helper_ref: Regex,
}

impl RegoConverter {
    /// Create a new Rego converter
    pub fn new() -> Result<Self> {
        Ok(Self {
            package_line: Regex::new(r"(?m)^\s*package\s+[A-Za-z_][\w.]*\s*$")
                .map_err(|e| pgc_core::Error::policy(format!("Failed to compile package regex: {}", e)))?,
            import_line: Regex::new(r"^import\s+([A-Za-z_][\w.]*)(?:\s+as\s+\w+)?$")
                .map_err(|e| pgc_core::Error::policy(format!("Failed to compile import regex: {}", e)))?,
            default_line: Regex::new(r"^default\s+[a-z_]\w*\s*:?=\s*\S+$")
                .map_err(|e| pgc_core::Error::policy(format!("Failed to compile default regex: {}", e)))?,
            block_header: Regex::new(r"^([a-z_][A-Za-z0-9_]*)\s*(?::?=\s*true\s*)?(?:if\s*)?$")
                .map_err(|e| pgc_core::Error::policy(format!("Failed to compile block regex: {}", e)))?,
            input_ref: Regex::new(r"^input\.([A-Za-z_]\w*)\.([A-Za-z_][\w-]*)$")
                .map_err(|e| pgc_core::Error::policy(format!("Failed to compile input regex: {}", e)))?,
            helper_ref: Regex::new(r"^[a-z_][A-Za-z0-9_]*$")
                .map_err(|e| pgc_core::Error::policy(format!("Failed to compile helper regex: {}", e)))?,
        })
    }

    fn declaration(&self, line: &str, program: &mut Program) -> std::result::Result<(), ConversionError> {
        if self.package_line.is_match(line) || self.default_line.is_match(line) {
            return Ok(());
        }

        if let Some(caps) = self.import_line.captures(line) {
            let path = &caps[1];
            let builtin = path == "input"
                || path.starts_with("input.")
                || path.starts_with("rego.")
                || path.starts_with("future.");
            if !builtin {
                program.add_import(path);
            }
            return Ok(());
        }

        Err(ConversionError::malformed(
            FRAMEWORK,
            format!("unrecognized statement '{}'", line),
        ))
    }

    fn block(
        &self,
        name: &str,
        body: &str,
        rule_name: &str,
    ) -> std::result::Result<pgc_core::Clause, ConversionError> {
        if matches!(name, "deny" | "violation") {
            return Err(ConversionError::unsupported(
                FRAMEWORK,
                format!("'{}' rules require negation", name),
            ));
        }
        if body.contains('{') {
            return Err(ConversionError::unsupported(FRAMEWORK, "nested blocks"));
        }

        let mut builder = ClauseBuilder::new(FRAMEWORK);

        let conditions = body
            .lines()
            .flat_map(|line| split_top_level(line, ";"))
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());

        for condition in conditions {
            self.condition(&condition, rule_name, &mut builder)?;
        }

        let head = if name == "allow" { rule_name } else { name };
        Ok(builder.build(head))
    }

    fn condition(
        &self,
        condition: &str,
        rule_name: &str,
        builder: &mut ClauseBuilder,
    ) -> std::result::Result<(), ConversionError> {
        if condition == "true" {
            return Ok(());
        }
        if condition.starts_with("not ") {
            return Err(ConversionError::unsupported(FRAMEWORK, "negated condition"));
        }
        if condition.starts_with("some ") || split_top_level(condition, " in ").len() > 1 {
            return Err(ConversionError::unsupported(FRAMEWORK, "iteration"));
        }
        if let Some(op) = UNSUPPORTED_OPERATORS
            .iter()
            .find(|op| split_top_level(condition, op).len() > 1)
        {
            return Err(ConversionError::unsupported(
                FRAMEWORK,
                format!("operator '{}'", op),
            ));
        }

        if self.helper_ref.is_match(condition) {
            let helper = if condition == "allow" { rule_name } else { condition };
            builder.call(helper);
            return Ok(());
        }

        let sides = split_top_level(condition, "==");
        let [lhs, rhs] = sides.as_slice() else {
            return Err(ConversionError::malformed(
                FRAMEWORK,
                format!("expected 'a == b', found '{}'", condition),
            ));
        };

        match (self.operand(lhs)?, self.operand(rhs)?) {
            (Operand::Input(var, attr), Operand::Literal(value))
            | (Operand::Literal(value), Operand::Input(var, attr)) => {
                if attr == "id" {
                    builder.bind(var, value)
                } else {
                    builder.has(var, &attr, value)
                }
            }
            (Operand::Input(lv, la), Operand::Input(rv, ra)) => builder.join((lv, &la), (rv, &ra)),
            (Operand::Literal(_), Operand::Literal(_)) => Err(ConversionError::malformed(
                FRAMEWORK,
                format!("comparison of two literals: '{}'", condition),
            )),
        }
    }

    fn operand(&self, text: &str) -> std::result::Result<Operand, ConversionError> {
        let text = text.trim();
        if let Some(caps) = self.input_ref.captures(text) {
            let var = group_variable(&caps[1]).ok_or_else(|| {
                ConversionError::malformed(FRAMEWORK, format!("unknown input group '{}'", &caps[1]))
            })?;
            return Ok(Operand::Input(var, caps[2].to_string()));
        }
        parse_literal(FRAMEWORK, text).map(Operand::Literal)
    }
}

impl RuleConverter for RegoConverter {
    fn framework(&self) -> Framework {
        FRAMEWORK
    }

    fn detect(&self, text: &str) -> Option<Detection> {
        let blocks_over_input = text.contains("input.") && text.contains('{');
        (self.package_line.is_match(text) || blocks_over_input).then_some(Detection::Strong)
    }

    fn convert(&self, text: &str, rule_name: &str) -> std::result::Result<Program, ConversionError> {
        let text = strip_comments(text, "#");
        let mut program = Program::new();
        let mut rest = text.as_str();

        loop {
            rest = rest.trim_start();
            if rest.is_empty() {
                break;
            }

            let brace = rest.find('{');
            let header = brace
                .map(|b| rest[..b].trim())
                .and_then(|h| self.block_header.captures(h))
                .map(|caps| caps[1].to_string());

            match (brace, header) {
                (Some(open), Some(name)) => {
                    let close = matching_close(rest, open).ok_or_else(|| {
                        ConversionError::malformed(FRAMEWORK, format!("unclosed block '{}'", name))
                    })?;
                    let clause = self.block(&name, &rest[open + 1..close], rule_name)?;
                    program.clauses.push(clause);
                    rest = &rest[close + 1..];
                }
                _ => {
                    let end = rest.find('\n').unwrap_or(rest.len());
                    self.declaration(rest[..end].trim(), &mut program)?;
                    rest = &rest[end..];
                }
            }
        }

        if program.clauses.is_empty() {
            return Err(ConversionError::malformed(FRAMEWORK, "no rule blocks"));
        }

        Ok(program)
    }
}
