//! Cedar-style policies
//!
//! ```text
//! permit(principal, action == Action::"read", resource)
//! when { principal.department == resource.department && context.mfa == true };
//! ```
//!
//! Scope equalities fix the identifier of that head position. `forbid`,
//! `unless`, `||` and hierarchy (`in`) need negation or entity graphs and
//! are rejected.

use pgc_core::{Framework, Program, Result, Value};
use regex::Regex;

use super::{
    group_variable, matching_close, parse_literal, split_top_level, strip_comments, ClauseBuilder,
    ConversionError, Detection, RuleConverter,
};

const FRAMEWORK: Framework = Framework::AlternateB;

const UNSUPPORTED_OPERATORS: [&str; 9] = ["||", "!=", "<=", ">=", "<", ">", " in ", " has ", " like "];

enum Operand {
    Attribute(&'static str, String),
    Literal(Value),
}

/// Converter for the Cedar-style subset
pub struct CedarConverter {
    statement: Regex,
    scope_eq: Regex,
    entity: Regex,
    attr_ref: Regex,
}

impl CedarConverter {
    /// Create a new Cedar converter
    pub fn new() -> Result<Self> {
        Ok(Self {
            statement: Regex::new(r"(?m)^\s*(permit|forbid)\s*\(")
                .map_err(|e| pgc_core::Error::policy(format!("Failed to compile statement regex: {}", e)))?,
            scope_eq: Regex::new(r"(?s)^(principal|action|resource)\s*==\s*(.+)$")
                .map_err(|e| pgc_core::Error::policy(format!("Failed to compile scope regex: {}", e)))?,
            entity: Regex::new(r#"^(?:[A-Za-z_]\w*::)+("(?:[^"\\]|\\.)*")$"#)
                .map_err(|e| pgc_core::Error::policy(format!("Failed to compile entity regex: {}", e)))?,
            attr_ref: Regex::new(r"^(principal|action|resource|context)\.([A-Za-z_]\w*)$")
                .map_err(|e| pgc_core::Error::policy(format!("Failed to compile attribute regex: {}", e)))?,
        })
    }

    fn statement(
        &self,
        statement: &str,
        rule_name: &str,
    ) -> std::result::Result<pgc_core::Clause, ConversionError> {
        let rest = if let Some(rest) = statement.strip_prefix("permit") {
            rest.trim_start()
        } else if statement.starts_with("forbid") {
            return Err(ConversionError::unsupported(FRAMEWORK, "forbid requires negation"));
        } else {
            return Err(ConversionError::malformed(
                FRAMEWORK,
                format!("expected permit statement, found '{}'", statement),
            ));
        };

        if !rest.starts_with('(') {
            return Err(ConversionError::malformed(FRAMEWORK, "missing scope"));
        }
        let close = matching_close(rest, 0)
            .ok_or_else(|| ConversionError::malformed(FRAMEWORK, "unclosed scope"))?;

        let mut builder = ClauseBuilder::new(FRAMEWORK);
        self.scope(&rest[1..close], &mut builder)?;

        let tail = rest[close + 1..].trim();
        if tail.starts_with("unless") {
            return Err(ConversionError::unsupported(FRAMEWORK, "unless requires negation"));
        }
        if let Some(when) = tail.strip_prefix("when") {
            let when = when.trim_start();
            let close = when
                .starts_with('{')
                .then(|| matching_close(when, 0))
                .flatten()
                .ok_or_else(|| ConversionError::malformed(FRAMEWORK, "malformed when clause"))?;
            if !when[close + 1..].trim().is_empty() {
                return Err(ConversionError::malformed(
                    FRAMEWORK,
                    "unexpected text after when clause",
                ));
            }
            self.conditions(&when[1..close], &mut builder)?;
        } else if !tail.is_empty() {
            return Err(ConversionError::malformed(
                FRAMEWORK,
                format!("unexpected text '{}'", tail),
            ));
        }

        Ok(builder.build(rule_name))
    }

    fn scope(&self, scope: &str, builder: &mut ClauseBuilder) -> std::result::Result<(), ConversionError> {
        let items: Vec<String> = split_top_level(scope, ",")
            .into_iter()
            .map(|s| s.trim().to_string())
            .collect();

        if items.len() != 3 {
            return Err(ConversionError::malformed(
                FRAMEWORK,
                "scope must name principal, action and resource",
            ));
        }

        for item in &items {
            if matches!(item.as_str(), "principal" | "action" | "resource") {
                continue;
            }
            if split_top_level(item, " in ").len() > 1 {
                return Err(ConversionError::unsupported(FRAMEWORK, "entity hierarchy (in)"));
            }
            let caps = self.scope_eq.captures(item).ok_or_else(|| {
                ConversionError::malformed(FRAMEWORK, format!("bad scope constraint '{}'", item))
            })?;
            let var = self.variable(&caps[1])?;
            builder.bind(var, self.literal(&caps[2])?)?;
        }

        Ok(())
    }

    fn conditions(&self, body: &str, builder: &mut ClauseBuilder) -> std::result::Result<(), ConversionError> {
        for op in UNSUPPORTED_OPERATORS {
            if split_top_level(body, op).len() > 1 {
                return Err(ConversionError::unsupported(
                    FRAMEWORK,
                    format!("operator '{}'", op.trim()),
                ));
            }
        }

        for condition in split_top_level(body, "&&") {
            let condition = condition.trim();
            if condition == "true" {
                continue;
            }

            let sides = split_top_level(condition, "==");
            let [lhs, rhs] = sides.as_slice() else {
                return Err(ConversionError::malformed(
                    FRAMEWORK,
                    format!("expected 'a == b', found '{}'", condition),
                ));
            };

            match (self.operand(lhs)?, self.operand(rhs)?) {
                (Operand::Attribute(var, attr), Operand::Literal(value))
                | (Operand::Literal(value), Operand::Attribute(var, attr)) => {
                    builder.has(var, &attr, value)?
                }
                (Operand::Attribute(lv, la), Operand::Attribute(rv, ra)) => {
                    builder.join((lv, &la), (rv, &ra))?
                }
                (Operand::Literal(_), Operand::Literal(_)) => {
                    return Err(ConversionError::malformed(
                        FRAMEWORK,
                        format!("comparison of two literals: '{}'", condition),
                    ))
                }
            }
        }

        Ok(())
    }

    fn operand(&self, text: &str) -> std::result::Result<Operand, ConversionError> {
        let text = text.trim();
        match self.attr_ref.captures(text) {
            Some(caps) => {
                let var = self.variable(&caps[1])?;
                Ok(Operand::Attribute(var, caps[2].to_string()))
            }
            None => self.literal(text).map(Operand::Literal),
        }
    }

    fn variable(&self, entity: &str) -> std::result::Result<&'static str, ConversionError> {
        group_variable(entity).ok_or_else(|| {
            ConversionError::malformed(FRAMEWORK, format!("unknown entity '{}'", entity))
        })
    }

    /// `User::"alice"` and `"alice"` both read as the string `alice`
    fn literal(&self, text: &str) -> std::result::Result<Value, ConversionError> {
        let text = text.trim();
        match self.entity.captures(text) {
            Some(caps) => parse_literal(FRAMEWORK, &caps[1]),
            None => parse_literal(FRAMEWORK, text),
        }
    }
}

impl RuleConverter for CedarConverter {
    fn framework(&self) -> Framework {
        FRAMEWORK
    }

    fn detect(&self, text: &str) -> Option<Detection> {
        (self.statement.is_match(text) && text.contains("principal")).then_some(Detection::Strong)
    }

    fn convert(&self, text: &str, rule_name: &str) -> std::result::Result<Program, ConversionError> {
        let text = strip_comments(text, "//");
        let mut program = Program::new();

        for statement in split_top_level(&text, ";") {
            let statement = statement.trim();
            if statement.is_empty() {
                continue;
            }
            program.clauses.push(self.statement(statement, rule_name)?);
        }

        if program.clauses.is_empty() {
            return Err(ConversionError::malformed(FRAMEWORK, "no statements"));
        }

        Ok(program)
    }
}
