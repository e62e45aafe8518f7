//! Canonical rule terms, atoms and clauses
//!
//! Every ingested rule, whatever format it arrived in, ends up as a
//! [`Program`] of Horn clauses over these types. The `Display`
//! implementations produce the canonical text form, so printing a parsed
//! program is the normalization step used for content hashing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A constant value appearing in rules and facts
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl Value {
    /// Create a string constant
    pub fn string(s: impl Into<String>) -> Self {
        Self::Str(s.into())
    }

    /// Convert a JSON scalar into a constant.
    ///
    /// Floats and integers outside the `i64` range are kept in their decimal
    /// string form. Returns `None` for null, arrays and objects.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) => Some(Self::Str(s.clone())),
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => Some(
                n.as_i64()
                    .map(Self::Int)
                    .unwrap_or_else(|| Self::Str(n.to_string())),
            ),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => {
                f.write_str("\"")?;
                for c in s.chars() {
                    match c {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        c => write!(f, "{}", c)?,
                    }
                }
                f.write_str("\"")
            }
        }
    }
}

/// A term: either a variable or a constant
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Term {
    Var(String),
    Const(Value),
}

impl Term {
    /// Create a variable term
    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(name.into())
    }

    /// Create a string constant term
    pub fn string(s: impl Into<String>) -> Self {
        Self::Const(Value::Str(s.into()))
    }

    /// Check if this term is a variable
    pub fn is_var(&self) -> bool {
        matches!(self, Self::Var(_))
    }

    /// Get the constant value if this term is ground
    pub fn as_const(&self) -> Option<&Value> {
        match self {
            Self::Const(v) => Some(v),
            Self::Var(_) => None,
        }
    }
}

impl From<Value> for Term {
    fn from(value: Value) -> Self {
        Self::Const(value)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(name) => f.write_str(name),
            Term::Const(value) => write!(f, "{}", value),
        }
    }
}

/// A predicate applied to an ordered argument list
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Atom {
    pub predicate: String,
    pub args: Vec<Term>,
}

impl Atom {
    /// Create a new atom
    pub fn new(predicate: impl Into<String>, args: Vec<Term>) -> Self {
        Self {
            predicate: predicate.into(),
            args,
        }
    }

    /// Create a ground atom from constants
    pub fn fact(predicate: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(predicate, values.into_iter().map(Term::Const).collect())
    }

    /// Number of arguments
    pub fn arity(&self) -> usize {
        self.args.len()
    }

    /// Check if the atom contains no variables
    pub fn is_ground(&self) -> bool {
        self.args.iter().all(|t| !t.is_var())
    }

    /// Variable names in order of first appearance
    pub fn variables(&self) -> Vec<&str> {
        let mut vars: Vec<&str> = Vec::new();
        for term in &self.args {
            if let Term::Var(name) = term {
                if !vars.contains(&name.as_str()) {
                    vars.push(name);
                }
            }
        }
        vars
    }
}

impl fmt::Display for Atom {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.predicate)?;
        if self.args.is_empty() {
            return Ok(());
        }
        f.write_str("(")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        f.write_str(")")
    }
}

/// A Horn clause: `head :- body1, body2.` or a fact `head.`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Clause {
    pub head: Atom,
    pub body: Vec<Atom>,
}

impl Clause {
    /// Create a rule clause
    pub fn rule(head: Atom, body: Vec<Atom>) -> Self {
        Self { head, body }
    }

    /// Create a fact clause
    pub fn fact(head: Atom) -> Self {
        Self {
            head,
            body: Vec::new(),
        }
    }

    /// Check if this clause is a fact
    pub fn is_fact(&self) -> bool {
        self.body.is_empty()
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.head)?;
        if !self.body.is_empty() {
            f.write_str(" :- ")?;
            for (i, atom) in self.body.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", atom)?;
            }
        }
        f.write_str(".")
    }
}

/// A parsed canonical rule document
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Program {
    /// Import declarations, deduplicated in order of appearance
    pub imports: Vec<String>,

    /// Clauses in source order
    pub clauses: Vec<Clause>,
}

impl Program {
    /// Create an empty program
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an import, ignoring duplicates
    pub fn add_import(&mut self, import: impl Into<String>) {
        let import = import.into();
        if !self.imports.contains(&import) {
            self.imports.push(import);
        }
    }

    /// Append another program's imports and clauses
    pub fn extend(&mut self, other: Program) {
        for import in other.imports {
            self.add_import(import);
        }
        self.clauses.extend(other.clauses);
    }
}

/// Canonical text: imports first, then one clause per line
impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for import in &self.imports {
            writeln!(f, "import {}.", import)?;
        }
        for clause in &self.clauses {
            writeln!(f, "{}", clause)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clause_display() {
        let clause = Clause::rule(
            Atom::new(
                "permit",
                vec![Term::var("U"), Term::var("A"), Term::var("R")],
            ),
            vec![Atom::new(
                "hasRole",
                vec![Term::var("U"), Term::string("admin")],
            )],
        );

        assert_eq!(
            clause.to_string(),
            r#"permit(U, A, R) :- hasRole(U, "admin")."#
        );
    }

    #[test]
    fn test_string_escaping() {
        let value = Value::string("say \"hi\"\\");
        assert_eq!(value.to_string(), r#""say \"hi\"\\""#);
    }

    #[test]
    fn test_value_from_json() {
        assert_eq!(
            Value::from_json(&serde_json::json!(42)),
            Some(Value::Int(42))
        );
        assert_eq!(
            Value::from_json(&serde_json::json!(1.5)),
            Some(Value::string("1.5"))
        );
        assert_eq!(
            Value::from_json(&serde_json::json!(true)),
            Some(Value::Bool(true))
        );
        assert_eq!(Value::from_json(&serde_json::json!(null)), None);
        assert_eq!(Value::from_json(&serde_json::json!(["a"])), None);
    }

    #[test]
    fn test_atom_variables_in_order() {
        let atom = Atom::new(
            "edge",
            vec![Term::var("Y"), Term::string("x"), Term::var("X"), Term::var("Y")],
        );
        assert_eq!(atom.variables(), vec!["Y", "X"]);
        assert!(!atom.is_ground());
    }

    #[test]
    fn test_program_imports_deduplicated() {
        let mut program = Program::new();
        program.add_import("data.roles");
        program.add_import("data.roles");
        program.clauses.push(Clause::fact(Atom::fact(
            "trusted",
            vec![Value::string("svc")],
        )));

        assert_eq!(program.to_string(), "import data.roles.\ntrusted(\"svc\").\n");
    }
}
