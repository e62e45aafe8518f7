//! Canonical rule syntax
//!
//! The canonical language is a small Horn-clause dialect:
//!
//! ```text
//! % comment
//! import data.roles.
//! permit(U, A, R) :- hasRole(U, "admin"), actionHasType(A, "read").
//! trusted("svc-backup").
//! ```
//!
//! Variables start with an uppercase letter or `_`. Constants are quoted
//! strings, integers, `true`/`false`, or bare lowercase identifiers (which
//! are read as strings).

use pgc_core::{Atom, Clause, Program, Term, Value};
use std::fmt;

/// Errors raised by the canonical parser
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyntaxError {
    #[error("line {line}: unexpected character '{ch}'")]
    InvalidCharacter { line: usize, ch: char },

    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: usize },

    #[error("line {line}: integer literal out of range: {literal}")]
    InvalidInteger { line: usize, literal: String },

    #[error("line {line}: expected {expected}, found {found}")]
    UnexpectedToken {
        line: usize,
        expected: &'static str,
        found: String,
    },

    #[error("unexpected end of input, expected {expected}")]
    UnexpectedEof { expected: &'static str },

    #[error("line {line}: unbalanced parentheses")]
    Unbalanced { line: usize },

    #[error("line {line}: unknown top-level declaration '{name}'")]
    UnknownDeclaration { line: usize, name: String },

    #[error("line {line}: invalid predicate name '{name}'")]
    InvalidPredicate { line: usize, name: String },

    #[error("line {line}: invalid import path '{path}'")]
    InvalidImport { line: usize, path: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    LParen,
    RParen,
    Comma,
    Dot,
    Neck,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(s) => write!(f, "'{}'", s),
            Token::Str(s) => write!(f, "string {:?}", s),
            Token::Int(i) => write!(f, "integer {}", i),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
            Token::Comma => f.write_str("','"),
            Token::Dot => f.write_str("'.'"),
            Token::Neck => f.write_str("':-'"),
        }
    }
}

#[derive(Debug, Clone)]
struct Spanned {
    token: Token,
    line: usize,
}

fn tokenize(text: &str) -> Result<Vec<Spanned>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1;
    let mut depth: i64 = 0;

    while let Some(&c) = chars.peek() {
        match c {
            '\n' => {
                line += 1;
                chars.next();
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            '%' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '(' => {
                depth += 1;
                chars.next();
                tokens.push(Spanned { token: Token::LParen, line });
            }
            ')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(SyntaxError::Unbalanced { line });
                }
                chars.next();
                tokens.push(Spanned { token: Token::RParen, line });
            }
            ',' => {
                chars.next();
                tokens.push(Spanned { token: Token::Comma, line });
            }
            '.' => {
                chars.next();
                tokens.push(Spanned { token: Token::Dot, line });
            }
            ':' => {
                chars.next();
                if chars.next_if_eq(&'-').is_none() {
                    return Err(SyntaxError::InvalidCharacter { line, ch: ':' });
                }
                tokens.push(Spanned { token: Token::Neck, line });
            }
            '"' => {
                chars.next();
                let start_line = line;
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some(other) => value.push(other),
                            None => break,
                        },
                        '\n' => {
                            line += 1;
                            value.push('\n');
                        }
                        c => value.push(c),
                    }
                }
                if !closed {
                    return Err(SyntaxError::UnterminatedString { line: start_line });
                }
                tokens.push(Spanned { token: Token::Str(value), line: start_line });
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut literal = String::new();
                literal.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if !d.is_ascii_digit() {
                        break;
                    }
                    literal.push(d);
                    chars.next();
                }
                if literal == "-" {
                    return Err(SyntaxError::InvalidCharacter { line, ch: '-' });
                }
                let value = literal
                    .parse::<i64>()
                    .map_err(|_| SyntaxError::InvalidInteger { line, literal: literal.clone() })?;
                tokens.push(Spanned { token: Token::Int(value), line });
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        ident.push(d);
                        chars.next();
                    } else if d == '.' {
                        // A dot directly followed by a letter continues a dotted path
                        let mut lookahead = chars.clone();
                        lookahead.next();
                        match lookahead.peek() {
                            Some(&n) if n.is_alphabetic() => {
                                ident.push('.');
                                chars.next();
                            }
                            _ => break,
                        }
                    } else {
                        break;
                    }
                }
                tokens.push(Spanned { token: Token::Ident(ident), line });
            }
            other => return Err(SyntaxError::InvalidCharacter { line, ch: other }),
        }
    }

    if depth != 0 {
        return Err(SyntaxError::Unbalanced { line });
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Spanned> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self, expected: &'static str) -> Result<Spanned, SyntaxError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(SyntaxError::UnexpectedEof { expected })?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, want: Token, expected: &'static str) -> Result<(), SyntaxError> {
        let got = self.next(expected)?;
        if got.token != want {
            return Err(SyntaxError::UnexpectedToken {
                line: got.line,
                expected,
                found: got.token.to_string(),
            });
        }
        Ok(())
    }

    fn program(&mut self) -> Result<Program, SyntaxError> {
        let mut program = Program::new();

        while let Some(first) = self.peek().cloned() {
            match &first.token {
                Token::Ident(name) if name == "import" => {
                    self.pos += 1;
                    let path = self.next("import path")?;
                    match path.token {
                        Token::Ident(p) if is_import_path(&p) => program.add_import(p),
                        other => {
                            return Err(SyntaxError::InvalidImport {
                                line: path.line,
                                path: other.to_string(),
                            })
                        }
                    }
                    self.expect(Token::Dot, "'.' after import")?;
                }
                Token::Ident(name) => {
                    if let Some(Spanned { token: Token::Ident(_), .. }) = self.tokens.get(self.pos + 1) {
                        return Err(SyntaxError::UnknownDeclaration {
                            line: first.line,
                            name: name.clone(),
                        });
                    }
                    program.clauses.push(self.clause()?);
                }
                other => {
                    return Err(SyntaxError::UnexpectedToken {
                        line: first.line,
                        expected: "clause or import",
                        found: other.to_string(),
                    })
                }
            }
        }

        Ok(program)
    }

    fn clause(&mut self) -> Result<Clause, SyntaxError> {
        let head = self.atom()?;
        let next = self.next("'.' or ':-'")?;
        match next.token {
            Token::Dot => Ok(Clause::fact(head)),
            Token::Neck => {
                let mut body = vec![self.atom()?];
                loop {
                    let sep = self.next("',' or '.'")?;
                    match sep.token {
                        Token::Comma => body.push(self.atom()?),
                        Token::Dot => break,
                        other => {
                            return Err(SyntaxError::UnexpectedToken {
                                line: sep.line,
                                expected: "',' or '.'",
                                found: other.to_string(),
                            })
                        }
                    }
                }
                Ok(Clause::rule(head, body))
            }
            other => Err(SyntaxError::UnexpectedToken {
                line: next.line,
                expected: "'.' or ':-'",
                found: other.to_string(),
            }),
        }
    }

    fn atom(&mut self) -> Result<Atom, SyntaxError> {
        let name = self.next("predicate")?;
        let predicate = match name.token {
            Token::Ident(p) if is_predicate(&p) => p,
            Token::Ident(p) => {
                return Err(SyntaxError::InvalidPredicate {
                    line: name.line,
                    name: p,
                })
            }
            other => {
                return Err(SyntaxError::UnexpectedToken {
                    line: name.line,
                    expected: "predicate",
                    found: other.to_string(),
                })
            }
        };

        let mut args = Vec::new();
        if matches!(self.peek(), Some(Spanned { token: Token::LParen, .. })) {
            self.pos += 1;
            if matches!(self.peek(), Some(Spanned { token: Token::RParen, .. })) {
                self.pos += 1;
                return Ok(Atom::new(predicate, args));
            }
            loop {
                args.push(self.term()?);
                let sep = self.next("',' or ')'")?;
                match sep.token {
                    Token::Comma => continue,
                    Token::RParen => break,
                    other => {
                        return Err(SyntaxError::UnexpectedToken {
                            line: sep.line,
                            expected: "',' or ')'",
                            found: other.to_string(),
                        })
                    }
                }
            }
        }

        Ok(Atom::new(predicate, args))
    }

    fn term(&mut self) -> Result<Term, SyntaxError> {
        let token = self.next("term")?;
        match token.token {
            Token::Str(s) => Ok(Term::Const(Value::Str(s))),
            Token::Int(i) => Ok(Term::Const(Value::Int(i))),
            Token::Ident(name) if name == "true" => Ok(Term::Const(Value::Bool(true))),
            Token::Ident(name) if name == "false" => Ok(Term::Const(Value::Bool(false))),
            Token::Ident(name) if is_variable(&name) => Ok(Term::Var(name)),
            Token::Ident(name) if is_predicate(&name) => Ok(Term::Const(Value::Str(name))),
            other => Err(SyntaxError::UnexpectedToken {
                line: token.line,
                expected: "term",
                found: other.to_string(),
            }),
        }
    }
}

/// Variables start with an uppercase letter or underscore
pub fn is_variable(name: &str) -> bool {
    name.chars()
        .next()
        .is_some_and(|c| c.is_uppercase() || c == '_')
        && !name.contains('.')
}

/// Predicates start with a lowercase letter and contain no dots
pub fn is_predicate(name: &str) -> bool {
    name.chars().next().is_some_and(|c| c.is_lowercase())
        && name.chars().all(|c| c.is_alphanumeric() || c == '_')
}

fn is_import_path(path: &str) -> bool {
    !path.is_empty()
        && path
            .split('.')
            .all(|seg| !seg.is_empty() && seg.chars().all(|c| c.is_alphanumeric() || c == '_'))
}

/// Parse canonical text into a program
pub fn parse_program(text: &str) -> Result<Program, SyntaxError> {
    let tokens = tokenize(text)?;
    Parser { tokens, pos: 0 }.program()
}

/// Parse a single atom, e.g. a query goal `permit("alice", A, R)`
pub fn parse_atom(text: &str) -> Result<Atom, SyntaxError> {
    let tokens = tokenize(text)?;
    let mut parser = Parser { tokens, pos: 0 };
    let atom = parser.atom()?;
    if let Some(extra) = parser.peek() {
        if extra.token != Token::Dot || parser.pos + 1 != parser.tokens.len() {
            return Err(SyntaxError::UnexpectedToken {
                line: extra.line,
                expected: "end of goal",
                found: extra.token.to_string(),
            });
        }
    }
    Ok(atom)
}
