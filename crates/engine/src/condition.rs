//! Step and trigger conditions.
//!
//! A condition is a small boolean expression over the run's variables
//! (trigger parameters plus `trigger`, the trigger type):
//!
//! ```text
//! branch == "main" && !(skip_deploy || env != 'prod')
//! ```
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! or      := and (("||" | "or") and)*
//! and     := not (("&&" | "and") not)*
//! not     := ("!" | "not") not | compare
//! compare := primary (("==" | "!=") primary)?
//! primary := "(" or ")" | STRING | "true" | "false" | IDENT | NUMBER
//! ```
//!
//! Unknown variables evaluate to the empty string. A string used as a
//! boolean is true unless it is empty, `"false"` or `"0"`.
//!
//! Conditions are parsed when the definition is loaded; evaluation cannot
//! fail.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Ne,
    Str(String),
    Ident(String),
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(i, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '!' => {
                chars.next();
                if matches!(chars.peek(), Some((_, '='))) {
                    chars.next();
                    tokens.push(Token::Ne);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '=' | '&' | '|' => {
                chars.next();
                match chars.next() {
                    Some((_, next)) if next == c => tokens.push(match c {
                        '=' => Token::Eq,
                        '&' => Token::And,
                        _ => Token::Or,
                    }),
                    _ => return Err(format!("expected '{c}{c}' at offset {i}")),
                }
            }
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some((_, escaped)) => value.push(escaped),
                            None => break,
                        },
                        ch if ch == quote => {
                            closed = true;
                            break;
                        }
                        ch => value.push(ch),
                    }
                }
                if !closed {
                    return Err(format!("unterminated string starting at offset {i}"));
                }
                tokens.push(Token::Str(value));
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut word = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || ch == '-' {
                        word.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character '{other}' at offset {i}")),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Expr {
    Str(String),
    Bool(bool),
    Var(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut lhs = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and()?));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut lhs = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            lhs = Expr::And(Box::new(lhs), Box::new(self.not()?));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, String> {
        let lhs = self.primary()?;
        match self.peek() {
            Some(Token::Eq) => {
                self.bump();
                Ok(Expr::Eq(Box::new(lhs), Box::new(self.primary()?)))
            }
            Some(Token::Ne) => {
                self.bump();
                Ok(Expr::Ne(Box::new(lhs), Box::new(self.primary()?)))
            }
            _ => Ok(lhs),
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.bump() {
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("missing ')'".into()),
                }
            }
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Expr::Bool(true),
                "false" => Expr::Bool(false),
                w if w.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-') => {
                    Expr::Str(word)
                }
                _ => Expr::Var(word),
            }),
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".into()),
        }
    }
}

enum Value {
    Str(String),
    Bool(bool),
}

impl Value {
    fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Str(s) => !(s.is_empty() || s == "false" || s == "0"),
        }
    }

    fn into_string(self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Str(s) => s,
        }
    }
}

impl Expr {
    fn eval(&self, vars: &BTreeMap<String, String>) -> Value {
        match self {
            Expr::Str(s) => Value::Str(s.clone()),
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Var(name) => Value::Str(vars.get(name).cloned().unwrap_or_default()),
            Expr::Not(e) => Value::Bool(!e.eval(vars).truthy()),
            Expr::And(a, b) => Value::Bool(a.eval(vars).truthy() && b.eval(vars).truthy()),
            Expr::Or(a, b) => Value::Bool(a.eval(vars).truthy() || b.eval(vars).truthy()),
            Expr::Eq(a, b) => Value::Bool(a.eval(vars).into_string() == b.eval(vars).into_string()),
            Expr::Ne(a, b) => Value::Bool(a.eval(vars).into_string() != b.eval(vars).into_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Condition
// ---------------------------------------------------------------------------

/// A parsed boolean condition. Serialises as its source text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Condition {
    source: String,
    expr: Expr,
}

impl Condition {
    /// # Errors
    /// [`EngineError::InvalidCondition`] on a syntax error.
    pub fn parse(source: &str) -> Result<Self, EngineError> {
        let invalid = |reason: String| EngineError::InvalidCondition {
            expression: source.to_string(),
            reason,
        };

        let tokens = tokenize(source).map_err(invalid)?;
        if tokens.is_empty() {
            return Err(invalid("empty condition".into()));
        }

        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or().map_err(invalid)?;
        if parser.pos < parser.tokens.len() {
            return Err(invalid(format!(
                "unexpected trailing token {:?}",
                parser.tokens[parser.pos]
            )));
        }

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn evaluate(&self, vars: &BTreeMap<String, String>) -> bool {
        self.expr.eval(vars).truthy()
    }

    pub fn source(&self) -> &str {
        &self.source
    }
}

impl TryFrom<String> for Condition {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Condition> for String {
    fn from(c: Condition) -> Self {
        c.source
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
