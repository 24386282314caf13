//! Restricted expression evaluator for user-authored rule text.
//!
//! Grammar (whitespace-insensitive):
//!
//! ```text
//!   expr       := additive ( CMP additive )?
//!   additive   := term ( ('+' | '-') term )*
//!   term       := unary ( ('*' | '/') unary )*
//!   unary      := ('-' | '+') unary | primary
//!   primary    := NUMBER | IDENT | '(' expr ')'
//!   CMP        := '==' | '!=' | '>' | '<' | '>=' | '<='
//! ```
//!
//! RULE: There is no function call, attribute access, indexing, string
//! literal or assignment. The only name a formula may reference is the one
//! variable bound at parse time. Anything else is rejected before evaluation.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const MAX_SOURCE_LEN: usize = 512;
const MAX_DEPTH: usize = 32;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("formula is empty")]
    Empty,

    #[error("formula exceeds {MAX_SOURCE_LEN} characters")]
    TooLong,

    #[error("formula nests deeper than {MAX_DEPTH} levels")]
    TooDeep,

    #[error("unknown name '{name}' (only '{allowed}' may be referenced)")]
    UnknownName { name: String, allowed: String },

    #[error("function calls are not allowed: '{name}(...)'")]
    DisallowedFunction { name: String },

    #[error("disallowed character '{ch}' at position {pos}")]
    DisallowedCharacter { ch: char, pos: usize },

    #[error("disallowed operator '{op}' at position {pos}")]
    DisallowedOperator { op: String, pos: usize },

    #[error("invalid number literal '{literal}'")]
    InvalidNumber { literal: String },

    #[error("unexpected token '{token}' at position {pos}")]
    UnexpectedToken { token: String, pos: usize },

    #[error("unexpected end of formula")]
    UnexpectedEnd,

    #[error("formula produced a non-numeric result")]
    NonNumericResult,

    #[error("formula produced a non-boolean result")]
    NonBooleanResult,

    #[error("formula produced a non-finite result")]
    NonFinite,
}

// ── Tokens ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
}

impl CmpOp {
    pub fn apply(self, lhs: f64, rhs: f64) -> bool {
        match self {
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
            CmpOp::Gt => lhs > rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Le => lhs <= rhs,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Lt => "<",
            CmpOp::Ge => ">=",
            CmpOp::Le => "<=",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Cmp(CmpOp),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{n}"),
            Token::Ident(s) => f.write_str(s),
            Token::Plus => f.write_str("+"),
            Token::Minus => f.write_str("-"),
            Token::Star => f.write_str("*"),
            Token::Slash => f.write_str("/"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Cmp(op) => f.write_str(op.symbol()),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(usize, Token)>, EvalError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '0'..='9' | '.' => {
                // A leading '.' is only accepted as part of a number (".5");
                // anything else is attribute access.
                if c == '.' && !chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()) {
                    return Err(EvalError::DisallowedCharacter { ch: c, pos: i });
                }
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // Scientific notation: 1e6, 2.5E-3
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                let value = literal
                    .parse::<f64>()
                    .map_err(|_| EvalError::InvalidNumber { literal: literal.clone() })?;
                tokens.push((start, Token::Number(value)));
                // "1.5.foo" and "2abc" are both rejected here.
                if let Some(&next) = chars.get(i) {
                    if next.is_ascii_alphabetic() || next == '_' {
                        return Err(EvalError::DisallowedCharacter { ch: next, pos: i });
                    }
                }
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                if chars.get(i) == Some(&'.') {
                    return Err(EvalError::DisallowedCharacter { ch: '.', pos: i });
                }
                tokens.push((start, Token::Ident(name)));
            }
            '+' => {
                tokens.push((start, Token::Plus));
                i += 1;
            }
            '-' => {
                tokens.push((start, Token::Minus));
                i += 1;
            }
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    return Err(EvalError::DisallowedOperator { op: "**".into(), pos: i });
                }
                tokens.push((start, Token::Star));
                i += 1;
            }
            '/' => {
                if chars.get(i + 1) == Some(&'/') {
                    return Err(EvalError::DisallowedOperator { op: "//".into(), pos: i });
                }
                tokens.push((start, Token::Slash));
                i += 1;
            }
            '(' => {
                tokens.push((start, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((start, Token::RParen));
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let op = match (c, next) {
                    ('=', Some('=')) => Some((CmpOp::Eq, 2)),
                    ('!', Some('=')) => Some((CmpOp::Ne, 2)),
                    ('>', Some('=')) => Some((CmpOp::Ge, 2)),
                    ('<', Some('=')) => Some((CmpOp::Le, 2)),
                    ('>', _) => Some((CmpOp::Gt, 1)),
                    ('<', _) => Some((CmpOp::Lt, 1)),
                    _ => None,
                };
                match op {
                    Some((op, width)) => {
                        tokens.push((start, Token::Cmp(op)));
                        i += width;
                    }
                    None => {
                        return Err(EvalError::DisallowedOperator { op: c.to_string(), pos: i })
                    }
                }
            }
            '%' | '^' | '&' | '|' | '~' => {
                return Err(EvalError::DisallowedOperator { op: c.to_string(), pos: i });
            }
            other => return Err(EvalError::DisallowedCharacter { ch: other, pos: i }),
        }
    }

    Ok(tokens)
}

// ── AST ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Var,
    Neg(Box<Expr>),
    Binary(ArithOp, Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Number(f64),
    Bool(bool),
}

struct Parser<'a> {
    tokens: &'a [(usize, Token)],
    pos: usize,
    variable: &'a str,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn advance(&mut self) -> Option<(usize, Token)> {
        let item = self.tokens.get(self.pos).cloned();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn expr(&mut self) -> Result<Expr, EvalError> {
        let lhs = self.additive()?;
        if let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.advance();
            let rhs = self.additive()?;
            if let Some(Token::Cmp(_)) = self.peek() {
                let (pos, token) = self.tokens[self.pos].clone();
                return Err(EvalError::UnexpectedToken { token: token.to_string(), pos });
            }
            return Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, EvalError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithOp::Mul,
                Some(Token::Slash) => ArithOp::Div,
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, EvalError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(EvalError::TooDeep);
        }
        let result = match self.peek() {
            Some(Token::Minus) => {
                self.advance();
                self.unary().map(|e| Expr::Neg(Box::new(e)))
            }
            Some(Token::Plus) => {
                self.advance();
                self.unary()
            }
            _ => self.primary(),
        };
        self.depth -= 1;
        result
    }

    fn primary(&mut self) -> Result<Expr, EvalError> {
        let (pos, token) = self.advance().ok_or(EvalError::UnexpectedEnd)?;
        match token {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Ident(name) => {
                if let Some(Token::LParen) = self.peek() {
                    return Err(EvalError::DisallowedFunction { name });
                }
                if name != self.variable {
                    return Err(EvalError::UnknownName {
                        name,
                        allowed: self.variable.to_string(),
                    });
                }
                Ok(Expr::Var)
            }
            Token::LParen => {
                let inner = self.expr()?;
                match self.advance() {
                    Some((_, Token::RParen)) => Ok(inner),
                    Some((pos, t)) => Err(EvalError::UnexpectedToken { token: t.to_string(), pos }),
                    None => Err(EvalError::UnexpectedEnd),
                }
            }
            other => Err(EvalError::UnexpectedToken { token: other.to_string(), pos }),
        }
    }
}

fn eval(expr: &Expr, binding: f64) -> Value {
    match expr {
        Expr::Number(n) => Value::Number(*n),
        Expr::Var => Value::Number(binding),
        Expr::Neg(inner) => match eval(inner, binding) {
            Value::Number(n) => Value::Number(-n),
            b => b,
        },
        Expr::Binary(op, l, r) => {
            let (l, r) = (as_number(eval(l, binding)), as_number(eval(r, binding)));
            Value::Number(match op {
                ArithOp::Add => l + r,
                ArithOp::Sub => l - r,
                ArithOp::Mul => l * r,
                ArithOp::Div => l / r,
            })
        }
        Expr::Compare(op, l, r) => {
            let (l, r) = (as_number(eval(l, binding)), as_number(eval(r, binding)));
            Value::Bool(op.apply(l, r))
        }
    }
}

// Booleans only appear at the top of a comparison; an arithmetic operand
// that is a comparison result becomes NaN and is caught as non-finite.
fn as_number(v: Value) -> f64 {
    match v {
        Value::Number(n) => n,
        Value::Bool(_) => f64::NAN,
    }
}

// ── Formula ──────────────────────────────────────────────────────────────────

/// A parsed, validated formula over exactly one named variable.
#[derive(Debug, Clone)]
pub struct Formula {
    source: String,
    variable: String,
    ast: Expr,
}

impl Formula {
    pub fn parse(source: &str, variable: &str) -> Result<Self, EvalError> {
        if source.trim().is_empty() {
            return Err(EvalError::Empty);
        }
        if source.len() > MAX_SOURCE_LEN {
            return Err(EvalError::TooLong);
        }
        let tokens = tokenize(source)?;
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            variable,
            depth: 0,
        };
        let ast = parser.expr()?;
        if let Some((pos, token)) = tokens.get(parser.pos) {
            return Err(EvalError::UnexpectedToken { token: token.to_string(), pos: *pos });
        }
        Ok(Self {
            source: source.to_string(),
            variable: variable.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn variable(&self) -> &str {
        &self.variable
    }

    /// True when the formula's top level is a comparison.
    pub fn is_condition(&self) -> bool {
        matches!(self.ast, Expr::Compare(..))
    }

    pub fn evaluate_value(&self, binding: f64) -> Value {
        eval(&self.ast, binding)
    }

    /// Evaluate to a finite number.
    pub fn evaluate(&self, binding: f64) -> Result<f64, EvalError> {
        match self.evaluate_value(binding) {
            Value::Number(n) if n.is_finite() => Ok(n),
            Value::Number(_) => Err(EvalError::NonFinite),
            Value::Bool(_) => Err(EvalError::NonNumericResult),
        }
    }

    /// Evaluate a comparison formula to a boolean.
    pub fn evaluate_condition(&self, binding: f64) -> Result<bool, EvalError> {
        match self.evaluate_value(binding) {
            Value::Bool(b) => Ok(b),
            Value::Number(_) => Err(EvalError::NonBooleanResult),
        }
    }
}

impl PartialEq for Formula {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.variable == other.variable
    }
}

/// One-shot helper: parse `formula` with `variable` bound to `value`.
pub fn evaluate(formula: &str, variable: &str, value: f64) -> Result<f64, EvalError> {
    Formula::parse(formula, variable)?.evaluate(value)
}
