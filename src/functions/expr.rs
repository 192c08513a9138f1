//! Boolean expressions over record fields, used by Filter rules.
//!
//! ```text
//! app == "web" and (status >= 500 or user.vip) and region not in ["cn", "ru"]
//! ```
//!
//! Names resolve to record fields (dotted names walk nested objects); a
//! missing field is `null`. Literals are strings in single or double quotes,
//! numbers, `true`/`false`, `null` and `[...]` lists. Operators by binding
//! strength: `or`, `and`, `not`, then comparisons `== != < <= > >= in`
//! and `not in`.

use crate::record::{Record, field};
use anyhow::{Result, anyhow, bail};
use serde_json::{Number, Value};
use std::cmp::Ordering;

/// Comparison operator shared by expressions and clause rules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

impl CmpOp {
    /// Parse an operator as written in clause rules.
    #[must_use]
    pub fn parse(op: &str) -> Option<Self> {
        Some(match op.trim().to_ascii_lowercase().as_str() {
            "==" | "=" | "eq" => Self::Eq,
            "!=" | "<>" | "ne" => Self::Ne,
            "<" | "lt" => Self::Lt,
            "<=" | "le" | "lte" => Self::Le,
            ">" | "gt" => Self::Gt,
            ">=" | "ge" | "gte" => Self::Ge,
            "in" => Self::In,
            "not in" | "not_in" | "nin" => Self::NotIn,
            _ => return None,
        })
    }

    /// Apply the operator.
    ///
    /// # Errors
    ///
    /// Fails when ordering values of different kinds, or testing membership
    /// in something that is not a list, string or object.
    pub fn apply(self, left: &Value, right: &Value) -> Result<bool> {
        match self {
            Self::Eq => Ok(loose_eq(left, right)),
            Self::Ne => Ok(!loose_eq(left, right)),
            Self::Lt => Ok(order(left, right)? == Ordering::Less),
            Self::Le => Ok(order(left, right)? != Ordering::Greater),
            Self::Gt => Ok(order(left, right)? == Ordering::Greater),
            Self::Ge => Ok(order(left, right)? != Ordering::Less),
            Self::In => contains(right, left),
            Self::NotIn => contains(right, left).map(|found| !found),
        }
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Result<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
                return Ok(i.cmp(&j));
            }
            let (x, y) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            x.partial_cmp(&y).ok_or_else(|| anyhow!("cannot order {x} and {y}"))
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        _ => bail!("cannot order {a} and {b}"),
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<bool> {
    match (haystack, needle) {
        (Value::Array(items), _) => Ok(items.iter().any(|v| loose_eq(v, needle))),
        (Value::String(s), Value::String(sub)) => Ok(s.contains(sub.as_str())),
        (Value::Object(map), Value::String(key)) => Ok(map.contains_key(key)),
        _ => bail!("cannot test membership of {needle} in {haystack}"),
    }
}

/// Truthiness used for the result of an expression.
#[must_use]
pub fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Parsed expression tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Literal(Value),
    Field(String),
    List(Vec<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
}

impl Expr {
    /// # Errors
    ///
    /// Returns a syntax error describing the first unexpected token.
    pub fn parse(src: &str) -> Result<Self> {
        let tokens = tokenize(src)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        if let Some(tok) = parser.peek() {
            bail!("unexpected {tok:?} at token {} in `{src}`", parser.pos);
        }
        Ok(expr)
    }

    /// Evaluate against a record.
    ///
    /// # Errors
    ///
    /// Fails on comparisons between incompatible values.
    pub fn eval(&self, record: &Record) -> Result<Value> {
        Ok(match self {
            Self::Literal(v) => v.clone(),
            Self::Field(name) => field(record, name).cloned().unwrap_or(Value::Null),
            Self::List(items) => Value::Array(
                items
                    .iter()
                    .map(|e| e.eval(record))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Self::Not(inner) => Value::Bool(!truthy(&inner.eval(record)?)),
            Self::And(a, b) => Value::Bool(truthy(&a.eval(record)?) && truthy(&b.eval(record)?)),
            Self::Or(a, b) => Value::Bool(truthy(&a.eval(record)?) || truthy(&b.eval(record)?)),
            Self::Compare(a, op, b) => Value::Bool(op.apply(&a.eval(record)?, &b.eval(record)?)?),
        })
    }

    /// # Errors
    ///
    /// See [`Expr::eval`].
    pub fn matches(&self, record: &Record) -> Result<bool> {
        self.eval(record).map(|v| truthy(&v))
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(Number),
    Op(&'static str),
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '(' => {
                out.push(Token::LParen);
                i += 1;
            }
            ')' => {
                out.push(Token::RParen);
                i += 1;
            }
            '[' => {
                out.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                out.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                out.push(Token::Comma);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let op = match two.as_str() {
                    "==" => "==",
                    "!=" => "!=",
                    "<=" => "<=",
                    ">=" => ">=",
                    _ => match c {
                        '<' => "<",
                        '>' => ">",
                        _ => bail!("unexpected `{c}` at {i} in `{src}`"),
                    },
                };
                i += op.len();
                out.push(Token::Op(op));
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => bail!("unterminated string in `{src}`"),
                        Some('\\') => {
                            if let Some(next) = chars.get(i + 1) {
                                s.push(*next);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                out.push(Token::Str(s));
            }
            _ if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E' | '+' | '-')) {
                    // A sign only continues a number right after an exponent.
                    if matches!(chars[i], '+' | '-') && !matches!(chars[i - 1], 'e' | 'E') {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let num = match text.parse::<i64>() {
                    Ok(n) => Number::from(n),
                    Err(_) => text
                        .parse::<f64>()
                        .ok()
                        .and_then(Number::from_f64)
                        .ok_or_else(|| anyhow!("bad number `{text}` in `{src}`"))?,
                };
                out.push(Token::Num(num));
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.')) {
                    i += 1;
                }
                out.push(Token::Ident(chars[start..i].iter().collect()));
            }
            _ => bail!("unexpected `{c}` at {i} in `{src}`"),
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(w)) if w == word)
    }

    fn expect(&mut self, want: &Token) -> Result<()> {
        match self.next() {
            Some(ref tok) if tok == want => Ok(()),
            other => bail!("expected {want:?}, found {other:?}"),
        }
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.keyword("or") {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.not()?;
        while self.keyword("and") {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.not()?));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr> {
        if self.keyword("not") {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.primary()?;
        let op = match self.peek() {
            Some(Token::Op(op)) => CmpOp::parse(op),
            Some(Token::Ident(w)) if w == "in" => Some(CmpOp::In),
            Some(Token::Ident(w))
                if w == "not" && matches!(self.tokens.get(self.pos + 1), Some(Token::Ident(n)) if n == "in") =>
            {
                self.pos += 1;
                Some(CmpOp::NotIn)
            }
            _ => None,
        };
        let Some(op) = op else {
            return Ok(left);
        };
        self.pos += 1;
        let right = self.primary()?;
        Ok(Expr::Compare(Box::new(left), op, Box::new(right)))
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if matches!(self.peek(), Some(Token::RBracket)) {
                    self.pos += 1;
                    return Ok(Expr::List(items));
                }
                loop {
                    items.push(self.primary()?);
                    match self.next() {
                        Some(Token::Comma) => {}
                        Some(Token::RBracket) => return Ok(Expr::List(items)),
                        other => bail!("expected `,` or `]`, found {other:?}"),
                    }
                }
            }
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" | "True" => Expr::Literal(Value::Bool(true)),
                "false" | "False" => Expr::Literal(Value::Bool(false)),
                "null" | "none" | "None" => Expr::Literal(Value::Null),
                "and" | "or" | "not" | "in" => bail!("unexpected keyword `{word}`"),
                _ => Expr::Field(word),
            }),
            other => bail!("unexpected {other:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    fn eval(src: &str, v: Value) -> bool {
        Expr::parse(src).unwrap().matches(&rec(v)).unwrap()
    }

    #[test]
    fn comparisons_and_logic() {
        let r = json!({"app": "web", "status": 503, "user": {"vip": true}, "region": "eu"});
        assert!(eval("app == 'web' and status >= 500", r.clone()));
        assert!(eval("not (app != \"web\")", r.clone()));
        assert!(eval("user.vip or status < 0", r.clone()));
        assert!(eval("region not in ['cn', 'ru']", r.clone()));
        assert!(!eval("region in ['cn', 'ru']", r.clone()));
        assert!(eval("status == 503.0", r.clone()));
        assert!(!eval("missing", r.clone()));
        assert!(eval("missing == null", r));
    }

    #[test]
    fn precedence() {
        assert_eq!(
            Expr::parse("a or b and c").unwrap(),
            Expr::Or(
                Box::new(Expr::Field("a".into())),
                Box::new(Expr::And(
                    Box::new(Expr::Field("b".into())),
                    Box::new(Expr::Field("c".into()))
                ))
            )
        );
    }

    #[test]
    fn errors() {
        assert!(Expr::parse("a ==").is_err());
        assert!(Expr::parse("(a").is_err());
        assert!(Expr::parse("a = b").is_err());
        assert!(Expr::parse("'open").is_err());
        let ordering = Expr::parse("app > 3").unwrap();
        assert!(ordering.matches(&rec(json!({"app": "web"}))).is_err());
    }

    #[test]
    fn negative_numbers() {
        assert!(eval("t > -1.5e2", json!({"t": -100})));
        assert!(eval("t in [-100, 3]", json!({"t": -100})));
    }
}
