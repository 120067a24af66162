//! Message selectors: boolean predicates over message properties.
//!
//! Grammar:
//!
//! ```text
//! expr    := and (OR and)*
//! and     := unary (AND unary)*
//! unary   := NOT unary | primary
//! primary := '(' expr ')' | ident cmp literal | ident IS [NOT] NULL
//! cmp     := = | <> | < | > | <= | >=
//! literal := 'string' | number | TRUE | FALSE
//! ```
//!
//! A comparison against a missing property, or between incompatible types,
//! is false.

use std::fmt;

use crate::error::{BrokerError, Result};
use crate::message::{Message, Value};

#[derive(Debug, Clone, Copy, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Str(String),
    Num(f64),
    Bool(bool),
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Cmp {
        key: String,
        op: CmpOp,
        literal: Literal,
    },
    IsNull {
        key: String,
        negated: bool,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, message: &Message) -> bool {
        match self {
            Expr::Cmp { key, op, literal } => match message.property(key) {
                Some(value) => compare(value, *op, literal),
                None => false,
            },
            Expr::IsNull { key, negated } => message.property(key).is_none() != *negated,
            Expr::Not(inner) => !inner.eval(message),
            Expr::And(a, b) => a.eval(message) && b.eval(message),
            Expr::Or(a, b) => a.eval(message) || b.eval(message),
        }
    }
}

fn compare(value: &Value, op: CmpOp, literal: &Literal) -> bool {
    match (value, literal) {
        (Value::String(s), Literal::Str(l)) => match op {
            CmpOp::Eq => s == l,
            CmpOp::Ne => s != l,
            _ => false,
        },
        (Value::Bool(b), Literal::Bool(l)) => match op {
            CmpOp::Eq => b == l,
            CmpOp::Ne => b != l,
            _ => false,
        },
        (v, Literal::Num(l)) => match v.as_f64() {
            Some(n) => match op {
                CmpOp::Eq => n == *l,
                CmpOp::Ne => n != *l,
                CmpOp::Lt => n < *l,
                CmpOp::Gt => n > *l,
                CmpOp::Le => n <= *l,
                CmpOp::Ge => n >= *l,
            },
            None => false,
        },
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Cmp(CmpOp),
    LParen,
    RParen,
    And,
    Or,
    Not,
    Is,
    Null,
    True,
    False,
}

fn tokenize(input: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 1;
            }
            '<' => match chars.get(i + 1) {
                Some('>') => {
                    tokens.push(Token::Cmp(CmpOp::Ne));
                    i += 2;
                }
                Some('=') => {
                    tokens.push(Token::Cmp(CmpOp::Le));
                    i += 2;
                }
                _ => {
                    tokens.push(Token::Cmp(CmpOp::Lt));
                    i += 1;
                }
            },
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Cmp(CmpOp::Ge));
                    i += 2;
                } else {
                    tokens.push(Token::Cmp(CmpOp::Gt));
                    i += 1;
                }
            }
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_string()),
                        // '' escapes a quote
                        Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                            s.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| format!("bad number {text:?}"))?;
                tokens.push(Token::Num(n));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.to_ascii_uppercase().as_str() {
                    "AND" => Token::And,
                    "OR" => Token::Or,
                    "NOT" => Token::Not,
                    "IS" => Token::Is,
                    "NULL" => Token::Null,
                    "TRUE" => Token::True,
                    "FALSE" => Token::False,
                    _ => Token::Ident(word),
                });
            }
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
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
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expr(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> std::result::Result<Expr, String> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> std::result::Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> std::result::Result<Expr, String> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            Some(Token::Ident(key)) => match self.next() {
                Some(Token::Cmp(op)) => {
                    let literal = match self.next() {
                        Some(Token::Str(s)) => Literal::Str(s),
                        Some(Token::Num(n)) => Literal::Num(n),
                        Some(Token::True) => Literal::Bool(true),
                        Some(Token::False) => Literal::Bool(false),
                        other => return Err(format!("expected literal, found {other:?}")),
                    };
                    Ok(Expr::Cmp { key, op, literal })
                }
                Some(Token::Is) => {
                    let negated = if self.peek() == Some(&Token::Not) {
                        self.pos += 1;
                        true
                    } else {
                        false
                    };
                    match self.next() {
                        Some(Token::Null) => Ok(Expr::IsNull { key, negated }),
                        other => Err(format!("expected NULL, found {other:?}")),
                    }
                }
                other => Err(format!("expected operator after {key:?}, found {other:?}")),
            },
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

/// A parsed selector.
#[derive(Clone, PartialEq)]
pub struct Filter {
    expression: String,
    expr: Expr,
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Filter({:?})", self.expression)
    }
}

impl Filter {
    /// Parses a selector expression.
    pub fn parse(expression: &str) -> Result<Self> {
        let invalid = |reason: String| BrokerError::InvalidFilter {
            expression: expression.to_string(),
            reason,
        };
        let tokens = tokenize(expression).map_err(invalid)?;
        if tokens.is_empty() {
            return Err(invalid("empty expression".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr().map_err(invalid)?;
        if parser.pos < parser.tokens.len() {
            return Err(invalid(format!(
                "trailing input at token {}",
                parser.pos
            )));
        }
        Ok(Self {
            expression: expression.to_string(),
            expr,
        })
    }

    /// Source text of the selector.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Evaluates the selector against a message.
    pub fn matches(&self, message: &Message) -> bool {
        self.expr.eval(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg() -> Message {
        Message::new("a", "")
            .with_property("color", "red")
            .with_property("size", 10i32)
            .with_property("weight", 2.5f64)
            .with_property("urgent", true)
    }

    #[test]
    fn test_string_equality() {
        assert!(Filter::parse("color = 'red'").unwrap().matches(&msg()));
        assert!(!Filter::parse("color = 'blue'").unwrap().matches(&msg()));
        assert!(Filter::parse("color <> 'blue'").unwrap().matches(&msg()));
    }

    #[test]
    fn test_numeric_comparisons() {
        let m = msg();
        assert!(Filter::parse("size > 5").unwrap().matches(&m));
        assert!(Filter::parse("size <= 10").unwrap().matches(&m));
        assert!(!Filter::parse("size < 10").unwrap().matches(&m));
        assert!(Filter::parse("weight >= 2.5").unwrap().matches(&m));
        assert!(Filter::parse("size = 10.0").unwrap().matches(&m));
    }

    #[test]
    fn test_boolean_logic_precedence() {
        let m = msg();
        // AND binds tighter: false OR (true AND true)
        assert!(Filter::parse("color = 'blue' OR size = 10 AND urgent = TRUE")
            .unwrap()
            .matches(&m));
        assert!(!Filter::parse("(color = 'blue' OR size = 10) AND urgent = FALSE")
            .unwrap()
            .matches(&m));
        assert!(Filter::parse("NOT color = 'blue'").unwrap().matches(&m));
    }

    #[test]
    fn test_is_null() {
        let m = msg();
        assert!(Filter::parse("missing IS NULL").unwrap().matches(&m));
        assert!(Filter::parse("color IS NOT NULL").unwrap().matches(&m));
        assert!(!Filter::parse("color IS NULL").unwrap().matches(&m));
    }

    #[test]
    fn test_missing_property_never_compares() {
        let m = msg();
        assert!(!Filter::parse("missing = 'x'").unwrap().matches(&m));
        assert!(!Filter::parse("missing <> 'x'").unwrap().matches(&m));
    }

    #[test]
    fn test_type_mismatch_is_false() {
        assert!(!Filter::parse("color > 3").unwrap().matches(&msg()));
        assert!(!Filter::parse("size = 'ten'").unwrap().matches(&msg()));
    }

    #[test]
    fn test_escaped_quote() {
        let m = Message::new("a", "").with_property("name", "o'brien");
        assert!(Filter::parse("name = 'o''brien'").unwrap().matches(&m));
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "color =", "color = 'red", "(size > 1", "size > 1 extra", "= 3"] {
            let err = Filter::parse(bad).unwrap_err();
            assert!(matches!(err, BrokerError::InvalidFilter { .. }), "{bad}");
        }
    }
}
