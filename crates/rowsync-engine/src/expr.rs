//! The transform expression language.
//!
//! Deliberately tiny: column references, string and number literals,
//! `+ - * /`, and the pure functions `concat`, `coalesce`, and `now`.
//! `now()` resolves to the entry's capture timestamp rather than the wall
//! clock, which keeps mapping a pure function of its inputs.
//!
//! Row filters are a separate, even smaller grammar:
//! `Column = literal` / `Column != literal` terms joined with `AND`.

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
   Column(String),
   String(String),
   Number(f64),
   Call(String, Vec<Expr>),
   Binary(Op, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
   Add,
   Sub,
   Mul,
   Div,
}

/// One `Column (=|!=) literal` comparison of a row filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterTerm {
   pub column: String,
   pub negated: bool,
   pub value: serde_json::Value,
}

/// Everything an expression may read during evaluation.
pub struct EvalContext<'a> {
   pub row: &'a serde_json::Map<String, serde_json::Value>,
   /// Capture timestamp of the entry being mapped; the value of `now()`.
   pub timestamp: OffsetDateTime,
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
   Ident(String),
   String(String),
   Number(f64),
   Plus,
   Minus,
   Star,
   Slash,
   LParen,
   RParen,
   Comma,
   Equals,
   NotEquals,
}

fn err(expression: &str, message: impl Into<String>) -> Error {
   Error::Expression {
      expression: expression.to_string(),
      message: message.into(),
   }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
   let mut tokens = Vec::new();
   let mut chars = input.chars().peekable();

   while let Some(&c) = chars.peek() {
      match c {
         ' ' | '\t' | '\n' | '\r' => {
            chars.next();
         }
         '+' => {
            chars.next();
            tokens.push(Token::Plus);
         }
         '-' => {
            chars.next();
            tokens.push(Token::Minus);
         }
         '*' => {
            chars.next();
            tokens.push(Token::Star);
         }
         '/' => {
            chars.next();
            tokens.push(Token::Slash);
         }
         '(' => {
            chars.next();
            tokens.push(Token::LParen);
         }
         ')' => {
            chars.next();
            tokens.push(Token::RParen);
         }
         ',' => {
            chars.next();
            tokens.push(Token::Comma);
         }
         '=' => {
            chars.next();
            tokens.push(Token::Equals);
         }
         '!' => {
            chars.next();
            if chars.next() != Some('=') {
               return Err(err(input, "expected '=' after '!'"));
            }
            tokens.push(Token::NotEquals);
         }
         '\'' | '"' => {
            let quote = c;
            chars.next();
            let mut text = String::new();
            loop {
               match chars.next() {
                  Some(ch) if ch == quote => break,
                  Some(ch) => text.push(ch),
                  None => return Err(err(input, "unterminated string literal")),
               }
            }
            tokens.push(Token::String(text));
         }
         c if c.is_ascii_digit() => {
            let mut text = String::new();
            while let Some(&ch) = chars.peek() {
               if ch.is_ascii_digit() || ch == '.' {
                  text.push(ch);
                  chars.next();
               } else {
                  break;
               }
            }
            let number = text
               .parse::<f64>()
               .map_err(|_| err(input, format!("bad number literal '{text}'")))?;
            tokens.push(Token::Number(number));
         }
         c if c.is_ascii_alphabetic() || c == '_' => {
            let mut text = String::new();
            while let Some(&ch) = chars.peek() {
               if ch.is_ascii_alphanumeric() || ch == '_' {
                  text.push(ch);
                  chars.next();
               } else {
                  break;
               }
            }
            tokens.push(Token::Ident(text));
         }
         other => return Err(err(input, format!("unexpected character '{other}'"))),
      }
   }
   Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
   input: &'a str,
   tokens: Vec<Token>,
   pos: usize,
}

impl<'a> Parser<'a> {
   fn peek(&self) -> Option<&Token> {
      self.tokens.get(self.pos)
   }

   fn next(&mut self) -> Option<Token> {
      let token = self.tokens.get(self.pos).cloned();
      if token.is_some() {
         self.pos += 1;
      }
      token
   }

   fn expect(&mut self, expected: Token) -> Result<()> {
      match self.next() {
         Some(token) if token == expected => Ok(()),
         other => Err(err(self.input, format!("expected {expected:?}, found {other:?}"))),
      }
   }

   fn expression(&mut self) -> Result<Expr> {
      let mut left = self.term()?;
      while let Some(op) = match self.peek() {
         Some(Token::Plus) => Some(Op::Add),
         Some(Token::Minus) => Some(Op::Sub),
         _ => None,
      } {
         self.next();
         let right = self.term()?;
         left = Expr::Binary(op, Box::new(left), Box::new(right));
      }
      Ok(left)
   }

   fn term(&mut self) -> Result<Expr> {
      let mut left = self.factor()?;
      while let Some(op) = match self.peek() {
         Some(Token::Star) => Some(Op::Mul),
         Some(Token::Slash) => Some(Op::Div),
         _ => None,
      } {
         self.next();
         let right = self.factor()?;
         left = Expr::Binary(op, Box::new(left), Box::new(right));
      }
      Ok(left)
   }

   fn factor(&mut self) -> Result<Expr> {
      match self.next() {
         Some(Token::Number(n)) => Ok(Expr::Number(n)),
         Some(Token::String(s)) => Ok(Expr::String(s)),
         Some(Token::LParen) => {
            let inner = self.expression()?;
            self.expect(Token::RParen)?;
            Ok(inner)
         }
         Some(Token::Ident(name)) => {
            if self.peek() == Some(&Token::LParen) {
               self.next();
               let mut args = Vec::new();
               if self.peek() != Some(&Token::RParen) {
                  loop {
                     args.push(self.expression()?);
                     match self.peek() {
                        Some(Token::Comma) => {
                           self.next();
                        }
                        _ => break,
                     }
                  }
               }
               self.expect(Token::RParen)?;
               let name = name.to_ascii_lowercase();
               match name.as_str() {
                  "concat" | "coalesce" | "now" => Ok(Expr::Call(name, args)),
                  other => Err(err(self.input, format!("unknown function '{other}'"))),
               }
            } else {
               Ok(Expr::Column(name))
            }
         }
         other => Err(err(self.input, format!("unexpected token {other:?}"))),
      }
   }
}

/// Parses one transform expression.
pub fn parse(input: &str) -> Result<Expr> {
   let tokens = tokenize(input)?;
   let mut parser = Parser {
      input,
      tokens,
      pos: 0,
   };
   let expr = parser.expression()?;
   if parser.peek().is_some() {
      return Err(err(input, "trailing tokens after expression"));
   }
   Ok(expr)
}

/// Parses a row filter: `Column = literal [AND Column != literal …]`.
pub fn parse_filter(input: &str) -> Result<Vec<FilterTerm>> {
   let ferr = |message: &str| Error::Filter {
      filter: input.to_string(),
      message: message.to_string(),
   };

   let tokens = tokenize(input).map_err(|e| Error::Filter {
      filter: input.to_string(),
      message: e.to_string(),
   })?;
   let mut terms = Vec::new();
   let mut pos = 0;

   loop {
      let Some(Token::Ident(column)) = tokens.get(pos).cloned() else {
         return Err(ferr("expected a column name"));
      };
      pos += 1;
      let negated = match tokens.get(pos) {
         Some(Token::Equals) => false,
         Some(Token::NotEquals) => true,
         _ => return Err(ferr("expected '=' or '!='")),
      };
      pos += 1;
      let value = match tokens.get(pos).cloned() {
         Some(Token::String(s)) => serde_json::Value::String(s),
         Some(Token::Number(n)) => serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
         Some(Token::Ident(word)) if word.eq_ignore_ascii_case("null") => serde_json::Value::Null,
         Some(Token::Ident(word)) if word.eq_ignore_ascii_case("true") => {
            serde_json::Value::Bool(true)
         }
         Some(Token::Ident(word)) if word.eq_ignore_ascii_case("false") => {
            serde_json::Value::Bool(false)
         }
         _ => return Err(ferr("expected a literal")),
      };
      pos += 1;
      terms.push(FilterTerm {
         column,
         negated,
         value,
      });

      match tokens.get(pos) {
         None => break,
         Some(Token::Ident(word)) if word.eq_ignore_ascii_case("and") => {
            pos += 1;
         }
         _ => return Err(ferr("expected AND between terms")),
      }
   }
   Ok(terms)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluates an expression against a source row.
pub fn eval(expr: &Expr, ctx: &EvalContext<'_>) -> Result<serde_json::Value> {
   match expr {
      Expr::Column(name) => Ok(ctx.row.get(name).cloned().unwrap_or(serde_json::Value::Null)),
      Expr::String(s) => Ok(serde_json::Value::String(s.clone())),
      Expr::Number(n) => Ok(number(*n)),
      Expr::Call(name, args) => match name.as_str() {
         "now" => {
            let formatted = ctx
               .timestamp
               .format(&Rfc3339)
               .map_err(|e| err("now()", e.to_string()))?;
            Ok(serde_json::Value::String(formatted))
         }
         "coalesce" => {
            for arg in args {
               let value = eval(arg, ctx)?;
               if !value.is_null() {
                  return Ok(value);
               }
            }
            Ok(serde_json::Value::Null)
         }
         "concat" => {
            let mut out = String::new();
            for arg in args {
               out.push_str(&stringify(&eval(arg, ctx)?));
            }
            Ok(serde_json::Value::String(out))
         }
         other => Err(err(other, "unknown function")),
      },
      Expr::Binary(op, left, right) => {
         let left = eval(left, ctx)?;
         let right = eval(right, ctx)?;
         apply_op(*op, &left, &right)
      }
   }
}

/// True when the row passes every filter term.
pub fn eval_filter(terms: &[FilterTerm], row: &serde_json::Map<String, serde_json::Value>) -> bool {
   terms.iter().all(|term| {
      let actual = row.get(&term.column).unwrap_or(&serde_json::Value::Null);
      let matches = json_eq(actual, &term.value);
      matches != term.negated
   })
}

fn json_eq(a: &serde_json::Value, b: &serde_json::Value) -> bool {
   match (a.as_f64(), b.as_f64()) {
      // Numeric comparison so 1 == 1.0 regardless of JSON spelling.
      (Some(x), Some(y)) => x == y,
      _ => a == b,
   }
}

fn stringify(value: &serde_json::Value) -> String {
   match value {
      serde_json::Value::Null => String::new(),
      serde_json::Value::String(s) => s.clone(),
      other => other.to_string(),
   }
}

fn number(n: f64) -> serde_json::Value {
   if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
      serde_json::Value::Number((n as i64).into())
   } else {
      serde_json::Number::from_f64(n)
         .map(serde_json::Value::Number)
         .unwrap_or(serde_json::Value::Null)
   }
}

fn apply_op(op: Op, left: &serde_json::Value, right: &serde_json::Value) -> Result<serde_json::Value> {
   // `+` over strings concatenates; every other combination is numeric.
   if op == Op::Add && (left.is_string() || right.is_string()) {
      return Ok(serde_json::Value::String(format!(
         "{}{}",
         stringify(left),
         stringify(right)
      )));
   }
   let (Some(l), Some(r)) = (left.as_f64(), right.as_f64()) else {
      return Err(err(
         "arithmetic",
         format!("non-numeric operands {left} and {right}"),
      ));
   };
   let result = match op {
      Op::Add => l + r,
      Op::Sub => l - r,
      Op::Mul => l * r,
      Op::Div => {
         if r == 0.0 {
            return Err(err("arithmetic", "division by zero"));
         }
         l / r
      }
   };
   Ok(number(result))
}
