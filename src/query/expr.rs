//! Expression language used by APPLY and FILTER.
//!
//! Grammar, lowest precedence first: `||`, `&&`, equality, comparison,
//! additive, multiplicative, `^` (right associative), unary `!`/`-`, then
//! primaries: numbers, quoted strings, `@property`, function calls and
//! parenthesized expressions.

use crate::error::{QueryError, Result};
use crate::pipeline::lookup::{KeyId, Lookup};
use crate::pipeline::row::Row;
use crate::pipeline::value::{Value, format_number};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Built-in functions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    Upper,
    Lower,
    Strlen,
    Substr,
    Contains,
    StartsWith,
    Abs,
    Ceil,
    Floor,
    Sqrt,
    Log,
    Log2,
    Exp,
    Exists,
    ToNumber,
    ToStr,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        let f = match name.to_lowercase().as_str() {
            "upper" => Function::Upper,
            "lower" => Function::Lower,
            "strlen" => Function::Strlen,
            "substr" => Function::Substr,
            "contains" => Function::Contains,
            "startswith" => Function::StartsWith,
            "abs" => Function::Abs,
            "ceil" => Function::Ceil,
            "floor" => Function::Floor,
            "sqrt" => Function::Sqrt,
            "log" => Function::Log,
            "log2" => Function::Log2,
            "exp" => Function::Exp,
            "exists" => Function::Exists,
            "to_number" => Function::ToNumber,
            "to_str" => Function::ToStr,
            _ => return None,
        };
        Some(f)
    }

    fn arity(&self) -> usize {
        match self {
            Function::Substr => 3,
            Function::Contains | Function::StartsWith => 2,
            _ => 1,
        }
    }
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    /// `@name`; `key` is filled in by [`Expr::collect_keys`]
    Property { name: String, key: Option<KeyId> },
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary { op: BinaryOp, left: Box<Expr>, right: Box<Expr> },
    Call { func: Function, name: String, args: Vec<Expr> },
}

/// Parse expression text
pub fn parse(input: &str) -> Result<Expr> {
    let tokens = lex(input)?;
    let mut parser = ExprParser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos < parser.tokens.len() {
        return Err(QueryError::expr(format!(
            "Syntax error in expression `{}`: unexpected {}",
            input,
            parser.tokens[parser.pos].describe()
        )));
    }
    Ok(expr)
}

impl Expr {
    /// Resolve every `@property` against `lookup`. A property nothing in the
    /// pipeline produces is an error; expressions never trigger loads.
    pub fn collect_keys(&mut self, lookup: &mut Lookup) -> Result<()> {
        match self {
            Expr::Literal(_) => Ok(()),
            Expr::Property { name, key } => match lookup.get_key_read(name) {
                Some(id) => {
                    *key = Some(id);
                    Ok(())
                }
                None => Err(QueryError::no_prop(format!(
                    "Property `{}` not loaded nor in pipeline",
                    name
                ))),
            },
            Expr::Unary { expr, .. } => expr.collect_keys(lookup),
            Expr::Binary { left, right, .. } => {
                left.collect_keys(lookup)?;
                right.collect_keys(lookup)
            }
            Expr::Call { args, .. } => args.iter_mut().try_for_each(|a| a.collect_keys(lookup)),
        }
    }

    /// Names of all referenced properties
    pub fn property_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.walk_properties(&mut names);
        names
    }

    fn walk_properties<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Property { name, .. } => out.push(name),
            Expr::Unary { expr, .. } => expr.walk_properties(out),
            Expr::Binary { left, right, .. } => {
                left.walk_properties(out);
                right.walk_properties(out);
            }
            Expr::Call { args, .. } => args.iter().for_each(|a| a.walk_properties(out)),
        }
    }

    /// Evaluate against one row. Missing values evaluate to null.
    pub fn evaluate(&self, row: &Row) -> Result<Value> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Property { key, .. } => Ok(key
                .and_then(|k| row.get(k))
                .cloned()
                .unwrap_or(Value::Null)),
            Expr::Unary { op, expr } => {
                let v = expr.evaluate(row)?;
                Ok(match op {
                    UnaryOp::Not => bool_value(!v.is_truthy()),
                    UnaryOp::Neg => v.as_number().map(|n| Value::Number(-n)).unwrap_or(Value::Null),
                })
            }
            Expr::Binary { op, left, right } => {
                // Short-circuit logic operators
                match op {
                    BinaryOp::And => {
                        let l = left.evaluate(row)?;
                        if !l.is_truthy() {
                            return Ok(bool_value(false));
                        }
                        return Ok(bool_value(right.evaluate(row)?.is_truthy()));
                    }
                    BinaryOp::Or => {
                        let l = left.evaluate(row)?;
                        if l.is_truthy() {
                            return Ok(bool_value(true));
                        }
                        return Ok(bool_value(right.evaluate(row)?.is_truthy()));
                    }
                    _ => {}
                }
                let l = left.evaluate(row)?;
                let r = right.evaluate(row)?;
                Ok(eval_binary(*op, &l, &r))
            }
            Expr::Call { func, name, args } => {
                let values = args
                    .iter()
                    .map(|a| a.evaluate(row))
                    .collect::<Result<Vec<_>>>()?;
                eval_call(*func, name, &values)
            }
        }
    }
}

fn bool_value(b: bool) -> Value {
    Value::Number(if b { 1.0 } else { 0.0 })
}

fn eval_binary(op: BinaryOp, l: &Value, r: &Value) -> Value {
    match op {
        BinaryOp::Eq => bool_value(values_equal(l, r)),
        BinaryOp::Ne => bool_value(!values_equal(l, r)),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if l.is_null() || r.is_null() {
                return bool_value(false);
            }
            let ord = l.compare(r);
            bool_value(match op {
                BinaryOp::Lt => ord == Ordering::Less,
                BinaryOp::Le => ord != Ordering::Greater,
                BinaryOp::Gt => ord == Ordering::Greater,
                _ => ord != Ordering::Less,
            })
        }
        _ => {
            let (Some(a), Some(b)) = (l.as_number(), r.as_number()) else {
                return Value::Null;
            };
            Value::Number(match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Mod => {
                    if b as i64 == 0 {
                        f64::NAN
                    } else {
                        ((a as i64) % (b as i64)) as f64
                    }
                }
                _ => a.powf(b),
            })
        }
    }
}

fn values_equal(l: &Value, r: &Value) -> bool {
    match (l, r) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(a), Value::String(b)) => a == b,
        _ => l.compare(r) == Ordering::Equal,
    }
}

fn string_arg(v: &Value) -> Option<String> {
    match v {
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

fn eval_call(func: Function, name: &str, args: &[Value]) -> Result<Value> {
    let numeric = |f: fn(f64) -> f64| -> Value {
        args[0].as_number().map(|n| Value::Number(f(n))).unwrap_or(Value::Null)
    };
    let value = match func {
        Function::Upper => string_arg(&args[0]).map(|s| Value::String(s.to_uppercase())).unwrap_or(Value::Null),
        Function::Lower => string_arg(&args[0]).map(|s| Value::String(s.to_lowercase())).unwrap_or(Value::Null),
        Function::Strlen => string_arg(&args[0])
            .map(|s| Value::Number(s.chars().count() as f64))
            .unwrap_or(Value::Null),
        Function::Substr => {
            let Some(s) = string_arg(&args[0]) else {
                return Ok(Value::Null);
            };
            let chars: Vec<char> = s.chars().collect();
            let offset = args[1].as_number().unwrap_or(0.0).max(0.0) as usize;
            let len = args[2].as_number().unwrap_or(-1.0);
            let start = offset.min(chars.len());
            let end = if len < 0.0 {
                chars.len()
            } else {
                (start + len as usize).min(chars.len())
            };
            Value::String(chars[start..end].iter().collect())
        }
        Function::Contains => match (string_arg(&args[0]), string_arg(&args[1])) {
            (Some(s), Some(sub)) => bool_value(s.contains(&sub)),
            _ => bool_value(false),
        },
        Function::StartsWith => match (string_arg(&args[0]), string_arg(&args[1])) {
            (Some(s), Some(prefix)) => bool_value(s.starts_with(&prefix)),
            _ => bool_value(false),
        },
        Function::Abs => numeric(f64::abs),
        Function::Ceil => numeric(f64::ceil),
        Function::Floor => numeric(f64::floor),
        Function::Sqrt => numeric(f64::sqrt),
        Function::Log => numeric(f64::ln),
        Function::Log2 => numeric(f64::log2),
        Function::Exp => numeric(f64::exp),
        Function::Exists => bool_value(!args[0].is_null()),
        Function::ToNumber => match &args[0] {
            Value::Null => Value::Null,
            v => Value::Number(v.as_number().ok_or_else(|| {
                QueryError::expr(format!("{}: cannot convert '{}' to a number", name, v))
            })?),
        },
        Function::ToStr => match &args[0] {
            Value::Null => Value::Null,
            Value::Number(n) => Value::String(format_number(*n)),
            v => Value::String(v.to_string()),
        },
    };
    Ok(value)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Property(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Number(n) => format!("number {}", format_number(*n)),
            Token::Str(s) => format!("string '{}'", s),
            Token::Property(p) => format!("property @{}", p),
            Token::Ident(i) => format!("identifier {}", i),
            Token::Op(op) => format!("operator {}", op),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::Comma => "','".to_string(),
        }
    }
}

const OPERATORS: &[&str] = &[
    "==", "!=", "<=", ">=", "&&", "||", "+", "-", "*", "/", "%", "^", "<", ">", "!",
];

fn lex(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut pos = 0;

    while pos < input.len() {
        let ch = input[pos..].chars().next().unwrap_or(' ');
        if ch.is_whitespace() {
            pos += ch.len_utf8();
            continue;
        }

        match ch {
            '(' => {
                tokens.push(Token::LParen);
                pos += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                pos += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                pos += 1;
            }
            '\'' | '"' => {
                let (s, next) = lex_string(input, pos, ch)?;
                tokens.push(Token::Str(s));
                pos = next;
            }
            '@' => {
                let start = pos + 1;
                let end = scan_ident(input, start);
                if end == start {
                    return Err(QueryError::expr(format!("Empty property name at offset {}", pos)));
                }
                tokens.push(Token::Property(input[start..end].to_string()));
                pos = end;
            }
            c if c.is_ascii_digit() || (c == '.' && bytes.get(pos + 1).is_some_and(u8::is_ascii_digit)) => {
                let end = scan_number(input, pos);
                let n = input[pos..end].parse::<f64>().map_err(|_| {
                    QueryError::expr(format!("Invalid number `{}`", &input[pos..end]))
                })?;
                tokens.push(Token::Number(n));
                pos = end;
            }
            c if c.is_alphabetic() || c == '_' => {
                let end = scan_ident(input, pos);
                tokens.push(Token::Ident(input[pos..end].to_string()));
                pos = end;
            }
            _ => {
                let op = OPERATORS
                    .iter()
                    .find(|op| input[pos..].starts_with(**op))
                    .ok_or_else(|| {
                        QueryError::expr(format!("Unexpected character `{}` at offset {}", ch, pos))
                    })?;
                tokens.push(Token::Op(op));
                pos += op.len();
            }
        }
    }
    Ok(tokens)
}

fn lex_string(input: &str, start: usize, quote: char) -> Result<(String, usize)> {
    let mut out = String::new();
    let mut chars = input[start + 1..].char_indices();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    out.push(escaped);
                }
            }
            c if c == quote => return Ok((out, start + 1 + i + 1)),
            c => out.push(c),
        }
    }
    Err(QueryError::expr(format!("Unterminated string at offset {}", start)))
}

fn scan_ident(input: &str, start: usize) -> usize {
    let mut end = start;
    for ch in input[start..].chars() {
        if ch.is_alphanumeric() || ch == '_' || ch == '.' {
            end += ch.len_utf8();
        } else {
            break;
        }
    }
    end
}

fn scan_number(input: &str, start: usize) -> usize {
    let bytes = input.as_bytes();
    let mut end = start;
    while end < bytes.len() && (bytes[end].is_ascii_digit() || bytes[end] == b'.') {
        end += 1;
    }
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp = end + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            end = exp;
            while end < bytes.len() && bytes[end].is_ascii_digit() {
                end += 1;
            }
        }
    }
    end
}

/// Recursive-descent parser over lexed tokens
struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn consume_op(&mut self, ops: &[&'static str]) -> Option<&'static str> {
        match self.peek() {
            Some(Token::Op(op)) if ops.contains(op) => {
                let op = *op;
                self.pos += 1;
                Some(op)
            }
            _ => None,
        }
    }

    fn binary_level(
        &mut self,
        ops: &[&'static str],
        next: fn(&mut Self) -> Result<Expr>,
    ) -> Result<Expr> {
        let mut left = next(self)?;
        while let Some(op) = self.consume_op(ops) {
            let right = next(self)?;
            left = Expr::Binary {
                op: binary_op(op),
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        self.binary_level(&["||"], Self::parse_and)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        self.binary_level(&["&&"], Self::parse_equality)
    }

    fn parse_equality(&mut self) -> Result<Expr> {
        self.binary_level(&["==", "!="], Self::parse_comparison)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        self.binary_level(&["<", "<=", ">", ">="], Self::parse_additive)
    }

    fn parse_additive(&mut self) -> Result<Expr> {
        self.binary_level(&["+", "-"], Self::parse_multiplicative)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr> {
        self.binary_level(&["*", "/", "%"], Self::parse_power)
    }

    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_unary()?;
        if self.consume_op(&["^"]).is_some() {
            let exponent = self.parse_power()?;
            return Ok(Expr::Binary {
                op: BinaryOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(op) = self.consume_op(&["!", "-"]) {
            let expr = self.parse_unary()?;
            let op = if op == "!" { UnaryOp::Not } else { UnaryOp::Neg };
            if let (UnaryOp::Neg, Expr::Literal(Value::Number(n))) = (op, &expr) {
                return Ok(Expr::Literal(Value::Number(-n)));
            }
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Property(name)) => Ok(Expr::Property { name, key: None }),
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(expr),
                    _ => Err(QueryError::expr("Missing closing parenthesis in expression")),
                }
            }
            Some(Token::Ident(name)) => self.parse_call(name),
            Some(tok) => Err(QueryError::expr(format!(
                "Syntax error in expression: unexpected {}",
                tok.describe()
            ))),
            None => Err(QueryError::expr("Unexpected end of expression")),
        }
    }

    fn parse_call(&mut self, name: String) -> Result<Expr> {
        let func = Function::from_name(&name)
            .ok_or_else(|| QueryError::expr(format!("Unknown function name '{}'", name)))?;
        if self.next() != Some(Token::LParen) {
            return Err(QueryError::expr(format!("Expected '(' after function name '{}'", name)));
        }

        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.pos += 1;
        } else {
            loop {
                args.push(self.parse_or()?);
                match self.next() {
                    Some(Token::Comma) => continue,
                    Some(Token::RParen) => break,
                    _ => {
                        return Err(QueryError::expr(format!(
                            "Missing closing parenthesis for function '{}'",
                            name
                        )));
                    }
                }
            }
        }

        if args.len() != func.arity() {
            return Err(QueryError::expr(format!(
                "Function '{}' expects {} argument(s), got {}",
                name,
                func.arity(),
                args.len()
            )));
        }
        Ok(Expr::Call { func, name, args })
    }
}

fn binary_op(op: &str) -> BinaryOp {
    match op {
        "+" => BinaryOp::Add,
        "-" => BinaryOp::Sub,
        "*" => BinaryOp::Mul,
        "/" => BinaryOp::Div,
        "%" => BinaryOp::Mod,
        "^" => BinaryOp::Pow,
        "==" => BinaryOp::Eq,
        "!=" => BinaryOp::Ne,
        "<" => BinaryOp::Lt,
        "<=" => BinaryOp::Le,
        ">" => BinaryOp::Gt,
        ">=" => BinaryOp::Ge,
        "&&" => BinaryOp::And,
        _ => BinaryOp::Or,
    }
}
