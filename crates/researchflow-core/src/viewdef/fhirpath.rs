//! The FHIRPath subset ViewDefinitions use.
//!
//! Supported: member navigation, `[n]` indexers, `$this`, `%constants`
//! (plus `%resource`), string/number/boolean/date literals, `{}`, the
//! operators `= != < > <= >= and or`, and the functions `where`, `exists`,
//! `empty`, `first`, `last`, `count`, `not`, `join`, `ofType`,
//! `extension`, `getResourceKey`, `getReferenceKey`, `startsWith`,
//! `contains`, `lower`, `upper`.
//!
//! Every expression evaluates to a collection (`Vec<Value>`); absent and
//! null elements are simply not in it.

use std::cmp::Ordering;
use std::collections::HashMap;

use serde_json::Value;

use super::ViewError;

const FUNCTIONS: &[&str] = &[
    "where",
    "exists",
    "empty",
    "first",
    "last",
    "count",
    "not",
    "join",
    "ofType",
    "extension",
    "getResourceKey",
    "getReferenceKey",
    "startsWith",
    "contains",
    "lower",
    "upper",
];

/// Evaluation environment shared by every path in one view run.
pub struct EvalContext<'a> {
    /// The resource being transformed (`%resource`).
    pub resource: &'a Value,
    pub constants: &'a HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FhirPath {
    source: String,
    expr: Expr,
}

impl FhirPath {
    pub fn parse(source: &str) -> Result<Self, ViewError> {
        let err = |message: String| ViewError::Parse {
            expr: source.to_string(),
            message,
        };
        let tokens = tokenize(source).map_err(err)?;
        if tokens.is_empty() {
            return Err(err("empty expression".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_expr().map_err(err)?;
        if parser.pos < parser.tokens.len() {
            return Err(err(format!("unexpected token {:?}", parser.tokens[parser.pos])));
        }
        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Evaluate with `focus` as the input collection's single element.
    pub fn evaluate(&self, focus: &Value, ctx: &EvalContext<'_>) -> Result<Vec<Value>, ViewError> {
        eval(&self.expr, std::slice::from_ref(focus), ctx)
    }

    /// Evaluate as a boolean test: empty is `false`.
    pub fn test(&self, focus: &Value, ctx: &EvalContext<'_>) -> Result<bool, ViewError> {
        Ok(to_bool(&self.evaluate(focus, ctx)?)?.unwrap_or(false))
    }
}

// ---------------------------------------------------------------------------
// Tokens
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(String),
    Date(String),
    This,
    Env(String),
    Dot,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Op(BinOp),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
    And,
    Or,
}

fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '=' => {
                tokens.push(Token::Op(BinOp::Eq));
                i += 1;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(BinOp::Ne));
                i += 2;
            }
            '<' | '>' => {
                let eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, eq) {
                    ('<', true) => BinOp::Le,
                    ('<', false) => BinOp::Lt,
                    (_, true) => BinOp::Ge,
                    (_, false) => BinOp::Gt,
                };
                tokens.push(Token::Op(op));
                i += if eq { 2 } else { 1 };
            }
            '\'' => {
                let (s, next) = read_string(&chars, i + 1, '\'')?;
                tokens.push(Token::Str(s));
                i = next;
            }
            '`' => {
                let (s, next) = read_string(&chars, i + 1, '`')?;
                tokens.push(Token::Ident(s));
                i = next;
            }
            '$' => {
                let (name, next) = read_ident(&chars, i + 1);
                if name != "this" {
                    return Err(format!("unsupported variable ${}", name));
                }
                tokens.push(Token::This);
                i = next;
            }
            '%' => {
                let (name, next) = match chars.get(i + 1) {
                    Some('`') => read_string(&chars, i + 2, '`')?,
                    Some('\'') => read_string(&chars, i + 2, '\'')?,
                    _ => read_ident(&chars, i + 1),
                };
                if name.is_empty() {
                    return Err("expected a name after %".to_string());
                }
                tokens.push(Token::Env(name));
                i = next;
            }
            '@' => {
                let start = i + 1;
                let mut j = start;
                while j < chars.len()
                    && (chars[j].is_ascii_alphanumeric() || matches!(chars[j], '-' | ':' | '+'))
                {
                    j += 1;
                }
                if j == start {
                    return Err("expected a date after @".to_string());
                }
                tokens.push(Token::Date(chars[start..j].iter().collect()));
                i = j;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                tokens.push(Token::Num(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let (name, next) = read_ident(&chars, i);
                tokens.push(match name.as_str() {
                    "and" => Token::Op(BinOp::And),
                    "or" => Token::Op(BinOp::Or),
                    _ => Token::Ident(name),
                });
                i = next;
            }
            other => return Err(format!("unexpected character '{}'", other)),
        }
    }
    Ok(tokens)
}

fn read_ident(chars: &[char], start: usize) -> (String, usize) {
    let mut j = start;
    while j < chars.len() && (chars[j].is_ascii_alphanumeric() || chars[j] == '_') {
        j += 1;
    }
    (chars[start..j].iter().collect(), j)
}

fn read_string(chars: &[char], start: usize, quote: char) -> Result<(String, usize), String> {
    let mut out = String::new();
    let mut j = start;
    while j < chars.len() {
        let c = chars[j];
        if c == quote {
            return Ok((out, j + 1));
        }
        if c == '\\' {
            j += 1;
            match chars.get(j) {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('r') => out.push('\r'),
                Some(&other) => out.push(other),
                None => break,
            }
        } else {
            out.push(c);
        }
        j += 1;
    }
    Err("unterminated string".to_string())
}

// ---------------------------------------------------------------------------
// AST + parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    This,
    Literal(Value),
    EmptySet,
    Env(String),
    /// Leading type name such as `Patient` in `Patient.name`.
    TypeRoot(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(Box<Expr>, String, Vec<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
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

    fn expect(&mut self, want: Token) -> Result<(), String> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            Some(t) => Err(format!("expected {:?}, found {:?}", want, t)),
            None => Err(format!("expected {:?}, found end of expression", want)),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr, String> {
        self.parse_binary(0)
    }

    /// Precedence climbing: or < and < equality < comparison.
    fn parse_binary(&mut self, level: u8) -> Result<Expr, String> {
        if level > 3 {
            return self.parse_postfix();
        }
        let mut left = self.parse_binary(level + 1)?;
        loop {
            let op = match self.peek() {
                Some(Token::Op(op)) if op_level(*op) == level => *op,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_binary(level + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_term()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let name = match self.next() {
                        Some(Token::Ident(name)) => name,
                        other => return Err(format!("expected a name after '.', found {:?}", other)),
                    };
                    expr = self.parse_invocation(expr, name)?;
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.parse_expr()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_invocation(&mut self, base: Expr, name: String) -> Result<Expr, String> {
        if self.peek() != Some(&Token::LParen) {
            return Ok(Expr::Member(Box::new(base), name));
        }
        if !FUNCTIONS.contains(&name.as_str()) {
            return Err(format!("unsupported function '{}'", name));
        }
        self.pos += 1;
        let mut args = Vec::new();
        if self.peek() != Some(&Token::RParen) {
            loop {
                args.push(self.parse_expr()?);
                match self.peek() {
                    Some(Token::Comma) => self.pos += 1,
                    _ => break,
                }
            }
        }
        self.expect(Token::RParen)?;
        Ok(Expr::Call(Box::new(base), name, args))
    }

    fn parse_term(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::This) => Ok(Expr::This),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Date(d)) => Ok(Expr::Literal(Value::String(d))),
            Some(Token::Num(n)) => {
                if n.contains('.') {
                    let f: f64 = n.parse().map_err(|_| format!("bad number '{}'", n))?;
                    Ok(Expr::Literal(serde_json::json!(f)))
                } else {
                    let i: i64 = n.parse().map_err(|_| format!("bad number '{}'", n))?;
                    Ok(Expr::Literal(Value::from(i)))
                }
            }
            Some(Token::Env(name)) => Ok(Expr::Env(name)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBrace) => {
                self.expect(Token::RBrace)?;
                Ok(Expr::EmptySet)
            }
            Some(Token::Ident(name)) => {
                let type_like = name.chars().next().map_or(false, |c| c.is_ascii_uppercase());
                if name == "true" || name == "false" {
                    Ok(Expr::Literal(Value::Bool(name == "true")))
                } else if type_like && self.peek() != Some(&Token::LParen) {
                    Ok(Expr::TypeRoot(name))
                } else {
                    self.parse_invocation(Expr::This, name)
                }
            }
            Some(other) => Err(format!("unexpected token {:?}", other)),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

fn op_level(op: BinOp) -> u8 {
    match op {
        BinOp::Or => 0,
        BinOp::And => 1,
        BinOp::Eq | BinOp::Ne => 2,
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => 3,
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

fn eval(expr: &Expr, input: &[Value], ctx: &EvalContext<'_>) -> Result<Vec<Value>, ViewError> {
    match expr {
        Expr::This => Ok(input.to_vec()),
        Expr::Literal(v) => Ok(vec![v.clone()]),
        Expr::EmptySet => Ok(Vec::new()),
        Expr::Env(name) => match name.as_str() {
            "resource" | "rootResource" => Ok(vec![ctx.resource.clone()]),
            _ => ctx
                .constants
                .get(name)
                .map(|v| vec![v.clone()])
                .ok_or_else(|| ViewError::Eval(format!("unknown constant %{}", name))),
        },
        Expr::TypeRoot(type_name) => Ok(input
            .iter()
            .filter(|v| resource_type(v) == Some(type_name.as_str()))
            .cloned()
            .collect()),
        Expr::Member(base, name) => {
            let items = eval(base, input, ctx)?;
            let mut out = Vec::new();
            for item in &items {
                push_flattened(&mut out, item.get(name));
            }
            Ok(out)
        }
        Expr::Index(base, index) => {
            let items = eval(base, input, ctx)?;
            let idx = eval(index, input, ctx)?;
            let n = match idx.as_slice() {
                [v] => v
                    .as_u64()
                    .ok_or_else(|| ViewError::Eval("index must be a non-negative integer".to_string()))?,
                _ => return Ok(Vec::new()),
            };
            Ok(items.into_iter().nth(n as usize).into_iter().collect())
        }
        Expr::Call(base, name, args) => eval_call(base, name, args, input, ctx),
        Expr::Binary(op, left, right) => {
            let l = eval(left, input, ctx)?;
            let r = eval(right, input, ctx)?;
            eval_binary(*op, &l, &r)
        }
    }
}

fn push_flattened(out: &mut Vec<Value>, value: Option<&Value>) {
    match value {
        Some(Value::Array(items)) => out.extend(items.iter().filter(|v| !v.is_null()).cloned()),
        Some(Value::Null) | None => {}
        Some(v) => out.push(v.clone()),
    }
}

fn resource_type(value: &Value) -> Option<&str> {
    value.get("resourceType").and_then(|t| t.as_str())
}

/// Name given as a function argument: `ofType(Quantity)`, `getReferenceKey(Patient)`.
fn type_name_arg(args: &[Expr]) -> Option<&str> {
    match args.first() {
        Some(Expr::TypeRoot(name)) => Some(name.as_str()),
        Some(Expr::Member(base, name)) if **base == Expr::This => Some(name.as_str()),
        Some(Expr::Literal(Value::String(s))) => Some(s.as_str()),
        _ => None,
    }
}

fn single_string_arg(
    name: &str,
    args: &[Expr],
    input: &[Value],
    ctx: &EvalContext<'_>,
) -> Result<Option<String>, ViewError> {
    let Some(arg) = args.first() else {
        return Ok(None);
    };
    match eval(arg, input, ctx)?.as_slice() {
        [] => Ok(None),
        [Value::String(s)] => Ok(Some(s.clone())),
        _ => Err(ViewError::Eval(format!("{}() expects a single string argument", name))),
    }
}

fn eval_call(
    base: &Expr,
    name: &str,
    args: &[Expr],
    input: &[Value],
    ctx: &EvalContext<'_>,
) -> Result<Vec<Value>, ViewError> {
    if name == "ofType" {
        let type_name = type_name_arg(args)
            .ok_or_else(|| ViewError::Eval("ofType() expects a type name".to_string()))?;
        let mut out = Vec::new();
        // Choice elements: value.ofType(Quantity) reads valueQuantity.
        if let Expr::Member(inner, field) = base {
            let key = format!("{}{}", field, capitalize(type_name));
            for item in eval(inner, input, ctx)? {
                push_flattened(&mut out, item.get(&key));
            }
        }
        for item in eval(base, input, ctx)? {
            if matches_type(&item, type_name) {
                out.push(item);
            }
        }
        return Ok(out);
    }

    let items = eval(base, input, ctx)?;
    match name {
        "where" => {
            let criteria = args
                .first()
                .ok_or_else(|| ViewError::Eval("where() expects a criteria".to_string()))?;
            let mut out = Vec::new();
            for item in items {
                let result = eval(criteria, std::slice::from_ref(&item), ctx)?;
                if to_bool(&result)? == Some(true) {
                    out.push(item);
                }
            }
            Ok(out)
        }
        "exists" => {
            let found = match args.first() {
                None => !items.is_empty(),
                Some(criteria) => {
                    let mut any = false;
                    for item in &items {
                        let result = eval(criteria, std::slice::from_ref(item), ctx)?;
                        if to_bool(&result)? == Some(true) {
                            any = true;
                            break;
                        }
                    }
                    any
                }
            };
            Ok(vec![Value::Bool(found)])
        }
        "empty" => Ok(vec![Value::Bool(items.is_empty())]),
        "first" => Ok(items.into_iter().take(1).collect()),
        "last" => Ok(items.into_iter().last().into_iter().collect()),
        "count" => Ok(vec![Value::from(items.len() as u64)]),
        "not" => Ok(match to_bool(&items)? {
            Some(b) => vec![Value::Bool(!b)],
            None => Vec::new(),
        }),
        "join" => {
            let sep = single_string_arg(name, args, input, ctx)?.unwrap_or_default();
            let joined = items
                .iter()
                .map(value_to_string)
                .collect::<Vec<_>>()
                .join(&sep);
            Ok(vec![Value::String(joined)])
        }
        "extension" => {
            let url = single_string_arg(name, args, input, ctx)?
                .ok_or_else(|| ViewError::Eval("extension() expects a url".to_string()))?;
            let mut out = Vec::new();
            for item in &items {
                if let Some(Value::Array(exts)) = item.get("extension") {
                    out.extend(
                        exts.iter()
                            .filter(|e| e.get("url").and_then(|u| u.as_str()) == Some(url.as_str()))
                            .cloned(),
                    );
                }
            }
            Ok(out)
        }
        "getResourceKey" => Ok(items
            .iter()
            .filter_map(|item| item.get("id").cloned())
            .collect()),
        "getReferenceKey" => {
            let wanted = type_name_arg(args);
            Ok(items
                .iter()
                .filter_map(|item| item.get("reference").and_then(|r| r.as_str()))
                .filter_map(|reference| reference_key(reference, wanted))
                .map(Value::String)
                .collect())
        }
        "startsWith" | "contains" => {
            let needle = single_string_arg(name, args, input, ctx)?;
            match (items.as_slice(), needle) {
                ([Value::String(s)], Some(needle)) => {
                    let hit = if name == "startsWith" {
                        s.starts_with(&needle)
                    } else {
                        s.contains(&needle)
                    };
                    Ok(vec![Value::Bool(hit)])
                }
                ([], _) | (_, None) => Ok(Vec::new()),
                _ => Err(ViewError::Eval(format!("{}() expects a single string input", name))),
            }
        }
        "lower" | "upper" => Ok(items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| {
                Value::String(if name == "lower" {
                    s.to_lowercase()
                } else {
                    s.to_uppercase()
                })
            })
            .collect()),
        other => Err(ViewError::Eval(format!("unsupported function '{}'", other))),
    }
}

/// `Patient/123`, `https://host/fhir/Patient/123/_history/2` → `123`.
fn reference_key(reference: &str, wanted_type: Option<&str>) -> Option<String> {
    let trimmed = match reference.find("/_history/") {
        Some(idx) => &reference[..idx],
        None => reference,
    };
    let mut parts = trimmed.rsplit('/');
    let id = parts.next()?;
    let ty = parts.next()?;
    if id.is_empty() {
        return None;
    }
    match wanted_type {
        Some(w) if w != ty => None,
        _ => Some(id.to_string()),
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn matches_type(value: &Value, type_name: &str) -> bool {
    match type_name {
        "string" | "String" | "code" | "uri" | "id" | "date" | "dateTime" => value.is_string(),
        "boolean" | "Boolean" => value.is_boolean(),
        "integer" | "Integer" => value.is_i64() || value.is_u64(),
        "decimal" | "Decimal" => value.is_number(),
        _ => resource_type(value) == Some(type_name),
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Singleton boolean evaluation: empty is `None`; a single non-boolean
/// item counts as `true`.
fn to_bool(items: &[Value]) -> Result<Option<bool>, ViewError> {
    match items {
        [] => Ok(None),
        [Value::Bool(b)] => Ok(Some(*b)),
        [_] => Ok(Some(true)),
        _ => Err(ViewError::Eval(
            "expected a single boolean, got a collection".to_string(),
        )),
    }
}

fn eval_binary(op: BinOp, l: &[Value], r: &[Value]) -> Result<Vec<Value>, ViewError> {
    match op {
        BinOp::And => {
            let (a, b) = (to_bool(l)?, to_bool(r)?);
            Ok(match (a, b) {
                (Some(false), _) | (_, Some(false)) => vec![Value::Bool(false)],
                (Some(true), Some(true)) => vec![Value::Bool(true)],
                _ => Vec::new(),
            })
        }
        BinOp::Or => {
            let (a, b) = (to_bool(l)?, to_bool(r)?);
            Ok(match (a, b) {
                (Some(true), _) | (_, Some(true)) => vec![Value::Bool(true)],
                (Some(false), Some(false)) => vec![Value::Bool(false)],
                _ => Vec::new(),
            })
        }
        BinOp::Eq | BinOp::Ne => {
            if l.is_empty() || r.is_empty() {
                return Ok(Vec::new());
            }
            let equal = l.len() == r.len() && l.iter().zip(r).all(|(a, b)| values_equal(a, b));
            Ok(vec![Value::Bool(if op == BinOp::Eq { equal } else { !equal })])
        }
        BinOp::Lt | BinOp::Gt | BinOp::Le | BinOp::Ge => {
            let (a, b) = match (l, r) {
                ([a], [b]) => (a, b),
                ([], _) | (_, []) => return Ok(Vec::new()),
                _ => {
                    return Err(ViewError::Eval(
                        "comparison operands must be single values".to_string(),
                    ))
                }
            };
            let ordering = compare(a, b).ok_or_else(|| {
                ViewError::Eval(format!("cannot compare {} with {}", a, b))
            })?;
            let result = match op {
                BinOp::Lt => ordering == Ordering::Less,
                BinOp::Gt => ordering == Ordering::Greater,
                BinOp::Le => ordering != Ordering::Greater,
                _ => ordering != Ordering::Less,
            };
            Ok(vec![Value::Bool(result)])
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn patient() -> Value {
        json!({
            "resourceType": "Patient",
            "id": "pt-1",
            "gender": "female",
            "birthDate": "1975-04-02",
            "active": true,
            "name": [
                { "use": "official", "family": "Chen", "given": ["Mei", "Lin"] },
                { "use": "nickname", "given": ["May"] }
            ],
            "extension": [
                { "url": "http://example.org/race", "valueString": "Asian" }
            ],
            "generalPractitioner": [{ "reference": "Practitioner/dr-9" }]
        })
    }

    fn run(path: &str, resource: &Value) -> Vec<Value> {
        let constants = HashMap::from([("use".to_string(), json!("official"))]);
        let ctx = EvalContext {
            resource,
            constants: &constants,
        };
        FhirPath::parse(path).unwrap().evaluate(resource, &ctx).unwrap()
    }

    #[test]
    fn test_navigation_and_functions() {
        let p = patient();
        assert_eq!(run("gender", &p), vec![json!("female")]);
        assert_eq!(run("Patient.name.family", &p), vec![json!("Chen")]);
        assert_eq!(run("name.given", &p).len(), 3);
        assert_eq!(run("name[1].given.first()", &p), vec![json!("May")]);
        assert_eq!(run("name.where(use = %use).given.join(' ')", &p), vec![json!("Mei Lin")]);
        assert_eq!(run("name.count()", &p), vec![json!(2)]);
        assert_eq!(run("name.given.last()", &p), vec![json!("May")]);
        assert_eq!(run("deceasedBoolean.exists()", &p), vec![json!(false)]);
        assert_eq!(run("telecom.empty()", &p), vec![json!(true)]);
        assert_eq!(run("name.exists(use = 'nickname')", &p), vec![json!(true)]);
        assert_eq!(run("getResourceKey()", &p), vec![json!("pt-1")]);
        assert_eq!(
            run("generalPractitioner.getReferenceKey(Practitioner)", &p),
            vec![json!("dr-9")]
        );
        assert!(run("generalPractitioner.getReferenceKey(Organization)", &p).is_empty());
        assert_eq!(
            run("extension('http://example.org/race').value.ofType(string)", &p),
            vec![json!("Asian")]
        );
        assert_eq!(run("gender.upper()", &p), vec![json!("FEMALE")]);
        assert_eq!(run("name.family.startsWith('Ch')", &p), vec![json!(true)]);
        assert_eq!(run("name.family.lower().contains('he')", &p), vec![json!(true)]);
        assert_eq!(run("active.not()", &p), vec![json!(false)]);
    }

    #[test]
    fn test_operators() {
        let p = patient();
        assert_eq!(run("birthDate < @1980-01-01", &p), vec![json!(true)]);
        assert_eq!(run("birthDate >= '1980-01-01'", &p), vec![json!(false)]);
        assert_eq!(run("gender = 'female' and active", &p), vec![json!(true)]);
        assert_eq!(run("gender != 'female' or name.count() > 1", &p), vec![json!(true)]);
        assert!(run("missing = 'x'", &p).is_empty());
        assert!(run("{}", &p).is_empty());
    }

    #[test]
    fn test_choice_type_of_type() {
        let obs = json!({
            "resourceType": "Observation",
            "valueQuantity": { "value": 7.2, "unit": "%" }
        });
        assert_eq!(run("value.ofType(Quantity).value", &obs), vec![json!(7.2)]);
        assert_eq!(run("value.ofType(Quantity).value > 6.5", &obs), vec![json!(true)]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(FhirPath::parse("").is_err());
        assert!(FhirPath::parse("name.where(").is_err());
        assert!(FhirPath::parse("name.frobnicate()").is_err());
        assert!(FhirPath::parse("'open").is_err());
        assert!(FhirPath::parse("$index").is_err());
    }

    #[test]
    fn test_unknown_constant_is_eval_error() {
        let p = patient();
        let constants = HashMap::new();
        let ctx = EvalContext {
            resource: &p,
            constants: &constants,
        };
        let path = FhirPath::parse("%missing").unwrap();
        assert!(path.evaluate(&p, &ctx).is_err());
    }
}
