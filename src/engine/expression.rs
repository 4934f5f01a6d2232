// Sandboxed expression evaluator - lexer, Pratt parser, tree interpreter

//! # Expression Evaluator
//!
//! Inline expressions (`{ mode: "expr", expression: "..." }`) are evaluated
//! against a read-only scope containing `steps.<nodeId>`, `trigger`,
//! `variables.*`, sibling node outputs by short name, and a whitelisted
//! builtin function namespace (`$uppercase`, `$now`, ...).
//!
//! The evaluator is deliberately NOT a host-language evaluator: it is a
//! small lexer + Pratt parser + tree interpreter with whitelisted operators
//! only. There is no I/O, no dynamic code loading, and no identifier
//! resolution outside the provided scope. Complexity is bounded: at most
//! 256 AST nodes and 64 levels of nesting; oversized expressions fail to
//! parse rather than run.

use serde_json::{Map, Number, Value};
use std::collections::HashMap;

use chrono::{SecondsFormat, Utc};

/// Hard cap on AST nodes per expression.
const MAX_AST_NODES: usize = 256;
/// Hard cap on nesting depth.
const MAX_DEPTH: usize = 64;

/// Evaluation result. `value: None` with `valid: false` signals a parse or
/// evaluation failure; the caller decides whether a fallback applies.
#[derive(Debug, Clone)]
pub struct EvalOutcome {
    pub value: Option<Value>,
    pub diagnostics: Vec<String>,
    pub valid: bool,
}

impl EvalOutcome {
    fn failure(diagnostic: String) -> Self {
        EvalOutcome {
            value: None,
            diagnostics: vec![diagnostic],
            valid: false,
        }
    }
}

/// Read-only evaluation scope.
#[derive(Debug, Clone, Default)]
pub struct EvalScope {
    root: Map<String, Value>,
}

impl EvalScope {
    /// Build the standard node scope from the execution's output map:
    /// `steps.<id>` for every node, `trigger`, an empty `variables`
    /// namespace, and each node id as a top-level sibling short name.
    pub fn from_outputs(outputs: &HashMap<String, Value>) -> Self {
        let mut root = Map::new();
        let mut steps = Map::new();
        for (node_id, output) in outputs {
            steps.insert(node_id.clone(), output.clone());
            root.entry(node_id.clone()).or_insert_with(|| output.clone());
        }
        if let Some(trigger) = outputs.get("trigger") {
            root.insert("trigger".to_string(), trigger.clone());
        }
        root.insert("steps".to_string(), Value::Object(steps));
        root.entry("variables".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        EvalScope { root }
    }

    /// Add or replace a top-level binding (used for loop item/index
    /// aliases and workflow variables).
    pub fn bind(&mut self, name: &str, value: Value) {
        self.root.insert(name.to_string(), value);
    }

    fn lookup(&self, name: &str) -> Option<&Value> {
        self.root.get(name)
    }
}

// ---------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    /// `$name` builtin function reference.
    Builtin(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn lex(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
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
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err("single '=' is not an operator; use '=='".to_string());
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::NotEq);
                    i += 2;
                } else {
                    tokens.push(Token::Bang);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::AndAnd);
                    i += 2;
                } else {
                    return Err("single '&' is not an operator".to_string());
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::OrOr);
                    i += 2;
                } else {
                    return Err("single '|' is not an operator".to_string());
                }
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                let mut closed = false;
                while i < chars.len() {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        s.push(chars[i + 1]);
                        i += 2;
                        continue;
                    }
                    if chars[i] == quote {
                        closed = true;
                        i += 1;
                        break;
                    }
                    s.push(chars[i]);
                    i += 1;
                }
                if !closed {
                    return Err("unterminated string literal".to_string());
                }
                tokens.push(Token::Str(s));
            }
            '$' => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                if end == start {
                    return Err("dangling '$'".to_string());
                }
                tokens.push(Token::Builtin(chars[start..end].iter().collect()));
                i = end;
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                let mut end = i;
                while end < chars.len() && (chars[end].is_ascii_digit() || chars[end] == '.') {
                    end += 1;
                }
                let raw: String = chars[start..end].iter().collect();
                let value = raw
                    .parse::<f64>()
                    .map_err(|_| format!("bad number literal: {raw}"))?;
                tokens.push(Token::Number(value));
                i = end;
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                let mut end = i;
                while end < chars.len() && (chars[end].is_alphanumeric() || chars[end] == '_') {
                    end += 1;
                }
                let word: String = chars[start..end].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                });
                i = end;
            }
            other => return Err(format!("unexpected character: {other}")),
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------
// Parser (Pratt)
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Ident(String),
    Member(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    nodes: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Parser {
            tokens,
            pos: 0,
            nodes: 0,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, token: &Token) -> Result<(), String> {
        match self.advance() {
            Some(ref t) if t == token => Ok(()),
            other => Err(format!("expected {token:?}, found {other:?}")),
        }
    }

    fn count_node(&mut self) -> Result<(), String> {
        self.nodes += 1;
        if self.nodes > MAX_AST_NODES {
            return Err(format!("expression exceeds {MAX_AST_NODES} AST nodes"));
        }
        Ok(())
    }

    fn parse_expression(&mut self, min_bp: u8, depth: usize) -> Result<Expr, String> {
        if depth > MAX_DEPTH {
            return Err(format!("expression exceeds depth {MAX_DEPTH}"));
        }

        let mut lhs = self.parse_prefix(depth)?;

        loop {
            let op = match self.peek() {
                Some(Token::OrOr) => BinaryOp::Or,
                Some(Token::AndAnd) => BinaryOp::And,
                Some(Token::EqEq) => BinaryOp::Eq,
                Some(Token::NotEq) => BinaryOp::Ne,
                Some(Token::Lt) => BinaryOp::Lt,
                Some(Token::Le) => BinaryOp::Le,
                Some(Token::Gt) => BinaryOp::Gt,
                Some(Token::Ge) => BinaryOp::Ge,
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => break,
            };
            let (l_bp, r_bp) = binding_power(op);
            if l_bp < min_bp {
                break;
            }
            self.advance();
            let rhs = self.parse_expression(r_bp, depth + 1)?;
            self.count_node()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn parse_prefix(&mut self, depth: usize) -> Result<Expr, String> {
        self.count_node()?;
        let expr = match self.advance() {
            Some(Token::Number(n)) => Expr::Number(n),
            Some(Token::Str(s)) => Expr::Str(s),
            Some(Token::True) => Expr::Bool(true),
            Some(Token::False) => Expr::Bool(false),
            Some(Token::Null) => Expr::Null,
            Some(Token::Ident(name)) => Expr::Ident(name),
            Some(Token::Builtin(name)) => {
                self.expect(&Token::LParen)?;
                let mut args = Vec::new();
                if self.peek() != Some(&Token::RParen) {
                    loop {
                        args.push(self.parse_expression(0, depth + 1)?);
                        match self.peek() {
                            Some(Token::Comma) => {
                                self.advance();
                            }
                            _ => break,
                        }
                    }
                }
                self.expect(&Token::RParen)?;
                Expr::Call(name, args)
            }
            Some(Token::Minus) => {
                let operand = self.parse_expression(unary_bp(), depth + 1)?;
                Expr::Unary(UnaryOp::Neg, Box::new(operand))
            }
            Some(Token::Bang) => {
                let operand = self.parse_expression(unary_bp(), depth + 1)?;
                Expr::Unary(UnaryOp::Not, Box::new(operand))
            }
            Some(Token::LParen) => {
                let inner = self.parse_expression(0, depth + 1)?;
                self.expect(&Token::RParen)?;
                inner
            }
            other => return Err(format!("unexpected token: {other:?}")),
        };
        self.parse_postfix(expr, depth)
    }

    fn parse_postfix(&mut self, mut expr: Expr, depth: usize) -> Result<Expr, String> {
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.advance();
                    match self.advance() {
                        Some(Token::Ident(name)) => {
                            self.count_node()?;
                            expr = Expr::Member(Box::new(expr), name);
                        }
                        other => return Err(format!("expected member name, found {other:?}")),
                    }
                }
                Some(Token::LBracket) => {
                    self.advance();
                    let index = self.parse_expression(0, depth + 1)?;
                    self.expect(&Token::RBracket)?;
                    self.count_node()?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => break,
            }
        }
        Ok(expr)
    }
}

fn binding_power(op: BinaryOp) -> (u8, u8) {
    match op {
        BinaryOp::Or => (1, 2),
        BinaryOp::And => (3, 4),
        BinaryOp::Eq | BinaryOp::Ne => (5, 6),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => (7, 8),
        BinaryOp::Add | BinaryOp::Sub => (9, 10),
        BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => (11, 12),
    }
}

fn unary_bp() -> u8 {
    13
}

// ---------------------------------------------------------------------
// Interpreter
// ---------------------------------------------------------------------

fn eval_expr(expr: &Expr, scope: &EvalScope) -> Result<Value, String> {
    match expr {
        Expr::Number(n) => Ok(number(*n)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Null => Ok(Value::Null),
        Expr::Ident(name) => scope
            .lookup(name)
            .cloned()
            .ok_or_else(|| format!("unknown identifier: {name}")),
        Expr::Member(base, field) => {
            let base = eval_expr(base, scope)?;
            Ok(base
                .as_object()
                .and_then(|o| o.get(field))
                .cloned()
                .unwrap_or(Value::Null))
        }
        Expr::Index(base, index) => {
            let base = eval_expr(base, scope)?;
            let index = eval_expr(index, scope)?;
            let out = match (&base, &index) {
                (Value::Array(items), Value::Number(n)) => n
                    .as_u64()
                    .and_then(|i| items.get(i as usize))
                    .cloned()
                    .unwrap_or(Value::Null),
                (Value::Object(map), Value::String(key)) => {
                    map.get(key).cloned().unwrap_or(Value::Null)
                }
                _ => Value::Null,
            };
            Ok(out)
        }
        Expr::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, scope)?);
            }
            call_builtin(name, &values)
        }
        Expr::Unary(op, operand) => {
            let value = eval_expr(operand, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => value
                    .as_f64()
                    .map(|n| number(-n))
                    .ok_or_else(|| "unary '-' needs a number".to_string()),
            }
        }
        Expr::Binary(op, lhs, rhs) => {
            // Short-circuit logical operators before evaluating the rhs.
            if *op == BinaryOp::And {
                let l = eval_expr(lhs, scope)?;
                if !truthy(&l) {
                    return Ok(Value::Bool(false));
                }
                let r = eval_expr(rhs, scope)?;
                return Ok(Value::Bool(truthy(&r)));
            }
            if *op == BinaryOp::Or {
                let l = eval_expr(lhs, scope)?;
                if truthy(&l) {
                    return Ok(Value::Bool(true));
                }
                let r = eval_expr(rhs, scope)?;
                return Ok(Value::Bool(truthy(&r)));
            }

            let l = eval_expr(lhs, scope)?;
            let r = eval_expr(rhs, scope)?;
            eval_binary(*op, &l, &r)
        }
    }
}

fn eval_binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, String> {
    match op {
        BinaryOp::Add => {
            // String concatenation when either side is a string.
            if l.is_string() || r.is_string() {
                return Ok(Value::String(format!(
                    "{}{}",
                    display(l),
                    display(r)
                )));
            }
            numeric(op, l, r)
        }
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => numeric(op, l, r),
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(l, r))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(l, r))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            if let (Value::String(a), Value::String(b)) = (l, r) {
                let result = match op {
                    BinaryOp::Lt => a < b,
                    BinaryOp::Le => a <= b,
                    BinaryOp::Gt => a > b,
                    BinaryOp::Ge => a >= b,
                    _ => unreachable!(),
                };
                return Ok(Value::Bool(result));
            }
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                return Err("comparison needs two numbers or two strings".to_string());
            };
            let result = match op {
                BinaryOp::Lt => a < b,
                BinaryOp::Le => a <= b,
                BinaryOp::Gt => a > b,
                BinaryOp::Ge => a >= b,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled with short-circuit"),
    }
}

fn numeric(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, String> {
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Err(format!("arithmetic needs numbers, got {l} and {r}"));
    };
    let out = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Sub => a - b,
        BinaryOp::Mul => a * b,
        BinaryOp::Div => {
            if b == 0.0 {
                return Err("division by zero".to_string());
            }
            a / b
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err("modulo by zero".to_string());
            }
            a % b
        }
        _ => unreachable!(),
    };
    Ok(number(out))
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return (a - b).abs() < f64::EPSILON;
    }
    l == r
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(_) => true,
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Wrap an f64 as a JSON number, preferring integer representation.
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::Number(Number::from(n as i64))
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, String> {
    match name {
        "uppercase" => one_string(name, args).map(|s| Value::String(s.to_uppercase())),
        "lower" => one_string(name, args).map(|s| Value::String(s.to_lowercase())),
        "now" => Ok(Value::String(
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        )),
        "date" => {
            let date = Utc::now().date_naive();
            match args.first() {
                None => Ok(Value::String(date.to_string())),
                Some(Value::String(fmt)) => Ok(Value::String(date.format(fmt).to_string())),
                Some(other) => Err(format!("$date expects a format string, got {other}")),
            }
        }
        "json" => serde_json::to_string(args.first().unwrap_or(&Value::Null))
            .map(Value::String)
            .map_err(|e| format!("$json: {e}")),
        "int" => {
            let arg = args.first().ok_or("$int needs an argument")?;
            let n = match arg {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                _ => None,
            }
            .ok_or_else(|| format!("$int cannot convert {arg}"))?;
            Ok(Value::Number(Number::from(n as i64)))
        }
        "float" => {
            let arg = args.first().ok_or("$float needs an argument")?;
            let n = match arg {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .ok_or_else(|| format!("$float cannot convert {arg}"))?;
            Number::from_f64(n)
                .map(Value::Number)
                .ok_or_else(|| "$float produced a non-finite number".to_string())
        }
        "len" => {
            let arg = args.first().ok_or("$len needs an argument")?;
            let len = match arg {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                _ => return Err(format!("$len cannot measure {arg}")),
            };
            Ok(Value::Number(Number::from(len as u64)))
        }
        "concat" => {
            let mut out = String::new();
            for arg in args {
                out.push_str(&display(arg));
            }
            Ok(Value::String(out))
        }
        other => Err(format!("unknown function: ${other}")),
    }
}

fn one_string(name: &str, args: &[Value]) -> Result<String, String> {
    match args {
        [Value::String(s)] => Ok(s.clone()),
        [other] => Ok(display(other)),
        _ => Err(format!("${name} expects exactly one argument")),
    }
}

/// Evaluate an expression against a scope.
pub fn evaluate(expression: &str, scope: &EvalScope) -> EvalOutcome {
    let tokens = match lex(expression) {
        Ok(t) => t,
        Err(e) => return EvalOutcome::failure(format!("lex error: {e}")),
    };
    if tokens.is_empty() {
        return EvalOutcome::failure("empty expression".to_string());
    }

    let mut parser = Parser::new(tokens);
    let ast = match parser.parse_expression(0, 0) {
        Ok(ast) => ast,
        Err(e) => return EvalOutcome::failure(format!("parse error: {e}")),
    };
    if parser.pos != parser.tokens.len() {
        return EvalOutcome::failure("trailing tokens after expression".to_string());
    }

    match eval_expr(&ast, scope) {
        Ok(value) => EvalOutcome {
            value: Some(value),
            diagnostics: Vec::new(),
            valid: true,
        },
        Err(e) => EvalOutcome::failure(format!("eval error: {e}")),
    }
}

/// Evaluate and type-check the result against an expected JSON type name
/// (`string`, `number`, `boolean`, `array`, `object`, `null`).
pub fn evaluate_with_schema(
    expression: &str,
    scope: &EvalScope,
    expected: Option<&str>,
) -> EvalOutcome {
    let mut outcome = evaluate(expression, scope);
    if let (Some(value), Some(expected)) = (&outcome.value, expected) {
        let actual = json_type_name(value);
        if actual != expected {
            outcome
                .diagnostics
                .push(format!("expected {expected}, got {actual}"));
            outcome.valid = false;
        }
    }
    outcome
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scope() -> EvalScope {
        let mut outputs = HashMap::new();
        outputs.insert("trigger".to_string(), json!({"count": 3, "name": "ada"}));
        outputs.insert("fetch".to_string(), json!({"items": [10, 20, 30]}));
        EvalScope::from_outputs(&outputs)
    }

    fn eval(expr: &str) -> Value {
        let outcome = evaluate(expr, &scope());
        assert!(outcome.valid, "diagnostics: {:?}", outcome.diagnostics);
        outcome.value.unwrap()
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert_eq!(eval("1 + 2 * 3"), json!(7));
        assert_eq!(eval("(1 + 2) * 3"), json!(9));
        assert_eq!(eval("10 % 4"), json!(2));
        assert_eq!(eval("-2 + 5"), json!(3));
    }

    #[test]
    fn member_and_index_access() {
        assert_eq!(eval("trigger.count + 1"), json!(4));
        assert_eq!(eval("steps.fetch.items[1]"), json!(20));
        assert_eq!(eval("fetch.items[2]"), json!(30));
        // Missing members are null, not errors.
        assert_eq!(eval("trigger.ghost"), Value::Null);
    }

    #[test]
    fn comparisons_and_logic() {
        assert_eq!(eval("trigger.count >= 3 && trigger.name == 'ada'"), json!(true));
        assert_eq!(eval("trigger.count > 5 || false"), json!(false));
        assert_eq!(eval("!null"), json!(true));
    }

    #[test]
    fn string_concat_via_plus() {
        assert_eq!(eval("'hi ' + trigger.name"), json!("hi ada"));
        assert_eq!(eval("trigger.count + 'x'"), json!("3x"));
    }

    #[test]
    fn builtins() {
        assert_eq!(eval("$uppercase('abc')"), json!("ABC"));
        assert_eq!(eval("$lower('ABC')"), json!("abc"));
        assert_eq!(eval("$len(fetch.items)"), json!(3));
        assert_eq!(eval("$int('42')"), json!(42));
        assert_eq!(eval("$float('1.5')"), json!(1.5));
        assert_eq!(eval("$concat('a', 1, 'b')"), json!("a1b"));
        assert_eq!(eval("$json(trigger.count)"), json!("3"));
    }

    #[test]
    fn unknown_identifiers_are_rejected() {
        let outcome = evaluate("not_in_scope + 1", &scope());
        assert!(!outcome.valid);
        assert!(outcome.diagnostics[0].contains("unknown identifier"));
    }

    #[test]
    fn unknown_functions_are_rejected() {
        let outcome = evaluate("$system('rm -rf /')", &scope());
        assert!(!outcome.valid);
        assert!(outcome.diagnostics[0].contains("unknown function"));
    }

    #[test]
    fn complexity_bound_enforced() {
        // 300 additions exceeds the 256-node cap.
        let big = (0..300).map(|i| i.to_string()).collect::<Vec<_>>().join(" + ");
        let outcome = evaluate(&big, &scope());
        assert!(!outcome.valid);
        assert!(outcome.diagnostics[0].contains("AST nodes"));
    }

    #[test]
    fn division_by_zero_is_a_diagnostic() {
        let outcome = evaluate("1 / 0", &scope());
        assert!(!outcome.valid);
        assert!(outcome.diagnostics[0].contains("division by zero"));
    }

    #[test]
    fn schema_check() {
        let outcome = evaluate_with_schema("1 + 1", &scope(), Some("number"));
        assert!(outcome.valid);
        let outcome = evaluate_with_schema("1 + 1", &scope(), Some("string"));
        assert!(!outcome.valid);
    }
}
