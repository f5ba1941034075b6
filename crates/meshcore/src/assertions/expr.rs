//! Tokenizer, parser and evaluator for assertion and condition expressions.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! or      := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | compare
//! compare := operand (cmp-op operand)?
//! operand := literal | path | call | "(" or ")" | "[" list "]" | "-" operand
//! ```
//!
//! Path segments may contain `-` between word characters (`headers.content-type`).

use crate::value::get_path;
use crate::OutputMap;
use serde_json::{Number, Value};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Path(String),
    True,
    False,
    Null,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    In,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
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
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let followed_by_eq = chars.get(i + 1) == Some(&'=');
                let token = match (c, followed_by_eq) {
                    ('=', true) => Token::Eq,
                    ('!', true) => Token::Ne,
                    ('<', true) => Token::Le,
                    ('>', true) => Token::Ge,
                    ('!', false) => Token::Not,
                    ('<', false) => Token::Lt,
                    ('>', false) => Token::Gt,
                    _ => return Err(format!("unexpected '=' at position {}", i)),
                };
                tokens.push(token);
                i += if followed_by_eq { 2 } else { 1 };
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(format!("expected '{}{}' at position {}", c, c, i));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '"' | '\'' => {
                let (text, next) = read_string(&chars, i)?;
                tokens.push(Token::Str(text));
                i = next;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number at position {}", start))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let (path, next) = read_path(&chars, i)?;
                tokens.push(keyword(&path).unwrap_or(Token::Path(path)));
                i = next;
            }
            _ => return Err(format!("unexpected character at position {}", i)),
        }
    }

    Ok(tokens)
}

fn read_string(chars: &[char], start: usize) -> Result<(String, usize), String> {
    let quote = chars[start];
    let mut out = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars.get(i + 1).ok_or("unterminated escape")?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err("unterminated string literal".to_string())
}

fn read_path(chars: &[char], start: usize) -> Result<(String, usize), String> {
    let mut i = start;
    while i < chars.len() {
        let c = chars[i];
        if c.is_alphanumeric() || c == '_' || c == '.' || c == '$' {
            i += 1;
        } else if c == '-' && joins_key(chars, i) {
            // header-style keys such as `content-type`
            i += 1;
        } else if c == '[' && i > start && chars.get(i + 1).is_some_and(|d| d.is_ascii_digit()) {
            let close = chars[i..]
                .iter()
                .position(|&ch| ch == ']')
                .ok_or("unterminated index")?;
            i += close + 1;
        } else {
            break;
        }
    }
    Ok((chars[start..i].iter().collect(), i))
}

impl Token {
    /// Kind of token, never its text.
    fn describe(&self) -> &'static str {
        match self {
            Token::Number(_) => "number",
            Token::Str(_) => "string literal",
            Token::Path(_) => "field path",
            Token::True | Token::False => "boolean",
            Token::Null => "null",
            Token::Eq | Token::Ne | Token::Lt | Token::Le | Token::Gt | Token::Ge => "comparison operator",
            Token::And | Token::Or | Token::Not => "logical operator",
            Token::In | Token::Contains | Token::StartsWith | Token::EndsWith | Token::Matches => "keyword operator",
            Token::Minus => "'-'",
            Token::LParen => "'('",
            Token::RParen => "')'",
            Token::LBracket => "'['",
            Token::RBracket => "']'",
            Token::Comma => "','",
        }
    }
}

/// JSON type name used in evaluation errors. Values never appear in them.
pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "object",
    }
}

/// A `-` continues a path only between two word characters. Anything else
/// is unary minus.
fn joins_key(chars: &[char], at: usize) -> bool {
    let word = |c: &char| c.is_alphanumeric() || *c == '_';
    at > 0 && chars.get(at - 1).is_some_and(word) && chars.get(at + 1).is_some_and(word)
}

fn keyword(word: &str) -> Option<Token> {
    Some(match word {
        "true" => Token::True,
        "false" => Token::False,
        "null" | "nil" => Token::Null,
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "in" => Token::In,
        "contains" => Token::Contains,
        "startsWith" => Token::StartsWith,
        "endsWith" => Token::EndsWith,
        "matches" => Token::Matches,
        _ => return None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    Path(String),
    List(Vec<Expr>),
    Call(String, Vec<Expr>),
    Neg(Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token) -> Result<(), String> {
        match self.advance() {
            Some(found) if found == token => Ok(()),
            Some(found) => Err(format!("expected {}, found {}", token.describe(), found.describe())),
            None => Err(format!("expected {}, found end of expression", token.describe())),
        }
    }

    fn or(&mut self) -> Result<Expr, String> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while self.eat(&Token::And) {
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, String> {
        let left = self.operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => CompareOp::Eq,
            Some(Token::Ne) => CompareOp::Ne,
            Some(Token::Lt) => CompareOp::Lt,
            Some(Token::Le) => CompareOp::Le,
            Some(Token::Gt) => CompareOp::Gt,
            Some(Token::Ge) => CompareOp::Ge,
            Some(Token::In) => CompareOp::In,
            Some(Token::Contains) => CompareOp::Contains,
            Some(Token::StartsWith) => CompareOp::StartsWith,
            Some(Token::EndsWith) => CompareOp::EndsWith,
            Some(Token::Matches) => CompareOp::Matches,
            Some(Token::Not) if self.tokens.get(self.pos + 1) == Some(&Token::In) => {
                self.pos += 1;
                CompareOp::NotIn
            }
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.operand()?;
        Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
    }

    fn operand(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Number(n)) => Number::from_f64(n)
                .map(|num| Expr::Literal(Value::Number(num)))
                .ok_or_else(|| "invalid number".to_string()),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Minus) => Ok(Expr::Neg(Box::new(self.operand()?))),
            Some(Token::LParen) => {
                let inner = self.or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if !self.eat(&Token::RBracket) {
                    loop {
                        items.push(self.or()?);
                        if self.eat(&Token::RBracket) {
                            break;
                        }
                        self.expect(Token::Comma)?;
                    }
                }
                Ok(Expr::List(items))
            }
            Some(Token::Path(path)) => {
                if self.eat(&Token::LParen) {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.or()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(Token::Comma)?;
                        }
                    }
                    Ok(Expr::Call(path, args))
                } else {
                    Ok(Expr::Path(path))
                }
            }
            Some(other) => Err(format!("unexpected {}", other.describe())),
            None => Err("unexpected end of expression".to_string()),
        }
    }
}

pub(crate) fn parse(source: &str) -> Result<Expr, String> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err("empty expression".to_string());
    }
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.or()?;
    if let Some(extra) = parser.peek() {
        return Err(format!("unexpected trailing {}", extra.describe()));
    }
    Ok(expr)
}

fn resolve_path<'a>(env: &'a OutputMap, path: &str) -> Option<&'a Value> {
    if let Some(body_path) = path.strip_prefix("$.") {
        let from_body = env
            .get("body")
            .and_then(|body| body.as_object())
            .and_then(|body| get_path(body, body_path));
        return from_body.or_else(|| get_path(env, body_path));
    }
    get_path(env, path).or_else(|| {
        path.strip_prefix("response.")
            .filter(|_| !env.contains_key("response"))
            .and_then(|rest| get_path(env, rest))
    })
}

fn as_bool(value: &Value, context: &str) -> Result<bool, String> {
    value
        .as_bool()
        .ok_or_else(|| format!("{} expects a boolean, got {}", context, type_name(value)))
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        _ => left == right,
    }
}

fn ordering(left: &Value, right: &Value) -> Result<std::cmp::Ordering, String> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b).ok_or_else(|| "numbers are not comparable".to_string())
        }
        (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
        _ => Err(format!("cannot compare {} with {}", type_name(left), type_name(right))),
    }
}

fn membership(needle: &Value, haystack: &Value) -> Result<bool, String> {
    match (needle, haystack) {
        (_, Value::Array(items)) => Ok(items.iter().any(|item| values_equal(item, needle))),
        (Value::String(n), Value::String(h)) => Ok(h.contains(n.as_str())),
        (Value::String(key), Value::Object(map)) => Ok(map.contains_key(key)),
        (_, Value::Null) => Ok(false),
        _ => Err(format!(
            "cannot test membership of {} in {}",
            type_name(needle),
            type_name(haystack)
        )),
    }
}

fn string_pair<'a>(left: &'a Value, right: &'a Value, op: &str) -> Result<(&'a str, &'a str), String> {
    match (left, right) {
        (Value::String(a), Value::String(b)) => Ok((a, b)),
        _ => Err(format!("{} expects strings, got {} and {}", op, type_name(left), type_name(right))),
    }
}

pub(crate) fn eval(expr: &Expr, env: &OutputMap) -> Result<Value, String> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(path) => Ok(resolve_path(env, path).cloned().unwrap_or(Value::Null)),
        Expr::List(items) => items
            .iter()
            .map(|item| eval(item, env))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Neg(inner) => {
            let value = eval(inner, env)?;
            value
                .as_f64()
                .and_then(|n| Number::from_f64(-n))
                .map(Value::Number)
                .ok_or_else(|| format!("cannot negate {}", type_name(&value)))
        }
        Expr::Not(inner) => Ok(Value::Bool(!as_bool(&eval(inner, env)?, "not")?)),
        Expr::And(left, right) => {
            if !as_bool(&eval(left, env)?, "&&")? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&eval(right, env)?, "&&")?))
        }
        Expr::Or(left, right) => {
            if as_bool(&eval(left, env)?, "||")? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&eval(right, env)?, "||")?))
        }
        Expr::Compare(op, left, right) => {
            let (l, r) = (eval(left, env)?, eval(right, env)?);
            let result = match op {
                CompareOp::Eq => values_equal(&l, &r),
                CompareOp::Ne => !values_equal(&l, &r),
                CompareOp::Lt => ordering(&l, &r)?.is_lt(),
                CompareOp::Le => ordering(&l, &r)?.is_le(),
                CompareOp::Gt => ordering(&l, &r)?.is_gt(),
                CompareOp::Ge => ordering(&l, &r)?.is_ge(),
                CompareOp::In => membership(&l, &r)?,
                CompareOp::NotIn => !membership(&l, &r)?,
                CompareOp::Contains => membership(&r, &l)?,
                CompareOp::StartsWith => {
                    let (a, b) = string_pair(&l, &r, "startsWith")?;
                    a.starts_with(b)
                }
                CompareOp::EndsWith => {
                    let (a, b) = string_pair(&l, &r, "endsWith")?;
                    a.ends_with(b)
                }
                CompareOp::Matches => {
                    let (text, pattern) = string_pair(&l, &r, "matches")?;
                    regex::Regex::new(pattern)
                        .map_err(|_| "matches expects a valid regular expression".to_string())?
                        .is_match(text)
                }
            };
            Ok(Value::Bool(result))
        }
        Expr::Call(name, args) => call(name, args, env),
    }
}

fn call(name: &str, args: &[Expr], env: &OutputMap) -> Result<Value, String> {
    let single = || match args {
        [arg] => Ok(arg),
        _ => Err(format!("{}() takes exactly one argument", name)),
    };
    match name {
        "exists" => match single()? {
            Expr::Path(path) => Ok(Value::Bool(resolve_path(env, path).is_some())),
            _ => Err("exists() expects a field path".to_string()),
        },
        "len" => {
            let value = eval(single()?, env)?;
            let len = match &value {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                Value::Null => 0,
                other => return Err(format!("len() not defined for {}", type_name(other))),
            };
            Ok(Value::from(len))
        }
        "lower" | "upper" => match eval(single()?, env)? {
            Value::String(s) if name == "lower" => Ok(Value::String(s.to_lowercase())),
            Value::String(s) => Ok(Value::String(s.to_uppercase())),
            other => Err(format!("{}() expects a string, got {}", name, type_name(&other))),
        },
        other => Err(format!("unknown function '{}'", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(source: &str, env: serde_json::Value) -> Result<Value, String> {
        let map = env.as_object().cloned().unwrap_or_default();
        eval(&parse(source)?, &map)
    }

    #[test]
    fn tokenizes_paths_with_indices() {
        let tokens = tokenize("body.items[0].id == \"x\"").unwrap();
        assert_eq!(tokens[0], Token::Path("body.items[0].id".to_string()));
        assert_eq!(tokens[1], Token::Eq);
        assert_eq!(tokens[2], Token::Str("x".to_string()));
    }

    #[test]
    fn precedence_binds_and_tighter_than_or() {
        let env = json!({"a": 1, "b": 2});
        assert_eq!(run("a == 2 || a == 1 && b == 2", env.clone()), Ok(json!(true)));
        assert_eq!(run("(a == 2 || a == 1) && b == 3", env), Ok(json!(false)));
    }

    #[test]
    fn membership_and_string_operators() {
        let env = json!({"tags": ["x", "y"], "name": "alice", "status": 201});
        assert_eq!(run("\"x\" in tags", env.clone()), Ok(json!(true)));
        assert_eq!(run("status in [200, 201]", env.clone()), Ok(json!(true)));
        assert_eq!(run("\"z\" not in tags", env.clone()), Ok(json!(true)));
        assert_eq!(run("name startsWith \"al\"", env.clone()), Ok(json!(true)));
        assert_eq!(run("name matches \"^a.*e$\"", env.clone()), Ok(json!(true)));
        assert_eq!(run("tags contains \"y\"", env), Ok(json!(true)));
    }

    #[test]
    fn functions_and_negation() {
        let env = json!({"items": [1, 2, 3], "delta": -2});
        assert_eq!(run("len(items) == 3", env.clone()), Ok(json!(true)));
        assert_eq!(run("exists(items) && !exists(missing)", env.clone()), Ok(json!(true)));
        assert_eq!(run("delta == -2", env), Ok(json!(true)));
    }

    #[test]
    fn hyphenated_keys_are_paths() {
        let env = json!({"headers": {"content-type": "application/json", "x-request-id": "r1"}, "n": 3});
        assert_eq!(
            run("headers.content-type == \"application/json\"", env.clone()),
            Ok(json!(true))
        );
        assert_eq!(run("headers.x-request-id startsWith \"r\"", env.clone()), Ok(json!(true)));
        assert_eq!(run("-n == -3", env.clone()), Ok(json!(true)));
        assert_eq!(run("n > -1", env), Ok(json!(true)));
        let tokens = tokenize("content-type").unwrap();
        assert_eq!(tokens, vec![Token::Path("content-type".to_string())]);
    }

    #[test]
    fn type_mismatch_is_an_error() {
        let env = json!({"name": "bob"});
        assert!(run("name > 3", env.clone()).is_err());
        assert!(run("name && true", env).is_err());
    }

    #[test]
    fn errors_name_types_not_values() {
        let env = json!({"password": "hunter2", "flags": {"admin": true}});
        let err = run("password > 3", env.clone()).unwrap_err();
        assert_eq!(err, "cannot compare string with number");
        let err = run("password && true", env.clone()).unwrap_err();
        assert_eq!(err, "&& expects a boolean, got string");
        let err = run("-password == 1", env.clone()).unwrap_err();
        assert!(!err.contains("hunter2"), "{}", err);
        let err = run("flags startsWith \"a\"", env).unwrap_err();
        assert_eq!(err, "startsWith expects strings, got object and string");
        let err = parse("a == \"hunter2\" \"again\"").unwrap_err();
        assert!(!err.contains("hunter2") && !err.contains("again"), "{}", err);
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(parse("status ==").is_err());
        assert!(parse("(a == 1").is_err());
        assert!(parse("a = 1").is_err());
        assert!(parse("").is_err());
    }
}
