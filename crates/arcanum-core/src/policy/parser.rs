//! Policy document parsing and validation.
//!
//! Two surface syntaxes are accepted and normalised into the same shape
//! before validation:
//!
//! ```text
//! {"path": {"secret/*": {"capabilities": ["read", "list"]}}}
//! ```
//!
//! ```text
//! path "secret/*" {
//!   capabilities = ["read", "list"]
//!   max_wrapping_ttl = "1h"
//! }
//! ```
//!
//! The HCL side is a small subset: `path` blocks holding `key = value`
//! attributes, where values are strings, integers, booleans, lists and
//! `{ key = value }` maps. `#`, `//` and `/* */` comments are skipped.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Deserialize;
use serde_json::{Map, Value};

use super::pattern::PathPattern;
use super::{Capability, PathRule, Policy};
use crate::error::PolicyError;

fn malformed(reason: impl Into<String>) -> PolicyError {
    PolicyError::Malformed {
        reason: reason.into(),
    }
}

/// Parse and validate a policy document.
pub(crate) fn parse(document: &str) -> Result<Policy, PolicyError> {
    let trimmed = document.trim_start();
    let blocks = if trimmed.starts_with('{') {
        json_blocks(trimmed)?
    } else {
        Parser::new(tokenize(trimmed)?).document()?
    };
    if blocks.is_empty() {
        return Err(malformed("policy has no path blocks"));
    }

    let rules = blocks
        .into_iter()
        .map(|(pattern, body)| build_rule(&pattern, body))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Policy { rules })
}

// ── Validation ───────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRule {
    #[serde(default)]
    capabilities: Vec<String>,
    #[serde(default)]
    allowed_parameters: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    denied_parameters: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    required_parameters: Vec<String>,
    #[serde(default)]
    min_wrapping_ttl: Option<RawTtl>,
    #[serde(default)]
    max_wrapping_ttl: Option<RawTtl>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawTtl {
    Seconds(u64),
    Text(String),
}

fn build_rule(pattern: &str, body: Value) -> Result<PathRule, PolicyError> {
    let raw: RawRule = serde_json::from_value(body)
        .map_err(|e| malformed(format!("path '{pattern}': {e}")))?;
    let pattern = PathPattern::parse(pattern)?;

    if raw.capabilities.is_empty() {
        return Err(malformed(format!("path '{pattern}': empty capability set")));
    }
    let capabilities = raw
        .capabilities
        .iter()
        .map(|c| {
            c.parse::<Capability>()
                .map_err(|_| malformed(format!("path '{pattern}': unknown capability '{c}'")))
        })
        .collect::<Result<BTreeSet<_>, _>>()?;
    if capabilities.contains(&Capability::Deny) && capabilities.len() > 1 {
        return Err(malformed(format!(
            "path '{pattern}': 'deny' cannot be combined with other capabilities"
        )));
    }

    let min_wrapping_ttl = raw
        .min_wrapping_ttl
        .map(|t| ttl_seconds(t, "min_wrapping_ttl", &pattern))
        .transpose()?;
    let max_wrapping_ttl = raw
        .max_wrapping_ttl
        .map(|t| ttl_seconds(t, "max_wrapping_ttl", &pattern))
        .transpose()?;
    if let (Some(min), Some(max)) = (min_wrapping_ttl, max_wrapping_ttl) {
        if min > max {
            return Err(malformed(format!(
                "path '{pattern}': min_wrapping_ttl ({min}s) exceeds max_wrapping_ttl ({max}s)"
            )));
        }
    }

    if let Some(name) = raw.required_parameters.iter().find(|p| p.is_empty()) {
        return Err(malformed(format!(
            "path '{pattern}': invalid required parameter '{name}'"
        )));
    }

    Ok(PathRule {
        pattern,
        capabilities,
        allowed_parameters: raw.allowed_parameters,
        denied_parameters: raw.denied_parameters,
        required_parameters: raw.required_parameters,
        min_wrapping_ttl,
        max_wrapping_ttl,
    })
}

/// Seconds from an integer or a `30s` / `5m` / `1h` string.
fn ttl_seconds(raw: RawTtl, field: &str, pattern: &PathPattern) -> Result<u64, PolicyError> {
    let text = match raw {
        RawTtl::Seconds(secs) => return Ok(secs),
        RawTtl::Text(text) => text,
    };
    let invalid = || malformed(format!("path '{pattern}': invalid {field} '{text}'"));

    let text_trimmed = text.trim();
    let split = text_trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text_trimmed.len());
    let (digits, unit) = text_trimmed.split_at(split);
    let value: u64 = digits.parse().map_err(|_| invalid())?;
    let scale = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(invalid()),
    };
    value.checked_mul(scale).ok_or_else(invalid)
}

// ── JSON ─────────────────────────────────────────────────────────────

fn json_blocks(document: &str) -> Result<Vec<(String, Value)>, PolicyError> {
    let value: Value =
        serde_json::from_str(document).map_err(|e| malformed(format!("invalid JSON: {e}")))?;
    let Value::Object(mut top) = value else {
        return Err(malformed("policy document must be an object"));
    };
    let paths = top
        .remove("path")
        .ok_or_else(|| malformed("policy document has no 'path' object"))?;
    if let Some(unknown) = top.keys().next() {
        return Err(malformed(format!("unknown top-level key '{unknown}'")));
    }
    match paths {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => Err(malformed("'path' must map patterns to rule objects")),
    }
}

// ── HCL subset ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    Number(u64),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Equals,
    Comma,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ident(s) => write!(f, "identifier '{s}'"),
            Self::Str(s) => write!(f, "string \"{s}\""),
            Self::Number(n) => write!(f, "number {n}"),
            Self::LBrace => f.write_str("'{'"),
            Self::RBrace => f.write_str("'}'"),
            Self::LBracket => f.write_str("'['"),
            Self::RBracket => f.write_str("']'"),
            Self::Equals => f.write_str("'='"),
            Self::Comma => f.write_str("','"),
        }
    }
}

/// Split an HCL document into tokens tagged with their line number.
fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, PolicyError> {
    let mut tokens = Vec::new();
    let mut chars = src.chars().peekable();
    let mut line = 1;

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            '#' => skip_line(&mut chars, &mut line),
            '/' => match chars.next() {
                Some('/') => skip_line(&mut chars, &mut line),
                Some('*') => {
                    let start = line;
                    let mut prev = '\0';
                    loop {
                        match chars.next() {
                            Some('/') if prev == '*' => break,
                            Some(c) => {
                                if c == '\n' {
                                    line += 1;
                                }
                                prev = c;
                            }
                            None => {
                                return Err(malformed(format!(
                                    "line {start}: unterminated block comment"
                                )));
                            }
                        }
                    }
                }
                _ => return Err(malformed(format!("line {line}: unexpected '/'"))),
            },
            '{' => tokens.push((Token::LBrace, line)),
            '}' => tokens.push((Token::RBrace, line)),
            '[' => tokens.push((Token::LBracket, line)),
            ']' => tokens.push((Token::RBracket, line)),
            '=' => tokens.push((Token::Equals, line)),
            ',' => tokens.push((Token::Comma, line)),
            '"' => {
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(c @ ('"' | '\\')) => s.push(c),
                            other => {
                                return Err(malformed(format!(
                                    "line {line}: invalid escape '\\{}'",
                                    other.map(String::from).unwrap_or_default()
                                )));
                            }
                        },
                        Some('\n') | None => {
                            return Err(malformed(format!("line {line}: unterminated string")));
                        }
                        Some(c) => s.push(c),
                    }
                }
                tokens.push((Token::Str(s), line));
            }
            c if c.is_ascii_digit() => {
                let mut digits = String::from(c);
                while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    digits.push(d);
                    chars.next();
                }
                let n = digits
                    .parse()
                    .map_err(|_| malformed(format!("line {line}: number {digits} is too large")))?;
                tokens.push((Token::Number(n), line));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::from(c);
                while let Some(&d) = chars
                    .peek()
                    .filter(|d| d.is_ascii_alphanumeric() || matches!(d, '_' | '-'))
                {
                    ident.push(d);
                    chars.next();
                }
                tokens.push((Token::Ident(ident), line));
            }
            other => {
                return Err(malformed(format!("line {line}: unexpected character '{other}'")));
            }
        }
    }
    Ok(tokens)
}

fn skip_line(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, line: &mut usize) {
    for c in chars.by_ref() {
        if c == '\n' {
            *line += 1;
            break;
        }
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<(Token, usize)>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let item = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        item
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn expect(&mut self, wanted: &Token) -> Result<(), PolicyError> {
        match self.next() {
            Some((t, _)) if &t == wanted => Ok(()),
            Some((t, line)) => Err(malformed(format!("line {line}: expected {wanted}, found {t}"))),
            None => Err(malformed(format!("expected {wanted}, found end of document"))),
        }
    }

    fn document(&mut self) -> Result<Vec<(String, Value)>, PolicyError> {
        let mut blocks = Vec::new();
        while let Some((token, line)) = self.next() {
            match token {
                Token::Ident(kw) if kw == "path" => {}
                other => {
                    return Err(malformed(format!("line {line}: expected 'path', found {other}")));
                }
            }
            let pattern = match self.next() {
                Some((Token::Str(p), _)) => p,
                Some((other, line)) => {
                    return Err(malformed(format!(
                        "line {line}: expected a quoted path, found {other}"
                    )));
                }
                None => return Err(malformed("expected a quoted path after 'path'")),
            };
            let body = self.object()?;
            blocks.push((pattern, body));
        }
        Ok(blocks)
    }

    fn object(&mut self) -> Result<Value, PolicyError> {
        self.expect(&Token::LBrace)?;
        let mut map = Map::new();
        loop {
            let (key, line) = match self.next() {
                Some((Token::RBrace, _)) => return Ok(Value::Object(map)),
                Some((Token::Ident(k) | Token::Str(k), line)) => (k, line),
                Some((other, line)) => {
                    return Err(malformed(format!(
                        "line {line}: expected an attribute name, found {other}"
                    )));
                }
                None => return Err(malformed("unterminated block")),
            };
            self.expect(&Token::Equals)?;
            let value = self.value()?;
            if map.insert(key.clone(), value).is_some() {
                return Err(malformed(format!("line {line}: duplicate attribute '{key}'")));
            }
            if self.peek() == Some(&Token::Comma) {
                self.pos += 1;
            }
        }
    }

    fn value(&mut self) -> Result<Value, PolicyError> {
        if self.peek() == Some(&Token::LBrace) {
            return self.object();
        }
        match self.next() {
            Some((Token::Str(s), _)) => Ok(Value::String(s)),
            Some((Token::Number(n), _)) => Ok(Value::from(n)),
            Some((Token::Ident(b), _)) if b == "true" => Ok(Value::Bool(true)),
            Some((Token::Ident(b), _)) if b == "false" => Ok(Value::Bool(false)),
            Some((Token::LBracket, _)) => self.list(),
            Some((other, line)) => Err(malformed(format!("line {line}: unexpected {other}"))),
            None => Err(malformed("expected a value, found end of document")),
        }
    }

    fn list(&mut self) -> Result<Value, PolicyError> {
        let mut items = Vec::new();
        loop {
            if self.peek() == Some(&Token::RBracket) {
                self.pos += 1;
                return Ok(Value::Array(items));
            }
            items.push(self.value()?);
            match self.next() {
                Some((Token::Comma, _)) => {}
                Some((Token::RBracket, _)) => return Ok(Value::Array(items)),
                Some((other, line)) => {
                    return Err(malformed(format!(
                        "line {line}: expected ',' or ']', found {other}"
                    )));
                }
                None => return Err(malformed("unterminated list")),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn reason(document: &str) -> String {
        match parse(document) {
            Err(PolicyError::Malformed { reason }) => reason,
            other => panic!("expected Malformed, got {other:?}"),
        }
    }

    // ── HCL ──────────────────────────────────────────────────────────

    #[test]
    fn parses_hcl_blocks() {
        let policy = parse(
            r#"
            # app secrets
            path "secret/app/*" {
              capabilities = ["read", "list"]
            }

            /* admin area */
            path "sys/+" {
              capabilities = ["sudo", "update",]
              min_wrapping_ttl = "30s"
              max_wrapping_ttl = 3600 // seconds
            }
            "#,
        )
        .unwrap();

        assert_eq!(policy.rules.len(), 2);
        assert_eq!(policy.rules[0].pattern.as_str(), "secret/app/*");
        assert_eq!(
            policy.rules[0].capabilities,
            BTreeSet::from([Capability::Read, Capability::List])
        );
        assert_eq!(policy.rules[1].min_wrapping_ttl, Some(30));
        assert_eq!(policy.rules[1].max_wrapping_ttl, Some(3600));
    }

    #[test]
    fn parses_hcl_parameter_maps() {
        let policy = parse(
            r#"path "kv/data/app" {
                 capabilities = ["create", "update"]
                 allowed_parameters = { "env" = ["dev", "staging"], "*" = [] }
                 denied_parameters = { admin = [true] }
                 required_parameters = ["env"]
               }"#,
        )
        .unwrap();

        let rule = &policy.rules[0];
        assert_eq!(
            rule.allowed_parameters["env"],
            vec![Value::from("dev"), Value::from("staging")]
        );
        assert!(rule.allowed_parameters["*"].is_empty());
        assert_eq!(rule.denied_parameters["admin"], vec![Value::Bool(true)]);
        assert_eq!(rule.required_parameters, vec!["env"]);
    }

    #[test]
    fn hcl_syntax_errors_carry_line_numbers() {
        assert!(reason("path \"a\" {\n capabilities = [\"read\"\n").contains("unterminated"));
        assert!(reason("path \"a\" {\n  capabilities [\"read\"]\n}").contains("line 2"));
        assert!(reason("policy \"a\" {}").contains("expected 'path'"));
        assert!(reason("path \"a\" { x = \"unterminated }").contains("unterminated string"));
    }

    #[test]
    fn duplicate_attributes_are_rejected() {
        let r = reason(r#"path "a" { capabilities = ["read"] capabilities = ["list"] }"#);
        assert!(r.contains("duplicate"));
    }

    // ── JSON ─────────────────────────────────────────────────────────

    #[test]
    fn parses_json_documents() {
        let policy = parse(
            r#"{"path": {
                "secret/*": {"capabilities": ["deny"]},
                "secret/foo": {"capabilities": ["read"], "max_wrapping_ttl": "5m"}
            }}"#,
        )
        .unwrap();
        assert_eq!(policy.rules.len(), 2);
        let foo = policy
            .rules
            .iter()
            .find(|r| r.pattern.as_str() == "secret/foo")
            .unwrap();
        assert_eq!(foo.max_wrapping_ttl, Some(300));
    }

    #[test]
    fn json_shape_is_checked() {
        assert!(reason("{ not json").contains("invalid JSON"));
        assert!(reason(r#"{"path": []}"#).contains("must map"));
        assert!(reason(r#"{"paths": {}}"#).contains("no 'path'"));
        assert!(reason(r#"{"path": {}, "extra": 1}"#).contains("extra"));
        assert!(reason(r#"{"path": {"a": {"capabilities": ["read"], "typo": 1}}}"#).contains("typo"));
    }

    // ── validation ───────────────────────────────────────────────────

    #[test]
    fn validation_rejects_bad_blocks() {
        assert!(reason(r#"path "" { capabilities = ["read"] }"#).contains("empty path"));
        assert!(reason(r#"path "a" { capabilities = ["fly"] }"#).contains("unknown capability"));
        assert!(reason(r#"path "a" { capabilities = ["deny", "read"] }"#).contains("deny"));
        assert!(reason(r#"path "a" { capabilities = [] }"#).contains("empty capability"));
        assert!(reason(r#"path "a" {}"#).contains("empty capability"));
        assert!(
            reason(r#"path "a" { capabilities = ["read"] min_wrapping_ttl = "2h" max_wrapping_ttl = "1h" }"#)
                .contains("exceeds")
        );
        assert!(reason(r#"path "a" { capabilities = ["read"] max_wrapping_ttl = "1w" }"#).contains("invalid"));
        assert!(reason("   ").contains("no path blocks"));
        assert!(reason(r#"{"path": {}}"#).contains("no path blocks"));
    }

    #[test]
    fn ttl_units() {
        let p = PathPattern::parse("a").unwrap();
        let secs = |s: &str| ttl_seconds(RawTtl::Text(s.to_owned()), "ttl", &p).unwrap();
        assert_eq!(secs("45"), 45);
        assert_eq!(secs("45s"), 45);
        assert_eq!(secs("5m"), 300);
        assert_eq!(secs("2h"), 7200);
        assert!(ttl_seconds(RawTtl::Text("h".to_owned()), "ttl", &p).is_err());
    }
}
