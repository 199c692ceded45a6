use std::fmt;

use serde::{Deserialize, Serialize};

use crate::state::{display_value, NodeRegion};

/// A condition over the node region, written as a short expression:
///
/// - `key`: the value is truthy
/// - `!key`: the value is missing or falsy
/// - `key == "text"` / `key != "text"`: display-string comparison
/// - `key contains "text"`: substring (strings) or membership (arrays)
///
/// Keys may use dotted paths (`decision.action`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Predicate {
    Truthy(String),
    Falsy(String),
    Equals(String, String),
    NotEquals(String, String),
    Contains(String, String),
}

impl Predicate {
    pub fn parse(expr: &str) -> Result<Self, String> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err("empty expression".into());
        }
        let operators: [(&str, fn(String, String) -> Self); 3] = [
            ("==", Self::Equals),
            ("!=", Self::NotEquals),
            (" contains ", Self::Contains),
        ];
        // The leftmost operator wins so literals may contain operator text.
        let first = operators
            .iter()
            .filter_map(|(op, build)| expr.find(op).map(|at| (at, *op, *build)))
            .min_by_key(|(at, _, _)| *at);
        if let Some((at, op, build)) = first {
            let key = parse_key(&expr[..at])?;
            let literal = parse_literal(&expr[at + op.len()..])?;
            return Ok(build(key, literal));
        }
        match expr.strip_prefix('!') {
            Some(key) => Ok(Self::Falsy(parse_key(key)?)),
            None => Ok(Self::Truthy(parse_key(expr)?)),
        }
    }

    /// The key path this predicate reads.
    pub fn key(&self) -> &str {
        match self {
            Self::Truthy(k)
            | Self::Falsy(k)
            | Self::Equals(k, _)
            | Self::NotEquals(k, _)
            | Self::Contains(k, _) => k,
        }
    }

    /// Root key of [`Predicate::key`].
    pub fn root_key(&self) -> &str {
        let key = self.key();
        key.split('.').next().unwrap_or(key)
    }

    pub fn evaluate(&self, region: &NodeRegion) -> bool {
        let value = region.lookup(self.key());
        match self {
            Self::Truthy(_) => value.is_some_and(is_truthy),
            Self::Falsy(_) => !value.is_some_and(is_truthy),
            Self::Equals(_, lit) => value.is_some_and(|v| display_value(v) == *lit),
            Self::NotEquals(_, lit) => !value.is_some_and(|v| display_value(v) == *lit),
            Self::Contains(_, lit) => match value {
                Some(serde_json::Value::String(s)) => s.contains(lit.as_str()),
                Some(serde_json::Value::Array(items)) => {
                    items.iter().any(|v| display_value(v) == *lit)
                }
                _ => false,
            },
        }
    }
}

fn parse_key(raw: &str) -> Result<String, String> {
    let key = raw.trim();
    let valid = !key.is_empty()
        && key.split('.').all(|seg| {
            !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
        && !key.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(key.to_string())
    } else {
        Err(format!("'{}' is not a key", key))
    }
}

fn parse_literal(raw: &str) -> Result<String, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("missing comparison value".into());
    }
    if raw.starts_with('"') {
        return serde_json::from_str::<String>(raw).map_err(|e| e.to_string());
    }
    Ok(raw.to_string())
}

fn is_truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty() && s != "false",
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

impl TryFrom<String> for Predicate {
    type Error = String;

    fn try_from(expr: String) -> Result<Self, Self::Error> {
        Self::parse(&expr)
    }
}

impl From<Predicate> for String {
    fn from(predicate: Predicate) -> Self {
        predicate.to_string()
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let quote = |s: &str| serde_json::Value::String(s.to_string()).to_string();
        match self {
            Self::Truthy(k) => write!(f, "{k}"),
            Self::Falsy(k) => write!(f, "!{k}"),
            Self::Equals(k, v) => write!(f, "{k} == {}", quote(v)),
            Self::NotEquals(k, v) => write!(f, "{k} != {}", quote(v)),
            Self::Contains(k, v) => write!(f, "{k} contains {}", quote(v)),
        }
    }
}

/// One predicate-selected edge. Evaluated in declaration order before the
/// node's default `next`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalNext {
    pub when: Predicate,
    pub to: String,
}
