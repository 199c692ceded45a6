use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use trellis_core::error::{Result, TrellisError};

use crate::state::{display_value, NodeRegion};

/// `{key}` or `{key.path.0}`. Only identifier-shaped names match, so literal
/// JSON braces in prompts pass through untouched.
fn placeholder() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\}")
            .unwrap_or_else(|e| unreachable!("placeholder pattern is valid: {e}"))
    })
}

/// Text with `{name}` placeholders resolved against the node region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Template(String);

impl Template {
    pub fn new(source: impl Into<String>) -> Self {
        Self(source.into())
    }

    pub fn source(&self) -> &str {
        &self.0
    }

    /// Root keys this template reads, in order of appearance.
    pub fn references(&self) -> Vec<&str> {
        string_references(&self.0)
    }

    /// Render to text. Missing keys are an error, never an empty string.
    pub fn render(&self, region: &NodeRegion) -> Result<String> {
        render_str(&self.0, region)
    }
}

impl From<&str> for Template {
    fn from(source: &str) -> Self {
        Self::new(source)
    }
}

fn string_references(source: &str) -> Vec<&str> {
    placeholder()
        .captures_iter(source)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().split('.').next().unwrap_or(m.as_str()))
        .collect()
}

fn render_str(source: &str, region: &NodeRegion) -> Result<String> {
    let mut out = String::with_capacity(source.len());
    let mut last = 0;
    for caps in placeholder().captures_iter(source) {
        let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = region
            .lookup(path.as_str())
            .ok_or_else(|| TrellisError::MissingVariable(path.as_str().to_string()))?;
        out.push_str(&source[last..whole.start()]);
        out.push_str(&display_value(value));
        last = whole.end();
    }
    out.push_str(&source[last..]);
    Ok(out)
}

/// Resolve an argument value. Strings are templates; a string that is
/// exactly one placeholder yields the referenced value with its JSON type
/// intact. Arrays and objects resolve element-wise; other literals pass
/// through.
pub fn resolve_value(value: &serde_json::Value, region: &NodeRegion) -> Result<serde_json::Value> {
    match value {
        serde_json::Value::String(source) => {
            if let Some(path) = sole_placeholder(source) {
                return region
                    .lookup(path)
                    .cloned()
                    .ok_or_else(|| TrellisError::MissingVariable(path.to_string()));
            }
            Ok(serde_json::Value::String(render_str(source, region)?))
        }
        serde_json::Value::Array(items) => items
            .iter()
            .map(|v| resolve_value(v, region))
            .collect::<Result<Vec<_>>>()
            .map(serde_json::Value::Array),
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, region)?);
            }
            Ok(serde_json::Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Root keys an argument value reads.
pub fn value_references(value: &serde_json::Value) -> Vec<&str> {
    match value {
        serde_json::Value::String(source) => string_references(source),
        serde_json::Value::Array(items) => items.iter().flat_map(value_references).collect(),
        serde_json::Value::Object(map) => map.values().flat_map(value_references).collect(),
        _ => Vec::new(),
    }
}

fn sole_placeholder(source: &str) -> Option<&str> {
    let caps = placeholder().captures(source)?;
    let whole = caps.get(0)?;
    if whole.start() == 0 && whole.end() == source.len() {
        caps.get(1).map(|m| m.as_str())
    } else {
        None
    }
}
