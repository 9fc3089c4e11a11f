use crate::rule::{TopicRule, ValueKind};
use serde_json::Value;
use std::fmt;

/// A typed sensor value, produced by extraction and consumed by the change
/// detector and the writer.
#[derive(Clone, Debug, PartialEq)]
pub enum TypedValue {
    Text(String),
    Boolean(bool),
    Integer(i64),
    Double(f64),
}

impl TypedValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            TypedValue::Text(_) => ValueKind::Text,
            TypedValue::Boolean(_) => ValueKind::Boolean,
            TypedValue::Integer(_) => ValueKind::Integer,
            TypedValue::Double(_) => ValueKind::Double,
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Text(s) => f.write_str(s),
            TypedValue::Boolean(b) => write!(f, "{}", b),
            TypedValue::Integer(i) => write!(f, "{}", i),
            TypedValue::Double(d) => write!(f, "{}", d),
        }
    }
}

/// Extraction failures. All of them drop the single message and leave the
/// dispatcher running.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractError {
    MalformedPayload(String),
    PathNotFound(String),
    TypeConversionFailed { value: String, kind: ValueKind },
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractError::MalformedPayload(msg) => {
                write!(f, "failed to parse payload as JSON: {}", msg)
            }
            ExtractError::PathNotFound(path) => {
                write!(f, "JSON path '{}' did not resolve to a value", path)
            }
            ExtractError::TypeConversionFailed { value, kind } => {
                write!(f, "cannot convert '{}' to {}", value, kind)
            }
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extract a typed value from a raw payload according to a rule.
///
/// With no JSON path the whole payload is taken as UTF-8 text; otherwise
/// the payload is parsed as JSON and the path resolved against it. Either
/// way the result is converted to the rule's declared kind, and double
/// values are scaled here so every later comparison sees the scaled value.
/// Pure function of payload + rule.
pub fn extract(payload: &[u8], rule: &TopicRule) -> Result<TypedValue, ExtractError> {
    let raw = match &rule.json_path {
        None => Value::String(String::from_utf8_lossy(payload).into_owned()),
        Some(path) => {
            let doc: Value = serde_json::from_slice(payload)
                .map_err(|e| ExtractError::MalformedPayload(e.to_string()))?;
            let resolved = resolve_path(&doc, path)
                .ok_or_else(|| ExtractError::PathNotFound(path.clone()))?;
            resolved.clone()
        }
    };

    let value = convert(&raw, rule.kind)?;

    // Scaling only applies to doubles; configured once, applied before any
    // comparison or write. A non-finite factor means "no scaling" no matter
    // how the rule was built.
    match (value, rule.scale.filter(|s| s.is_finite())) {
        (TypedValue::Double(d), Some(scale)) => Ok(TypedValue::Double(d * scale)),
        (value, _) => Ok(value),
    }
}

/// Resolve a dotted path (`$.a.b[0]`, `a.b[0]`) against a JSON document.
/// Returns None for missing intermediate keys, out-of-range indexes and
/// null leaves.
fn resolve_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let path = path.strip_prefix('$').unwrap_or(path);
    let path = path.strip_prefix('.').unwrap_or(path);

    let mut current = doc;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        let (key, indexes) = split_indexes(segment)?;
        if !key.is_empty() {
            current = current.get(key)?;
        }
        for index in indexes {
            current = current.get(index)?;
        }
    }
    if current.is_null() {
        return None;
    }
    Some(current)
}

/// Split `"b[0][1]"` into `("b", [0, 1])`. Returns None on unbalanced or
/// non-numeric brackets.
fn split_indexes(segment: &str) -> Option<(&str, Vec<usize>)> {
    let key_end = segment.find('[').unwrap_or(segment.len());
    let (key, mut rest) = segment.split_at(key_end);
    let mut indexes = Vec::new();
    while !rest.is_empty() {
        let inner = rest.strip_prefix('[')?;
        let close = inner.find(']')?;
        indexes.push(inner[..close].parse().ok()?);
        rest = &inner[close + 1..];
    }
    Some((key, indexes))
}

/// Convert a resolved JSON value to the rule's declared kind.
fn convert(raw: &Value, kind: ValueKind) -> Result<TypedValue, ExtractError> {
    let fail = || ExtractError::TypeConversionFailed {
        value: raw.to_string(),
        kind,
    };

    match kind {
        ValueKind::Text => match raw {
            Value::String(s) => Ok(TypedValue::Text(s.clone())),
            Value::Number(n) => Ok(TypedValue::Text(n.to_string())),
            Value::Bool(b) => Ok(TypedValue::Text(b.to_string())),
            _ => Err(fail()),
        },
        ValueKind::Boolean => match raw {
            Value::Bool(b) => Ok(TypedValue::Boolean(*b)),
            Value::Number(n) => Ok(TypedValue::Boolean(n.as_f64() != Some(0.0))),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "on" | "1" => Ok(TypedValue::Boolean(true)),
                "false" | "off" | "0" => Ok(TypedValue::Boolean(false)),
                _ => Err(fail()),
            },
            _ => Err(fail()),
        },
        ValueKind::Integer => match raw {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64))
                .map(TypedValue::Integer)
                .ok_or_else(fail),
            Value::Bool(b) => Ok(TypedValue::Integer(*b as i64)),
            Value::String(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f.round() as i64))
                    .map(TypedValue::Integer)
                    .ok_or_else(fail)
            }
            _ => Err(fail()),
        },
        ValueKind::Double => match raw {
            Value::Number(n) => n.as_f64().map(TypedValue::Double).ok_or_else(fail),
            Value::Bool(b) => Ok(TypedValue::Double(*b as i64 as f64)),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map(TypedValue::Double)
                .map_err(|_| fail()),
            _ => Err(fail()),
        },
    }
}
