//! Dotted and indexed path lookup into JSON values.
//!
//! A path is a `.`-separated list of segments; each segment is a key
//! followed by zero or more `[index]` suffixes: `addresses[0].city`,
//! `items.0.name`, `matrix[1][2]`. When a key segment meets an array,
//! the first element is used (`items.id` reads `items[0].id`).

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Text substituted for a structured value that holds no scalar.
pub const OBJECT_PLACEHOLDER: &str = "[object Object]";

#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    key: String,
    indices: Vec<usize>,
}

/// Outcome of a traced lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution<'a> {
    pub value: Option<&'a Value>,
    /// Path prefixes at which an array was entered without an explicit
    /// index and element 0 was used instead.
    pub auto_indexed: Vec<String>,
}

/// Look up `path` in `data`. Returns `None` for any missing key, index
/// or malformed segment; never panics.
pub fn resolve<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    resolve_traced(data, path).value
}

/// Like [`resolve`], also reporting where array auto-indexing kicked in.
pub fn resolve_traced<'a>(data: &'a Value, path: &str) -> Resolution<'a> {
    let mut auto_indexed = Vec::new();
    let value = parse_path(path)
        .and_then(|segments| walk(data, &segments, &mut auto_indexed));
    Resolution {
        value,
        auto_indexed,
    }
}

fn parse_path(path: &str) -> Option<Vec<Segment>> {
    path.trim()
        .split('.')
        .filter(|part| !part.is_empty())
        .map(parse_segment)
        .collect()
}

fn parse_segment(raw: &str) -> Option<Segment> {
    static SEGMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^([^\[\]]*)((?:\[\d+\])*)$")
            .expect("failed to compile path segment regex")
    });
    static INDEX_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\[(\d+)\]").expect("failed to compile index regex")
    });

    let caps = SEGMENT_RE.captures(raw)?;
    let indices = INDEX_RE
        .captures_iter(&caps[2])
        .map(|c| c[1].parse::<usize>().ok())
        .collect::<Option<Vec<_>>>()?;

    Some(Segment {
        key: caps[1].trim().to_string(),
        indices,
    })
}

fn walk<'a>(
    data: &'a Value,
    segments: &[Segment],
    auto_indexed: &mut Vec<String>,
) -> Option<&'a Value> {
    let mut current = data;
    let mut walked = String::new();

    for segment in segments {
        if !segment.key.is_empty() {
            current = step_key(current, &segment.key, &walked, auto_indexed)?;
            if !walked.is_empty() {
                walked.push('.');
            }
            walked.push_str(&segment.key);
        }

        for index in &segment.indices {
            current = match current {
                Value::Array(items) => items.get(*index)?,
                Value::Object(map) => map.get(&index.to_string())?,
                _ => return None,
            };
            walked.push_str(&format!("[{index}]"));
        }
    }

    Some(current)
}

fn step_key<'a>(
    mut current: &'a Value,
    key: &str,
    walked: &str,
    auto_indexed: &mut Vec<String>,
) -> Option<&'a Value> {
    loop {
        match current {
            Value::Object(map) => return map.get(key),
            Value::Array(items) => {
                if let Ok(index) = key.parse::<usize>() {
                    return items.get(index);
                }
                auto_indexed.push(if walked.is_empty() {
                    "$".to_string()
                } else {
                    walked.to_string()
                });
                current = items.first()?;
            }
            _ => return None,
        }
    }
}

/// First scalar leaf of `value`, depth-first in document order.
pub fn first_primitive(value: &Value) -> Option<&Value> {
    match value {
        Value::Object(map) => map.values().find_map(first_primitive),
        Value::Array(items) => items.iter().find_map(first_primitive),
        scalar => Some(scalar),
    }
}

/// Text form of a scalar: strings verbatim, everything else as JSON.
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Text to substitute for a resolved value. Structured values collapse to
/// their first scalar leaf, or [`OBJECT_PLACEHOLDER`] when they have none.
pub fn substitution_text(value: &Value) -> String {
    match value {
        Value::Object(_) | Value::Array(_) => first_primitive(value)
            .map(scalar_text)
            .unwrap_or_else(|| OBJECT_PLACEHOLDER.to_string()),
        scalar => scalar_text(scalar),
    }
}
