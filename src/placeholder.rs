//! Placeholder substitution over strings and JSON values.
//!
//! Two families of placeholder are handled:
//!
//! * Row-scoped rules built from test-data columns. A column `key`
//!   replaces `{key}` tokens, query parameters and body fields named
//!   `key`, and values written as the bare text `key`. A column named
//!   `key(requestK)` does the same, but only while materializing the K-th
//!   request of the chain.
//! * `{{token}}` placeholders. `{{responseN.path}}` reads `path` from the
//!   body captured for the N-th request; any other token is looked up as a
//!   row column.
//!
//! Nothing here fails: a placeholder that cannot be resolved is left in the
//! output verbatim and reported as a warning.

use crate::model::{Header, TestDataRow};
use crate::path::{self, scalar_text, substitution_text};
use crate::store::ResponseStore;
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::LazyLock;
use tracing::warn;
use url::form_urlencoded;

/// A test-data column parsed into a substitution rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RowRule {
    pub key: String,
    /// 1-indexed chain position the rule is limited to, if any.
    pub scope: Option<usize>,
    pub value: Value,
}

impl RowRule {
    /// Parse a column name, splitting off a `(requestK)` suffix.
    pub fn parse(column: &str, value: &Value) -> Self {
        static SCOPE_RE: LazyLock<Regex> = LazyLock::new(|| {
            Regex::new(r"(?i)^(.*?)\s*\(\s*request\s*(\d+)\s*\)\s*$")
                .expect("failed to compile scope regex")
        });

        let (key, scope) = match SCOPE_RE.captures(column) {
            Some(caps) => match caps[2].parse::<usize>() {
                Ok(k) => (caps[1].to_string(), Some(k)),
                Err(_) => (column.to_string(), None),
            },
            None => (column.to_string(), None),
        };

        Self {
            key: key.trim().to_string(),
            scope,
            value: value.clone(),
        }
    }

    pub fn applies_to(&self, position: usize) -> bool {
        self.scope.map_or(true, |k| k == position)
    }
}

/// The row rules in effect at one chain position. A scoped rule wins over
/// an unscoped rule with the same key.
#[derive(Debug, Clone, Default)]
pub struct RowBindings {
    values: Vec<(String, Value)>,
}

impl RowBindings {
    pub fn for_position(
        row: &TestDataRow,
        position: usize,
        id_column: &str,
    ) -> Self {
        let rules: Vec<RowRule> = row
            .columns()
            .filter(|(column, _)| column.as_str() != id_column)
            .map(|(column, value)| RowRule::parse(column, value))
            .filter(|rule| !rule.key.is_empty() && rule.applies_to(position))
            .collect();

        let mut bindings = RowBindings::default();
        for rule in rules.iter().filter(|r| r.scope.is_none()) {
            bindings.bind(&rule.key, rule.value.clone());
        }
        for rule in rules.iter().filter(|r| r.scope.is_some()) {
            bindings.bind(&rule.key, rule.value.clone());
        }
        bindings
    }

    fn bind(&mut self, key: &str, value: Value) {
        match self.values.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.values.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

/// Replace `{key}` tokens that name a bound column. `{{...}}` spans are
/// copied through untouched.
pub fn apply_row_to_text(text: &str, bindings: &RowBindings) -> String {
    if bindings.is_empty() || !text.contains('{') {
        return text.to_string();
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];

        if let Some(inner) = tail.strip_prefix("{{") {
            match inner.find("}}") {
                Some(end) => {
                    let span = end + 4;
                    out.push_str(&tail[..span]);
                    rest = &tail[span..];
                }
                None => {
                    out.push_str(tail);
                    rest = "";
                }
            }
            continue;
        }

        match tail[1..].find('}') {
            Some(end) => {
                let name = tail[1..1 + end].trim();
                match bindings.get(name) {
                    Some(value) => {
                        out.push_str(&scalar_text(value));
                        rest = &tail[end + 2..];
                    }
                    None => {
                        out.push('{');
                        rest = &tail[1..];
                    }
                }
            }
            None => {
                out.push_str(tail);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

/// Apply row rules to a URL: query parameters named after a column (or
/// whose value is the bare column name) take the column value, then
/// `{key}` tokens anywhere in the URL are replaced.
pub fn apply_row_to_url(url: &str, bindings: &RowBindings) -> String {
    if bindings.is_empty() {
        return url.to_string();
    }

    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };

    let rewritten = match base.split_once('?') {
        Some((path, query)) => {
            let pairs: Vec<String> = query
                .split('&')
                .map(|pair| rewrite_query_pair(pair, bindings))
                .collect();
            format!("{path}?{}", pairs.join("&"))
        }
        None => base.to_string(),
    };

    let mut out = apply_row_to_text(&rewritten, bindings);
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(&apply_row_to_text(fragment, bindings));
    }
    out
}

fn rewrite_query_pair(pair: &str, bindings: &RowBindings) -> String {
    let Some((name, value)) = form_urlencoded::parse(pair.as_bytes()).next()
    else {
        return pair.to_string();
    };

    let bound = bindings
        .get(name.as_ref())
        .or_else(|| bindings.get(value.as_ref()));

    match bound {
        Some(bound) => {
            let raw_name = pair.split_once('=').map_or(pair, |(n, _)| n);
            let encoded: String =
                form_urlencoded::byte_serialize(scalar_text(bound).as_bytes())
                    .collect();
            format!("{raw_name}={encoded}")
        }
        None => pair.to_string(),
    }
}

/// Apply row rules to headers: a header named after a column takes its
/// value, other values get `{key}` tokens replaced.
pub fn apply_row_to_headers(
    headers: &[Header],
    bindings: &RowBindings,
) -> Vec<Header> {
    headers
        .iter()
        .map(|header| {
            let value = match bindings.get(&header.key) {
                Some(bound) => scalar_text(bound),
                None => apply_row_to_text(&header.value, bindings),
            };
            Header::new(header.key.clone(), value)
        })
        .collect()
}

/// Apply row rules to a structured body. Fields whose key matches a column
/// take the column value with its original type; string leaves equal to a
/// bare column name are replaced the same way; `{key}` tokens inside other
/// strings are replaced textually.
pub fn apply_row_to_json(value: &Value, bindings: &RowBindings) -> Value {
    if bindings.is_empty() {
        return value.clone();
    }

    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, child) in map {
                let replaced = match bindings.get(key) {
                    Some(bound) => bound.clone(),
                    None => apply_row_to_json(child, bindings),
                };
                out.insert(key.clone(), replaced);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| apply_row_to_json(item, bindings))
                .collect(),
        ),
        Value::String(s) => match bindings.get(s) {
            Some(bound) => bound.clone(),
            None => Value::String(apply_row_to_text(s, bindings)),
        },
        other => other.clone(),
    }
}

/// Split `responseN`, `responseN.path` or `responseN[i].path` into the
/// slot number and the remaining path.
pub fn parse_response_ref(token: &str) -> Option<(usize, &str)> {
    static RESPONSE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"^response(\d+)(.*)$")
            .expect("failed to compile response reference regex")
    });

    let caps = RESPONSE_RE.captures(token)?;
    let slot = caps[1].parse::<usize>().ok()?;
    let rest = caps.get(2).map_or("", |m| m.as_str());

    let path = if rest.is_empty() {
        rest
    } else if let Some(stripped) = rest.strip_prefix('.') {
        stripped
    } else if rest.starts_with('[') {
        rest
    } else {
        return None;
    };
    Some((slot, path))
}

/// Resolves `{{token}}` placeholders against the response store, falling
/// back to the row bindings for tokens that are not response references.
#[derive(Debug)]
pub struct Substitutor<'a> {
    store: &'a ResponseStore,
    bindings: &'a RowBindings,
    warnings: Vec<String>,
}

impl<'a> Substitutor<'a> {
    pub fn new(store: &'a ResponseStore, bindings: &'a RowBindings) -> Self {
        Self {
            store,
            bindings,
            warnings: Vec::new(),
        }
    }

    /// Replace every resolvable `{{token}}` in `text`. An opening `{{`
    /// without a closing `}}` passes the remainder through unchanged.
    pub fn substitute_str(&mut self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];

            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                return out;
            };

            match self.resolve_token(&after[..end]) {
                Some(text) => out.push_str(&text),
                None => out.push_str(&rest[start..start + end + 4]),
            }
            rest = &after[end + 2..];
        }

        out.push_str(rest);
        out
    }

    /// Rewrite every string leaf of `value`; keys and non-string leaves
    /// are left as they are.
    pub fn substitute_value(&mut self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.substitute_str(s)),
            Value::Array(items) => Value::Array(
                items.iter().map(|item| self.substitute_value(item)).collect(),
            ),
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.substitute_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn into_warnings(self) -> Vec<String> {
        self.warnings
    }

    fn resolve_token(&mut self, raw: &str) -> Option<String> {
        let token = raw.trim();

        let Some((slot, path)) = parse_response_ref(token) else {
            let resolved = self.bindings.get(token).map(scalar_text);
            if resolved.is_none() {
                self.warn(format!("unresolved placeholder {{{{{token}}}}}"));
            }
            return resolved;
        };

        let Some(response) = self.store.get(slot) else {
            self.warn(format!(
                "unresolved placeholder {{{{{token}}}}}: response{slot} has not been captured"
            ));
            return None;
        };

        let resolution = path::resolve_traced(&response.body, path);
        for prefix in &resolution.auto_indexed {
            self.warn(format!(
                "{{{{{token}}}}}: array at '{prefix}' has no index, using element 0"
            ));
        }

        match resolution.value {
            Some(value) => Some(substitution_text(value)),
            None => {
                self.warn(format!(
                    "unresolved placeholder {{{{{token}}}}}: path not found in response{slot}"
                ));
                None
            }
        }
    }

    fn warn(&mut self, message: String) {
        warn!("{}", message);
        self.warnings.push(message);
    }
}
