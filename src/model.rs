//! Collection, test-data and result types shared by every stage of a run.

use crate::error::RowError;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// An ordered list of request templates. Position in `requests` is the
/// chain order: request K may only reference responses 1..K-1.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Collection {
    /// Optional collection name, echoed in run reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Requests in chain order.
    #[serde(default)]
    pub requests: Vec<RequestTemplate>,
}

impl Collection {
    /// Deserialize a `{ requests: [...] }` document from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Deserialize a `{ requests: [...] }` document from YAML.
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// One API call definition. Templates are never mutated by a run;
/// materialization always produces a fresh [`ConcreteRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub method: HttpMethod,
    pub url: String,
    #[serde(default, deserialize_with = "deserialize_headers")]
    pub headers: Vec<Header>,
    /// Raw JSON text, plain text, or an already-structured JSON value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl RequestTemplate {
    pub fn new(method: HttpMethod, url: impl Into<String>) -> Self {
        Self {
            name: None,
            method,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_header(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.push(Header::new(key, value));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Name shown in logs: the template name or `Request_<position>`.
    pub fn display_name(&self, position: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("Request_{position}"))
    }
}

/// HTTP method of a request template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[serde(alias = "get")]
    Get,
    #[serde(alias = "post")]
    Post,
    #[serde(alias = "put")]
    Put,
    #[serde(alias = "delete")]
    Delete,
    #[serde(alias = "patch")]
    Patch,
    #[serde(alias = "head")]
    Head,
    #[serde(alias = "options")]
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single header entry. Order in the owning list is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    #[serde(default)]
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            disabled: false,
        }
    }
}

/// Headers may be written as a Postman-style `[{key, value}]` list or
/// as a flat `{name: value}` map. Disabled entries are dropped.
fn deserialize_headers<'de, D>(deserializer: D) -> Result<Vec<Header>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum HeadersRepr {
        List(Vec<Header>),
        Map(Map<String, Value>),
        Null(()),
    }

    let headers = match HeadersRepr::deserialize(deserializer)? {
        HeadersRepr::List(list) => {
            list.into_iter().filter(|h| !h.disabled).collect()
        }
        HeadersRepr::Map(map) => map
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                Header::new(key, value)
            })
            .collect(),
        HeadersRepr::Null(()) => Vec::new(),
    };
    Ok(headers)
}

/// One record of test data: column name to scalar value.
///
/// Column order is preserved. A column named `key(requestK)` only
/// applies to the K-th request of the chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestDataRow(pub Map<String, Value>);

impl TestDataRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: impl Into<String>, value: Value) -> Self {
        self.0.insert(column.into(), value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn columns(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// External identifier of the row, falling back to `row-<n>`
    /// (1-indexed) when the identifier column is missing or blank.
    pub fn identifier(&self, id_column: &str, index: usize) -> String {
        match self.0.get(id_column) {
            Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => format!("row-{}", index + 1),
        }
    }

    /// Every cell must be a scalar; nested objects or arrays cannot be
    /// substituted and make the whole row invalid.
    pub fn validate(&self) -> Result<(), RowError> {
        for (column, value) in &self.0 {
            if matches!(value, Value::Object(_) | Value::Array(_)) {
                return Err(RowError::NonScalarCell {
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }
}

/// A dispatchable request with every substitution applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcreteRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<Header>,
    pub body: Option<String>,
    /// `true` when `body` is serialized JSON.
    #[serde(default)]
    pub json_body: bool,
}

impl ConcreteRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key.eq_ignore_ascii_case(name))
            .map(|h| h.value.as_str())
    }
}

/// Captured outcome of one dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedResponse {
    /// HTTP status, absent when the request never got a response.
    pub status: Option<u16>,
    pub ok: bool,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Parsed JSON body, `{"raw": text}` for non-JSON bodies, `null`
    /// when nothing was received.
    pub body: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: u64,
}

impl CapturedResponse {
    pub fn status(&self) -> Status {
        if self.ok {
            Status::Passed
        } else {
            Status::Failed
        }
    }
}

/// Outcome of a request or a whole row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Passed,
    Failed,
    #[serde(rename = "Not Run")]
    NotRun,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Status::Passed => "Passed",
            Status::Failed => "Failed",
            Status::NotRun => "Not Run",
        })
    }
}

/// Log of one request attempt within a chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    /// 1-indexed chain position.
    pub position: usize,
    pub name: String,
    pub method: HttpMethod,
    pub original_url: String,
    pub modified_url: String,
    pub headers: Vec<Header>,
    pub body: Option<String>,
    pub status: Status,
    pub response: Option<CapturedResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Non-fatal diagnostics: unresolved placeholders, array auto-index.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

/// Result of running the chain for one test-data row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCaseResult {
    pub id: String,
    /// 0-indexed position of the row in the input.
    pub row_index: usize,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub logs: Vec<ExecutionLog>,
    pub duration_ms: u64,
}

impl TestCaseResult {
    pub fn passed(&self) -> bool {
        self.status == Status::Passed
    }
}

/// Aggregate counts over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub not_run: usize,
}

impl RunSummary {
    pub fn from_rows(rows: &[TestCaseResult]) -> Self {
        let mut summary = RunSummary {
            total: rows.len(),
            ..Default::default()
        };
        for row in rows {
            match row.status {
                Status::Passed => summary.passed += 1,
                Status::Failed => summary.failed += 1,
                Status::NotRun => summary.not_run += 1,
            }
        }
        summary
    }
}

/// One [`TestCaseResult`] per input row, in input order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    pub started_at: String,
    pub duration_ms: u64,
    pub summary: RunSummary,
    pub rows: Vec<TestCaseResult>,
}

impl RunResult {
    pub fn success(&self) -> bool {
        self.summary.passed == self.summary.total
    }

    /// Render as YAML. Response-body numbers keep the text they arrived
    /// with; integers outside the 64-bit range are written as strings.
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        let json = serde_json::to_value(self)
            .map_err(<serde_yaml::Error as serde::ser::Error>::custom)?;
        serde_yaml::to_string(&yaml_value(json))
    }
}

fn yaml_value(value: Value) -> serde_yaml::Value {
    use serde_yaml::{Number, Value as Yaml};

    match value {
        Value::Null => Yaml::Null,
        Value::Bool(b) => Yaml::Bool(b),
        Value::Number(n) => {
            let text = n.to_string();
            if let Some(i) = n.as_i64() {
                Yaml::Number(Number::from(i))
            } else if let Some(u) = n.as_u64() {
                Yaml::Number(Number::from(u))
            } else if text.contains(['.', 'e', 'E']) {
                n.as_f64()
                    .map(|f| Yaml::Number(Number::from(f)))
                    .unwrap_or(Yaml::String(text))
            } else {
                Yaml::String(text)
            }
        }
        Value::String(s) => Yaml::String(s),
        Value::Array(items) => {
            Yaml::Sequence(items.into_iter().map(yaml_value).collect())
        }
        Value::Object(map) => Yaml::Mapping(
            map.into_iter()
                .map(|(k, v)| (Yaml::String(k), yaml_value(v)))
                .collect(),
        ),
    }
}
