//! Run configuration and loading of collection / test-data files.

use crate::dispatch::{Dispatcher, HttpDispatcher, DEFAULT_TIMEOUT_SECS};
use crate::forward::ForwardingDispatcher;
use crate::materialize::{MaterializeOptions, Materializer};
use crate::model::{Collection, Header, TestDataRow};
use crate::postman;
use crate::runner::{ChainExecutor, RunOrchestrator};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Column that identifies a test-data row in results.
pub const DEFAULT_ID_COLUMN: &str = "Jira-Id";

/// Carry a value from each successful response into a header of every
/// later request in the same chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationRule {
    /// Path into the response body, e.g. `operationToken` or
    /// `data.session.token`.
    pub field: String,
    /// Header name that receives the value.
    pub header: String,
}

impl PropagationRule {
    /// Parse the CLI form `field=header`.
    pub fn parse(value: &str) -> Result<Self> {
        let (field, header) = value
            .split_once('=')
            .ok_or_else(|| anyhow!("expected FIELD=HEADER, got '{value}'"))?;
        let (field, header) = (field.trim(), header.trim());
        if field.is_empty() || header.is_empty() {
            return Err(anyhow!("expected FIELD=HEADER, got '{value}'"));
        }
        Ok(Self {
            field: field.to_string(),
            header: header.to_string(),
        })
    }
}

/// Settings for one run. Every field has a default, so an empty document
/// is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    /// Headers added to requests that do not set them.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default)]
    pub propagate: Option<PropagationRule>,
    /// Resolve `{{responseN...}}` placeholders in header values too.
    #[serde(default)]
    pub response_headers: bool,
    /// Rows run at once; 1 keeps rows strictly sequential.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub forward_url: Option<String>,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_id_column() -> String {
    DEFAULT_ID_COLUMN.to_string()
}

fn default_concurrency() -> usize {
    1
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            headers: HashMap::new(),
            timeout: default_timeout(),
            id_column: default_id_column(),
            propagate: None,
            response_headers: false,
            concurrency: default_concurrency(),
            forward_url: None,
        }
    }
}

impl RunConfig {
    /// Parse YAML (or JSON, which YAML accepts).
    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading run configuration from {}", path.display());
        let content = fs::read_to_string(path).context(format!(
            "Failed to read config file: {}",
            path.display()
        ))?;
        Self::from_yaml(&content)
            .context(format!("Failed to parse config from {}", path.display()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn materialize_options(&self) -> MaterializeOptions {
        let mut default_headers: Vec<Header> = self
            .headers
            .iter()
            .map(|(k, v)| Header::new(k.clone(), v.clone()))
            .collect();
        default_headers.sort_by(|a, b| a.key.cmp(&b.key));

        MaterializeOptions {
            id_column: self.id_column.clone(),
            base_url: self.base_url.clone(),
            default_headers,
            response_headers: self.response_headers,
        }
    }

    pub fn dispatcher(&self) -> Arc<dyn Dispatcher> {
        match &self.forward_url {
            Some(url) => {
                info!("Dispatching through forwarder at {}", url);
                Arc::new(ForwardingDispatcher::new(url.clone(), self.timeout()))
            }
            None => Arc::new(HttpDispatcher::new(self.timeout())),
        }
    }

    /// Build an orchestrator around `dispatcher`.
    pub fn orchestrator_with(&self, dispatcher: Arc<dyn Dispatcher>) -> RunOrchestrator {
        let mut executor =
            ChainExecutor::new(dispatcher, Materializer::new(self.materialize_options()));
        if let Some(rule) = &self.propagate {
            executor = executor.with_propagation(rule.clone());
        }
        RunOrchestrator::new(executor).concurrency(self.concurrency)
    }

    pub fn orchestrator(&self) -> RunOrchestrator {
        self.orchestrator_with(self.dispatcher())
    }
}

/// Read a JSON or YAML document into a JSON value.
fn read_document(path: &Path) -> Result<Value> {
    let content = fs::read_to_string(path)
        .context(format!("Failed to read file: {}", path.display()))?;

    if is_yaml_file(path) {
        serde_yaml::from_str(&content)
            .context(format!("Failed to parse YAML from {}", path.display()))
    } else {
        serde_json::from_str(&content)
            .context(format!("Failed to parse JSON from {}", path.display()))
    }
}

/// Load a collection: a `{ requests: [...] }` document or a Postman
/// export. The file stem names the collection when the document doesn't.
pub fn load_collection<P: AsRef<Path>>(path: P) -> Result<Collection> {
    let path = path.as_ref();
    info!("Loading collection from {}", path.display());

    let document = read_document(path)?;
    let mut collection = if postman::is_postman_collection(&document) {
        debug!("Detected Postman collection format");
        postman::parse_collection(&document).context(format!(
            "Failed to import Postman collection from {}",
            path.display()
        ))?
    } else {
        serde_json::from_value::<Collection>(document).context(format!(
            "Failed to parse collection from {}",
            path.display()
        ))?
    };

    if collection.name.is_none() {
        collection.name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string);
    }

    info!(
        "Loaded {} request(s) from {}",
        collection.len(),
        path.display()
    );
    Ok(collection)
}

/// Load test-data rows: a list of flat objects, or `{ rows: [...] }`.
pub fn load_rows<P: AsRef<Path>>(path: P) -> Result<Vec<TestDataRow>> {
    let path = path.as_ref();
    info!("Loading test data from {}", path.display());

    let document = read_document(path)?;
    let list = match document {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("rows") {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(anyhow!(
                    "Test data in {} must be a list of rows or {{ rows: [...] }}",
                    path.display()
                ))
            }
        },
        _ => {
            return Err(anyhow!(
                "Test data in {} must be a list of rows",
                path.display()
            ))
        }
    };

    let rows = list
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Object(map) => Ok(TestDataRow(map)),
            other => Err(anyhow!(
                "Row {} in {} is not an object: {}",
                index + 1,
                path.display(),
                other
            )),
        })
        .collect::<Result<Vec<_>>>()?;

    info!("Loaded {} test-data row(s) from {}", rows.len(), path.display());
    Ok(rows)
}

fn is_yaml_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml")
}
