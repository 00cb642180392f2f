//! Turns a request template into a concrete request for one chain step.

use crate::model::{ConcreteRequest, Header, RequestTemplate, TestDataRow};
use crate::placeholder::{
    apply_row_to_headers, apply_row_to_json, apply_row_to_text,
    apply_row_to_url, RowBindings, Substitutor,
};
use crate::store::ResponseStore;
use serde_json::Value;
use tracing::{debug, warn};

/// Settings that shape materialization for a whole run.
#[derive(Debug, Clone)]
pub struct MaterializeOptions {
    /// Column holding the row identifier; never used as a rule.
    pub id_column: String,
    /// Joined onto URLs that are still relative after substitution.
    pub base_url: Option<String>,
    /// Added when the template does not set a header of the same name.
    pub default_headers: Vec<Header>,
    /// Also resolve `{{responseN...}}` placeholders in header values.
    pub response_headers: bool,
}

impl Default for MaterializeOptions {
    fn default() -> Self {
        Self {
            id_column: crate::config::DEFAULT_ID_COLUMN.to_string(),
            base_url: None,
            default_headers: Vec::new(),
            response_headers: false,
        }
    }
}

/// A concrete request plus the diagnostics gathered while building it.
#[derive(Debug, Clone)]
pub struct Materialized {
    pub request: ConcreteRequest,
    pub warnings: Vec<String>,
}

/// The template body, split by whether it is JSON.
enum BodyForm {
    Json(Value),
    Text(String),
}

impl BodyForm {
    fn from_template(body: &Value) -> Self {
        match body {
            Value::String(text) => match serde_json::from_str::<Value>(text) {
                Ok(parsed) => BodyForm::Json(parsed),
                Err(_) => BodyForm::Text(text.clone()),
            },
            structured => BodyForm::Json(structured.clone()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Materializer {
    options: MaterializeOptions,
}

impl Materializer {
    pub fn new(options: MaterializeOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &MaterializeOptions {
        &self.options
    }

    /// Build the request for 1-indexed chain `position`.
    ///
    /// Row rules are applied first (URL, headers, body), then `{{...}}`
    /// placeholders (URL and body, headers only when enabled), then headers
    /// carried from earlier responses override same-named headers. JSON
    /// bodies are substituted structurally and re-serialized. This never
    /// fails: anything unresolved stays in the output as literal text.
    pub fn materialize(
        &self,
        template: &RequestTemplate,
        row: &TestDataRow,
        store: &ResponseStore,
        position: usize,
    ) -> Materialized {
        let bindings =
            RowBindings::for_position(row, position, &self.options.id_column);

        // row-scoped rules
        let url = apply_row_to_url(&template.url, &bindings);
        let mut headers = apply_row_to_headers(&template.headers, &bindings);
        let body = template.body.as_ref().map(|body| {
            match BodyForm::from_template(body) {
                BodyForm::Json(value) => {
                    BodyForm::Json(apply_row_to_json(&value, &bindings))
                }
                BodyForm::Text(text) => {
                    BodyForm::Text(apply_row_to_text(&text, &bindings))
                }
            }
        });

        // response placeholders, with row fallback
        let mut substitutor = Substitutor::new(store, &bindings);
        let url = substitutor.substitute_str(&url);
        let body = body.map(|body| match body {
            BodyForm::Json(value) => {
                BodyForm::Json(substitutor.substitute_value(&value))
            }
            BodyForm::Text(text) => {
                BodyForm::Text(substitutor.substitute_str(&text))
            }
        });
        if self.options.response_headers {
            for header in &mut headers {
                header.value = substitutor.substitute_str(&header.value);
            }
        }
        let mut warnings = substitutor.into_warnings();

        for header in &self.options.default_headers {
            if !headers.iter().any(|h| h.key.eq_ignore_ascii_case(&header.key)) {
                headers.push(header.clone());
            }
        }
        for carried in store.carried_headers() {
            merge_header(&mut headers, carried);
        }

        let url = self.join_base_url(url, &mut warnings);

        let (body, json_body) = match body {
            Some(BodyForm::Json(value)) => match serde_json::to_string(&value) {
                Ok(text) => (Some(text), true),
                Err(err) => {
                    warnings.push(format!("failed to serialize body: {err}"));
                    (None, false)
                }
            },
            Some(BodyForm::Text(text)) => (Some(text), false),
            None => (None, false),
        };

        debug!(position, %url, "Materialized request");

        Materialized {
            request: ConcreteRequest {
                method: template.method,
                url,
                headers,
                body,
                json_body,
            },
            warnings,
        }
    }

    fn join_base_url(&self, url: String, warnings: &mut Vec<String>) -> String {
        let Some(base_url) = &self.options.base_url else {
            return url;
        };
        if url.contains("://") {
            return url;
        }

        let joined = reqwest::Url::parse(base_url).and_then(|base| {
            if url.is_empty() {
                Ok(base)
            } else {
                // keep the base path: "/v1" + "users" -> "/v1/users"
                let mut base = base;
                if !base.path().ends_with('/') {
                    let path = format!("{}/", base.path());
                    base.set_path(&path);
                }
                base.join(url.trim_start_matches('/'))
            }
        });

        match joined {
            Ok(joined) => joined.to_string(),
            Err(err) => {
                let message =
                    format!("failed to join base_url '{base_url}' with '{url}': {err}");
                warn!("{}", message);
                warnings.push(message);
                url
            }
        }
    }
}

/// Replace the first header with the same name (dropping any later
/// duplicates), or append.
fn merge_header(headers: &mut Vec<Header>, carried: &Header) {
    let mut replaced = false;
    headers.retain_mut(|header| {
        if !header.key.eq_ignore_ascii_case(&carried.key) {
            return true;
        }
        if replaced {
            return false;
        }
        header.value = carried.value.clone();
        replaced = true;
        true
    });
    if !replaced {
        headers.push(carried.clone());
    }
}
