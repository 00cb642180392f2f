//! Sending concrete requests and normalizing what comes back.

use crate::error::DispatchError;
use crate::model::{CapturedResponse, ConcreteRequest, HttpMethod};
use async_trait::async_trait;
use reqwest::{Client, Method as ReqMethod};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Default per-request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// What came back over the wire, before normalization.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    /// Verdict reported alongside the status, e.g. by a forwarding
    /// service. When absent, any 2xx status counts as ok.
    pub ok: Option<bool>,
    pub headers: BTreeMap<String, String>,
    pub body: String,
}

/// Sends concrete requests. Implementors only provide [`Dispatcher::send`];
/// [`Dispatcher::dispatch`] turns every outcome, including transport
/// errors, into a [`CapturedResponse`].
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(
        &self,
        request: &ConcreteRequest,
    ) -> Result<RawResponse, DispatchError>;

    async fn dispatch(&self, request: &ConcreteRequest) -> CapturedResponse {
        let start = Instant::now();
        let outcome = self.send(request).await;
        normalize(outcome, start.elapsed().as_millis() as u64)
    }
}

/// Parse a response body as JSON, keeping non-JSON text under `raw`.
pub fn parse_body(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or_else(|_| json!({ "raw": text }))
}

/// Map a send outcome onto the result contract: 2xx is a pass unless the
/// sender reported otherwise, any other status is a failure carrying the
/// status and body text, and a send error is a failure with no status.
pub fn normalize(
    outcome: Result<RawResponse, DispatchError>,
    duration_ms: u64,
) -> CapturedResponse {
    match outcome {
        Ok(raw) => {
            let ok = raw
                .ok
                .unwrap_or_else(|| (200..300).contains(&raw.status));
            let error = if ok {
                None
            } else {
                Some(format!("HTTP {}: {}", raw.status, raw.body))
            };
            CapturedResponse {
                status: Some(raw.status),
                ok,
                body: parse_body(&raw.body),
                headers: raw.headers,
                error,
                duration_ms,
            }
        }
        Err(err) => {
            warn!("Dispatch failed: {}", err);
            CapturedResponse {
                status: None,
                ok: false,
                headers: BTreeMap::new(),
                body: Value::Null,
                error: Some(err.to_string()),
                duration_ms,
            }
        }
    }
}

fn convert_method(method: HttpMethod) -> ReqMethod {
    match method {
        HttpMethod::Get => ReqMethod::GET,
        HttpMethod::Post => ReqMethod::POST,
        HttpMethod::Put => ReqMethod::PUT,
        HttpMethod::Delete => ReqMethod::DELETE,
        HttpMethod::Patch => ReqMethod::PATCH,
        HttpMethod::Head => ReqMethod::HEAD,
        HttpMethod::Options => ReqMethod::OPTIONS,
    }
}

/// Calls target endpoints directly.
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: Client,
    timeout: Duration,
}

impl HttpDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            timeout,
        }
    }
}

impl Default for HttpDispatcher {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(
        &self,
        request: &ConcreteRequest,
    ) -> Result<RawResponse, DispatchError> {
        let mut req_builder = self
            .client
            .request(convert_method(request.method), &request.url)
            .timeout(self.timeout);

        for header in &request.headers {
            req_builder = req_builder.header(&header.key, &header.value);
        }

        if let Some(body) = &request.body {
            if request.json_body && request.header("content-type").is_none() {
                req_builder =
                    req_builder.header("Content-Type", "application/json");
            }
            req_builder = req_builder.body(body.clone());
        }

        debug!("Sending request");
        let response = req_builder
            .send()
            .await
            .map_err(|e| DispatchError::from_reqwest(e, self.timeout))?;

        let status = response.status().as_u16();
        debug!("Received response with status: {}", status);

        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or("").to_string(),
                )
            })
            .collect();

        let body = response
            .text()
            .await
            .map_err(|e| DispatchError::from_reqwest(e, self.timeout))?;

        Ok(RawResponse {
            status,
            ok: None,
            headers,
            body,
        })
    }
}
