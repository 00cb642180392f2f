//! Dispatch through a forwarding service instead of calling targets
//! directly.
//!
//! The forwarder receives `{url, method, headers, body}` and answers with
//! `{status, ok, body}` describing the target's reply, or an `{error}`
//! payload when it could not reach the target.

use crate::dispatch::{Dispatcher, RawResponse};
use crate::error::DispatchError;
use crate::model::ConcreteRequest;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, instrument};

/// Request envelope posted to the forwarder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRequest {
    pub url: String,
    pub method: String,
    pub headers: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl ForwardRequest {
    pub fn from_request(request: &ConcreteRequest) -> Self {
        let headers = request
            .headers
            .iter()
            .map(|h| (h.key.clone(), Value::String(h.value.clone())))
            .collect();

        let body = request.body.as_ref().map(|body| {
            if request.json_body {
                serde_json::from_str(body)
                    .unwrap_or_else(|_| Value::String(body.clone()))
            } else {
                Value::String(body.clone())
            }
        });

        Self {
            url: request.url.clone(),
            method: request.method.to_string(),
            headers,
            body,
        }
    }
}

/// Reply envelope returned by the forwarder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardReply {
    pub status: u16,
    #[serde(default)]
    pub ok: Option<bool>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Deserialize)]
struct ForwardFailure {
    error: Value,
}

/// Client for a forwarding service.
#[derive(Debug, Clone)]
pub struct ForwardingDispatcher {
    forward_url: String,
    timeout: Duration,
    http: reqwest::Client,
}

impl ForwardingDispatcher {
    pub fn new(forward_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            forward_url: forward_url.into(),
            timeout,
            http: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl Dispatcher for ForwardingDispatcher {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(
        &self,
        request: &ConcreteRequest,
    ) -> Result<RawResponse, DispatchError> {
        let envelope = ForwardRequest::from_request(request);

        debug!("Forwarding request via {}", self.forward_url);
        let response = self
            .http
            .post(&self.forward_url)
            .timeout(self.timeout)
            .json(&envelope)
            .send()
            .await
            .map_err(|e| DispatchError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| DispatchError::from_reqwest(e, self.timeout))?;

        if !status.is_success() {
            let detail = serde_json::from_str::<ForwardFailure>(&text)
                .map(|f| match f.error {
                    Value::String(s) => s,
                    other => other.to_string(),
                })
                .unwrap_or(text);
            return Err(DispatchError::Forwarder(format!("{status} - {detail}")));
        }

        if let Ok(failure) = serde_json::from_str::<ForwardFailure>(&text) {
            if !failure.error.is_null() {
                return Err(DispatchError::Forwarder(match failure.error {
                    Value::String(s) => s,
                    other => other.to_string(),
                }));
            }
        }

        let reply: ForwardReply = serde_json::from_str(&text).map_err(|e| {
            DispatchError::Forwarder(format!("malformed forwarder reply: {e}"))
        })?;

        let body = match reply.body {
            Value::String(s) => s,
            Value::Null => String::new(),
            other => other.to_string(),
        };

        Ok(RawResponse {
            status: reply.status,
            ok: reply.ok,
            headers: reply.headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Header, HttpMethod};
    use serde_json::json;

    #[test]
    fn test_envelope_carries_parsed_json_body() {
        let request = ConcreteRequest {
            method: HttpMethod::Post,
            url: "https://api.test/orders".into(),
            headers: vec![Header::new("X-Trace", "abc")],
            body: Some(r#"{"qty":2}"#.into()),
            json_body: true,
        };

        let envelope = ForwardRequest::from_request(&request);
        assert_eq!(envelope.method, "POST");
        assert_eq!(envelope.headers["X-Trace"], json!("abc"));
        assert_eq!(envelope.body, Some(json!({"qty": 2})));
    }

    #[test]
    fn test_envelope_keeps_text_body() {
        let request = ConcreteRequest {
            method: HttpMethod::Put,
            url: "https://api.test/notes/1".into(),
            headers: Vec::new(),
            body: Some("plain".into()),
            json_body: false,
        };

        let envelope = ForwardRequest::from_request(&request);
        assert_eq!(envelope.body, Some(json!("plain")));
    }

    #[test]
    fn test_reply_defaults() {
        let reply: ForwardReply =
            serde_json::from_str(r#"{"status": 204}"#).unwrap();
        assert_eq!(reply.status, 204);
        assert_eq!(reply.ok, None);
        assert_eq!(reply.body, Value::Null);
    }
}
