//! Import of Postman v2.x collection exports.
//!
//! Folders are flattened depth-first so the chain order matches the order
//! requests appear in the Postman sidebar.

use crate::model::{Collection, Header, HttpMethod, RequestTemplate};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, Deserialize)]
struct PostmanCollection {
    #[serde(default)]
    info: PostmanInfo,
    #[serde(default)]
    item: Vec<PostmanItem>,
}

#[derive(Debug, Deserialize, Default)]
struct PostmanInfo {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostmanItem {
    #[serde(default)]
    name: Option<String>,
    /// Present on folders.
    #[serde(default)]
    item: Option<Vec<PostmanItem>>,
    #[serde(default)]
    request: Option<PostmanRequestRepr>,
}

/// Postman allows a bare URL string in place of a request object.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PostmanRequestRepr {
    Url(String),
    Full(PostmanRequest),
}

#[derive(Debug, Deserialize)]
struct PostmanRequest {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    url: Option<PostmanUrl>,
    #[serde(default)]
    header: Vec<Header>,
    #[serde(default)]
    body: Option<PostmanBody>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PostmanUrl {
    Raw(String),
    Parts(PostmanUrlParts),
}

#[derive(Debug, Deserialize)]
struct PostmanUrlParts {
    #[serde(default)]
    raw: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    host: Option<StringOrList>,
    #[serde(default)]
    port: Option<String>,
    #[serde(default)]
    path: Option<StringOrList>,
    #[serde(default)]
    query: Vec<PostmanQuery>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn join(&self, sep: &str) -> String {
        match self {
            StringOrList::One(s) => s.clone(),
            StringOrList::Many(parts) => parts.join(sep),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PostmanQuery {
    key: Option<String>,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Deserialize)]
struct PostmanBody {
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    raw: Option<String>,
}

/// Return `true` when the document looks like a Postman export.
pub fn is_postman_collection(document: &Value) -> bool {
    let has_items = document.get("item").is_some_and(Value::is_array);
    let has_info = document.get("info").is_some_and(|info| {
        info.get("_postman_id").is_some() || info.get("schema").is_some()
    });
    has_items && has_info
}

/// Convert a Postman export into a [`Collection`].
pub fn parse_collection(document: &Value) -> Result<Collection> {
    let postman: PostmanCollection = serde_json::from_value(document.clone())
        .context("Failed to parse Postman collection")?;

    let mut requests = Vec::new();
    flatten_items(&postman.item, &mut requests)?;
    debug!("Imported {} request(s) from Postman", requests.len());

    Ok(Collection {
        name: postman.info.name,
        requests,
    })
}

fn flatten_items(
    items: &[PostmanItem],
    out: &mut Vec<RequestTemplate>,
) -> Result<()> {
    for item in items {
        if let Some(children) = &item.item {
            flatten_items(children, out)?;
            continue;
        }
        let Some(request) = &item.request else {
            warn!(
                "Skipping Postman item without a request: {}",
                item.name.as_deref().unwrap_or("<unnamed>")
            );
            continue;
        };
        let position = out.len() + 1;
        let mut template = convert_request(request).context(format!(
            "Invalid Postman request #{position}"
        ))?;
        template.name = item.name.clone();
        out.push(template);
    }
    Ok(())
}

fn convert_request(repr: &PostmanRequestRepr) -> Result<RequestTemplate> {
    let request = match repr {
        PostmanRequestRepr::Url(url) => {
            return Ok(RequestTemplate::new(HttpMethod::Get, url.clone()))
        }
        PostmanRequestRepr::Full(request) => request,
    };

    let method = parse_method(request.method.as_deref().unwrap_or("GET"))?;
    let url = request.url.as_ref().map(format_url).unwrap_or_default();

    let mut template = RequestTemplate::new(method, url);
    template.headers = request
        .header
        .iter()
        .filter(|h| !h.disabled && !h.key.is_empty())
        .cloned()
        .collect();

    if let Some(body) = &request.body {
        match (body.mode.as_deref(), &body.raw) {
            (Some("raw") | None, Some(raw)) if !raw.trim().is_empty() => {
                template.body = Some(Value::String(raw.clone()));
            }
            (Some("raw") | None, _) => {}
            (Some(mode), _) => {
                warn!("Postman body mode '{}' is not supported; body dropped", mode);
            }
        }
    }

    Ok(template)
}

fn parse_method(method: &str) -> Result<HttpMethod> {
    serde_json::from_value(Value::String(method.to_ascii_uppercase()))
        .map_err(|_| anyhow!("unsupported HTTP method '{method}'"))
}

fn format_url(url: &PostmanUrl) -> String {
    let parts = match url {
        PostmanUrl::Raw(raw) => return raw.clone(),
        PostmanUrl::Parts(parts) => parts,
    };
    if let Some(raw) = &parts.raw {
        return raw.clone();
    }

    let mut formatted = String::new();
    if let Some(host) = &parts.host {
        let protocol = parts.protocol.as_deref().unwrap_or("https");
        formatted.push_str(&format!("{protocol}://{}", host.join(".")));
        if let Some(port) = &parts.port {
            formatted.push_str(&format!(":{port}"));
        }
    }
    if let Some(path) = &parts.path {
        formatted.push('/');
        formatted.push_str(path.join("/").trim_start_matches('/'));
    }

    let query: Vec<String> = parts
        .query
        .iter()
        .filter(|q| !q.disabled)
        .filter_map(|q| {
            q.key.as_ref().map(|key| {
                format!("{key}={}", q.value.as_deref().unwrap_or(""))
            })
        })
        .collect();
    if !query.is_empty() {
        formatted.push('?');
        formatted.push_str(&query.join("&"));
    }
    formatted
}
