use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Path,
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use scriptless::{
    load_collection, load_rows, Collection, ConcreteRequest, Dispatcher,
    ForwardingDispatcher, HttpMethod, PropagationRule, RequestTemplate,
    RunConfig, RunResult, Status, TestDataRow,
};
use serde_json::{json, Value};
use tokio::task::JoinHandle;

struct TestServer {
    base_url: String,
    after_failure_hits: Arc<AtomicUsize>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

async fn login(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let user = body["user"].as_str().unwrap_or_default().to_string();
    if body["password"] == "secret" {
        (
            StatusCode::OK,
            Json(json!({
                "token": format!("tok-{user}"),
                "user": {"id": format!("u-{user}"), "roles": ["reader"]}
            })),
        )
    } else {
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "bad credentials"})),
        )
    }
}

async fn profile(
    Path(id): Path<String>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    let expected = format!("Bearer tok-{}", id.trim_start_matches("u-"));
    let authorized = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    if authorized {
        (StatusCode::OK, Json(json!({"id": id, "active": true})))
    } else {
        (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"})))
    }
}

async fn start_operation() -> Json<Value> {
    Json(json!({"operationToken": "op-1"}))
}

async fn confirm_operation(headers: HeaderMap) -> (StatusCode, Json<Value>) {
    match headers.get("operation-token").and_then(|v| v.to_str().ok()) {
        Some("op-1") => (
            StatusCode::OK,
            Json(json!({"operationToken": "op-2", "confirmed": true})),
        ),
        other => (
            StatusCode::CONFLICT,
            Json(json!({"error": format!("unexpected token {other:?}")})),
        ),
    }
}

/// Stand-in forwarding service: answers for the target named by the
/// envelope URL without calling it.
async fn forward(Json(envelope): Json<Value>) -> (StatusCode, Json<Value>) {
    let target = envelope["url"].as_str().unwrap_or_default().to_string();
    if target.ends_with("/accepted") {
        (
            StatusCode::OK,
            Json(json!({"status": 201, "ok": true, "body": {"echo": envelope}})),
        )
    } else if target.ends_with("/rejected") {
        (
            StatusCode::OK,
            Json(json!({"status": 200, "ok": false, "body": "x"})),
        )
    } else if target.ends_with("/unreachable") {
        (
            StatusCode::OK,
            Json(json!({"error": "connect ECONNREFUSED"})),
        )
    } else {
        (
            StatusCode::BAD_GATEWAY,
            Json(json!({"error": "upstream gone"})),
        )
    }
}

async fn store_note(body: String) -> (StatusCode, String) {
    (StatusCode::CREATED, format!("stored {body}"))
}

impl TestServer {
    async fn spawn() -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let after_failure_hits = Arc::new(AtomicUsize::new(0));
        let hits = after_failure_hits.clone();

        let app = Router::new()
            .route("/login", post(login))
            .route("/users/:id", get(profile))
            .route("/operations/start", post(start_operation))
            .route("/operations/confirm", post(confirm_operation))
            .route("/notes", post(store_note))
            .route("/forward", post(forward))
            .route(
                "/boom",
                get(|| async move {
                    (StatusCode::INTERNAL_SERVER_ERROR, "database unavailable")
                }),
            )
            .route(
                "/after-boom",
                get(move || {
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, Ordering::SeqCst);
                        Json(json!({"reached": true}))
                    }
                }),
            );

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
        let server = axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });

        let handle = tokio::spawn(async move {
            if let Err(err) = server.await {
                eprintln!("test server error: {err}");
            }
        });

        Self {
            base_url: format!("http://{addr}"),
            after_failure_hits,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    fn config(&self) -> RunConfig {
        RunConfig {
            base_url: Some(self.base_url.clone()),
            timeout: 5,
            ..RunConfig::default()
        }
    }

    async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                let _ = handle.await;
            }
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

fn assert_login_chain(result: &RunResult) {
    assert_eq!(result.rows.len(), 2);

    let ann = &result.rows[0];
    assert_eq!(ann.id, "QA-101");
    assert_eq!(ann.status, Status::Passed, "row failed: {:?}", ann.error);
    assert_eq!(ann.logs.len(), 2);
    assert!(ann.logs[1].modified_url.ends_with("/users/u-ann"));
    assert_eq!(ann.logs[1].original_url, "/users/{{response1.user.id}}");
    let profile = ann.logs[1].response.as_ref().unwrap();
    assert_eq!(profile.body["id"], "u-ann");

    let bob = &result.rows[1];
    assert_eq!(bob.id, "QA-102");
    assert_eq!(bob.status, Status::Failed);
    assert_eq!(bob.logs.len(), 1);
    assert_eq!(bob.logs[0].response.as_ref().unwrap().status, Some(401));
    assert!(bob.error.as_deref().unwrap().starts_with("Login: HTTP 401"));

    assert_eq!(result.summary.passed, 1);
    assert_eq!(result.summary.failed, 1);
    assert!(!result.success());
}

#[tokio::test]
async fn login_chain_runs_once_per_row() {
    let server = TestServer::spawn().await;
    let collection = load_collection(fixture("login_chain.yaml")).unwrap();
    let rows = load_rows(fixture("login_rows.json")).unwrap();
    let config = RunConfig {
        response_headers: true,
        ..server.config()
    };

    let result = config.orchestrator().run(&collection, &rows).await;

    assert_eq!(result.collection.as_deref(), Some("Login chain"));
    assert_login_chain(&result);
    let login_body = result.rows[0].logs[0].body.as_deref().unwrap();
    assert_eq!(login_body, r#"{"user":"ann","password":"secret"}"#);

    server.shutdown().await;
}

#[tokio::test]
async fn postman_export_runs_like_native_collection() {
    let server = TestServer::spawn().await;
    let collection =
        load_collection(fixture("login_chain.postman.json")).unwrap();
    let rows = load_rows(fixture("login_rows.json")).unwrap();
    let config = RunConfig {
        response_headers: true,
        ..server.config()
    };

    let result = config.orchestrator().run(&collection, &rows).await;

    assert_eq!(result.collection.as_deref(), Some("Login chain (Postman)"));
    assert_login_chain(&result);

    server.shutdown().await;
}

#[tokio::test]
async fn header_placeholders_stay_literal_unless_enabled() {
    let server = TestServer::spawn().await;
    let collection = load_collection(fixture("login_chain.yaml")).unwrap();
    let rows = load_rows(fixture("login_rows.json")).unwrap();

    let result = server.config().orchestrator().run(&collection, &rows).await;

    let ann = &result.rows[0];
    assert_eq!(ann.status, Status::Failed);
    assert_eq!(ann.logs[1].response.as_ref().unwrap().status, Some(403));
    let auth = ann.logs[1]
        .headers
        .iter()
        .find(|h| h.key == "Authorization")
        .unwrap();
    assert_eq!(auth.value, "Bearer {{response1.token}}");

    server.shutdown().await;
}

#[tokio::test]
async fn server_error_stops_the_chain() {
    let server = TestServer::spawn().await;
    let collection = Collection {
        name: Some("boom".into()),
        requests: vec![
            RequestTemplate::new(HttpMethod::Get, "/boom"),
            RequestTemplate::new(HttpMethod::Get, "/after-boom"),
        ],
    };

    let result = server
        .config()
        .orchestrator()
        .run(&collection, &[TestDataRow::new()])
        .await;

    let row = &result.rows[0];
    assert_eq!(row.status, Status::Failed);
    assert_eq!(row.logs.len(), 1);
    let response = row.logs[0].response.as_ref().unwrap();
    assert_eq!(response.status, Some(500));
    assert_eq!(response.body, json!({"raw": "database unavailable"}));
    assert_eq!(
        row.error.as_deref(),
        Some("Request_1: HTTP 500: database unavailable")
    );
    assert_eq!(server.after_failure_hits.load(Ordering::SeqCst), 0);

    server.shutdown().await;
}

#[tokio::test]
async fn text_body_is_sent_verbatim_after_row_rules() {
    let server = TestServer::spawn().await;
    let collection = Collection {
        name: None,
        requests: vec![RequestTemplate::new(HttpMethod::Post, "/notes")
            .with_name("Note")
            .with_body(json!("note for {ticket}"))],
    };
    let row = TestDataRow::new().with("ticket", json!("QA-7"));

    let result = server.config().orchestrator().run(&collection, &[row]).await;

    let log = &result.rows[0].logs[0];
    assert_eq!(log.status, Status::Passed);
    assert_eq!(log.body.as_deref(), Some("note for QA-7"));
    assert_eq!(
        log.response.as_ref().unwrap().body,
        json!({"raw": "stored note for QA-7"})
    );

    server.shutdown().await;
}

#[tokio::test]
async fn propagated_token_reaches_the_next_request() {
    let server = TestServer::spawn().await;
    let collection = Collection {
        name: Some("operation".into()),
        requests: vec![
            RequestTemplate::new(HttpMethod::Post, "/operations/start"),
            RequestTemplate::new(HttpMethod::Post, "/operations/confirm"),
        ],
    };
    let config = RunConfig {
        propagate: Some(PropagationRule::parse("operationToken=Operation-Token").unwrap()),
        ..server.config()
    };

    let result = config
        .orchestrator()
        .run(&collection, &[TestDataRow::new()])
        .await;

    let row = &result.rows[0];
    assert_eq!(row.status, Status::Passed, "row failed: {:?}", row.error);
    assert!(row.logs[0].headers.is_empty());
    assert!(row.logs[1]
        .headers
        .iter()
        .any(|h| h.key == "Operation-Token" && h.value == "op-1"));
    assert_eq!(row.logs[1].response.as_ref().unwrap().body["confirmed"], true);

    server.shutdown().await;
}

#[tokio::test]
async fn concurrent_rows_keep_their_own_responses() {
    let server = TestServer::spawn().await;
    let collection = load_collection(fixture("login_chain.yaml")).unwrap();
    let users = ["ann", "bob", "cy", "dee", "eve"];
    let rows: Vec<TestDataRow> = users
        .iter()
        .map(|user| {
            TestDataRow::new()
                .with("Jira-Id", json!(format!("QA-{user}")))
                .with("username", json!(user))
                .with("password", json!("secret"))
        })
        .collect();
    let config = RunConfig {
        response_headers: true,
        concurrency: 3,
        ..server.config()
    };

    let result = config.orchestrator().run(&collection, &rows).await;

    assert!(result.success());
    for (row, user) in result.rows.iter().zip(users) {
        assert_eq!(row.id, format!("QA-{user}"));
        assert!(row.logs[1].modified_url.ends_with(&format!("/users/u-{user}")));
    }

    server.shutdown().await;
}

fn target(path: &str) -> ConcreteRequest {
    ConcreteRequest {
        method: HttpMethod::Get,
        url: format!("http://target.test{path}"),
        headers: Vec::new(),
        body: None,
        json_body: false,
    }
}

#[tokio::test]
async fn forwarder_reply_maps_to_the_response() {
    let server = TestServer::spawn().await;
    let collection = Collection {
        name: Some("forwarded".into()),
        requests: vec![RequestTemplate::new(HttpMethod::Post, "/accepted")
            .with_header("X-Trace", "abc")
            .with_body(json!({"qty": 2}))],
    };
    let config = RunConfig {
        base_url: Some("http://target.test".into()),
        forward_url: Some(format!("{}/forward", server.base_url)),
        timeout: 5,
        ..RunConfig::default()
    };

    let result = config
        .orchestrator()
        .run(&collection, &[TestDataRow::new()])
        .await;

    let row = &result.rows[0];
    assert_eq!(row.status, Status::Passed, "row failed: {:?}", row.error);
    let response = row.logs[0].response.as_ref().unwrap();
    assert_eq!(response.status, Some(201));
    let echo = &response.body["echo"];
    assert_eq!(echo["url"], "http://target.test/accepted");
    assert_eq!(echo["method"], "POST");
    assert_eq!(echo["headers"]["X-Trace"], "abc");
    assert_eq!(echo["body"], json!({"qty": 2}));

    server.shutdown().await;
}

#[tokio::test]
async fn forwarder_verdict_and_errors_fail_the_request() {
    let server = TestServer::spawn().await;
    let dispatcher = ForwardingDispatcher::new(
        format!("{}/forward", server.base_url),
        Duration::from_secs(5),
    );

    let rejected = dispatcher.dispatch(&target("/rejected")).await;
    assert!(!rejected.ok);
    assert_eq!(rejected.status, Some(200));
    assert_eq!(rejected.error.as_deref(), Some("HTTP 200: x"));

    let unreachable = dispatcher.dispatch(&target("/unreachable")).await;
    assert!(!unreachable.ok);
    assert_eq!(unreachable.status, None);
    assert_eq!(unreachable.body, Value::Null);
    assert_eq!(
        unreachable.error.as_deref(),
        Some("Forwarding service error: connect ECONNREFUSED")
    );

    let crashed = dispatcher.dispatch(&target("/crash")).await;
    assert!(!crashed.ok);
    assert_eq!(crashed.status, None);
    let error = crashed.error.unwrap();
    assert!(error.contains("502"), "unexpected error: {error}");
    assert!(error.contains("upstream gone"), "unexpected error: {error}");

    server.shutdown().await;
}
