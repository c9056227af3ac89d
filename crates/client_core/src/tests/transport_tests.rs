use std::collections::HashMap;

use axum::{
    extract::Query,
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use shared::protocol::SearchResponse;
use tokio::net::TcpListener;

use super::*;

async fn echo(Query(params): Query<HashMap<String, String>>, headers: HeaderMap) -> Json<Value> {
    let api_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    Json(json!({ "params": params, "api_key": api_key }))
}

async fn start_sync(headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if headers.get("x-api-key").is_none() {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "code": "UNAUTHORIZED", "message": "missing api key" })),
        );
    }
    let roots = body["root_folder_ids"].as_array().map_or(0, Vec::len);
    (
        StatusCode::ACCEPTED,
        Json(json!({ "message": format!("sync started for {roots} roots") })),
    )
}

async fn spawn_server() -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let app = Router::new()
        .route("/echo", get(echo))
        .route(
            "/api/v1/admin/sync",
            axum::routing::post(start_sync).delete(|| async { StatusCode::NO_CONTENT }),
        )
        .route(
            "/missing",
            get(|| async {
                (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "code": "NOT_FOUND", "message": "file missing", "request_id": "req-1" })),
                )
            }),
        )
        .route(
            "/broken",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded") }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({}))
            }),
        );

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

#[test]
fn query_params_skip_absent_and_empty_values() {
    let params = QueryParams::new()
        .with("query", "report")
        .with("cursor", "")
        .with("page", 2u32)
        .with("department", Option::<i64>::None)
        .with("file_id", Some(FileId(7)));

    let pairs: Vec<(&str, &str)> = params.iter().collect();
    assert_eq!(pairs, vec![("query", "report"), ("page", "2"), ("file_id", "7")]);
}

#[test]
fn credentials_are_trimmed_and_redacted() {
    let credentials = Credentials::api_key("  secret-key \n");
    assert_eq!(
        credentials.headers(),
        vec![(API_KEY_HEADER.to_string(), "secret-key".to_string())]
    );
    assert!(!format!("{credentials:?}").contains("secret"));
    assert!(Credentials::api_key("   ").headers().is_empty());
}

#[test]
fn rejects_non_http_base_url() {
    assert!(HttpTransport::new("ftp://files.example").is_err());
    assert!(HttpTransport::new("not a url").is_err());
    assert!(HttpTransport::new("https://files.example").is_ok());
}

#[tokio::test]
async fn get_sends_params_and_credentials() {
    let base = spawn_server().await;
    let transport = HttpTransport::new(&base).expect("transport");

    let params = QueryParams::new().with("query", "q4 report").with("page", 1u32);
    let options = RequestOptions::new().with_credentials(&Credentials::api_key("k-123"));
    let body = transport.get("/echo", &params, options).await.expect("get");

    assert_eq!(body["params"]["query"], "q4 report");
    assert_eq!(body["params"]["page"], "1");
    assert_eq!(body["api_key"], "k-123");
}

#[tokio::test]
async fn error_body_is_mapped_to_http_error() {
    let base = spawn_server().await;
    let transport = HttpTransport::new(&base).expect("transport");

    let err = transport
        .get("/missing", &QueryParams::new(), RequestOptions::new())
        .await
        .expect_err("should fail");

    assert!(err.is_not_found());
    assert_eq!(err.code(), "NOT_FOUND");
    assert_eq!(err.to_string(), "file missing");
}

#[tokio::test]
async fn unstructured_error_falls_back_to_unknown() {
    let base = spawn_server().await;
    let transport = HttpTransport::new(&base).expect("transport");

    let err = transport
        .get("/broken", &QueryParams::new(), RequestOptions::new())
        .await
        .expect_err("should fail");

    assert_eq!(err.status(), Some(500));
    assert_eq!(err.code(), shared::error::UNKNOWN_ERROR_CODE);
    assert_eq!(err.to_string(), "HTTP 500");
}

#[tokio::test]
async fn schema_mismatch_is_a_validation_error() {
    let base = spawn_server().await;
    let transport = HttpTransport::new(&base).expect("transport");

    let err = get_json::<SearchResponse>(&transport, "/echo", &QueryParams::new(), RequestOptions::new())
        .await
        .expect_err("should fail");

    assert!(matches!(err, TransportError::Validation(_)));
}

#[tokio::test]
async fn cancelled_request_resolves_promptly() {
    let base = spawn_server().await;
    let transport = HttpTransport::new(&base).expect("transport");
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = std::time::Instant::now();
    let err = transport
        .get("/slow", &QueryParams::new(), RequestOptions::new().with_cancel(token))
        .await
        .expect_err("should be cancelled");

    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn post_and_delete_decode_message_responses() {
    let base = spawn_server().await;
    let transport = HttpTransport::new(&base).expect("transport");
    let options = RequestOptions::new().with_credentials(&Credentials::api_key("k-123"));

    let started = transport
        .post(
            "/api/v1/admin/sync",
            json!({ "root_folder_ids": [1, 2] }),
            options.clone(),
        )
        .await
        .expect("post");
    assert_eq!(started.message, "sync started for 2 roots");

    let cancelled = transport
        .delete("/api/v1/admin/sync", options)
        .await
        .expect("delete");
    assert!(cancelled.message.is_empty());

    let err = transport
        .post("/api/v1/admin/sync", json!({}), RequestOptions::new())
        .await
        .expect_err("unauthorized");
    assert!(err.is_unauthorized());
}
