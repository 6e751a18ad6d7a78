use std::{sync::Arc, time::Duration};

use axum::{
    body::{Body, HttpBody},
    http::{Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use simplebank::{
    api::{self, AppState},
    config::{ApiKeyEntry, AuthConfig, Role},
};
use simplebank_core::{Ledger, StorageBackend, UpdateAccountParams};
use simplebank_memory::InMemoryStorage;
use tower::ServiceExt;

fn setup(auth: AuthConfig) -> (Router, Arc<InMemoryStorage>) {
    let store = Arc::new(InMemoryStorage::new());
    let state = AppState {
        ledger: Ledger::new(store.clone()),
        transfer_timeout: Duration::from_secs(5),
        metrics: None,
    };
    (api::router(state, auth), store)
}

fn keys() -> AuthConfig {
    AuthConfig {
        enabled: true,
        api_keys: vec![
            ApiKeyEntry {
                name: "alice".to_string(),
                key: "alice-key".to_string(),
                role: Role::User,
            },
            ApiKeyEntry {
                name: "bob".to_string(),
                key: "bob-key".to_string(),
                role: Role::User,
            },
        ],
    }
}

async fn send(app: &Router, method: Method, uri: &str, key: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(key) = key {
        builder = builder.header("X-API-Key", key);
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let mut body = response.into_body();
    let mut bytes = Vec::new();
    while let Some(chunk) = body.data().await {
        bytes.extend_from_slice(&chunk.unwrap());
    }
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    (status, value)
}

async fn create_user(app: &Router, username: &str) {
    let (status, body) = send(
        app,
        Method::POST,
        "/users",
        None,
        Some(json!({
            "username": username,
            "password": "secret",
            "full_name": "Test User",
            "email": format!("{username}@example.com"),
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
}

async fn create_account(app: &Router, key: Option<&str>, owner: Option<&str>, currency: &str) -> i64 {
    let (status, body) = send(
        app,
        Method::POST,
        "/accounts",
        key,
        Some(json!({ "currency": currency, "owner": owner })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    assert_eq!(body["balance"], 0);
    body["id"].as_i64().unwrap()
}

fn fund(store: &InMemoryStorage, id: i64, amount: i64) {
    store.update_account(&UpdateAccountParams { id, amount }).unwrap();
}

#[tokio::test]
async fn test_health_is_public() {
    let (app, _) = setup(keys());
    let (status, body) = send(&app, Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, _) = send(&app, Method::GET, "/metrics", None, None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_user_response_omits_password_hash() {
    let (app, _) = setup(AuthConfig::default());
    create_user(&app, "alice").await;

    let (status, body) = send(&app, Method::GET, "/users/alice", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["username"], "alice");
    assert_eq!(body["password_changed_at"], "1970-01-01T00:00:00Z");
    assert!(body.get("hashed_password").is_none());
    assert!(!body.to_string().contains("argon2"));

    let (status, body) = send(
        &app,
        Method::POST,
        "/users",
        None,
        Some(json!({
            "username": "alice",
            "password": "secret",
            "full_name": "Other Alice",
            "email": "other@example.com",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_transfer_moves_money_and_records_entries() {
    let (app, store) = setup(AuthConfig::default());
    create_user(&app, "alice").await;
    create_user(&app, "bob").await;
    let a = create_account(&app, None, Some("alice"), "USD").await;
    let b = create_account(&app, None, Some("bob"), "USD").await;
    fund(&store, a, 100);
    fund(&store, b, 50);

    let (status, body) = send(
        &app,
        Method::POST,
        "/transfers",
        None,
        Some(json!({ "from_account_id": a, "to_account_id": b, "amount": 30, "currency": "USD" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["from_account"]["balance"], 70);
    assert_eq!(body["to_account"]["balance"], 80);
    assert_eq!(body["from_entry"]["amount"], -30);
    assert_eq!(body["to_entry"]["amount"], 30);
    let transfer_id = body["transfer"]["id"].as_i64().unwrap();

    let (status, body) = send(&app, Method::GET, &format!("/transfers/{transfer_id}"), None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["amount"], 30);

    let (status, body) = send(
        &app,
        Method::GET,
        &format!("/entries?account_id={a}&page_id=1&page_size=5"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["amount"], -30);

    let (status, body) = send(
        &app,
        Method::GET,
        &format!("/transfers?account_id={b}&page_id=1&page_size=5"),
        None,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body[0]["id"], transfer_id);
}

#[tokio::test]
async fn test_transfer_request_validation() {
    let (app, _) = setup(AuthConfig::default());
    create_user(&app, "alice").await;
    create_user(&app, "bob").await;
    let a = create_account(&app, None, Some("alice"), "USD").await;
    let b = create_account(&app, None, Some("bob"), "EUR").await;

    let transfer = |from: i64, to: i64, amount: i64, currency: &str| {
        json!({ "from_account_id": from, "to_account_id": to, "amount": amount, "currency": currency })
    };

    let cases = [
        (transfer(a, b, 0, "USD"), StatusCode::BAD_REQUEST),
        (transfer(a, a, 10, "USD"), StatusCode::BAD_REQUEST),
        (transfer(a, b, 10, "USD"), StatusCode::BAD_REQUEST),
        (transfer(a, b, 10, "GBP"), StatusCode::BAD_REQUEST),
        (transfer(a, 9_999, 10, "USD"), StatusCode::NOT_FOUND),
    ];
    for (body, expected) in cases {
        let (status, response) = send(&app, Method::POST, "/transfers", None, Some(body.clone())).await;
        assert_eq!(status, expected, "{body} -> {response}");
    }
}

#[tokio::test]
async fn test_pagination_bounds() {
    let (app, _) = setup(AuthConfig::default());
    create_user(&app, "alice").await;
    let a = create_account(&app, None, Some("alice"), "USD").await;

    for uri in [
        format!("/entries?account_id={a}&page_id=0&page_size=5"),
        format!("/entries?account_id={a}&page_id=1&page_size=11"),
        format!("/entries?account_id={a}&page_id=1"),
    ] {
        let (status, _) = send(&app, Method::GET, &uri, None, None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
    }
}

#[tokio::test]
async fn test_auth_and_ownership() {
    let (app, store) = setup(keys());
    create_user(&app, "alice").await;
    create_user(&app, "bob").await;

    let (status, _) = send(&app, Method::GET, "/users/alice", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, Method::GET, "/users/alice", Some("wrong"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let a = create_account(&app, Some("alice-key"), None, "USD").await;
    let b = create_account(&app, Some("bob-key"), None, "USD").await;
    fund(&store, a, 100);

    // Bob cannot open accounts for Alice or read hers.
    let (status, _) = send(
        &app,
        Method::POST,
        "/accounts",
        Some("bob-key"),
        Some(json!({ "currency": "EUR", "owner": "alice" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app, Method::GET, &format!("/accounts/{a}"), Some("bob-key"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Bob cannot spend from Alice's account.
    let body = json!({ "from_account_id": a, "to_account_id": b, "amount": 10, "currency": "USD" });
    let (status, _) = send(&app, Method::POST, "/transfers", Some("bob-key"), Some(body.clone())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(store.get_account(a).unwrap().balance, 100);

    let (status, response) = send(&app, Method::POST, "/transfers", Some("alice-key"), Some(body)).await;
    assert_eq!(status, StatusCode::OK, "{response}");

    let (status, body) = send(&app, Method::GET, "/accounts?page_id=1&page_size=5", Some("alice-key"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["balance"], 90);
}
