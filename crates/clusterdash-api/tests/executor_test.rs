#![allow(clippy::unwrap_used)]
// Integration tests for `RequestExecutor` and the login/renewal calls using wiremock.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use url::Url;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use clusterdash_api::{
    AuthToken, Endpoints, Error, FetchOptions, RequestExecutor, TokenStore, auth, read_success,
};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, RequestExecutor, Endpoints) {
    let server = MockServer::start().await;
    let endpoints = Endpoints::new(Url::parse(&server.uri()).unwrap(), "/");
    let executor = RequestExecutor::new(reqwest::Client::new(), TokenStore::in_memory());
    (server, executor, endpoints)
}

fn get() -> FetchOptions {
    FetchOptions::get(Duration::from_secs(5))
}

/// Serve one connection that sends complete headers and a partial body,
/// then holds the socket open without writing anything else.
async fn stalled_body_server() -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0_u8; 1024];
        let _ = socket.read(&mut buf).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n[{\"NodeId\":")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        drop(socket);
    });
    Url::parse(&format!("http://{addr}/api/nodes")).unwrap()
}

// ── Request lifecycle ───────────────────────────────────────────────

#[tokio::test]
async fn test_execute_returns_raw_response() {
    let (server, executor, endpoints) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/nodes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "NodeId": "n1" }])))
        .mount(&server)
        .await;

    let resp = executor
        .execute(endpoints.http("api/nodes").unwrap(), get(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let body = read_success(resp).await.unwrap();
    let nodes: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(nodes[0]["NodeId"], "n1");
}

#[tokio::test]
async fn test_unauthorized_is_a_response_not_a_failure() {
    let (server, executor, endpoints) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/get-kernels"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let resp = executor
        .execute(endpoints.http("api/get-kernels").unwrap(), get(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let err = read_success(resp).await.unwrap_err();
    assert!(err.is_unauthorized(), "expected Unauthorized, got: {err:?}");
}

#[tokio::test]
async fn test_server_error_carries_status() {
    let (server, executor, endpoints) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/scheduling-policy"))
        .respond_with(ResponseTemplate::new(500).set_body_string("scheduler exploded"))
        .mount(&server)
        .await;

    let resp = executor
        .execute(endpoints.http("api/scheduling-policy").unwrap(), get(), &CancellationToken::new())
        .await
        .unwrap();
    let err = read_success(resp).await.unwrap_err();
    match err {
        Error::Http { status, message } => {
            assert_eq!(status, 500);
            assert!(message.contains("scheduler exploded"), "message: {message}");
        }
        other => panic!("expected Http error, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_deadline_lapse_is_timeout() {
    let (server, executor, endpoints) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/cluster-age"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let result = executor
        .execute(
            endpoints.http("api/cluster-age").unwrap(),
            FetchOptions::get(Duration::from_millis(100)),
            &CancellationToken::new(),
        )
        .await;

    assert!(
        matches!(result, Err(Error::Timeout { timeout_ms: 100 })),
        "expected Timeout, got: {result:?}"
    );
}

#[tokio::test]
async fn test_deadline_covers_a_stalled_body() {
    let url = stalled_body_server().await;
    let executor = RequestExecutor::new(reqwest::Client::new(), TokenStore::in_memory());

    let resp = executor
        .execute(url, FetchOptions::get(Duration::from_millis(300)), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let result = tokio::time::timeout(Duration::from_secs(3), read_success(resp))
        .await
        .expect("body read should end at the request deadline");
    assert!(
        matches!(result, Err(Error::Timeout { timeout_ms: 300 })),
        "expected Timeout, got: {result:?}"
    );
}

#[tokio::test]
async fn test_cancellation_reaches_a_stalled_body() {
    let url = stalled_body_server().await;
    let executor = RequestExecutor::new(reqwest::Client::new(), TokenStore::in_memory());
    let cancel = CancellationToken::new();

    let resp = executor.execute(url, get(), &cancel).await.unwrap();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = tokio::time::timeout(Duration::from_secs(3), read_success(resp))
        .await
        .expect("body read should stop on cancellation");
    assert!(matches!(result, Err(Error::Cancelled)), "got: {result:?}");
}

#[tokio::test]
async fn test_cancellation_is_not_timeout() {
    let (server, executor, endpoints) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/nodes"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = executor
        .execute(endpoints.http("api/nodes").unwrap(), get(), &cancel)
        .await;
    assert!(matches!(result, Err(Error::Cancelled)), "got: {result:?}");
}

#[tokio::test]
async fn test_sibling_attempts_cancel_independently() {
    let (server, executor, endpoints) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/nodes"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)))
        .mount(&server)
        .await;

    let url = endpoints.http("api/nodes").unwrap();
    let doomed = CancellationToken::new();
    let survivor = CancellationToken::new();

    let first = executor.execute(url.clone(), get(), &doomed);
    let second = executor.execute(url, get(), &survivor);
    doomed.cancel();

    let (first, second) = tokio::join!(first, second);
    assert!(matches!(first, Err(Error::Cancelled)), "got: {first:?}");
    assert_eq!(second.unwrap().status().as_u16(), 200);
}

#[tokio::test]
async fn test_refused_connection_is_network_error() {
    // Grab a free port, then release it so nothing is listening.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let executor = RequestExecutor::new(reqwest::Client::new(), TokenStore::in_memory());
    let url = Url::parse(&format!("http://127.0.0.1:{port}/api/nodes")).unwrap();
    let result = executor.execute(url, get(), &CancellationToken::new()).await;

    match result {
        Err(err @ Error::Network(_)) => assert!(err.is_transient()),
        other => panic!("expected Network error, got: {other:?}"),
    }
}

// ── Request shaping ─────────────────────────────────────────────────

#[tokio::test]
async fn test_bearer_token_is_injected() {
    let (server, executor, endpoints) = setup().await;
    executor.tokens().set(AuthToken::new("abc", None)).unwrap();

    Mock::given(method("GET"))
        .and(path("/api/deployment-mode"))
        .and(header("Authorization", "Bearer abc"))
        .respond_with(ResponseTemplate::new(200).set_body_string("docker-compose"))
        .expect(1)
        .mount(&server)
        .await;

    let resp = executor
        .execute(endpoints.http("api/deployment-mode").unwrap(), get(), &CancellationToken::new())
        .await
        .unwrap();
    let body = read_success(resp).await.unwrap();
    assert_eq!(&body[..], b"docker-compose");
}

#[tokio::test]
async fn test_unauthorized_options_skip_bearer() {
    let (server, executor, endpoints) = setup().await;
    executor.tokens().set(AuthToken::new("abc", None)).unwrap();

    Mock::given(method("GET"))
        .and(path("/api/nodes"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut options = get();
    options.authorize = false;
    executor
        .execute(endpoints.http("api/nodes").unwrap(), options, &CancellationToken::new())
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    assert!(!requests[0].headers.contains_key("authorization"));
}

#[tokio::test]
async fn test_cache_bust_appends_rand_number() {
    let (server, executor, endpoints) = setup().await;

    Mock::given(method("GET"))
        .and(path("/api/workload-presets"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let url = endpoints.http("api/workload-presets").unwrap();
    for _ in 0..2 {
        executor
            .execute(url.clone(), get().with_cache_bust(true), &CancellationToken::new())
            .await
            .unwrap();
    }

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert!(
            request.url.query_pairs().any(|(k, _)| k == "randNumber"),
            "missing randNumber in {}",
            request.url
        );
    }
}

// ── Login / renewal ─────────────────────────────────────────────────

#[tokio::test]
async fn test_login_stores_token() {
    let (server, executor, endpoints) = setup().await;

    Mock::given(method("POST"))
        .and(path("/authenticate"))
        .and(body_json(json!({ "username": "admin", "password": "hunter2" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "fresh-token",
            "expire": "2030-01-01T00:00:00Z"
        })))
        .mount(&server)
        .await;

    let password: SecretString = "hunter2".to_string().into();
    let token = auth::login(
        &executor,
        endpoints.http("authenticate").unwrap(),
        "admin",
        &password,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(token.token.expose_secret(), "fresh-token");
    assert!(token.expire.is_some());
    assert_eq!(executor.tokens().bearer().as_deref(), Some("Bearer fresh-token"));
}

#[tokio::test]
async fn test_login_rejected() {
    let (server, executor, endpoints) = setup().await;

    Mock::given(method("POST"))
        .and(path("/authenticate"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
        .mount(&server)
        .await;

    let password: SecretString = "wrong".to_string().into();
    let result = auth::login(
        &executor,
        endpoints.http("authenticate").unwrap(),
        "admin",
        &password,
        &CancellationToken::new(),
    )
    .await;

    assert!(matches!(result, Err(Error::Unauthorized)), "got: {result:?}");
    assert!(executor.tokens().is_empty());
}

#[tokio::test]
async fn test_renew_replaces_token() {
    let (server, executor, endpoints) = setup().await;
    executor.tokens().set(AuthToken::new("old", None)).unwrap();

    Mock::given(method("POST"))
        .and(path("/refresh_token"))
        .and(header("Authorization", "Bearer old"))
        .and(body_json(json!({ "token": "old" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token": "new",
            "expire": 1_900_000_000_000_i64
        })))
        .mount(&server)
        .await;

    let token = auth::renew(&executor, endpoints.http("refresh_token").unwrap(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(token.expire.unwrap().timestamp_millis(), 1_900_000_000_000);
    assert_eq!(executor.tokens().bearer().as_deref(), Some("Bearer new"));
}

#[tokio::test]
async fn test_renew_without_token_is_unauthorized() {
    let (_server, executor, endpoints) = setup().await;
    let result = auth::renew(&executor, endpoints.http("refresh_token").unwrap(), &CancellationToken::new()).await;
    assert!(matches!(result, Err(Error::Unauthorized)));
}
