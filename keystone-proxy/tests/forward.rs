use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Request, Uri};
use axum::Router;
use http_body_util::BodyExt;
use keystone_proxy::ProxyPool;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct Seen(Arc<Mutex<Vec<SeenRequest>>>);

#[derive(Debug, Clone)]
struct SeenRequest {
    path: String,
    host: String,
    forwarded_for: Option<String>,
}

async fn record(State(seen): State<Seen>, uri: Uri, headers: HeaderMap) -> &'static str {
    seen.0.lock().unwrap().push(SeenRequest {
        path: uri.path().to_string(),
        host: headers
            .get("host")
            .and_then(|h| h.to_str().ok())
            .unwrap_or_default()
            .to_string(),
        forwarded_for: headers
            .get("x-forwarded-for")
            .and_then(|h| h.to_str().ok())
            .map(String::from),
    });
    "ok"
}

async fn spawn_stub() -> (SocketAddr, Seen) {
    let seen = Seen::default();
    let app = Router::new().fallback(record).with_state(seen.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, seen)
}

#[tokio::test]
async fn forward_rewrites_path_and_host() {
    let (addr, seen) = spawn_stub().await;
    let pool = ProxyPool::new().unwrap();
    let backend = pool.backend(&format!("http://{}", addr)).unwrap();

    let request = Request::builder()
        .method("GET")
        .uri("/acme/users/42")
        .header("host", "gateway.local")
        .body(Body::empty())
        .unwrap();

    let response = pool
        .forward(&backend, "/users/42", request, Some("10.1.2.3"))
        .await;
    assert_eq!(response.status(), 200);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"ok");

    let seen = seen.0.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].path, "/users/42", "tenant prefix must be stripped");
    assert_eq!(
        seen[0].host,
        addr.to_string(),
        "host must be the upstream, not the gateway"
    );
    assert_eq!(seen[0].forwarded_for.as_deref(), Some("10.1.2.3"));
}

#[tokio::test]
async fn forward_appends_to_existing_forwarded_for() {
    let (addr, seen) = spawn_stub().await;
    let pool = ProxyPool::new().unwrap();
    let backend = pool.backend(&format!("http://{}", addr)).unwrap();

    let request = Request::builder()
        .method("GET")
        .uri("/x")
        .header("x-forwarded-for", "203.0.113.9")
        .body(Body::empty())
        .unwrap();

    let response = pool.forward(&backend, "/x", request, Some("10.1.2.3")).await;
    assert_eq!(response.status(), 200);

    let seen = seen.0.lock().unwrap();
    assert_eq!(
        seen[0].forwarded_for.as_deref(),
        Some("203.0.113.9, 10.1.2.3")
    );
}

#[tokio::test]
async fn forward_preserves_query_string() {
    let (addr, seen) = spawn_stub().await;
    let pool = ProxyPool::new().unwrap();
    let backend = pool.backend(&format!("http://{}", addr)).unwrap();

    let request = Request::builder()
        .method("GET")
        .uri("/acme/search?q=rust&page=2")
        .body(Body::empty())
        .unwrap();

    let response = pool
        .forward(&backend, "/search", request, None)
        .await;
    assert_eq!(response.status(), 200);
    assert_eq!(seen.0.lock().unwrap()[0].path, "/search");
}

#[tokio::test]
async fn closed_port_yields_502() {
    // Bind then drop to get a port that refuses connections.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let pool = ProxyPool::new().unwrap();
    let backend = pool.backend(&format!("http://{}", addr)).unwrap();

    let request = Request::builder()
        .method("GET")
        .uri("/anything")
        .body(Body::empty())
        .unwrap();

    let response = pool.forward(&backend, "/anything", request, None).await;
    assert_eq!(response.status(), 502);

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("502"));
    assert!(
        !text.contains(&addr.to_string()),
        "error body must not leak the upstream address"
    );
}
