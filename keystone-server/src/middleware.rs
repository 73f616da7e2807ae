use axum::extract::{ConnectInfo, Request};
use axum::middleware::Next;
use axum::response::Response;
use http_body_util::Full;
use keystone_observability::ClientIp;
use std::any::Any;
use std::net::SocketAddr;
use tracing::error;

/// Resolve the client address and stash it in request extensions.
///
/// `X-Forwarded-For` (first hop) wins, then `X-Real-IP`, then the peer
/// address. Downstream consumers: access log, proxy `X-Forwarded-For`
/// append, and the script request table's `remote_addr`.
pub async fn real_ip(mut request: Request, next: Next) -> Response {
    let connect_info = request.extensions().get::<ConnectInfo<SocketAddr>>().copied();

    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let real_ip = request
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let client = forwarded
        .or(real_ip)
        .or_else(|| connect_info.map(|ConnectInfo(addr)| addr.to_string()))
        .unwrap_or_else(|| "-".to_string());

    request.extensions_mut().insert(ClientIp(client));
    next.run(request).await
}

/// Convert a recovered panic into a safe 500. Wired into
/// `CatchPanicLayer::custom` as the outermost native middleware.
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> http::Response<Full<bytes::Bytes>> {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    error!(panic = %detail, "Recovered panic while handling request");

    http::Response::builder()
        .status(http::StatusCode::INTERNAL_SERVER_ERROR)
        .header("content-type", "application/json")
        .body(Full::from(
            &br#"{"error":"internal error","status":500}"#[..],
        ))
        .expect("static panic response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_panic_is_500_and_safe() {
        let response = handle_panic(Box::new("secret internal state".to_string()));
        assert_eq!(response.status(), 500);
        // The body is fixed; panic details only reach the log.
    }
}
