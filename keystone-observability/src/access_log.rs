use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Resolved client address, inserted into request extensions by the
/// real-IP middleware and read by the access log, the proxy, and the
/// script request table.
#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

/// Structured access log, one line per completed request.
///
/// Route misses stay at debug so unmatched scans do not flood the log.
pub async fn access_log(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let client_ip = request
        .extensions()
        .get::<ClientIp>()
        .map(|ip| ip.0.clone())
        .unwrap_or_else(|| "-".to_string());

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

    if status == 404 {
        debug!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            client_ip = %client_ip,
            request_id = %request_id,
            "access"
        );
    } else if status >= 500 {
        warn!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            client_ip = %client_ip,
            request_id = %request_id,
            "access"
        );
    } else {
        info!(
            method = %method,
            path = %path,
            status,
            latency_ms,
            client_ip = %client_ip,
            request_id = %request_id,
            "access"
        );
    }

    response
}
