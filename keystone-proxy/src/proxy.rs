use axum::body::Body;
use axum::response::Response;
use dashmap::DashMap;
use http::header::HeaderName;
use http::Request;
use keystone_core::KeystoneError;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A cached reverse-proxy target. One exists per upstream URL process-wide,
/// created on first use and never evicted.
#[derive(Debug)]
pub struct Backend {
    pub url: String,
    base: reqwest::Url,
}

/// Backend cache plus the shared outbound transport.
///
/// Every backend forwards through the same `reqwest::Client`: pooled
/// keep-alive connections, HTTP/2 via ALPN on TLS upstreams, no redirect
/// following, no response transformation. Entry creation is idempotent, so
/// a racing lookup still converges on a single backend per URL.
pub struct ProxyPool {
    client: reqwest::Client,
    backends: DashMap<String, Arc<Backend>>,
}

impl ProxyPool {
    pub fn new() -> Result<Self, KeystoneError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_gzip()
            .connect_timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| KeystoneError::Internal(format!("proxy transport: {}", e)))?;

        Ok(Self {
            client,
            backends: DashMap::new(),
        })
    }

    /// Resolve (lazily creating) the backend for an upstream URL.
    pub fn backend(&self, url: &str) -> Result<Arc<Backend>, KeystoneError> {
        if let Some(backend) = self.backends.get(url) {
            return Ok(Arc::clone(&backend));
        }

        let base = reqwest::Url::parse(url)
            .map_err(|e| KeystoneError::Config(format!("invalid upstream url '{}': {}", url, e)))?;

        let entry = self
            .backends
            .entry(url.to_string())
            .or_insert_with(|| {
                debug!(upstream = url, "Creating backend");
                Arc::new(Backend {
                    url: url.to_string(),
                    base,
                })
            });
        Ok(Arc::clone(&entry))
    }

    /// Number of cached backends.
    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// Forward a request to `backend`, with the tenant prefix already
    /// stripped from `path`. Bodies stream in both directions; the inbound
    /// `Host` is dropped so the transport sets the upstream host.
    pub async fn forward(
        &self,
        backend: &Backend,
        path: &str,
        request: Request<Body>,
        client_ip: Option<&str>,
    ) -> Response {
        let (parts, body) = request.into_parts();

        let mut url = backend.base.clone();
        let joined = format!("{}{}", url.path().trim_end_matches('/'), path);
        url.set_path(&joined);
        url.set_query(parts.uri.query());

        let mut outbound = self.client.request(parts.method.clone(), url);
        for (name, value) in parts.headers.iter() {
            if forwardable(name) {
                outbound = outbound.header(name, value);
            }
        }
        if let Some(ip) = client_ip {
            let xff = match parts.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                Some(existing) => format!("{}, {}", existing, ip),
                None => ip.to_string(),
            };
            outbound = outbound.header("x-forwarded-for", xff);
        }

        let outbound = outbound.body(reqwest::Body::wrap_stream(body.into_data_stream()));

        match outbound.send().await {
            Ok(upstream) => {
                let mut builder = Response::builder().status(upstream.status());
                for (name, value) in upstream.headers().iter() {
                    if forwardable_response(name) {
                        builder = builder.header(name, value);
                    }
                }
                builder
                    .body(Body::from_stream(upstream.bytes_stream()))
                    .unwrap_or_else(|e| {
                        warn!(upstream = %backend.url, error = %e, "Failed to assemble upstream response");
                        error_response(&KeystoneError::Internal(e.to_string()))
                    })
            }
            Err(e) => {
                warn!(upstream = %backend.url, error = %e, "Upstream unreachable");
                error_response(&KeystoneError::UpstreamUnreachable(backend.url.clone()))
            }
        }
    }
}

fn error_response(err: &KeystoneError) -> Response {
    Response::builder()
        .status(err.status_code())
        .header("content-type", "application/json")
        .body(Body::from(err.to_json_body()))
        .expect("static error response")
}

/// Request headers the proxy passes through. Hop-by-hop headers stay on
/// this hop; `Host` is replaced by the transport; `Content-Length` is
/// recomputed for the streamed body.
fn forwardable(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

/// Response headers passed back to the client. The body streams through
/// unmodified, so entity headers like `Content-Length` survive.
fn forwardable_response(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
