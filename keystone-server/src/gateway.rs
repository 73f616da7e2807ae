use crate::middleware::{handle_panic, real_ip};
use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use http::StatusCode;
use http_body_util::BodyExt;
use keystone_core::route::Target;
use keystone_core::router::TenantRouter;
use keystone_core::{KeystoneConfig, KeystoneError, Tenant};
use keystone_observability::{access_log, ClientIp};
use keystone_proxy::ProxyPool;
use keystone_script::pool::PoolStats;
use keystone_script::types::parse_query;
use keystone_script::{HostContext, ScriptCompiler, ScriptEngine, ScriptRequest, VmFactory, VmPool};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, info, warn};

/// The assembled gateway: router, script engine, and proxy, wired once at
/// startup and shared across request workers.
pub struct Gateway {
    router: TenantRouter,
    engine: ScriptEngine,
    proxy: ProxyPool,
    pool: Arc<VmPool>,
    max_body: usize,
}

impl Gateway {
    /// Build every subsystem from a validated configuration. Any failure
    /// (bad config, compile error, unresolvable symbol) aborts startup
    /// before the listener binds.
    pub fn build(config: &KeystoneConfig) -> anyhow::Result<Arc<Self>> {
        config.validate()?;

        let tenants: Vec<Tenant> = config
            .tenants
            .iter()
            .map(Tenant::from_config)
            .collect::<Result<_, _>>()?;

        let symbols: BTreeSet<&str> = tenants
            .iter()
            .flat_map(|t| t.referenced_symbols())
            .collect();

        let compiler = ScriptCompiler::new();
        let artifacts = if config.script.scripts_dir.is_dir() {
            compiler.compile_dir(&config.script.scripts_dir)?
        } else if symbols.is_empty() {
            Vec::new()
        } else {
            return Err(KeystoneError::Config(format!(
                "routes reference script symbols but scripts_dir '{}' does not exist",
                config.script.scripts_dir.display()
            ))
            .into());
        };

        let host = Arc::new(HostContext::new(
            config.script.http_timeout_secs,
            config.script.max_response_body_bytes,
        )?);
        let pool = VmPool::new(config.script.pool_size, VmFactory::new(artifacts, host))?;

        let symbols: Vec<&str> = symbols.into_iter().collect();
        pool.validate_symbols(&symbols)?;

        let engine = ScriptEngine::new(Arc::clone(&pool));
        let proxy = ProxyPool::new()?;
        let router = TenantRouter::build(tenants)?;

        info!(
            tenants = config.tenants.len(),
            routes = router.route_count(),
            pool_size = config.script.pool_size,
            "Gateway assembled"
        );

        Ok(Arc::new(Self {
            router,
            engine,
            proxy,
            pool,
            max_body: config.limits.max_request_body_bytes,
        }))
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Per-request state machine: match, then proxy or scripted chain.
    async fn handle(&self, request: Request) -> Response {
        let path = request.uri().path();

        // Hostile-path rules come before routing.
        if path.len() > 1024 || path.contains('\0') || path.contains("%00") {
            return not_found(path);
        }

        let method = request.method().clone();
        let Some(matched) = self.router.resolve(&method, path) else {
            return not_found(path);
        };

        match &matched.route.target {
            Target::Proxy { url } => {
                let backend = match self.proxy.backend(url) {
                    Ok(backend) => backend,
                    Err(e) => {
                        warn!(error = %e, "Backend resolution failed");
                        return error_response(&KeystoneError::Internal(e.to_string()));
                    }
                };
                let client_ip = request
                    .extensions()
                    .get::<ClientIp>()
                    .map(|c| c.0.clone());
                self.proxy
                    .forward(&backend, &matched.stripped_path, request, client_ip.as_deref())
                    .await
            }
            Target::Script {
                handler,
                middleware,
            } => {
                let handler = handler.clone();
                let middleware = middleware.clone();
                let params = matched.params;

                let script_request = match self.build_script_request(request, params).await {
                    Ok(r) => r,
                    Err(response) => return response,
                };
                let response = self.engine.execute(&middleware, &handler, script_request).await;
                script_response(response)
            }
        }
    }

    /// Marshal the inbound request for the script engine, reading the body
    /// within the configured bound. Oversized bodies are rejected before
    /// any script runs.
    async fn build_script_request(
        &self,
        request: Request,
        params: Vec<(String, String)>,
    ) -> Result<ScriptRequest, Response> {
        let (parts, body) = request.into_parts();

        if let Some(length) = parts
            .headers
            .get(http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            if length > self.max_body as u64 {
                info!(length, limit = self.max_body, "Request body too large");
                return Err(error_response(&KeystoneError::RequestTooLarge(self.max_body)));
            }
        }

        let body = match http_body_util::Limited::new(body, self.max_body)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                return if is_length_limit(e.as_ref()) {
                    info!(limit = self.max_body, "Request body too large");
                    Err(error_response(&KeystoneError::RequestTooLarge(self.max_body)))
                } else {
                    info!(error = %e, "Failed to read request body");
                    Err(error_response(&KeystoneError::MalformedRequest(
                        e.to_string(),
                    )))
                };
            }
        };

        let host = parts
            .headers
            .get(http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .or_else(|| parts.uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let remote_addr = parts
            .extensions
            .get::<ClientIp>()
            .map(|c| c.0.clone())
            .unwrap_or_else(|| "-".to_string());

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-")
            .to_string();

        let headers = parts
            .headers
            .iter()
            .filter_map(|(k, v)| {
                v.to_str()
                    .ok()
                    .map(|v| (k.as_str().to_string(), v.to_string()))
            })
            .collect();

        let url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());

        Ok(ScriptRequest {
            method: parts.method.as_str().to_string(),
            path: parts.uri.path().to_string(),
            url,
            host,
            remote_addr,
            request_id,
            headers,
            params,
            query: parse_query(parts.uri.query()),
            body,
        })
    }
}

/// Fallback handler bound into the axum router: every request lands here
/// after the native middleware stack.
pub async fn dispatch(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    gateway.handle(request).await
}

/// Assemble the native middleware stack around the dispatch handler.
/// Outermost to innermost: panic recovery, request id, real IP, access
/// log, optional compression, timeout (504), body limit (413).
pub fn app(gateway: Arc<Gateway>, config: &KeystoneConfig) -> Router {
    let mut app = Router::new()
        .fallback(dispatch)
        .with_state(gateway)
        .layer(RequestBodyLimitLayer::new(config.limits.max_request_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::GATEWAY_TIMEOUT,
            Duration::from_secs(config.server.request_timeout_secs),
        ));

    if config.server.compression {
        app = app.layer(CompressionLayer::new());
    }

    app.layer(axum::middleware::from_fn(access_log))
        .layer(axum::middleware::from_fn(real_ip))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(CatchPanicLayer::custom(handle_panic))
}

fn not_found(path: &str) -> Response {
    debug!(path = %path, "Route not found");
    error_response(&KeystoneError::RouteNotFound(path.to_string()))
}

fn error_response(err: &KeystoneError) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header("content-type", "application/json")
        .body(Body::from(err.to_json_body()))
        .expect("static error response")
}

/// Write a script response: status (default already applied), headers set
/// verbatim, body as bytes. A header the `http` crate cannot represent
/// downgrades the response to a logged 500.
fn script_response(response: keystone_script::ScriptResponse) -> Response {
    let status =
        StatusCode::from_u16(response.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in &response.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }
    match builder.body(Body::from(response.body)) {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "Script produced an unwritable response");
            error_response(&KeystoneError::Internal(e.to_string()))
        }
    }
}

fn is_length_limit(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<http_body_util::LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}
