use crate::types::{ScriptRequest, ScriptResponse};
use futures_util::StreamExt;
use keystone_core::KeystoneError;
use mlua::{Lua, Table, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Process-wide host state reachable from script bindings.
///
/// The two clients differ only in redirect policy; both share pooled
/// connections and the configured default timeout. Created once at startup
/// and installed into every interpreter instance.
pub struct HostContext {
    http: reqwest::Client,
    http_no_redirect: reqwest::Client,
    max_response_body_bytes: usize,
}

impl HostContext {
    pub fn new(timeout_secs: u64, max_response_body_bytes: usize) -> Result<Self, KeystoneError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| KeystoneError::Internal(format!("script http client: {}", e)))?;
        let http_no_redirect = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| KeystoneError::Internal(format!("script http client: {}", e)))?;

        Ok(Self {
            http,
            http_no_redirect,
            max_response_body_bytes,
        })
    }
}

/// Install the host vocabulary into a VM: `log`, `http_get`, `http_post`,
/// `get_env`. Marshalling helpers stay on the Rust side.
pub fn register(lua: &Lua, host: Arc<HostContext>) -> mlua::Result<()> {
    let globals = lua.globals();

    globals.set(
        "log",
        lua.create_function(|_, (level, message): (String, String)| {
            match level.to_ascii_lowercase().as_str() {
                "trace" => trace!(script = true, "{}", message),
                "debug" => debug!(script = true, "{}", message),
                "warn" | "warning" => warn!(script = true, "{}", message),
                "error" => error!(script = true, "{}", message),
                _ => info!(script = true, "{}", message),
            }
            Ok(())
        })?,
    )?;

    globals.set(
        "get_env",
        lua.create_function(|_, name: String| Ok(std::env::var(&name).ok()))?,
    )?;

    let get_host = Arc::clone(&host);
    globals.set(
        "http_get",
        lua.create_async_function(
            move |lua, (url, headers, follow): (String, Option<Table>, Option<bool>)| {
                let host = Arc::clone(&get_host);
                async move {
                    let client = if follow.unwrap_or(true) {
                        &host.http
                    } else {
                        &host.http_no_redirect
                    };
                    let mut request = client.get(&url);
                    if let Some(headers) = headers {
                        for pair in headers.pairs::<String, String>() {
                            let (k, v) = pair?;
                            request = request.header(k.as_str(), v.as_str());
                        }
                    }
                    match send_bounded(request, host.max_response_body_bytes).await {
                        Ok((status, headers, body)) => Ok((
                            Value::Table(outbound_response_table(&lua, status, headers, body)?),
                            None,
                        )),
                        Err(message) => Ok((Value::Nil, Some(message))),
                    }
                }
            },
        )?,
    )?;

    let post_host = host;
    globals.set(
        "http_post",
        lua.create_async_function(
            move |lua, (url, body, headers): (String, mlua::String, Option<Table>)| {
                let host = Arc::clone(&post_host);
                let body = body.as_bytes().to_vec();
                async move {
                    let mut request = host.http.post(&url).body(body);
                    if let Some(headers) = headers {
                        for pair in headers.pairs::<String, String>() {
                            let (k, v) = pair?;
                            request = request.header(k.as_str(), v.as_str());
                        }
                    }
                    match send_bounded(request, host.max_response_body_bytes).await {
                        Ok((status, headers, body)) => Ok((
                            Value::Table(outbound_response_table(&lua, status, headers, body)?),
                            None,
                        )),
                        Err(message) => Ok((Value::Nil, Some(message))),
                    }
                }
            },
        )?,
    )?;

    Ok(())
}

/// Send an outbound request, capping the response body so a hostile origin
/// cannot exhaust host memory.
async fn send_bounded(
    request: reqwest::RequestBuilder,
    cap: usize,
) -> Result<(u16, Vec<(String, String)>, Vec<u8>), String> {
    let response = request.send().await.map_err(|e| e.to_string())?;

    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| {
            v.to_str()
                .ok()
                .map(|v| (canonical_header_key(k.as_str()), v.to_string()))
        })
        .collect();

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| e.to_string())?;
        if body.len() + chunk.len() > cap {
            return Err(format!("response body exceeds {} bytes", cap));
        }
        body.extend_from_slice(&chunk);
    }

    Ok((status, headers, body))
}

fn outbound_response_table(
    lua: &Lua,
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set("status", status)?;
    let header_table = lua.create_table()?;
    for (k, v) in headers {
        header_table.set(k, v)?;
    }
    table.set("headers", header_table)?;
    table.set("body", lua.create_string(&body)?)?;
    Ok(table)
}

/// Canonical HTTP header form (`content-type` → `Content-Type`), so scripts
/// index `headers` the way the wire shows them.
pub fn canonical_header_key(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            out.extend(c.to_uppercase());
        } else {
            out.extend(c.to_lowercase());
        }
        upper = c == '-';
    }
    out
}

/// Build the request table handed to handlers and middleware.
pub fn build_request_table(lua: &Lua, request: &ScriptRequest) -> mlua::Result<Table> {
    let table = lua.create_table()?;
    table.set("method", request.method.as_str())?;
    table.set("path", request.path.as_str())?;
    table.set("url", request.url.as_str())?;
    table.set("host", request.host.as_str())?;
    table.set("remote_addr", request.remote_addr.as_str())?;

    let headers = lua.create_table()?;
    for (k, v) in &request.headers {
        headers.set(canonical_header_key(k), v.as_str())?;
    }
    table.set("headers", headers)?;

    let params = lua.create_table()?;
    for (k, v) in &request.params {
        params.set(k.as_str(), v.as_str())?;
    }
    table.set("params", params)?;

    let query = lua.create_table()?;
    for (k, v) in &request.query {
        query.set(k.as_str(), v.as_str())?;
    }
    table.set("query", query)?;

    table.set("body", lua.create_string(&request.body)?)?;

    Ok(table)
}

/// Read a response table back from a script return value. `None` means the
/// value was not a table (nil, or something the contract does not allow).
pub fn read_response_table(value: &Value) -> Option<ScriptResponse> {
    let Value::Table(table) = value else {
        return None;
    };

    let status = table
        .get::<Option<u16>>("status")
        .ok()
        .flatten()
        .unwrap_or(200);

    let mut headers = Vec::new();
    if let Ok(Some(header_table)) = table.get::<Option<Table>>("headers") {
        for pair in header_table.pairs::<String, String>() {
            if let Ok((k, v)) = pair {
                headers.push((k, v));
            }
        }
    }

    let body = table
        .get::<Option<mlua::String>>("body")
        .ok()
        .flatten()
        .map(|s| s.as_bytes().to_vec())
        .unwrap_or_default();

    Some(ScriptResponse {
        status,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn test_host() -> Arc<HostContext> {
        Arc::new(HostContext::new(2, 1024 * 1024).unwrap())
    }

    #[test]
    fn test_canonical_header_key() {
        assert_eq!(canonical_header_key("content-type"), "Content-Type");
        assert_eq!(canonical_header_key("authorization"), "Authorization");
        assert_eq!(canonical_header_key("x-request-id"), "X-Request-Id");
        assert_eq!(canonical_header_key("HOST"), "Host");
    }

    #[test]
    fn test_build_request_table() {
        let lua = Lua::new();
        let request = ScriptRequest {
            method: "GET".into(),
            path: "/hello/world".into(),
            url: "/hello/world?a=1".into(),
            host: "gw.local".into(),
            remote_addr: "10.0.0.1:5555".into(),
            request_id: "r1".into(),
            headers: vec![("authorization".into(), "Bearer t".into())],
            params: vec![("name".into(), "world".into())],
            query: vec![("a".into(), "1".into())],
            body: Bytes::from_static(b"payload"),
        };

        let table = build_request_table(&lua, &request).unwrap();
        assert_eq!(table.get::<String>("method").unwrap(), "GET");
        assert_eq!(table.get::<String>("path").unwrap(), "/hello/world");

        let headers: Table = table.get("headers").unwrap();
        assert_eq!(
            headers.get::<String>("Authorization").unwrap(),
            "Bearer t",
            "header names must be canonicalised"
        );

        let params: Table = table.get("params").unwrap();
        assert_eq!(params.get::<String>("name").unwrap(), "world");

        let body: mlua::String = table.get("body").unwrap();
        assert_eq!(&*body.as_bytes(), b"payload");
    }

    #[test]
    fn test_read_response_table() {
        let lua = Lua::new();
        let value: Value = lua
            .load(r#"return {status=201, headers={["X-Custom"]="v"}, body="created"}"#)
            .eval()
            .unwrap();

        let resp = read_response_table(&value).unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(resp.headers, vec![("X-Custom".to_string(), "v".to_string())]);
        assert_eq!(resp.body, b"created");
    }

    #[test]
    fn test_read_response_table_defaults() {
        let lua = Lua::new();
        let value: Value = lua.load("return {}").eval().unwrap();
        let resp = read_response_table(&value).unwrap();
        assert_eq!(resp.status, 200);
        assert!(resp.headers.is_empty());
        assert!(resp.body.is_empty());
    }

    #[test]
    fn test_read_response_table_rejects_non_table() {
        assert!(read_response_table(&Value::Nil).is_none());
        let lua = Lua::new();
        let value: Value = lua.load(r#"return "oops""#).eval().unwrap();
        assert!(read_response_table(&value).is_none());
    }

    #[test]
    fn test_get_env_binding() {
        let lua = Lua::new();
        register(&lua, test_host()).unwrap();
        std::env::set_var("KEYSTONE_BINDING_TEST", "42");

        let value: Option<String> = lua
            .load(r#"return get_env("KEYSTONE_BINDING_TEST")"#)
            .eval()
            .unwrap();
        assert_eq!(value.as_deref(), Some("42"));

        let missing: Option<String> = lua
            .load(r#"return get_env("KEYSTONE_BINDING_TEST_MISSING")"#)
            .eval()
            .unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_log_binding_does_not_error() {
        let lua = Lua::new();
        register(&lua, test_host()).unwrap();
        lua.load(r#"log("info", "hello"); log("nonsense-level", "still fine")"#)
            .exec()
            .unwrap();
    }

    #[tokio::test]
    async fn test_http_get_connection_failure_returns_nil_and_message() {
        let lua = Lua::new();
        register(&lua, test_host()).unwrap();

        let func: mlua::Function = lua.globals().get("http_get").unwrap();
        let result: mlua::MultiValue = func
            .call_async("http://127.0.0.1:9/unreachable")
            .await
            .unwrap();

        let mut iter = result.into_iter();
        assert!(matches!(iter.next(), Some(Value::Nil)));
        match iter.next() {
            Some(Value::String(msg)) => assert!(!msg.to_string_lossy().is_empty()),
            other => panic!("expected error message, got {:?}", other),
        }
    }
}
