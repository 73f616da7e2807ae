use crate::error::KeystoneError;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Top-level configuration for Keystone Gateway.
///
/// Loaded once at startup from YAML plus `KEYSTONE_`-prefixed environment
/// variables and treated as read-only afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoneConfig {
    /// Listener and request-lifecycle settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Protocol-level limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Script engine settings
    #[serde(default)]
    pub script: ScriptConfig,

    /// Log level filter (overridable via RUST_LOG)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Ordered tenant list
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listener address (single port, HTTP/1.1 + HTTP/2)
    #[serde(default = "default_addr")]
    pub addr: SocketAddr,

    /// Per-request deadline enforced by the timeout middleware (seconds)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Bound on in-flight request draining at shutdown (seconds)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,

    /// Enable gzip response compression
    #[serde(default)]
    pub compression: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound request body size (bytes); larger bodies get 413
    #[serde(default = "default_max_body")]
    pub max_request_body_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    /// Number of pre-warmed interpreter instances in the pool
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Directory containing `*.lua` script sources
    #[serde(default = "default_scripts_dir")]
    pub scripts_dir: PathBuf,

    /// Default timeout for script-initiated outbound HTTP (seconds)
    #[serde(default = "default_http_timeout")]
    pub http_timeout_secs: u64,

    /// Cap on outbound HTTP response bodies handed to scripts (bytes)
    #[serde(default = "default_max_response_body")]
    pub max_response_body_bytes: usize,
}

/// A named grouping of routes sharing a path prefix and a service table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub name: String,

    /// Mount prefix, e.g. `/acme`. Absent means catch-all.
    #[serde(default)]
    pub path_prefix: Option<String>,

    /// Named upstream origins reachable from this tenant's routes
    #[serde(default)]
    pub services: Vec<ServiceConfig>,

    /// Ordered route list; declaration order breaks matching ties
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// HTTP method, or "any"
    #[serde(default = "default_method")]
    pub method: String,

    /// Path pattern: literal segments, `{name}` captures, trailing `*`
    pub pattern: String,

    /// Terminal target: a service name from this tenant's table…
    #[serde(default)]
    pub upstream: Option<String>,

    /// …or a script handler symbol. Exactly one of the two.
    #[serde(default)]
    pub handler: Option<String>,

    /// Scripted middleware symbols, run in declared order
    #[serde(default)]
    pub middleware: Vec<String>,
}

impl KeystoneConfig {
    /// Load configuration from a YAML file + environment variables.
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::new();

        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        } else {
            for default_path in &[
                "keystone.yaml",
                "/etc/keystone/keystone.yaml",
                "config/keystone.yaml",
            ] {
                if Path::new(default_path).exists() {
                    figment = figment.merge(Yaml::file(default_path));
                    break;
                }
            }
        }

        // Environment variables override: KEYSTONE_SERVER__ADDR, etc.
        figment = figment.merge(Env::prefixed("KEYSTONE_").split("__"));

        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation. Script symbol resolution happens later, once
    /// the compiler has produced artifacts.
    pub fn validate(&self) -> Result<(), KeystoneError> {
        if self.script.pool_size == 0 {
            return Err(KeystoneError::Config(
                "script.pool_size must be at least 1".into(),
            ));
        }
        if self.limits.max_request_body_bytes == 0 {
            return Err(KeystoneError::Config(
                "limits.max_request_body_bytes must be positive".into(),
            ));
        }

        let mut tenant_names = HashSet::new();
        for tenant in &self.tenants {
            if !tenant_names.insert(tenant.name.as_str()) {
                return Err(KeystoneError::Config(format!(
                    "duplicate tenant name '{}'",
                    tenant.name
                )));
            }

            if let Some(prefix) = &tenant.path_prefix {
                if !prefix.starts_with('/') || prefix.len() > 1 && prefix.ends_with('/') {
                    return Err(KeystoneError::Config(format!(
                        "tenant '{}': path_prefix '{}' must start with '/' and not end with '/'",
                        tenant.name, prefix
                    )));
                }
            }

            let mut service_names = HashSet::new();
            for service in &tenant.services {
                if !service_names.insert(service.name.as_str()) {
                    return Err(KeystoneError::Config(format!(
                        "tenant '{}': duplicate service name '{}'",
                        tenant.name, service.name
                    )));
                }
                if service.url.parse::<http::Uri>().is_err()
                    || !(service.url.starts_with("http://") || service.url.starts_with("https://"))
                {
                    return Err(KeystoneError::Config(format!(
                        "tenant '{}': service '{}' has invalid url '{}'",
                        tenant.name, service.name, service.url
                    )));
                }
            }

            for route in &tenant.routes {
                route.validate(tenant)?;
            }
        }

        Ok(())
    }
}

impl RouteConfig {
    fn validate(&self, tenant: &TenantConfig) -> Result<(), KeystoneError> {
        if !self.pattern.starts_with('/') {
            return Err(KeystoneError::Config(format!(
                "tenant '{}': pattern '{}' must begin with '/'",
                tenant.name, self.pattern
            )));
        }

        if self.method != "any" && http::Method::from_bytes(self.method.as_bytes()).is_err() {
            return Err(KeystoneError::Config(format!(
                "tenant '{}': unknown method '{}' on pattern '{}'",
                tenant.name, self.method, self.pattern
            )));
        }

        match (&self.upstream, &self.handler) {
            (Some(_), Some(_)) => {
                return Err(KeystoneError::Config(format!(
                    "tenant '{}': route '{}' declares both an upstream and a handler",
                    tenant.name, self.pattern
                )));
            }
            (None, None) => {
                return Err(KeystoneError::Config(format!(
                    "tenant '{}': route '{}' declares neither an upstream nor a handler",
                    tenant.name, self.pattern
                )));
            }
            (Some(upstream), None) => {
                if !tenant.services.iter().any(|s| &s.name == upstream) {
                    return Err(KeystoneError::Config(format!(
                        "tenant '{}': route '{}' references unknown upstream '{}'",
                        tenant.name, self.pattern, upstream
                    )));
                }
                if !self.middleware.is_empty() {
                    return Err(KeystoneError::Config(format!(
                        "tenant '{}': route '{}' attaches script middleware to a proxy target",
                        tenant.name, self.pattern
                    )));
                }
            }
            (None, Some(_)) => {}
        }

        Ok(())
    }
}

// Default implementations

impl Default for KeystoneConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            limits: LimitsConfig::default(),
            script: ScriptConfig::default(),
            log_level: default_log_level(),
            tenants: vec![],
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
            compression: false,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_body_bytes: default_max_body(),
        }
    }
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            scripts_dir: default_scripts_dir(),
            http_timeout_secs: default_http_timeout(),
            max_response_body_bytes: default_max_response_body(),
        }
    }
}

// Serde default functions

fn default_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_grace() -> u64 {
    10
}

fn default_max_body() -> usize {
    10 * 1024 * 1024
}

fn default_pool_size() -> usize {
    8
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("scripts")
}

fn default_http_timeout() -> u64 {
    10
}

fn default_max_response_body() -> usize {
    8 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_method() -> String {
    "any".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(method: &str, pattern: &str, upstream: Option<&str>, handler: Option<&str>) -> RouteConfig {
        RouteConfig {
            method: method.to_string(),
            pattern: pattern.to_string(),
            upstream: upstream.map(String::from),
            handler: handler.map(String::from),
            middleware: vec![],
        }
    }

    fn tenant(name: &str, prefix: Option<&str>, routes: Vec<RouteConfig>) -> TenantConfig {
        TenantConfig {
            name: name.to_string(),
            path_prefix: prefix.map(String::from),
            services: vec![ServiceConfig {
                name: "api".into(),
                url: "http://127.0.0.1:9000".into(),
            }],
            routes,
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = KeystoneConfig::default();
        assert_eq!(cfg.server.addr.port(), 8080);
        assert_eq!(cfg.limits.max_request_body_bytes, 10 * 1024 * 1024);
        assert_eq!(cfg.script.pool_size, 8);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_zero_pool_size_rejected() {
        let mut cfg = KeystoneConfig::default();
        cfg.script.pool_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_route_requires_exactly_one_target() {
        let mut cfg = KeystoneConfig::default();
        cfg.tenants = vec![tenant("t", None, vec![route("GET", "/a", Some("api"), Some("h"))])];
        assert!(cfg.validate().is_err());

        cfg.tenants = vec![tenant("t", None, vec![route("GET", "/a", None, None)])];
        assert!(cfg.validate().is_err());

        cfg.tenants = vec![tenant("t", None, vec![route("GET", "/a", Some("api"), None)])];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_unknown_upstream_rejected() {
        let mut cfg = KeystoneConfig::default();
        cfg.tenants = vec![tenant("t", None, vec![route("GET", "/a", Some("nope"), None)])];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_pattern_must_start_with_slash() {
        let mut cfg = KeystoneConfig::default();
        cfg.tenants = vec![tenant("t", None, vec![route("GET", "a", None, Some("h"))])];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_method_rejected() {
        let mut cfg = KeystoneConfig::default();
        cfg.tenants = vec![tenant("t", None, vec![route("FETCH??", "/a", None, Some("h"))])];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_duplicate_tenant_rejected() {
        let mut cfg = KeystoneConfig::default();
        cfg.tenants = vec![tenant("t", None, vec![]), tenant("t", Some("/t"), vec![])];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_prefix_shape() {
        let mut cfg = KeystoneConfig::default();
        cfg.tenants = vec![tenant("t", Some("acme"), vec![])];
        assert!(cfg.validate().is_err());

        cfg.tenants = vec![tenant("t", Some("/acme/"), vec![])];
        assert!(cfg.validate().is_err());

        cfg.tenants = vec![tenant("t", Some("/acme"), vec![])];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_load_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keystone.yaml");
        std::fs::write(
            &path,
            r#"
server:
  addr: "127.0.0.1:8888"
script:
  pool_size: 2
tenants:
  - name: acme
    path_prefix: /acme
    services:
      - name: api
        url: "http://127.0.0.1:9000"
    routes:
      - method: any
        pattern: /*
        upstream: api
"#,
        )
        .unwrap();

        let cfg = KeystoneConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.server.addr.port(), 8888);
        assert_eq!(cfg.script.pool_size, 2);
        assert_eq!(cfg.tenants.len(), 1);
        assert_eq!(cfg.tenants[0].routes[0].method, "any");
    }

    #[test]
    fn test_middleware_on_proxy_route_rejected() {
        let mut cfg = KeystoneConfig::default();
        let mut r = route("GET", "/a", Some("api"), None);
        r.middleware = vec!["auth".into()];
        cfg.tenants = vec![tenant("t", None, vec![r])];
        assert!(cfg.validate().is_err());
    }
}
