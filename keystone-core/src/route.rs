use crate::config::TenantConfig;
use crate::error::KeystoneError;
use http::Method;

/// Method constraint on a route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodMatch {
    /// Matches every HTTP method
    Any,
    /// Matches exactly one method
    Exact(Method),
}

impl MethodMatch {
    pub fn parse(s: &str) -> Result<Self, KeystoneError> {
        if s.eq_ignore_ascii_case("any") {
            return Ok(MethodMatch::Any);
        }
        Method::from_bytes(s.to_ascii_uppercase().as_bytes())
            .map(MethodMatch::Exact)
            .map_err(|_| KeystoneError::Config(format!("unknown HTTP method '{}'", s)))
    }

    #[inline]
    pub fn allows(&self, method: &Method) -> bool {
        match self {
            MethodMatch::Any => true,
            MethodMatch::Exact(m) => m == method,
        }
    }
}

/// Terminal target of a route, bound at registration time.
#[derive(Debug, Clone)]
pub enum Target {
    /// Reverse-proxy to the resolved upstream URL
    Proxy { url: String },
    /// Run a scripted chain: middleware in order, then the handler
    Script {
        handler: String,
        middleware: Vec<String>,
    },
}

/// A compiled route entry. Patterns are compiled into the tenant's matchers
/// during router construction; the original pattern is kept for diagnostics.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub method: MethodMatch,
    pub pattern: String,
    pub target: Target,
}

/// Runtime tenant: config with service references resolved to URLs.
#[derive(Debug, Clone)]
pub struct Tenant {
    pub name: String,
    /// Normalised mount prefix; empty string is the catch-all
    pub path_prefix: String,
    pub routes: Vec<RouteEntry>,
}

impl Tenant {
    /// Resolve a validated tenant config into the runtime model.
    pub fn from_config(cfg: &TenantConfig) -> Result<Self, KeystoneError> {
        let mut routes = Vec::with_capacity(cfg.routes.len());

        for rc in &cfg.routes {
            let method = MethodMatch::parse(&rc.method)?;
            let target = match (&rc.upstream, &rc.handler) {
                (Some(upstream), None) => {
                    let url = cfg
                        .services
                        .iter()
                        .find(|s| &s.name == upstream)
                        .map(|s| s.url.clone())
                        .ok_or_else(|| {
                            KeystoneError::Config(format!(
                                "tenant '{}': unknown upstream '{}'",
                                cfg.name, upstream
                            ))
                        })?;
                    Target::Proxy { url }
                }
                (None, Some(handler)) => Target::Script {
                    handler: handler.clone(),
                    middleware: rc.middleware.clone(),
                },
                _ => {
                    return Err(KeystoneError::Config(format!(
                        "tenant '{}': route '{}' needs exactly one of upstream/handler",
                        cfg.name, rc.pattern
                    )));
                }
            };

            routes.push(RouteEntry {
                method,
                pattern: rc.pattern.clone(),
                target,
            });
        }

        Ok(Tenant {
            name: cfg.name.clone(),
            path_prefix: cfg.path_prefix.clone().unwrap_or_default(),
            routes,
        })
    }

    /// Every script symbol (handlers and middleware) referenced by this tenant.
    pub fn referenced_symbols(&self) -> Vec<&str> {
        let mut symbols = Vec::new();
        for route in &self.routes {
            if let Target::Script {
                handler,
                middleware,
            } = &route.target
            {
                symbols.push(handler.as_str());
                symbols.extend(middleware.iter().map(|m| m.as_str()));
            }
        }
        symbols
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RouteConfig, ServiceConfig, TenantConfig};

    fn tenant_cfg() -> TenantConfig {
        TenantConfig {
            name: "acme".into(),
            path_prefix: Some("/acme".into()),
            services: vec![ServiceConfig {
                name: "api".into(),
                url: "http://127.0.0.1:9000".into(),
            }],
            routes: vec![
                RouteConfig {
                    method: "any".into(),
                    pattern: "/*".into(),
                    upstream: Some("api".into()),
                    handler: None,
                    middleware: vec![],
                },
                RouteConfig {
                    method: "GET".into(),
                    pattern: "/hello/{name}".into(),
                    upstream: None,
                    handler: Some("hello".into()),
                    middleware: vec!["auth".into()],
                },
            ],
        }
    }

    #[test]
    fn test_method_match() {
        assert_eq!(MethodMatch::parse("any").unwrap(), MethodMatch::Any);
        assert_eq!(MethodMatch::parse("ANY").unwrap(), MethodMatch::Any);
        assert_eq!(
            MethodMatch::parse("get").unwrap(),
            MethodMatch::Exact(Method::GET)
        );
        assert!(MethodMatch::Any.allows(&Method::DELETE));
        assert!(MethodMatch::Exact(Method::GET).allows(&Method::GET));
        assert!(!MethodMatch::Exact(Method::GET).allows(&Method::POST));
    }

    #[test]
    fn test_upstream_resolution() {
        let tenant = Tenant::from_config(&tenant_cfg()).unwrap();
        assert_eq!(tenant.path_prefix, "/acme");
        match &tenant.routes[0].target {
            Target::Proxy { url } => assert_eq!(url, "http://127.0.0.1:9000"),
            other => panic!("expected proxy target, got {:?}", other),
        }
    }

    #[test]
    fn test_referenced_symbols() {
        let tenant = Tenant::from_config(&tenant_cfg()).unwrap();
        let symbols = tenant.referenced_symbols();
        assert_eq!(symbols, vec!["hello", "auth"]);
    }

    #[test]
    fn test_missing_prefix_is_catch_all() {
        let mut cfg = tenant_cfg();
        cfg.path_prefix = None;
        let tenant = Tenant::from_config(&cfg).unwrap();
        assert_eq!(tenant.path_prefix, "");
    }
}
