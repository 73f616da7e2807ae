use crate::error::KeystoneError;
use crate::route::{RouteEntry, Tenant};
use http::Method;
use matchit::Router as MatchitRouter;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Reserved parameter name used to translate a trailing `*` into a matchit
/// catch-all. Never surfaced in `params`.
const WILDCARD: &str = "__rest";

/// Static, path-prefix-based route tree built once from configuration.
///
/// Matching is two-level: tenant selection by longest path prefix on a
/// segment boundary, then a radix-trie lookup (via `matchit`) inside the
/// tenant. Method-specific tries are consulted before the any-method trie,
/// and matchit's static > capture > catch-all precedence provides the
/// most-specific-wins ordering. Insertion conflicts keep the first-declared
/// route.
pub struct TenantRouter {
    /// Tenants sorted by prefix length, longest first
    tenants: Vec<CompiledTenant>,
}

struct CompiledTenant {
    name: String,
    prefix: String,
    routes: Vec<RouteEntry>,
    method_routers: HashMap<Method, MatchitRouter<usize>>,
    any_router: MatchitRouter<usize>,
}

/// Result of a route match.
#[derive(Debug)]
pub struct RouteMatch<'a> {
    pub tenant: &'a str,
    pub route: &'a RouteEntry,
    /// Inbound path with the tenant prefix stripped; what proxy targets see
    pub stripped_path: String,
    /// Captured pattern parameters, in path order
    pub params: Vec<(String, String)>,
}

impl TenantRouter {
    /// Compile every tenant's route table. Fails on malformed patterns.
    pub fn build(tenants: Vec<Tenant>) -> Result<Self, KeystoneError> {
        let mut compiled = Vec::with_capacity(tenants.len());

        for tenant in tenants {
            let mut method_routers: HashMap<Method, MatchitRouter<usize>> = HashMap::new();
            let mut any_router = MatchitRouter::new();

            for (idx, route) in tenant.routes.iter().enumerate() {
                let pattern = compile_pattern(&route.pattern)?;
                let targets = insertion_patterns(&pattern);

                let router = match &route.method {
                    crate::route::MethodMatch::Any => &mut any_router,
                    crate::route::MethodMatch::Exact(m) => method_routers
                        .entry(m.clone())
                        .or_insert_with(MatchitRouter::new),
                };

                for p in targets {
                    if let Err(e) = router.insert(p, idx) {
                        // First-declared route wins on pattern conflicts.
                        warn!(
                            tenant = %tenant.name,
                            pattern = %route.pattern,
                            error = %e,
                            "Route pattern conflicts with an earlier declaration; keeping the first"
                        );
                    }
                }
            }

            compiled.push(CompiledTenant {
                name: tenant.name,
                prefix: tenant.path_prefix,
                routes: tenant.routes,
                method_routers,
                any_router,
            });
        }

        // Longest prefix first; declaration order breaks length ties.
        compiled.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));

        Ok(Self { tenants: compiled })
    }

    /// Match an inbound request to exactly one route entry, or none.
    ///
    /// Tenant selection does not fall through: once a prefix matches, a miss
    /// inside that tenant is a miss for the whole request.
    pub fn resolve(&self, method: &Method, path: &str) -> Option<RouteMatch<'_>> {
        let tenant = self
            .tenants
            .iter()
            .find(|t| prefix_matches(&t.prefix, path))?;

        let rest = strip_prefix(&tenant.prefix, path);

        if let Some(router) = tenant.method_routers.get(method) {
            if let Ok(matched) = router.at(&rest) {
                return Some(Self::to_match(tenant, *matched.value, &rest, &matched.params));
            }
        }

        match tenant.any_router.at(&rest) {
            Ok(matched) => Some(Self::to_match(tenant, *matched.value, &rest, &matched.params)),
            Err(_) => {
                debug!(tenant = %tenant.name, path = %path, "No route matched");
                None
            }
        }
    }

    fn to_match<'a>(
        tenant: &'a CompiledTenant,
        idx: usize,
        rest: &str,
        params: &matchit::Params<'_, '_>,
    ) -> RouteMatch<'a> {
        let params = params
            .iter()
            .filter(|(k, _)| *k != WILDCARD)
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        RouteMatch {
            tenant: &tenant.name,
            route: &tenant.routes[idx],
            stripped_path: rest.to_string(),
            params,
        }
    }

    /// Total number of compiled route entries, across all tenants.
    pub fn route_count(&self) -> usize {
        self.tenants.iter().map(|t| t.routes.len()).sum()
    }
}

/// True if `path` lies under `prefix` on a segment boundary.
#[inline]
fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

/// Strip the tenant prefix, always yielding a path that starts with `/`.
#[inline]
fn strip_prefix(prefix: &str, path: &str) -> String {
    let rest = &path[prefix.len()..];
    if rest.is_empty() {
        "/".to_string()
    } else {
        rest.to_string()
    }
}

/// Translate a configured pattern into matchit syntax.
///
/// Supported segment kinds: literal (`/users`), single-segment capture
/// (`/users/{id}`), trailing wildcard (`/*`). Anything else is a
/// configuration error.
fn compile_pattern(pattern: &str) -> Result<String, KeystoneError> {
    if !pattern.starts_with('/') {
        return Err(KeystoneError::Config(format!(
            "pattern '{}' must begin with '/'",
            pattern
        )));
    }
    if pattern == "/" {
        return Ok("/".to_string());
    }

    let segments: Vec<&str> = pattern[1..].split('/').collect();
    let last = segments.len() - 1;
    let mut out = String::new();

    for (i, seg) in segments.iter().enumerate() {
        out.push('/');
        if *seg == "*" {
            if i != last {
                return Err(KeystoneError::Config(format!(
                    "pattern '{}': wildcard is only allowed as the final segment",
                    pattern
                )));
            }
            out.push_str(&format!("{{*{}}}", WILDCARD));
        } else if seg.starts_with('{') && seg.ends_with('}') {
            let name = &seg[1..seg.len() - 1];
            if name.is_empty()
                || name.starts_with("__")
                || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
            {
                return Err(KeystoneError::Config(format!(
                    "pattern '{}': invalid capture name '{}'",
                    pattern, name
                )));
            }
            out.push_str(seg);
        } else if seg.contains(['{', '}', '*']) {
            return Err(KeystoneError::Config(format!(
                "pattern '{}': segment '{}' mixes literals with capture syntax",
                pattern, seg
            )));
        } else {
            out.push_str(seg);
        }
    }

    Ok(out)
}

/// The matchit patterns a compiled pattern is registered under. A root
/// catch-all also registers `/`, since the catch-all parameter itself
/// requires at least one byte after the slash.
fn insertion_patterns(compiled: &str) -> Vec<String> {
    let root_catch_all = format!("/{{*{}}}", WILDCARD);
    if compiled == root_catch_all {
        vec![compiled.to_string(), "/".to_string()]
    } else {
        vec![compiled.to_string()]
    }
}
