//! Host and path-prefix routing over an immutable route table.
//!
//! Every configured API contributes one [`BackendRoute`] per url match, in
//! declaration order. Lookup picks the longest matching `frontend_prefix`;
//! on equal length an exact host beats the `*` wildcard, and after that the
//! first declared route wins. A small set of internal prefixes is checked
//! before any of that and can never be shadowed by configuration.

use std::sync::Arc;

use crate::{
    config::{AdminConfig, ApiConfig, ApiSettings, BackendProtocol, ServerConfig},
    core::load_balancer::{LoadBalancerFactory, LoadBalancingStrategy},
};

pub const ADMIN_PREFIX: &str = "/admin";
pub const GATEWAY_API_PREFIX: &str = "/_gateway/";

/// One routing rule, immutable for the lifetime of a snapshot.
#[derive(Debug)]
pub struct BackendRoute {
    pub api_name: String,
    pub frontend_host: String,
    pub frontend_prefix: String,
    pub backend_host: String,
    pub backend_prefix: String,
    pub backend_protocol: BackendProtocol,
    pub servers: Vec<ServerConfig>,
    pub settings: Arc<ApiSettings>,
    pub balancer: Box<dyn LoadBalancingStrategy>,
}

impl BackendRoute {
    pub fn is_wildcard(&self) -> bool {
        self.frontend_host == "*"
    }

    fn host_matches(&self, host: &str) -> bool {
        self.is_wildcard() || strip_port(&self.frontend_host).eq_ignore_ascii_case(host)
    }

    /// Substitute `backend_prefix` for the matched `frontend_prefix`.
    pub fn rewrite_path(&self, path: &str) -> String {
        match path.strip_prefix(&self.frontend_prefix) {
            Some(rest) => format!("{}{}", self.backend_prefix, rest),
            None => path.to_string(),
        }
    }
}

/// Routes answered by the gateway itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalRoute {
    Admin,
    GatewayApi,
}

#[derive(Debug, Clone)]
pub enum RouteMatch {
    Internal(InternalRoute),
    Backend {
        route: Arc<BackendRoute>,
        rewritten_path: String,
    },
}

/// Ordered, immutable route list built from one configuration snapshot.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<BackendRoute>>,
    admin: Option<Arc<BackendRoute>>,
}

impl RouteTable {
    pub fn new(apis: &[ApiConfig], admin: Option<&AdminConfig>) -> Self {
        let mut routes = Vec::new();
        for api in apis {
            let settings = Arc::new(api.settings.clone());
            for url_match in &api.url_matches {
                routes.push(Arc::new(BackendRoute {
                    api_name: api.name.clone(),
                    frontend_host: api.frontend_host.clone(),
                    frontend_prefix: url_match.frontend_prefix.clone(),
                    backend_host: api.backend_host.clone(),
                    backend_prefix: url_match.backend_prefix.clone(),
                    backend_protocol: api.backend_protocol,
                    servers: api.servers.clone(),
                    settings: settings.clone(),
                    balancer: LoadBalancerFactory::create_strategy(api.balance),
                }));
            }
        }

        let admin = admin.map(|admin| {
            Arc::new(BackendRoute {
                api_name: "admin".to_string(),
                frontend_host: "*".to_string(),
                frontend_prefix: ADMIN_PREFIX.to_string(),
                backend_host: admin.backend_host.clone(),
                backend_prefix: ADMIN_PREFIX.to_string(),
                backend_protocol: admin.backend_protocol,
                servers: admin.servers.clone(),
                settings: Arc::new(ApiSettings::default()),
                balancer: LoadBalancerFactory::create_strategy(Default::default()),
            })
        });

        Self { routes, admin }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> &[Arc<BackendRoute>] {
        &self.routes
    }

    /// Upstream route for the admin application, when one is configured.
    pub fn admin_route(&self) -> Option<&Arc<BackendRoute>> {
        self.admin.as_ref()
    }

    /// Full lookup including internal routes.
    pub fn resolve(&self, host: &str, path: &str) -> Option<RouteMatch> {
        if let Some(internal) = internal_route(path) {
            return Some(RouteMatch::Internal(internal));
        }
        self.route(host, path)
            .map(|(route, rewritten_path)| RouteMatch::Backend {
                route,
                rewritten_path,
            })
    }

    /// Match configured routes only and rewrite the path for the backend.
    pub fn route(&self, host: &str, path: &str) -> Option<(Arc<BackendRoute>, String)> {
        let host = strip_port(host);
        let mut best: Option<&Arc<BackendRoute>> = None;

        for candidate in &self.routes {
            if !candidate.host_matches(host) || !path.starts_with(&candidate.frontend_prefix) {
                continue;
            }
            let better = match best {
                None => true,
                Some(current) => {
                    let (len, current_len) =
                        (candidate.frontend_prefix.len(), current.frontend_prefix.len());
                    len > current_len
                        || (len == current_len && current.is_wildcard() && !candidate.is_wildcard())
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        best.map(|route| (route.clone(), route.rewrite_path(path)))
    }
}

fn internal_route(path: &str) -> Option<InternalRoute> {
    if path == ADMIN_PREFIX || path.starts_with("/admin/") {
        Some(InternalRoute::Admin)
    } else if path.starts_with(GATEWAY_API_PREFIX) {
        Some(InternalRoute::GatewayApi)
    } else {
        None
    }
}

/// Drop a trailing `:port` (IPv6 literals keep their brackets).
pub fn strip_port(host: &str) -> &str {
    if let Some(end) = host.strip_prefix('[').and_then(|_| host.find(']')) {
        return &host[..=end];
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UrlMatchConfig;

    fn api(name: &str, host: &str, matches: &[(&str, &str)]) -> ApiConfig {
        ApiConfig {
            name: name.to_string(),
            frontend_host: host.to_string(),
            backend_host: format!("{name}.backend"),
            backend_protocol: BackendProtocol::Http,
            balance: Default::default(),
            servers: vec![ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 9444,
            }],
            url_matches: matches
                .iter()
                .map(|(f, b)| UrlMatchConfig {
                    frontend_prefix: f.to_string(),
                    backend_prefix: b.to_string(),
                })
                .collect(),
            settings: Default::default(),
        }
    }

    fn name_of(table: &RouteTable, host: &str, path: &str) -> Option<String> {
        table.route(host, path).map(|(r, _)| r.api_name.clone())
    }

    #[test]
    fn longest_prefix_wins_regardless_of_order() {
        let table = RouteTable::new(
            &[
                api("short", "localhost", &[("/api/", "/")]),
                api("long", "localhost", &[("/api/v2/", "/v2/")]),
            ],
            None,
        );
        assert_eq!(name_of(&table, "localhost", "/api/v2/users").as_deref(), Some("long"));
        assert_eq!(name_of(&table, "localhost", "/api/v1/users").as_deref(), Some("short"));
    }

    #[test]
    fn exact_host_beats_wildcard_on_equal_prefix() {
        let table = RouteTable::new(
            &[
                api("wild", "*", &[("/hello", "/")]),
                api("exact", "example.com", &[("/hello", "/")]),
            ],
            None,
        );
        assert_eq!(name_of(&table, "example.com:9080", "/hello").as_deref(), Some("exact"));
        assert_eq!(name_of(&table, "unknown.foo", "/hello").as_deref(), Some("wild"));
    }

    #[test]
    fn first_declared_wins_full_ties() {
        let table = RouteTable::new(
            &[
                api("first", "*", &[("/x", "/")]),
                api("second", "*", &[("/x", "/")]),
            ],
            None,
        );
        assert_eq!(name_of(&table, "h", "/x").as_deref(), Some("first"));
    }

    #[test]
    fn longer_wildcard_prefix_beats_shorter_exact_host() {
        let table = RouteTable::new(
            &[
                api("exact", "example.com", &[("/", "/")]),
                api("wild", "*", &[("/special/", "/")]),
            ],
            None,
        );
        assert_eq!(name_of(&table, "example.com", "/special/a").as_deref(), Some("wild"));
    }

    #[test]
    fn host_match_is_case_insensitive_and_ignores_port() {
        let table = RouteTable::new(&[api("a", "Example.COM", &[("/", "/")])], None);
        assert!(table.route("example.com:8080", "/").is_some());
        assert!(table.route("other.com", "/").is_none());
    }

    #[test]
    fn rewrites_prefix() {
        let table = RouteTable::new(&[api("a", "*", &[("/front/end/path", "/backend-prefix")])], None);
        let (_, rewritten) = table.route("h", "/front/end/path/info?x=1").unwrap();
        assert_eq!(rewritten, "/backend-prefix/info?x=1");
    }

    #[test]
    fn internal_routes_shadow_user_routes() {
        let table = RouteTable::new(&[api("a", "*", &[("/admin/", "/")])], None);
        assert!(matches!(
            table.resolve("h", "/admin/login"),
            Some(RouteMatch::Internal(InternalRoute::Admin))
        ));
        assert!(matches!(
            table.resolve("h", "/admin"),
            Some(RouteMatch::Internal(InternalRoute::Admin))
        ));
        assert!(matches!(
            table.resolve("h", "/_gateway/health"),
            Some(RouteMatch::Internal(InternalRoute::GatewayApi))
        ));
        assert!(matches!(
            table.resolve("h", "/administrator"),
            None
        ));
    }

    #[test]
    fn strip_port_handles_names_and_literals() {
        assert_eq!(strip_port("example.com:80"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:9080"), "[::1]");
    }
}
