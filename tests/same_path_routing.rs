// Test for verifying multiple routes on same path with different hosts
#[cfg(test)]
mod test {
    use gatehouse::{
        config::{ApiConfig, ServerConfig, UrlMatchConfig},
        core::router::RouteTable,
    };

    fn api(name: &str, host: &str, prefixes: &[(&str, &str)]) -> ApiConfig {
        ApiConfig {
            name: name.to_string(),
            frontend_host: host.to_string(),
            backend_host: format!("{name}.internal"),
            backend_protocol: Default::default(),
            balance: Default::default(),
            servers: vec![ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 3000,
            }],
            url_matches: prefixes
                .iter()
                .map(|(frontend, backend)| UrlMatchConfig {
                    frontend_prefix: frontend.to_string(),
                    backend_prefix: backend.to_string(),
                })
                .collect(),
            settings: Default::default(),
        }
    }

    #[test]
    fn test_same_path_different_hosts() {
        let table = RouteTable::new(
            &[
                api("wild", "*", &[("/", "/")]),
                api("api", "api.example.com", &[("/", "/api-root/")]),
                api("web", "web.example.com", &[("/", "/web-root/")]),
            ],
            None,
        );

        let (route, path) = table.route("api.example.com", "/users").unwrap();
        assert_eq!(route.api_name, "api");
        assert_eq!(path, "/api-root/users");

        let (route, path) = table.route("web.example.com", "/users").unwrap();
        assert_eq!(route.api_name, "web");
        assert_eq!(path, "/web-root/users");

        let (route, _) = table.route("other.example.com", "/users").unwrap();
        assert_eq!(route.api_name, "wild");
    }

    #[test]
    fn test_longest_prefix_beats_exact_host() {
        let table = RouteTable::new(
            &[
                api("exact", "api.example.com", &[("/", "/")]),
                api("deep", "*", &[("/reports/", "/r/")]),
            ],
            None,
        );

        let (route, path) = table.route("api.example.com", "/reports/2024").unwrap();
        assert_eq!(route.api_name, "deep");
        assert_eq!(path, "/r/2024");
    }

    #[test]
    fn test_first_declared_wins_on_tie() {
        let table = RouteTable::new(
            &[
                api("first", "*", &[("/same/", "/one/")]),
                api("second", "*", &[("/same/", "/two/")]),
            ],
            None,
        );

        let (route, path) = table.route("any.host", "/same/x").unwrap();
        assert_eq!(route.api_name, "first");
        assert_eq!(path, "/one/x");
    }

    #[test]
    fn test_no_match() {
        let table = RouteTable::new(&[api("only", "api.example.com", &[("/v1/", "/")])], None);
        assert!(table.route("api.example.com", "/v2/x").is_none());
        assert!(table.route("other.example.com", "/v1/x").is_none());
    }
}
