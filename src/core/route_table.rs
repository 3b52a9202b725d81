//! Immutable route table, rebuilt and swapped wholesale on reload.
use std::sync::Arc;

use http::Method;

use crate::{config::RouteConfig, core::error::GatewayError};

#[derive(Debug, Default)]
pub struct RouteTable {
    /// Longest path first so the first hit is the most specific one
    routes: Vec<Arc<RouteConfig>>,
}

impl RouteTable {
    pub fn new(routes: Vec<RouteConfig>) -> Self {
        let mut routes: Vec<Arc<RouteConfig>> = routes
            .into_iter()
            .map(|mut route| {
                route.path = normalize_prefix(&route.path);
                Arc::new(route)
            })
            .collect();
        routes.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.path.cmp(&b.path)));
        Self { routes }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn routes(&self) -> impl Iterator<Item = &Arc<RouteConfig>> {
        self.routes.iter()
    }

    /// Longest prefix (on a segment boundary) whose method list admits `method`.
    pub fn find(&self, method: &Method, path: &str) -> Result<Arc<RouteConfig>, GatewayError> {
        self.routes
            .iter()
            .find(|route| {
                prefix_matches(&route.path, path) && method_allowed(&route.methods, method)
            })
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("No route for {method} {path}")))
    }
}

fn normalize_prefix(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn prefix_matches(prefix: &str, path: &str) -> bool {
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

fn method_allowed(methods: &[String], method: &Method) -> bool {
    methods.is_empty()
        || methods
            .iter()
            .any(|m| m == "*" || m.eq_ignore_ascii_case(method.as_str()))
}

/// Path sent upstream for a request that matched `route`.
pub fn upstream_path(route: &RouteConfig, path: &str) -> String {
    if !route.strip_prefix || route.path == "/" {
        return path.to_string();
    }
    match path.strip_prefix(route.path.as_str()) {
        Some("") | None => "/".to_string(),
        Some(rest) => rest.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> RouteTable {
        RouteTable::new(vec![
            RouteConfig::new("/", "fallback"),
            RouteConfig::new("/api", "api"),
            RouteConfig::new("/api/orders/", "orders").methods(&["GET", "POST"]),
            RouteConfig::new("/api/orders", "orders-admin").methods(&["DELETE"]),
        ])
    }

    #[test]
    fn longest_prefix_on_segment_boundary() {
        let table = table();
        assert_eq!(table.find(&Method::GET, "/api/orders/42").unwrap().target, "orders");
        assert_eq!(table.find(&Method::GET, "/api/orders").unwrap().target, "orders");
        assert_eq!(table.find(&Method::GET, "/api/ordersx").unwrap().target, "api");
        assert_eq!(table.find(&Method::GET, "/apiv2").unwrap().target, "fallback");
    }

    #[test]
    fn method_filter_falls_through_to_shorter_prefix() {
        let table = table();
        assert_eq!(
            table.find(&Method::DELETE, "/api/orders/1").unwrap().target,
            "orders-admin"
        );
        assert_eq!(table.find(&Method::PUT, "/api/orders/1").unwrap().target, "api");
    }

    #[test]
    fn no_match_is_not_found() {
        let table = RouteTable::new(vec![RouteConfig::new("/api", "api").methods(&["GET"])]);
        assert!(matches!(
            table.find(&Method::GET, "/other"),
            Err(GatewayError::NotFound(_))
        ));
        assert!(matches!(
            table.find(&Method::POST, "/api"),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[test]
    fn strip_prefix_rewrites_path() {
        let route = RouteConfig::new("/users", "users").strip_prefix();
        let table = RouteTable::new(vec![route]);
        let route = table.find(&Method::GET, "/users/7").unwrap();
        assert_eq!(upstream_path(&route, "/users/7"), "/7");
        assert_eq!(upstream_path(&route, "/users"), "/");

        let keep = RouteConfig::new("/users", "users");
        assert_eq!(upstream_path(&keep, "/users/7"), "/users/7");
    }
}
