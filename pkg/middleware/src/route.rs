//! Route name resolution for span operation names.
//!
//! Route names must be low-cardinality: `/orders/42` and `/orders/43` resolve
//! to the same name.
use axum::extract::MatchedPath;
use http::Method;

use crate::request::RequestHead;

/// Resolves a request to a canonical route name.
///
/// Returning `None` (or an empty name) means the request did not match a route.
pub trait RouteMatcher: Send + Sync {
    fn route_name(&self, request: &RequestHead<'_>) -> Option<String>;
}

impl<F> RouteMatcher for F
where
    F: Fn(&RequestHead<'_>) -> Option<String> + Send + Sync,
{
    fn route_name(&self, request: &RequestHead<'_>) -> Option<String> {
        self(request)
    }
}

/// A single named route in a [`RouteTable`].
#[derive(Debug, Clone)]
struct Route {
    /// `None` matches any method.
    method: Option<Method>,
    pattern: String,
    name: String,
}

/// An ordered table of named routes. The first matching route wins.
///
/// Patterns are split on `/`. A `*` or `{param}` segment matches any single
/// segment, all other segments must match exactly.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    /// Creates an empty [`RouteTable`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a route that matches `pattern` for the given method only.
    pub fn route<P, N>(mut self, method: Method, pattern: P, name: N) -> Self
    where
        P: Into<String>,
        N: Into<String>,
    {
        self.routes.push(Route {
            method: Some(method),
            pattern: pattern.into(),
            name: name.into(),
        });
        self
    }

    /// Adds a route that matches `pattern` for every method.
    pub fn any<P, N>(mut self, pattern: P, name: N) -> Self
    where
        P: Into<String>,
        N: Into<String>,
    {
        self.routes.push(Route {
            method: None,
            pattern: pattern.into(),
            name: name.into(),
        });
        self
    }
}

impl RouteMatcher for RouteTable {
    fn route_name(&self, request: &RequestHead<'_>) -> Option<String> {
        let path = request.uri.path();
        self.routes
            .iter()
            .filter(|r| r.method.as_ref().is_none_or(|m| m == request.method))
            .find(|r| matches_pattern(&r.pattern, path))
            .map(|r| r.name.clone())
    }
}

/// Names requests after the axum route template they were matched against.
///
/// Requires the tracer to be installed with `Router::layer` so that the
/// [`MatchedPath`] extension is present.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchedPathRoutes;

impl RouteMatcher for MatchedPathRoutes {
    fn route_name(&self, request: &RequestHead<'_>) -> Option<String> {
        request
            .extensions
            .get::<MatchedPath>()
            .map(|path| make_label_value(path.as_str()))
    }
}

/// Converts a route template into a label-safe value.
///
/// Runs of non-alphanumeric characters become a single `_`, leading and
/// trailing underscores are trimmed and the result is lowercased. An empty
/// result becomes `root`.
pub fn make_label_value(path: &str) -> String {
    let mut label = String::with_capacity(path.len());
    let mut pending_separator = false;
    for c in path.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_separator && !label.is_empty() {
                label.push('_');
            }
            pending_separator = false;
            label.push(c.to_ascii_lowercase());
        } else {
            pending_separator = true;
        }
    }

    if label.is_empty() {
        return String::from("root");
    }
    label
}

fn matches_pattern(pattern: &str, path: &str) -> bool {
    let pattern_parts: Vec<&str> = pattern.split('/').collect();
    let path_parts: Vec<&str> = path.split('/').collect();

    if pattern_parts.len() != path_parts.len() {
        return false;
    }

    for (pattern, path) in pattern_parts.iter().zip(path_parts.iter()) {
        if *pattern == "*" || is_param(pattern) {
            continue;
        }
        if pattern != path {
            return false;
        }
    }
    true
}

fn is_param(segment: &str) -> bool {
    segment.len() > 2 && segment.starts_with('{') && segment.ends_with('}')
}
