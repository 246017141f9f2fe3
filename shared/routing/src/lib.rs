//! Declarative request routing.
//!
//! Routes are path patterns plus an allowed method set, carrying an arbitrary
//! action value. Patterns support static segments (`/status`), named
//! parameters (`/ping/{envId}`), and parameters with a static suffix
//! (`/a/{envId}.gif`). Resolution distinguishes "no such path" from "path
//! exists but method not allowed" so callers can answer 404 vs 405 (and
//! build CORS preflight responses from the allowed set).

use http::Method;
use std::collections::HashMap;

#[derive(Debug)]
enum PathSegment {
    Static(String),
    Param(String),
    /// `{name}.gif` style: a parameter followed by a fixed suffix.
    ParamWithSuffix {
        name: String,
        suffix: String,
    },
}

#[derive(Debug)]
struct Path {
    segments: Vec<PathSegment>,
}

impl Path {
    fn parse(path_str: &str) -> Self {
        let normalized = path_str.trim().trim_matches('/');

        let segments = if normalized.is_empty() {
            vec![]
        } else {
            normalized.split('/').map(parse_segment).collect()
        };

        Path { segments }
    }

    /// Matches a request path against this pattern, returning captured
    /// parameters on success. Trailing slashes are normalized away.
    fn matches(&self, request_path: &str) -> Option<HashMap<String, String>> {
        let normalized = request_path.trim().trim_matches('/');

        let request_segments: Vec<&str> = if normalized.is_empty() {
            vec![]
        } else {
            normalized.split('/').collect()
        };

        if request_segments.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (pattern, actual) in self.segments.iter().zip(request_segments) {
            match pattern {
                PathSegment::Static(s) => {
                    if actual != s {
                        return None;
                    }
                }
                PathSegment::Param(name) => {
                    if actual.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), actual.to_string());
                }
                PathSegment::ParamWithSuffix { name, suffix } => {
                    let value = actual.strip_suffix(suffix.as_str())?;
                    if value.is_empty() {
                        return None;
                    }
                    params.insert(name.clone(), value.to_string());
                }
            }
        }

        Some(params)
    }
}

fn parse_segment(s: &str) -> PathSegment {
    if let Some(inner) = s.strip_prefix('{') {
        if let Some(name) = inner.strip_suffix('}') {
            return PathSegment::Param(name.to_string());
        }
        if let Some((name, suffix)) = inner.split_once('}') {
            return PathSegment::ParamWithSuffix {
                name: name.to_string(),
                suffix: suffix.to_string(),
            };
        }
    }
    PathSegment::Static(s.to_string())
}

#[derive(Debug)]
pub struct Route<A> {
    methods: Vec<Method>,
    path: Path,
    action: A,
}

impl<A> Route<A> {
    pub fn new(methods: Vec<Method>, pattern: &str, action: A) -> Self {
        Self {
            methods,
            path: Path::parse(pattern),
            action,
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct RouteMatch<'a, A> {
    pub params: HashMap<String, String>,
    pub action: &'a A,
}

/// Outcome of resolving a request against a route set.
#[derive(Debug, PartialEq)]
pub enum Resolution<'a, A> {
    Matched(RouteMatch<'a, A>),
    /// The path exists but none of its routes allow the request method.
    /// `allowed` is the union of methods across routes on this path, and
    /// `any_action` is one of the path's actions (its routing properties,
    /// e.g. CORS applicability, are shared across a path).
    MethodNotAllowed {
        allowed: Vec<Method>,
        any_action: &'a A,
    },
    NotFound,
}

pub struct RouteSet<A> {
    routes: Vec<Route<A>>,
}

impl<A> RouteSet<A> {
    pub fn new(routes: Vec<Route<A>>) -> Self {
        Self { routes }
    }

    pub fn resolve(&self, method: &Method, path: &str) -> Resolution<'_, A> {
        let mut allowed: Vec<Method> = Vec::new();
        let mut any_action = None;

        for route in &self.routes {
            let Some(params) = route.path.matches(path) else {
                continue;
            };
            if route.methods.contains(method) {
                return Resolution::Matched(RouteMatch {
                    params,
                    action: &route.action,
                });
            }
            any_action = any_action.or(Some(&route.action));
            for m in &route.methods {
                if !allowed.contains(m) {
                    allowed.push(m.clone());
                }
            }
        }

        match any_action {
            Some(any_action) => Resolution::MethodNotAllowed { allowed, any_action },
            None => Resolution::NotFound,
        }
    }
}
