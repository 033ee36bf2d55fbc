//! Route templates with `:param` segments.
//!
//! Matching is deliberately minimal: exact segment counts, literal
//! comparison, named captures. Anything fancier (wildcards, regex segments,
//! precedence) belongs to a real router, not here.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed route template such as `/users/:id/orders`.
#[derive(Debug, Clone)]
pub struct RouteTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl RouteTemplate {
    pub fn parse(template: impl ToString) -> Self {
        let raw = template.to_string();
        let segments = raw
            .split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| match segment.strip_prefix(':') {
                Some(name) => Segment::Param(name.to_string()),
                None => Segment::Literal(segment.to_string()),
            })
            .collect();

        RouteTemplate { raw, segments }
    }

    /// The template as declared, e.g. `/users/:id`.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Matches a concrete path, returning the captured `:param` values.
    ///
    /// Trailing slashes and query strings are ignored.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let path = path.split('?').next().unwrap_or(path);
        let parts: Vec<&str> = path.split('/').filter(|part| !part.is_empty()).collect();

        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(literal) if literal == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }

        Some(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_routes_match_exactly() {
        let route = RouteTemplate::parse("/health");
        assert!(route.matches("/health").unwrap().is_empty());
        assert!(route.matches("/health/").unwrap().is_empty());
        assert!(route.matches("/healthz").is_none());
        assert!(route.matches("/health/extra").is_none());
    }

    #[test]
    fn params_are_captured_by_name() {
        let route = RouteTemplate::parse("/users/:id/orders/:order_id");
        let params = route.matches("/users/u1/orders/o9").unwrap();
        assert_eq!(params["id"], "u1");
        assert_eq!(params["order_id"], "o9");
    }

    #[test]
    fn query_strings_are_ignored_for_matching() {
        let route = RouteTemplate::parse("/users/:id");
        let params = route.matches("/users/u1?verbose=true").unwrap();
        assert_eq!(params["id"], "u1");
    }

    #[test]
    fn root_route_matches_the_bare_slash() {
        let route = RouteTemplate::parse("/");
        assert!(route.matches("/").unwrap().is_empty());
        assert!(route.matches("/anything").is_none());
    }
}
