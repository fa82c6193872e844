//! Path-pattern router.
//!
//! Patterns are `/`-separated sequences of literal segments, single-segment
//! variables (`{name}`) and an optional final tail variable (`{name*}`)
//! capturing the rest of the path including slashes. Per method, matching
//! is most-specific-first (literal over variable over tail, position by
//! position), with registration order breaking ties.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use http::Method;
use percent_encoding::percent_decode_str;
use tracing::debug;

/// Variables captured from the request path.
#[derive(Clone, Debug, Default)]
pub struct Params {
    inner: Vec<(String, String)>,
}

impl Params {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.inner.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    fn push(&mut self, name: &str, value: String) {
        self.inner.push((name.to_owned(), value));
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Literal(String),
    Var(String),
    Tail(String),
}

impl Segment {
    fn rank(&self) -> u8 {
        match self {
            Segment::Literal(_) => 0,
            Segment::Var(_) => 1,
            Segment::Tail(_) => 2,
        }
    }
}

/// A compiled URL pattern.
#[derive(Clone, PartialEq)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Compiles a pattern.
    ///
    /// # Panics
    ///
    /// Panics on an empty variable name or a tail variable that is not the
    /// final segment; route tables are built at startup and a bad pattern
    /// is a programming error.
    pub fn parse(raw: &str) -> Pattern {
        let trimmed = raw.trim_matches('/');
        let mut segments: Vec<Segment> = Vec::new();
        if !trimmed.is_empty() {
            for part in trimmed.split('/') {
                assert!(
                    !matches!(segments.last(), Some(Segment::Tail(_))),
                    "tail variable must be the final segment: {:?}",
                    raw
                );
                let segment = if let Some(name) = part
                    .strip_prefix('{')
                    .and_then(|p| p.strip_suffix('}'))
                {
                    if let Some(name) = name.strip_suffix('*') {
                        assert!(!name.is_empty(), "tail variable needs a name: {:?}", raw);
                        Segment::Tail(name.to_owned())
                    } else {
                        assert!(!name.is_empty(), "variable needs a name: {:?}", raw);
                        Segment::Var(name.to_owned())
                    }
                } else {
                    Segment::Literal(part.to_owned())
                };
                segments.push(segment);
            }
        }
        Pattern {
            raw: raw.to_owned(),
            segments,
        }
    }

    /// Matches against the decoded, slash-normalized path segments.
    fn match_segments(&self, parts: &[&str]) -> Option<Params> {
        let mut params = Params::default();
        let mut at = 0;
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => {
                    if parts.get(at).copied() != Some(lit.as_str()) {
                        return None;
                    }
                    at += 1;
                }
                Segment::Var(name) => {
                    let value = parts.get(at)?;
                    params.push(name, (*value).to_owned());
                    at += 1;
                }
                Segment::Tail(name) => {
                    // Everything that remains, slashes included.
                    params.push(name, parts[at..].join("/"));
                    return Some(params);
                }
            }
        }
        if at == parts.len() {
            Some(params)
        } else {
            None
        }
    }

    /// Most-specific-first ordering: compare segment kinds position by
    /// position; a pattern that runs out of segments sorts after one that
    /// still has literals to demand.
    fn specificity_cmp(&self, other: &Pattern) -> Ordering {
        let mut a = self.segments.iter();
        let mut b = other.segments.iter();
        loop {
            match (a.next(), b.next()) {
                (Some(x), Some(y)) => match x.rank().cmp(&y.rank()) {
                    Ordering::Equal => continue,
                    unequal => return unequal,
                },
                (None, None) => return Ordering::Equal,
                (Some(_), None) => return Ordering::Less,
                (None, Some(_)) => return Ordering::Greater,
            }
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.raw).finish()
    }
}

struct Route<H: ?Sized> {
    pattern: Pattern,
    order: usize,
    handler: Arc<H>,
}

/// A `(method, pattern) -> handler` table.
pub struct Router<H: ?Sized> {
    branches: HashMap<Method, Vec<Route<H>>>,
    registered: usize,
}

impl<H: ?Sized> Router<H> {
    pub fn new() -> Router<H> {
        Router {
            branches: HashMap::new(),
            registered: 0,
        }
    }

    /// Registers a handler; panics on an invalid pattern (see
    /// [`Pattern::parse`]).
    pub fn route(&mut self, method: Method, pattern: &str, handler: Arc<H>) {
        let pattern = Pattern::parse(pattern);
        debug!("route registered: {} {}", method, pattern.raw);
        let route = Route {
            pattern,
            order: self.registered,
            handler,
        };
        self.registered += 1;
        let branch = self.branches.entry(method).or_default();
        let at = branch
            .binary_search_by(|existing| {
                existing
                    .pattern
                    .specificity_cmp(&route.pattern)
                    .then(existing.order.cmp(&route.order))
            })
            .unwrap_err();
        branch.insert(at, route);
    }

    /// Looks up the handler for `(method, path)`.
    ///
    /// The path is percent-decoded here; any query string is ignored.
    pub fn lookup(&self, method: &Method, path: &str) -> Option<(Arc<H>, Params)> {
        let branch = self.branches.get(method)?;
        let path = path.split('?').next().unwrap_or(path);
        let decoded = percent_decode_str(path).decode_utf8().ok()?;
        let trimmed = decoded.trim_matches('/');
        let parts: Vec<&str> = if trimmed.is_empty() {
            Vec::new()
        } else {
            trimmed.split('/').collect()
        };
        for route in branch {
            if let Some(params) = route.pattern.match_segments(&parts) {
                return Some((route.handler.clone(), params));
            }
        }
        None
    }
}

impl<H: ?Sized> Default for Router<H> {
    fn default() -> Router<H> {
        Router::new()
    }
}

impl<H: ?Sized> fmt::Debug for Router<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("routes", &self.registered)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router(patterns: &[&str]) -> Router<str> {
        let mut router = Router::new();
        for pattern in patterns {
            router.route(Method::GET, pattern, Arc::from(*pattern));
        }
        router
    }

    fn lookup(router: &Router<str>, path: &str) -> Option<(Arc<str>, Params)> {
        router.lookup(&Method::GET, path)
    }

    #[test]
    fn literal_match() {
        let router = router(&["/health"]);
        let (handler, params) = lookup(&router, "/health").unwrap();
        assert_eq!(&*handler, "/health");
        assert!(params.is_empty());
        assert!(lookup(&router, "/nope").is_none());
    }

    #[test]
    fn variable_capture() {
        let router = router(&["/users/{id}/posts/{post}"]);
        let (_, params) = lookup(&router, "/users/42/posts/7").unwrap();
        assert_eq!(params.get("id"), Some("42"));
        assert_eq!(params.get("post"), Some("7"));
    }

    #[test]
    fn tail_captures_rest_with_slashes() {
        let router = router(&["/static/{path*}"]);
        let (_, params) = lookup(&router, "/static/css/site/main.css").unwrap();
        assert_eq!(params.get("path"), Some("css/site/main.css"));
    }

    #[test]
    fn literal_beats_variable_beats_tail() {
        let router = router(&["/a/{tail*}", "/a/{x}", "/a/b"]);
        assert_eq!(&*lookup(&router, "/a/b").unwrap().0, "/a/b");
        assert_eq!(&*lookup(&router, "/a/c").unwrap().0, "/a/{x}");
        assert_eq!(&*lookup(&router, "/a/c/d").unwrap().0, "/a/{tail*}");
    }

    #[test]
    fn insertion_order_breaks_ties() {
        let router = router(&["/t/{first}", "/t/{second}"]);
        let (_, params) = lookup(&router, "/t/x").unwrap();
        assert_eq!(params.get("first"), Some("x"));
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let router1 = router(&["/users/{id}"]);
        assert!(lookup(&router1, "/users/1/").is_some());
        let router2 = router(&["/users/{id}/"]);
        assert!(lookup(&router2, "/users/1").is_some());
    }

    #[test]
    fn query_string_is_ignored() {
        let router = router(&["/search"]);
        assert!(lookup(&router, "/search?q=hello").is_some());
    }

    #[test]
    fn percent_decoding_applies() {
        let router = router(&["/files/{name}"]);
        let (_, params) = lookup(&router, "/files/a%20b").unwrap();
        assert_eq!(params.get("name"), Some("a b"));
    }

    #[test]
    fn root_pattern() {
        let router = router(&["/"]);
        assert!(lookup(&router, "/").is_some());
        assert!(lookup(&router, "/x").is_none());
    }

    #[test]
    fn method_branches_are_separate() {
        let mut router: Router<str> = Router::new();
        router.route(Method::POST, "/submit", Arc::from("post"));
        assert!(router.lookup(&Method::GET, "/submit").is_none());
        assert!(router.lookup(&Method::POST, "/submit").is_some());
    }

    #[test]
    #[should_panic(expected = "tail variable must be the final segment")]
    fn tail_must_be_last() {
        Pattern::parse("/a/{rest*}/b");
    }

    #[test]
    fn deterministic_lookup() {
        let router = router(&["/a/{x}/c", "/a/b/{y}", "/{z}/b/c"]);
        for _ in 0..8 {
            assert_eq!(&*lookup(&router, "/a/b/c").unwrap().0, "/a/b/{y}");
        }
    }
}
