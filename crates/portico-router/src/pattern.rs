//! Segment-based path pattern matching.
//!
//! Patterns and request paths are both split on `/`, discarding the empty
//! segments produced by leading, trailing or doubled separators.

use crate::params::Params;

/// One segment of a compiled pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal segment, compared case-sensitively
    Literal(String),
    /// Named parameter (`:name` or `@name`), matches any single segment
    Param(String),
    /// Trailing `*`, matches any remaining suffix
    Wildcard,
}

/// Splits a path into its non-empty `/`-separated segments.
///
/// ```rust
/// use portico_router::split_segments;
///
/// assert_eq!(split_segments("//api/users/"), vec!["api", "users"]);
/// assert!(split_segments("/").is_empty());
/// ```
pub fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// A compiled route pattern built from a prefix and a format.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    /// Compiles a pattern from an optional prefix and format.
    ///
    /// The prefix segments come first, followed by the format segments.
    #[must_use]
    pub fn new(prefix: Option<&str>, format: Option<&str>) -> Self {
        let raw: Vec<&str> = prefix
            .into_iter()
            .chain(format)
            .flat_map(split_segments)
            .collect();
        let last = raw.len().saturating_sub(1);

        let segments = raw
            .iter()
            .enumerate()
            .map(|(i, s)| Self::parse_segment(s, i == last))
            .collect();

        Self { segments }
    }

    /// Parses a single segment of a pattern.
    fn parse_segment(segment: &str, is_last: bool) -> Segment {
        if segment == "*" && is_last {
            Segment::Wildcard
        } else if let Some(name) = segment
            .strip_prefix(':')
            .or_else(|| segment.strip_prefix('@'))
        {
            Segment::Param(name.to_string())
        } else {
            Segment::Literal(segment.to_string())
        }
    }

    /// Returns the compiled segments.
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Returns true if the pattern ends in a wildcard.
    #[must_use]
    pub fn has_wildcard(&self) -> bool {
        matches!(self.segments.last(), Some(Segment::Wildcard))
    }

    /// Matches a request path, returning the bound parameters on success.
    ///
    /// ```rust
    /// use portico_router::Pattern;
    ///
    /// let pattern = Pattern::new(None, Some("/:x/b"));
    /// let params = pattern.matches("/a/b").unwrap();
    /// assert_eq!(params.get("x"), Some("a"));
    ///
    /// assert!(Pattern::new(None, Some("/:x/*")).matches("/a/b/c").is_some());
    /// assert!(Pattern::new(None, Some("/a/b")).matches("/a").is_none());
    /// ```
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<Params> {
        self.match_segments(&split_segments(path))
    }

    /// Matches pre-split path segments.
    #[must_use]
    pub fn match_segments(&self, path: &[&str]) -> Option<Params> {
        let mut params = Params::new();
        let mut remaining = path.iter();

        for segment in &self.segments {
            match segment {
                Segment::Wildcard => return Some(params),
                Segment::Param(name) => {
                    let value = remaining.next()?;
                    params.bind(name.as_str(), value);
                }
                Segment::Literal(literal) => {
                    if *remaining.next()? != literal.as_str() {
                        return None;
                    }
                }
            }
        }

        remaining.next().is_none().then_some(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_literal_match() {
        let pattern = Pattern::new(Some("api"), Some("users"));
        assert!(pattern.matches("/api/users").is_some());
        assert!(pattern.matches("api/users/").is_some());
        assert!(pattern.matches("//api//users").is_some());
        assert!(pattern.matches("/api/Users").is_none());
    }

    #[test]
    fn test_param_binding() {
        let pattern = Pattern::new(None, Some("/:x/b"));
        let params = pattern.matches("/a/b").unwrap();
        assert_eq!(params.get("x"), Some("a"));
    }

    #[test]
    fn test_at_param_binding() {
        let pattern = Pattern::new(Some("api"), Some("@kind/:id"));
        let params = pattern.matches("/api/widget/9").unwrap();
        assert_eq!(params.get("kind"), Some("widget"));
        assert_eq!(params.get("id"), Some("9"));
    }

    #[test]
    fn test_repeated_param_accumulates() {
        let pattern = Pattern::new(None, Some("/:id/:id"));
        let params = pattern.matches("/1/2").unwrap();
        assert_eq!(params.get("id"), Some("1,2"));
    }

    #[test]
    fn test_trailing_wildcard() {
        let pattern = Pattern::new(None, Some("/:x/*"));
        assert!(pattern.matches("/a/b/c").is_some());
        assert!(pattern.matches("/a").is_some());
        assert!(pattern.matches("/").is_none());
        assert!(pattern.has_wildcard());
    }

    #[test]
    fn test_inner_star_is_literal() {
        let pattern = Pattern::new(None, Some("/*/a"));
        assert_eq!(pattern.segments()[0], Segment::Literal("*".into()));
        assert!(pattern.matches("/*/a").is_some());
        assert!(pattern.matches("/x/a").is_none());
    }

    #[test]
    fn test_length_mismatch() {
        assert!(Pattern::new(None, Some("/a/b")).matches("/a").is_none());
        assert!(Pattern::new(None, Some("/a")).matches("/a/b").is_none());
    }

    #[test]
    fn test_empty_pattern_matches_root_only() {
        let pattern = Pattern::new(None, None);
        assert!(pattern.matches("/").is_some());
        assert!(pattern.matches("").is_some());
        assert!(pattern.matches("/x").is_none());
    }

    fn segment() -> impl Strategy<Value = String> {
        "[a-z]{1,4}"
    }

    proptest! {
        #[test]
        fn prop_path_matches_itself(segs in prop::collection::vec(segment(), 0..6)) {
            let path = format!("/{}", segs.join("/"));
            prop_assert!(Pattern::new(None, Some(&path)).matches(&path).is_some());
        }

        #[test]
        fn prop_params_bind_each_segment(segs in prop::collection::vec(segment(), 1..6)) {
            let format: Vec<String> = (0..segs.len()).map(|i| format!(":p{i}")).collect();
            let pattern = Pattern::new(None, Some(&format.join("/")));
            let params = pattern.matches(&segs.join("/")).unwrap();
            for (i, value) in segs.iter().enumerate() {
                let name = format!("p{i}");
                prop_assert_eq!(params.get(&name), Some(value.as_str()));
            }
        }

        #[test]
        fn prop_wildcard_accepts_any_suffix(
            head in prop::collection::vec(segment(), 0..4),
            tail in prop::collection::vec(segment(), 0..4),
        ) {
            let format = format!("/{}/*", head.join("/"));
            let path = format!("/{}/{}", head.join("/"), tail.join("/"));
            prop_assert!(Pattern::new(None, Some(&format)).matches(&path).is_some());
        }

        #[test]
        fn prop_unequal_length_rejected(
            segs in prop::collection::vec(segment(), 1..5),
            extra in segment(),
        ) {
            let format = segs.join("/");
            let longer = format!("{format}/{extra}");
            prop_assert!(Pattern::new(None, Some(&format)).matches(&longer).is_none());
            prop_assert!(Pattern::new(None, Some(&longer)).matches(&format).is_none());
        }
    }
}
