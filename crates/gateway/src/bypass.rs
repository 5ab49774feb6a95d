//! Bypass-path matching: `*` matches one path segment, `**` any run of
//! segments (including none).

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Any,
    Globstar,
}

#[derive(Debug, Clone)]
pub struct BypassMatcher {
    patterns: Vec<Vec<Segment>>,
}

impl BypassMatcher {
    #[must_use]
    pub fn new(patterns: &[String]) -> Self {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                split_segments(pattern)
                    .map(|seg| match seg {
                        "*" => Segment::Any,
                        "**" => Segment::Globstar,
                        literal => Segment::Literal(literal.to_owned()),
                    })
                    .collect()
            })
            .collect();
        Self { patterns }
    }

    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        let segments: Vec<&str> = split_segments(path).collect();
        self.patterns
            .iter()
            .any(|pattern| match_segments(pattern, &segments))
    }
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

fn match_segments(pattern: &[Segment], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(Segment::Globstar) => {
            // Try consuming zero or more path segments.
            (0..=path.len()).any(|n| match_segments(&pattern[1..], &path[n..]))
        }
        Some(Segment::Any) => !path.is_empty() && match_segments(&pattern[1..], &path[1..]),
        Some(Segment::Literal(literal)) => {
            path.first() == Some(&literal.as_str()) && match_segments(&pattern[1..], &path[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> BypassMatcher {
        let patterns: Vec<String> = patterns.iter().map(|s| (*s).to_owned()).collect();
        BypassMatcher::new(&patterns)
    }

    #[test]
    fn literal_paths_match_exactly() {
        let m = matcher(&["/health"]);
        assert!(m.matches("/health"));
        assert!(m.matches("/health/"));
        assert!(!m.matches("/healthz"));
        assert!(!m.matches("/health/live"));
        assert!(!m.matches("/"));
    }

    #[test]
    fn single_star_matches_one_segment() {
        let m = matcher(&["/metrics/*"]);
        assert!(m.matches("/metrics/http"));
        assert!(!m.matches("/metrics"));
        assert!(!m.matches("/metrics/http/latency"));
    }

    #[test]
    fn globstar_matches_any_depth() {
        let m = matcher(&["/internal/**"]);
        assert!(m.matches("/internal"));
        assert!(m.matches("/internal/a"));
        assert!(m.matches("/internal/a/b/c"));
        assert!(!m.matches("/external/a"));
    }

    #[test]
    fn multiple_patterns_are_unioned() {
        let m = matcher(&["/health", "/metrics/**"]);
        assert!(m.matches("/health"));
        assert!(m.matches("/metrics/anything/here"));
        assert!(!m.matches("/api/v1/verify"));
    }

    #[test]
    fn empty_pattern_set_matches_nothing() {
        let m = matcher(&[]);
        assert!(!m.matches("/health"));
        assert!(!m.matches("/"));
    }
}
