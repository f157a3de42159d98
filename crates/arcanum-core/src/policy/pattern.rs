//! Segment-wise path patterns.
//!
//! A pattern is a `/`-separated list of segments. A literal segment matches
//! itself, `*` matches exactly one segment and a final `+` matches one or more
//! trailing segments. Matching never touches a regex engine, so a compiled
//! pattern is immutable and safe to share across tasks.

use std::fmt;

use crate::error::PolicyError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    One,
    Rest,
}

/// A compiled path pattern.
#[derive(Clone, PartialEq, Eq)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    /// Compile a pattern.
    ///
    /// A single leading `/` is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Malformed`] for an empty pattern, an empty
    /// segment, a `+` that is not the last segment, or a `*`/`+` mixed into a
    /// literal segment.
    pub fn parse(raw: &str) -> Result<Self, PolicyError> {
        let malformed = |reason: String| PolicyError::Malformed { reason };

        let trimmed = raw.trim();
        let body = trimmed.strip_prefix('/').unwrap_or(trimmed);
        if body.is_empty() {
            return Err(malformed("empty path".to_owned()));
        }

        let parts: Vec<&str> = body.split('/').collect();
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "" => {
                    return Err(malformed(format!("path '{raw}' has an empty segment")));
                }
                "*" => Segment::One,
                "+" if i + 1 == parts.len() => Segment::Rest,
                "+" => {
                    return Err(malformed(format!(
                        "path '{raw}': '+' may only be the last segment"
                    )));
                }
                literal if literal.contains(['*', '+']) => {
                    return Err(malformed(format!(
                        "path '{raw}': wildcards must be whole segments, got '{literal}'"
                    )));
                }
                literal => Segment::Literal(literal.to_owned()),
            };
            segments.push(segment);
        }

        Ok(Self {
            raw: trimmed.to_owned(),
            segments,
        })
    }

    /// The pattern matching every non-empty path.
    pub(crate) fn any_path() -> Self {
        Self {
            raw: "+".to_owned(),
            segments: vec![Segment::Rest],
        }
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether `path` matches. Leading and trailing `/` on the path are
    /// ignored.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return false;
        }
        let mut parts = path.split('/');

        for segment in &self.segments {
            match segment {
                Segment::Rest => {
                    let mut rest = parts.peekable();
                    return rest.peek().is_some() && rest.all(|p| !p.is_empty());
                }
                Segment::One => match parts.next() {
                    Some(p) if !p.is_empty() => {}
                    _ => return false,
                },
                Segment::Literal(lit) => match parts.next() {
                    Some(p) if p == lit => {}
                    _ => return false,
                },
            }
        }
        parts.next().is_none()
    }
}

impl fmt::Display for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for PathPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathPattern({:?})", self.raw)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn matches(pattern: &str, path: &str) -> bool {
        PathPattern::parse(pattern).unwrap().matches(path)
    }

    #[test]
    fn literal_matches_exactly() {
        assert!(matches("secret/foo", "secret/foo"));
        assert!(matches("/secret/foo", "secret/foo/"));
        assert!(!matches("secret/foo", "secret/foo/bar"));
        assert!(!matches("secret/foo", "secret"));
        assert!(!matches("secret/foo", "secret/food"));
    }

    #[test]
    fn star_matches_one_segment() {
        assert!(matches("secret/*", "secret/foo"));
        assert!(!matches("secret/*", "secret/foo/bar"));
        assert!(!matches("secret/*", "secret"));
        assert!(matches("secret/*/config", "secret/app/config"));
        assert!(!matches("secret/*/config", "secret/config"));
    }

    #[test]
    fn plus_matches_one_or_more_trailing_segments() {
        assert!(matches("a/+", "a/b"));
        assert!(matches("a/+", "a/b/c"));
        assert!(!matches("a/+", "a"));
        assert!(!matches("a/*", "a/b/c"));
        assert!(matches("+", "anything/at/all"));
    }

    #[test]
    fn empty_segments_in_paths_never_match_wildcards() {
        assert!(!matches("a/*/c", "a//c"));
        assert!(!matches("a/+", "a/b//c"));
    }

    #[test]
    fn malformed_patterns_are_rejected() {
        for bad in ["", "  ", "/", "a//b", "a/", "a/+/b", "a/b*", "se+cret"] {
            assert!(
                matches!(PathPattern::parse(bad), Err(PolicyError::Malformed { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn any_path_matches_like_plus() {
        let any = PathPattern::any_path();
        assert_eq!(any, PathPattern::parse("+").unwrap());
        assert!(any.matches("kv/data/app"));
        assert!(!any.matches(""));
    }
}
