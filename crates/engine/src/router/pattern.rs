//! Route pattern compilation and matching.
//!
//! The pattern language has exactly five segment forms:
//!
//! - static literal: `/users/admin`
//! - parameter: `{name}` matches one segment and binds it
//! - typed parameter: `{name:regex}` constrains the binding
//! - single-segment wildcard: `*` matches one segment, no binding
//! - multi-segment wildcard: `**` matches the remaining path, no binding
//!
//! Each pattern compiles once at registration; matching is deterministic
//! and pure. Specificity scoring: +10 per static segment, −10 per
//! parameter, −20 per `*`, −30 per `**`.

use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

/// Errors raised while compiling a route pattern.
#[derive(Debug, Error)]
pub enum PatternError {
    /// Empty parameter name in `{}` or `{:regex}`.
    #[error("pattern '{pattern}' has a parameter without a name")]
    EmptyParamName { pattern: String },

    /// The regex of a typed parameter failed to compile.
    #[error("pattern '{pattern}' has an invalid regex: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// `**` segments may only appear last.
    #[error("pattern '{pattern}' has segments after '**'")]
    CatchAllNotLast { pattern: String },
}

/// One compiled segment of a pattern.
#[derive(Debug)]
enum Segment {
    Static(String),
    Param(String),
    TypedParam { name: String, regex: Regex },
    Wildcard,
    CatchAll,
}

/// A compiled route pattern.
#[derive(Debug)]
pub struct Pattern {
    raw: String,
    segments: Vec<Segment>,
    score: i32,
}

impl Pattern {
    /// Compiles a pattern string.
    pub fn parse(raw: &str) -> Result<Self, PatternError> {
        let mut segments = Vec::new();
        let mut score = 0;

        for part in split_segments(raw) {
            if matches!(segments.last(), Some(Segment::CatchAll)) {
                return Err(PatternError::CatchAllNotLast { pattern: raw.to_string() });
            }

            let segment = compile_segment(raw, part)?;
            score += match &segment {
                Segment::Static(_) => 10,
                Segment::Param(_) | Segment::TypedParam { .. } => -10,
                Segment::Wildcard => -20,
                Segment::CatchAll => -30,
            };
            segments.push(segment);
        }

        Ok(Self { raw: raw.to_string(), segments, score })
    }

    /// Returns the original pattern string.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Returns the specificity score; higher wins.
    pub fn score(&self) -> i32 {
        self.score
    }

    /// Returns true if the pattern contains only static segments.
    pub fn is_static(&self) -> bool {
        self.segments.iter().all(|segment| matches!(segment, Segment::Static(_)))
    }

    /// Matches a normalized path, returning the bound path parameters.
    ///
    /// The path is expected to be percent-decoded and slash-normalized
    /// already; matching never allocates unless the pattern binds.
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let mut params = HashMap::new();
        let mut path_segments = split_segments(path);

        for segment in &self.segments {
            // a catch-all swallows the rest, including an empty rest
            if matches!(segment, Segment::CatchAll) {
                return Some(params);
            }

            let part = path_segments.next()?;
            match segment {
                Segment::Static(literal) => {
                    if literal != part {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
                Segment::TypedParam { name, regex } => {
                    if !full_match(regex, part) {
                        return None;
                    }
                    params.insert(name.clone(), part.to_string());
                }
                Segment::Wildcard | Segment::CatchAll => {}
            }
        }

        // all pattern segments consumed; the path must be consumed too
        if path_segments.next().is_some() {
            return None;
        }
        Some(params)
    }
}

fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|part| !part.is_empty())
}

fn compile_segment(raw: &str, part: &str) -> Result<Segment, PatternError> {
    if part == "**" {
        return Ok(Segment::CatchAll);
    }
    if part == "*" {
        return Ok(Segment::Wildcard);
    }
    if let Some(inner) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
        return match inner.split_once(':') {
            Some((name, regex)) => {
                if name.is_empty() {
                    return Err(PatternError::EmptyParamName { pattern: raw.to_string() });
                }
                let regex = Regex::new(regex)
                    .map_err(|source| PatternError::InvalidRegex { pattern: raw.to_string(), source })?;
                Ok(Segment::TypedParam { name: name.to_string(), regex })
            }
            None => {
                if inner.is_empty() {
                    return Err(PatternError::EmptyParamName { pattern: raw.to_string() });
                }
                Ok(Segment::Param(inner.to_string()))
            }
        };
    }
    Ok(Segment::Static(part.to_string()))
}

/// Requires the regex to cover the entire segment, not just a substring.
fn full_match(regex: &Regex, part: &str) -> bool {
    regex.find(part).map(|m| m.start() == 0 && m.end() == part.len()).unwrap_or(false)
}

/// Normalizes a request path for matching.
///
/// Guarantees a leading `/` and collapses consecutive slashes. The request
/// path is already percent-decoded at parse time.
pub fn normalize_path(path: &str) -> String {
    let mut normalized = String::with_capacity(path.len() + 1);
    normalized.push('/');
    let mut last_was_slash = true;
    for ch in path.chars() {
        if ch == '/' {
            if !last_was_slash {
                normalized.push('/');
            }
            last_was_slash = true;
        } else {
            normalized.push(ch);
            last_was_slash = false;
        }
    }
    if normalized.len() > 1 && normalized.ends_with('/') {
        normalized.pop();
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_pattern_matches_exactly() {
        let pattern = Pattern::parse("/users/admin").unwrap();
        assert!(pattern.is_static());
        assert!(pattern.matches("/users/admin").is_some());
        assert!(pattern.matches("/users/other").is_none());
        assert!(pattern.matches("/users").is_none());
        assert!(pattern.matches("/users/admin/extra").is_none());
    }

    #[test]
    fn param_binds_one_segment() {
        let pattern = Pattern::parse("/users/{id}").unwrap();
        let params = pattern.matches("/users/42").unwrap();
        assert_eq!(params.get("id").map(String::as_str), Some("42"));
        assert!(pattern.matches("/users/42/posts").is_none());
    }

    #[test]
    fn typed_param_constrains_binding() {
        let pattern = Pattern::parse("/users/{id:[0-9]+}").unwrap();
        assert!(pattern.matches("/users/42").is_some());
        assert!(pattern.matches("/users/abc").is_none());
        // the regex must cover the whole segment
        assert!(pattern.matches("/users/42abc").is_none());
    }

    #[test]
    fn wildcard_matches_without_binding() {
        let pattern = Pattern::parse("/files/*/raw").unwrap();
        let params = pattern.matches("/files/report/raw").unwrap();
        assert!(params.is_empty());
        assert!(pattern.matches("/files/raw").is_none());
    }

    #[test]
    fn catch_all_matches_remainder() {
        let pattern = Pattern::parse("/static/**").unwrap();
        assert!(pattern.matches("/static/css/site.css").is_some());
        assert!(pattern.matches("/static").is_some());
        assert!(pattern.matches("/other/css").is_none());
    }

    #[test]
    fn catch_all_must_be_last() {
        assert!(matches!(Pattern::parse("/a/**/b"), Err(PatternError::CatchAllNotLast { .. })));
    }

    #[test]
    fn scores_follow_specificity() {
        let stat = Pattern::parse("/users/admin").unwrap();
        let param = Pattern::parse("/users/{id}").unwrap();
        let wild = Pattern::parse("/users/*").unwrap();
        let catch = Pattern::parse("/users/**").unwrap();

        assert_eq!(stat.score(), 20);
        assert_eq!(param.score(), 0);
        assert_eq!(wild.score(), -10);
        assert_eq!(catch.score(), -20);
        assert!(stat.score() > param.score());
        assert!(param.score() > wild.score());
        assert!(wild.score() > catch.score());
    }

    #[test]
    fn empty_param_name_is_rejected() {
        assert!(matches!(Pattern::parse("/users/{}"), Err(PatternError::EmptyParamName { .. })));
        assert!(matches!(Pattern::parse("/users/{:[0-9]+}"), Err(PatternError::EmptyParamName { .. })));
    }

    #[test]
    fn normalize_collapses_slashes() {
        assert_eq!(normalize_path("//users///42"), "/users/42");
        assert_eq!(normalize_path("users/42"), "/users/42");
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("/users/"), "/users");
    }
}
