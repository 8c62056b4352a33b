//! Glob patterns for cache invalidation (`*` and `?`).

use regex::Regex;

use crate::{Error, Result};

#[derive(Debug, Clone)]
pub struct GlobPattern {
    raw: String,
    regex: Regex,
}

impl GlobPattern {
    pub fn new(pattern: &str) -> Result<Self> {
        let mut regex = String::with_capacity(pattern.len() * 2 + 6);
        // Keys may contain newlines.
        regex.push_str("(?s)^");
        for c in pattern.chars() {
            match c {
                '*' => regex.push_str(".*"),
                '?' => regex.push('.'),
                c => regex.push_str(&regex::escape(&c.to_string())),
            }
        }
        regex.push('$');

        let regex = Regex::new(&regex)
            .map_err(|e| Error::validation(format!("invalid pattern '{pattern}': {e}")))?;
        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Same pattern in Redis `MATCH` syntax.
    pub fn to_redis_pattern(&self) -> String {
        let mut out = String::with_capacity(self.raw.len());
        for c in self.raw.chars() {
            if matches!(c, '[' | ']' | '\\' | '^') {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }
}

/// Escape `s` so Redis `MATCH` treats it literally.
pub fn redis_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\' | '^') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_matching() {
        let pattern = GlobPattern::new("media-1:*").unwrap();
        assert!(pattern.matches("media-1:caption"));
        assert!(pattern.matches("media-1:"));
        assert!(!pattern.matches("media-10:caption"));

        let single = GlobPattern::new("frame-?").unwrap();
        assert!(single.matches("frame-7"));
        assert!(!single.matches("frame-17"));

        let literal = GlobPattern::new("a.b+c").unwrap();
        assert!(literal.matches("a.b+c"));
        assert!(!literal.matches("aXb+c"));
    }

    #[test]
    fn test_redis_pattern_escapes_brackets() {
        let pattern = GlobPattern::new("item[1]:*").unwrap();
        assert_eq!(pattern.to_redis_pattern(), "item\\[1\\]:*");
        assert!(pattern.matches("item[1]:x"));
        assert_eq!(redis_literal("a*b:"), "a\\*b:");
    }

    #[test]
    fn test_wildcards_match_newlines() {
        let pattern = GlobPattern::new("note:*").unwrap();
        assert!(pattern.matches("note:line one\nline two"));
        assert!(GlobPattern::new("a?b").unwrap().matches("a\nb"));
    }
}
