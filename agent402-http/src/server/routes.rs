//! Route patterns for protected resources.
//!
//! A pattern is `"VERB /path"` or just `"/path"` (any verb). In the path,
//! `*` matches any run of characters and `[name]` exactly one segment:
//!
//! ```rust
//! use agent402_http::server::RoutePattern;
//!
//! let route = RoutePattern::parse("GET /weather/[city]").unwrap();
//! assert!(route.matches("get", "/weather/paris/"));
//! assert!(!route.matches("GET", "/weather/paris/today"));
//! assert!(!route.matches("POST", "/weather/paris"));
//! ```

use std::borrow::Cow;
use std::fmt;

use percent_encoding::percent_decode_str;
use regex::Regex;

const ANY_VERB: &str = "*";

/// Error building a [`RoutePattern`].
#[derive(Debug, thiserror::Error)]
pub enum RoutePatternError {
    /// The pattern has no path.
    #[error("empty route pattern")]
    Empty,
    /// A `{` without its closing `}`.
    #[error("unterminated parameter in route pattern '{0}'")]
    UnterminatedParameter(String),
    /// The pattern compiled to an invalid regex.
    #[error("invalid route pattern '{pattern}': {source}")]
    Regex {
        /// The pattern as written.
        pattern: String,
        /// The regex compile error.
        #[source]
        source: regex::Error,
    },
}

/// A compiled `"VERB /path"` matcher.
#[derive(Clone)]
pub struct RoutePattern {
    raw: String,
    verb: String,
    regex: Regex,
}

impl fmt::Debug for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RoutePattern").field(&self.raw).finish()
    }
}

impl fmt::Display for RoutePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl RoutePattern {
    /// Compiles a pattern.
    ///
    /// With exactly two whitespace-separated fields the first is the verb;
    /// otherwise the whole pattern is the path and any verb matches.
    ///
    /// # Errors
    ///
    /// Returns [`RoutePatternError`] for an empty pattern or an unclosed
    /// `[param]`.
    pub fn parse(pattern: &str) -> Result<Self, RoutePatternError> {
        let fields: Vec<&str> = pattern.split_whitespace().collect();
        let (verb, path) = match fields.as_slice() {
            [] => return Err(RoutePatternError::Empty),
            [verb, path] => (verb.to_ascii_uppercase(), *path),
            _ => (ANY_VERB.to_owned(), pattern.trim()),
        };

        let mut source = String::from("^");
        let mut chars = path.trim_end_matches('/').chars();
        if path.chars().all(|c| c == '/') {
            source.push('/');
        }
        while let Some(c) = chars.next() {
            match c {
                '*' => source.push_str(".*?"),
                '[' => {
                    if !chars.by_ref().any(|c| c == ']') {
                        return Err(RoutePatternError::UnterminatedParameter(pattern.to_owned()));
                    }
                    source.push_str("[^/]+");
                }
                other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }
        source.push('$');

        let regex = Regex::new(&source).map_err(|source| RoutePatternError::Regex {
            pattern: pattern.to_owned(),
            source,
        })?;
        Ok(Self {
            raw: pattern.to_owned(),
            verb,
            regex,
        })
    }

    /// The pattern as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// `true` if `method` and `path` hit this route.
    ///
    /// The verb compares case-insensitively and `path` is run through
    /// [`normalize_path`] first.
    #[must_use]
    pub fn matches(&self, method: &str, path: &str) -> bool {
        (self.verb == ANY_VERB || self.verb.eq_ignore_ascii_case(method))
            && self.regex.is_match(&normalize_path(path))
    }
}

/// Canonical form of a request path for route matching.
///
/// Drops the query and fragment, percent-decodes (keeping the input when the
/// result is not UTF-8), turns `\` into `/`, collapses repeated slashes and
/// trims a trailing slash. An empty result becomes `/`.
#[must_use]
pub fn normalize_path(path: &str) -> String {
    let path = path.find(['?', '#']).map_or(path, |end| &path[..end]);
    let decoded = percent_decode_str(path)
        .decode_utf8()
        .unwrap_or(Cow::Borrowed(path));

    let mut normalized = String::with_capacity(decoded.len());
    let mut last_slash = false;
    for c in decoded.chars() {
        let c = if c == '\\' { '/' } else { c };
        if c == '/' && last_slash {
            continue;
        }
        last_slash = c == '/';
        normalized.push(c);
    }

    let trimmed = normalized.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_owned()
    } else {
        trimmed.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("//api///weather//"), "/api/weather");
        assert_eq!(normalize_path("/api/weather?city=paris#top"), "/api/weather");
        assert_eq!(normalize_path("/api%2Fweather"), "/api/weather");
        assert_eq!(normalize_path("\\api\\weather"), "/api/weather");
        assert_eq!(normalize_path("/caf%C3%A9"), "/café");
        assert_eq!(normalize_path("/bad%FF"), "/bad%FF");
    }

    #[test]
    fn test_verb_handling() {
        let get = RoutePattern::parse("get /weather").unwrap();
        assert!(get.matches("GET", "/weather"));
        assert!(!get.matches("POST", "/weather"));

        let any = RoutePattern::parse("/weather").unwrap();
        assert!(any.matches("DELETE", "/weather"));

        let star = RoutePattern::parse("* /weather").unwrap();
        assert!(star.matches("PATCH", "/weather"));
    }

    #[test]
    fn test_wildcards_and_params() {
        let wildcard = RoutePattern::parse("GET /api/*").unwrap();
        assert!(wildcard.matches("GET", "/api/a/b/c"));
        assert!(!wildcard.matches("GET", "/other/api/a"));

        let param = RoutePattern::parse("GET /users/[id]/posts").unwrap();
        assert!(param.matches("GET", "/users/42/posts"));
        assert!(!param.matches("GET", "/users/posts"));
        assert!(!param.matches("GET", "/users/4/2/posts"));
    }

    #[test]
    fn test_literal_regex_characters_are_escaped() {
        let route = RoutePattern::parse("GET /v1.0/price(usd)").unwrap();
        assert!(route.matches("GET", "/v1.0/price(usd)"));
        assert!(!route.matches("GET", "/v1x0/price(usd)"));
    }

    #[test]
    fn test_root_and_trailing_slash() {
        assert!(RoutePattern::parse("GET /").unwrap().matches("GET", ""));
        assert!(RoutePattern::parse("GET /weather/").unwrap().matches("GET", "/weather"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(matches!(RoutePattern::parse("  "), Err(RoutePatternError::Empty)));
        assert!(matches!(
            RoutePattern::parse("GET /users/[id"),
            Err(RoutePatternError::UnterminatedParameter(_))
        ));
    }
}
