//! # Path Patterns
//!
//! Compiles route patterns such as `/users/:id` or `/files/*` into a
//! segment list and matches request paths against it.
//!
//! ## Syntax
//!
//! - `literal` - static segment, compared against the percent-decoded path segment
//! - `:name` - captures exactly one non-empty segment
//! - `*` - trailing wildcard, captures the rest of the path (may be empty,
//!   may contain `/`) under the key [`WILDCARD_KEY`]
//!
//! Matching is anchored. One trailing slash on the request path is ignored,
//! except under a wildcard, whose capture keeps it (`/files/a/` gives `a/`).

use crate::error::{Error, Result};
use std::borrow::Cow;

/// Parameter name under which a trailing wildcard capture is stored
pub const WILDCARD_KEY: &str = "*";

/// One compiled pattern segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text
    Static(String),
    /// Named single-segment capture
    Param(String),
    /// Remainder capture, always last
    Wildcard,
}

/// Captured path parameters in pattern order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(String, String)>,
}

impl Params {
    /// Create an empty parameter list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, name: &str, value: String) {
        self.entries.push((name.to_string(), value));
    }

    /// Get a captured value by parameter name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate `(name, value)` pairs in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Parameter names in declaration order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Number of captures
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was captured
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A route pattern ready for matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPattern {
    source: String,
    segments: Vec<Segment>,
}

/// Compile a route pattern
///
/// # Errors
///
/// Returns `Error::InvalidPattern` when the pattern does not start with `/`,
/// contains an empty segment, an empty or duplicated parameter name, or a
/// `*` anywhere but the final segment.
pub fn compile(pattern: &str) -> Result<CompiledPattern> {
    let invalid = |reason: &str| Error::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    let body = pattern
        .strip_prefix('/')
        .ok_or_else(|| invalid("pattern must start with '/'"))?;

    let mut segments = Vec::new();
    if !body.is_empty() {
        let raw: Vec<&str> = body.split('/').collect();
        let last = raw.len() - 1;
        for (i, segment) in raw.iter().enumerate() {
            // A single trailing slash is tolerated, same as on request paths
            if segment.is_empty() && i == last && i > 0 {
                break;
            }
            if segment.is_empty() {
                return Err(invalid("empty path segment"));
            }
            if *segment == WILDCARD_KEY {
                if i != last {
                    return Err(invalid("wildcard '*' must be the final segment"));
                }
                segments.push(Segment::Wildcard);
            } else if let Some(name) = segment.strip_prefix(':') {
                if name.is_empty() {
                    return Err(invalid("parameter name is empty"));
                }
                let duplicate = segments
                    .iter()
                    .any(|s| matches!(s, Segment::Param(n) if n == name));
                if duplicate {
                    return Err(invalid(&format!("duplicate parameter ':{name}'")));
                }
                segments.push(Segment::Param(name.to_string()));
            } else {
                segments.push(Segment::Static((*segment).to_string()));
            }
        }
    }

    Ok(CompiledPattern {
        source: pattern.to_string(),
        segments,
    })
}

impl CompiledPattern {
    /// The pattern as registered
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Compiled segments
    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Parameter names in declaration order (wildcard reported as `*`)
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Static(_) => None,
            Segment::Param(name) => Some(name.as_str()),
            Segment::Wildcard => Some(WILDCARD_KEY),
        })
    }

    /// Structural signature with parameter names erased
    ///
    /// Two patterns with the same shape are duplicates: both register, the
    /// first one wins at dispatch.
    #[must_use]
    pub fn shape(&self) -> String {
        let mut out = String::from("/");
        let parts: Vec<&str> = self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Static(lit) => lit.as_str(),
                Segment::Param(_) => ":",
                Segment::Wildcard => "*",
            })
            .collect();
        out.push_str(&parts.join("/"));
        out
    }

    /// Match a request path
    ///
    /// Returns the captured parameters on success, `None` on mismatch.
    #[must_use]
    pub fn matches(&self, path: &str) -> Option<Params> {
        let normalized = if matches!(self.segments.last(), Some(Segment::Wildcard)) {
            path.strip_prefix('/').unwrap_or(path)
        } else {
            normalize(path)
        };
        let mut rest = if normalized.is_empty() {
            None
        } else {
            Some(normalized)
        };
        let mut params = Params::new();

        for segment in &self.segments {
            if let Segment::Wildcard = segment {
                let remainder = decode_segment(rest.unwrap_or(""))?;
                params.push(WILDCARD_KEY, remainder.into_owned());
                return Some(params);
            }

            let current = rest?;
            let (head, tail) = match current.split_once('/') {
                Some((h, t)) => (h, Some(t)),
                None => (current, None),
            };
            if head.is_empty() {
                return None;
            }
            let value = decode_segment(head)?;

            match segment {
                Segment::Static(lit) => {
                    if value != lit.as_str() {
                        return None;
                    }
                }
                Segment::Param(name) => params.push(name, value.into_owned()),
                Segment::Wildcard => unreachable!("handled above"),
            }
            rest = tail;
        }

        rest.is_none().then_some(params)
    }
}

/// Strip the leading slash and at most one trailing slash
fn normalize(path: &str) -> &str {
    let path = path.strip_prefix('/').unwrap_or(path);
    path.strip_suffix('/').unwrap_or(path)
}

/// Percent-decode a path segment; `None` if the result is not UTF-8
pub(crate) fn decode_segment(raw: &str) -> Option<Cow<'_, str>> {
    if raw.contains('%') {
        urlencoding::decode(raw).ok()
    } else {
        Some(Cow::Borrowed(raw))
    }
}
