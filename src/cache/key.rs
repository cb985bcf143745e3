//! Structured cache keys with a canonical text form.
//!
//! A key is a kind, an optional id, and a sorted parameter map:
//!
//! ```text
//! task:42
//! tasks?project_id=7&status=open
//! workload:u-17
//! ```
//!
//! Parameter order never matters, so two keys built in different orders
//! compare, hash, and print identically. Keys double as invalidation
//! patterns through [`CacheKey::matches`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyParseError {
    #[error("cache key is empty")]
    Empty,
    #[error("cache key has an empty kind: '{0}'")]
    EmptyKind(String),
    #[error("malformed parameter '{0}'")]
    BadParam(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    kind: String,
    id: Option<String>,
    params: BTreeMap<String, String>,
}

impl CacheKey {
    /// A collection key such as `tasks` or `dashboard`.
    pub fn list(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), id: None, params: BTreeMap::new() }
    }

    /// A single-record key such as `task:42`.
    pub fn detail(kind: impl Into<String>, id: impl fmt::Display) -> Self {
        Self { kind: kind.into(), id: Some(id.to_string()), params: BTreeMap::new() }
    }

    /// Add a filter parameter.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl fmt::Display) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    #[must_use]
    pub fn kind(&self) -> &str {
        &self.kind
    }

    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    #[must_use]
    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    /// True when `self`, read as a pattern, covers `other`: same kind, same
    /// id unless the pattern has none, and every pattern parameter present
    /// with the same value. `tasks` covers `tasks?status=open`; `task:42`
    /// covers only `task:42` and its parameterized variants.
    #[must_use]
    pub fn matches(&self, other: &CacheKey) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.id.is_some() && self.id != other.id {
            return false;
        }
        self.params.iter().all(|(name, value)| other.params.get(name) == Some(value))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&escape(&self.kind))?;
        if let Some(id) = &self.id {
            write!(f, ":{}", escape(id))?;
        }
        for (i, (name, value)) in self.params.iter().enumerate() {
            let sep = if i == 0 { '?' } else { '&' };
            write!(f, "{sep}{}={}", escape(name), escape(value))?;
        }
        Ok(())
    }
}

impl FromStr for CacheKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(KeyParseError::Empty);
        }
        let (head, query) = match s.split_once('?') {
            Some((head, query)) => (head, Some(query)),
            None => (s, None),
        };
        let (kind, id) = match head.split_once(':') {
            Some((kind, id)) => (unescape(kind), Some(unescape(id))),
            None => (unescape(head), None),
        };
        if kind.is_empty() {
            return Err(KeyParseError::EmptyKind(s.to_owned()));
        }

        let mut params = BTreeMap::new();
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            let Some((name, value)) = pair.split_once('=') else {
                return Err(KeyParseError::BadParam(pair.to_owned()));
            };
            if name.is_empty() {
                return Err(KeyParseError::BadParam(pair.to_owned()));
            }
            params.insert(unescape(name), unescape(value));
        }

        Ok(Self { kind, id, params })
    }
}

/// Percent-encode the characters that carry structure in the text form.
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            '?' => out.push_str("%3F"),
            ':' => out.push_str("%3A"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape(encoded: &str) -> String {
    let mut out = String::with_capacity(encoded.len());
    let mut rest = encoded;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let code = rest.get(pos + 1..pos + 3);
        let decoded = match code {
            Some("25") => Some('%'),
            Some("26") => Some('&'),
            Some("3D") => Some('='),
            Some("3F") => Some('?'),
            Some("3A") => Some(':'),
            _ => None,
        };
        if let Some(ch) = decoded {
            out.push(ch);
            rest = &rest[pos + 3..];
        } else {
            out.push('%');
            rest = &rest[pos + 1..];
        }
    }
    out.push_str(rest);
    out
}
