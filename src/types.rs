//! Shared primitive IDs, object names, and caller identity.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Buffer sequence number. Negative values are only meaningful as a
/// "sync only" fetch start.
pub type SeqNum = i64;
/// Per-session listener identifier.
pub type ListenerId = u64;

/// Opaque identifier of a managed object in a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    /// Wraps a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the name text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Glob over object names where `*` matches any run of characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectPattern(String);

impl ObjectPattern {
    /// Builds a pattern from glob text.
    pub fn new(glob: impl Into<String>) -> Self {
        Self(glob.into())
    }

    /// Pattern matching every object.
    pub fn any() -> Self {
        Self("*".to_string())
    }

    /// Tests `id` against the pattern.
    pub fn matches(&self, id: &ObjectId) -> bool {
        glob_match(self.0.as_bytes(), id.as_str().as_bytes())
    }
}

impl From<&ObjectId> for ObjectPattern {
    fn from(value: &ObjectId) -> Self {
        Self(value.as_str().to_string())
    }
}

// Iterative wildcard match with single-star backtracking.
fn glob_match(pat: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pat.len() && pat[p] == b'*' {
            star = Some((p, t));
            p += 1;
        } else if p < pat.len() && pat[p] == text[t] {
            p += 1;
            t += 1;
        } else if let Some((sp, st)) = star {
            p = sp + 1;
            t = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }

    pat[p..].iter().all(|b| *b == b'*')
}

/// Caller identity carried explicitly through permission-checked calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    /// Authenticated name.
    pub name: String,
}

impl Principal {
    /// Builds a principal from a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_prefix_suffix_and_infix() {
        let id = ObjectId::new("app:type=Cache,name=users");
        assert!(ObjectPattern::any().matches(&id));
        assert!(ObjectPattern::new("app:*").matches(&id));
        assert!(ObjectPattern::new("*name=users").matches(&id));
        assert!(ObjectPattern::new("app:*Cache*").matches(&id));
        assert!(!ObjectPattern::new("sys:*").matches(&id));
        assert!(ObjectPattern::from(&id).matches(&id));
        assert!(!ObjectPattern::new("app:type=Cache").matches(&id));
    }
}
