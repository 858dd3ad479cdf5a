//! Typed keys
//!
//! A [`TypedKey`] is a relpath tagged with a keyname. The keyname names
//! the semantic type of the record and is what range scans filter on.
//! [`PatternKey`] produces typed keys from a relpath template such as
//! `"{user}/{index}/+simple/{project}"`.

use std::fmt;

/// A relpath together with its keyname
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct TypedKey {
    pub relpath: String,
    pub name: String,
}

impl TypedKey {
    /// Create a new typed key
    #[must_use]
    pub fn new(name: impl Into<String>, relpath: impl Into<String>) -> Self {
        Self {
            relpath: relpath.into(),
            name: name.into(),
        }
    }
}

impl fmt::Debug for TypedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<TypedKey {} {}>", self.name, self.relpath)
    }
}

impl fmt::Display for TypedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relpath)
    }
}

/// Template for typed keys of one keyname
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PatternKey {
    pub name: &'static str,
    pub pattern: &'static str,
}

impl PatternKey {
    /// Create a new key pattern
    #[must_use]
    pub const fn new(name: &'static str, pattern: &'static str) -> Self {
        Self { name, pattern }
    }

    /// Substitute `{param}` placeholders and return the typed key.
    ///
    /// The pattern is scanned once, so braces inside a substituted value
    /// are never expanded. Placeholders without a matching parameter are
    /// left in place, which makes a missing parameter visible in the
    /// resulting relpath.
    #[must_use]
    pub fn key(&self, params: &[(&str, &str)]) -> TypedKey {
        let mut relpath = String::with_capacity(self.pattern.len());
        let mut rest = self.pattern;
        while let Some(start) = rest.find('{') {
            let Some(len) = rest[start..].find('}') else {
                break;
            };
            let end = start + len;
            relpath.push_str(&rest[..start]);
            let name = &rest[start + 1..end];
            match params.iter().find(|(param, _)| *param == name) {
                Some((_, value)) => relpath.push_str(value),
                None => relpath.push_str(&rest[start..=end]),
            }
            rest = &rest[end + 1..];
        }
        relpath.push_str(rest);
        TypedKey::new(self.name, relpath)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: PatternKey =
        PatternKey::new("PROJSIMPLELINKS", "{user}/{index}/+simple/{project}");

    #[test]
    fn test_pattern_key_format() {
        let key = SIMPLE.key(&[("user", "root"), ("index", "pypi"), ("project", "requests")]);
        assert_eq!(key.relpath, "root/pypi/+simple/requests");
        assert_eq!(key.name, "PROJSIMPLELINKS");
    }

    #[test]
    fn test_braces_in_values_are_not_expanded() {
        let key = SIMPLE.key(&[("user", "{index}"), ("index", "pypi"), ("project", "{user}")]);
        assert_eq!(key.relpath, "{index}/pypi/+simple/{user}");
    }

    #[test]
    fn test_unclosed_brace_is_kept() {
        let pattern = PatternKey::new("ODD", "{user}/half{open");
        assert_eq!(pattern.key(&[("user", "root")]).relpath, "root/half{open");
    }

    #[test]
    fn test_missing_param_stays_visible() {
        let key = SIMPLE.key(&[("user", "root")]);
        assert_eq!(key.relpath, "root/{index}/+simple/{project}");
    }
}
