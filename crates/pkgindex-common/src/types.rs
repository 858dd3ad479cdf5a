//! Core type definitions for pkgindex
//!
//! This module defines the primitive types shared by the storage engine
//! and the mirror layer: commit serials, normalized project names and
//! stage (user/index) names.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Commit serial of the keyfs changelog.
///
/// Serials start at 0 and are assigned exactly once per committed
/// transaction. "No serial" (an empty store, a key without predecessor)
/// is expressed as `Option<Serial>::None`.
pub type Serial = u64;

/// Normalize a project name the PEP 503 way.
///
/// Lowercases the name and collapses every run of `-`, `_` and `.` into a
/// single `-`.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                out.push('-');
                in_separator = true;
            }
        } else {
            out.extend(c.to_lowercase());
            in_separator = false;
        }
    }
    out
}

/// Normalized project name
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display)]
#[display("{_0}")]
pub struct ProjectName(String);

impl ProjectName {
    /// Create a project name, normalizing it
    pub fn new(name: impl AsRef<str>) -> Result<Self, ProjectNameError> {
        let raw = name.as_ref().trim();
        Self::validate(raw)?;
        Ok(Self(normalize_name(raw)))
    }

    /// Get the project name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(name: &str) -> Result<(), ProjectNameError> {
        if name.is_empty() {
            return Err(ProjectNameError::Empty);
        }
        for c in name.chars() {
            if !c.is_ascii_alphanumeric() && !matches!(c, '-' | '_' | '.') {
                return Err(ProjectNameError::InvalidChar(c));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ProjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProjectName({:?})", self.0)
    }
}

impl AsRef<str> for ProjectName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when creating a project name
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProjectNameError {
    #[error("project name cannot be empty")]
    Empty,
    #[error("project name contains invalid character: {0:?}")]
    InvalidChar(char),
}

/// A stage is one index of one user, e.g. `root/pypi`
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[display("{user}/{index}")]
pub struct StageName {
    pub user: String,
    pub index: String,
}

impl StageName {
    /// Create a new stage name
    #[must_use]
    pub fn new(user: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            index: index.into(),
        }
    }
}

impl fmt::Debug for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StageName({}/{})", self.user, self.index)
    }
}
