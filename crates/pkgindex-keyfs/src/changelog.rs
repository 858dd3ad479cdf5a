//! Changelog entries
//!
//! One [`ChangelogEntry`] is written per committed serial. It maps every
//! relpath touched by the transaction to its keyname, its back-serial and
//! its new value. Back-serials chain the history of a relpath backwards
//! without a separate per-key log.
//!
//! Values are JSON documents shared behind `Arc`, so a decoded entry is
//! a deeply immutable snapshot that can be handed to any number of readers
//! and caches. A `None` value records a deletion.

use crate::error::KeyFsResult;
use pkgindex_common::Serial;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Value payload stored under a relpath
pub type Value = serde_json::Value;

/// One relpath mutation inside a changelog entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub keyname: String,
    pub back_serial: Option<Serial>,
    pub value: Option<Arc<Value>>,
}

/// All relpath mutations committed at one serial
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub changes: BTreeMap<String, ChangeRecord>,
}

impl ChangelogEntry {
    /// Encode for the changelog table
    pub fn to_bytes(&self) -> KeyFsResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from the changelog table
    pub fn from_bytes(data: &[u8]) -> KeyFsResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Relpaths touched by this entry
    pub fn relpaths(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    /// Resolved view of one relpath as written at `serial`
    #[must_use]
    pub fn relpath_at(&self, relpath: &str, serial: Serial) -> Option<RelpathAt> {
        self.changes.get(relpath).map(|record| RelpathAt {
            serial,
            back_serial: record.back_serial,
            value: record.value.clone(),
        })
    }
}

/// The value of a relpath visible at some serial
#[derive(Clone, Debug, PartialEq)]
pub struct RelpathAt {
    /// Serial at which this value was written
    pub serial: Serial,
    /// Serial of the value before that, if any
    pub back_serial: Option<Serial>,
    /// The value, `None` when the write was a deletion
    pub value: Option<Arc<Value>>,
}

/// One row of a by-keyname range scan
#[derive(Clone, Debug, PartialEq)]
pub struct RelpathInfo {
    pub relpath: String,
    pub keyname: String,
    pub serial: Serial,
    pub back_serial: Option<Serial>,
    pub value: Option<Arc<Value>>,
}

/// Lazy `Display` of the relpaths in a change set, for debug logging
pub(crate) struct ChangedKeys<'a>(pub &'a BTreeMap<String, ChangeRecord>);

impl std::fmt::Display for ChangedKeys<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("keys: ")?;
        for (i, relpath) in self.0.keys().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{relpath:?}")?;
        }
        Ok(())
    }
}
