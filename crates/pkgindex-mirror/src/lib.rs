//! pkgindex-mirror - Mirror cache of an upstream package index
//!
//! This crate keeps the release links of upstream projects in keyfs and
//! decides when they must be fetched again:
//! - In-memory freshness caches for project names and retrieval times
//! - Simple page parsing and link merging
//! - Upstream fetches with stale fallback and detached background refresh
//! - Replica reads that wait for the primary's serial instead of writing

pub mod caches;
pub mod error;
pub mod filestore;
pub mod http;
pub mod keys;
pub mod links;
pub mod replication;
pub mod stage;
pub mod sync;

pub use caches::{MirrorCaches, ProjectNamesCache, ProjectUpdateCache};
pub use error::{MirrorError, MirrorResult};
pub use filestore::{FileEntry, FileEntryRecord, FileStore};
pub use http::{ReqwestClient, UpstreamClient, UpstreamRequest, UpstreamResponse};
pub use links::{Link, parse_index, parse_project_list};
pub use replication::{NodeReplication, ReplicationChannel};
pub use stage::{MirrorStage, SimpleLink, SimpleLinksRecord, VersionMetadata};
pub use sync::FetchedLinks;
