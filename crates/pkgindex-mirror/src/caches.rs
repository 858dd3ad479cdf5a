//! In-memory freshness bookkeeping
//!
//! Neither cache is persisted: the full upstream name list changes too
//! often to write it on every check, and retrieval times are only hints.
//! Both are owned by a [`MirrorCaches`] context created by the process
//! and shared by every component of one stage.

use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Full list of project names known upstream
#[derive(Debug, Default)]
pub struct ProjectNamesCache {
    data: RwLock<Arc<BTreeSet<String>>>,
    timestamp: RwLock<Option<Instant>>,
}

impl ProjectNamesCache {
    /// Check if the list was ever loaded
    #[must_use]
    pub fn exists(&self) -> bool {
        self.timestamp.read().is_some()
    }

    #[must_use]
    pub fn is_expired(&self, expiry: Duration) -> bool {
        self.timestamp
            .read()
            .is_none_or(|loaded| loaded.elapsed() >= expiry)
    }

    /// Snapshot of the names
    #[must_use]
    pub fn get(&self) -> Arc<BTreeSet<String>> {
        Arc::clone(&self.data.read())
    }

    pub fn add(&self, project: &str) {
        let mut data = self.data.write();
        if !data.contains(project) {
            Arc::make_mut(&mut *data).insert(project.to_string());
        }
    }

    /// Replace the names and mark the list current
    pub fn set(&self, projects: BTreeSet<String>) {
        *self.data.write() = Arc::new(projects);
        self.mark_current();
    }

    /// Mark the list current without changing it
    pub fn mark_current(&self) {
        *self.timestamp.write() = Some(Instant::now());
    }
}

/// Per-project time of the last successful upstream retrieval
#[derive(Debug, Default)]
pub struct ProjectUpdateCache {
    retrieved: DashMap<String, Instant>,
}

impl ProjectUpdateCache {
    /// Projects never retrieved count as expired
    #[must_use]
    pub fn is_expired(&self, project: &str, expiry: Duration) -> bool {
        self.retrieved
            .get(project)
            .is_none_or(|at| at.elapsed() >= expiry)
    }

    pub fn refresh(&self, project: &str) {
        let now = Instant::now();
        self.retrieved
            .entry(project.to_string())
            .and_modify(|at| *at = (*at).max(now))
            .or_insert(now);
    }

    pub fn expire(&self, project: &str) {
        self.retrieved.remove(project);
    }
}

/// Freshness caches of one mirror stage
#[derive(Debug, Default)]
pub struct MirrorCaches {
    pub project_names: ProjectNamesCache,
    pub retrieve_times: ProjectUpdateCache,
}

impl MirrorCaches {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}
