//! Replication channel seen by the mirror
//!
//! A replica never writes mirror data itself. After asking the primary to
//! refresh a project it waits until the replication stream applied the
//! serial the primary reported.

use async_trait::async_trait;
use pkgindex_common::Serial;
use pkgindex_keyfs::KeyFs;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait ReplicationChannel: Send + Sync {
    /// True when this node only applies replicated changes
    fn is_replica(&self) -> bool;

    /// Wait until the local store applied `serial`; `false` on timeout
    async fn wait_for_serial(&self, serial: Serial, timeout: Duration) -> bool;
}

/// Replication state of the local keyfs
pub struct NodeReplication {
    keyfs: Arc<KeyFs>,
    replica: bool,
}

impl NodeReplication {
    #[must_use]
    pub fn new(keyfs: Arc<KeyFs>, replica: bool) -> Self {
        Self { keyfs, replica }
    }
}

#[async_trait]
impl ReplicationChannel for NodeReplication {
    fn is_replica(&self) -> bool {
        self.replica
    }

    async fn wait_for_serial(&self, serial: Serial, timeout: Duration) -> bool {
        self.keyfs.wait_tx_serial(serial, timeout).await
    }
}
