//! Persistence strategy and the manager contract implemented by
//! [`crate::cached_disk::LocalCachedDisk`].

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{Entry, HardState, Snapshot};

/// How durable writes are treated right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentStrategy {
    /// When true every write is synchronously persisted; caching is
    /// disallowed and previously cached items persist as well.
    pub fsync: bool,

    /// Entry count above which cached writes are forced out.
    pub max_local_cache_size: usize,

    /// How long cached writes may sit before the next save flushes them.
    pub cache_preserve_time: Duration,
}

impl Default for PersistentStrategy {
    fn default() -> Self {
        PersistentStrategy {
            fsync: false,
            max_local_cache_size: 50_000,
            cache_preserve_time: Duration::from_secs(30),
        }
    }
}

/// Descriptor of a remote disk. Remote persistence is not supported by this
/// core; any descriptor is rejected at configuration time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDiskDescriptor {}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentConfig {
    pub strategy: Option<PersistentStrategy>,
    pub remotes: Option<Vec<RemoteDiskDescriptor>>,
}

/// Wraps a storage handle and keeps track of each persistent operation.
pub trait PersistentManager: Send + Sync {
    fn save(&self, hard_state: &HardState, entries: &[Entry]) -> Result<()>;
    fn save_snap(&self, snap: &Snapshot) -> Result<()>;
    fn close(&self) -> Result<()>;

    /// Whether any buffered write has not reached the wrapped storage yet.
    fn unpersisted(&self) -> bool;

    /// Forces every buffered write out to the wrapped storage.
    fn flush(&self) -> Result<()>;

    fn get_config(&self) -> PersistentConfig;
    fn set_config(&self, config: &PersistentConfig) -> Result<()>;

    fn get_strategy(&self) -> PersistentStrategy;
    fn set_strategy(&self, strategy: &PersistentStrategy) -> Result<()>;
}

/// Replaces only the fsync flag of a manager's strategy.
pub fn set_persistent_fsync(manager: &dyn PersistentManager, fsync: bool) -> Result<()> {
    let mut strategy = manager.get_strategy();
    strategy.fsync = fsync;
    manager.set_strategy(&strategy)
}
