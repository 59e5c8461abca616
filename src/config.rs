use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::hb_counter::HbCounterKind;

/// Operating mode of an adaptive peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaucrMode {
    /// The peer network works fine: prefer performance, buffer persistent
    /// operations in memory.
    Normal,

    /// The peer network is at stake: prefer reliability, persist every
    /// write immediately.
    Sheltering,
}

impl SaucrMode {
    pub fn is_critical(self) -> bool {
        self == SaucrMode::Sheltering
    }

    pub fn is_fsync(self) -> bool {
        self == SaucrMode::Sheltering
    }

    pub fn conflicts_with_critical(self, critical: bool) -> bool {
        if critical {
            self != SaucrMode::Sheltering
        } else {
            self != SaucrMode::Normal
        }
    }

    pub fn from_critical(critical: bool) -> Self {
        if critical {
            SaucrMode::Sheltering
        } else {
            SaucrMode::Normal
        }
    }

    pub fn from_fsync(fsync: bool) -> Self {
        if fsync {
            SaucrMode::Sheltering
        } else {
            SaucrMode::Normal
        }
    }
}

impl std::fmt::Display for SaucrMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaucrMode::Normal => write!(f, "NORMAL"),
            SaucrMode::Sheltering => write!(f, "SHELTERING"),
        }
    }
}

/// Construction-time knobs of an adaptive peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaucrConfig {
    /// Entry count above which cached writes are forced out to disk.
    /// Zero disables caching by forcing immediate flushes.
    pub max_local_cache_size: usize,

    /// How long cached writes may sit in memory before the next save
    /// flushes them.
    pub cache_preserve_time: Duration,

    /// Mode the peer starts in.
    pub init_mode: SaucrMode,

    /// Force a permanently inactivated monitor regardless of cluster size.
    pub use_disabled_monitor: bool,

    /// Heartbeat counter the monitor builds for each peer.
    pub hb_counter: HbCounterKind,

    /// Whether the leader re-broadcasts its mode periodically.
    pub mode_sync: bool,
    pub mode_sync_interval: Duration,

    /// Mode damper window. Zero disables damping.
    pub damper_window_size: usize,
    pub damper_fluctuate: usize,
}

impl Default for SaucrConfig {
    fn default() -> Self {
        SaucrConfig {
            max_local_cache_size: 50_000,
            cache_preserve_time: Duration::from_secs(30),
            init_mode: SaucrMode::Sheltering,
            use_disabled_monitor: false,
            hb_counter: HbCounterKind::Cautious { polarize: true },
            mode_sync: true,
            mode_sync_interval: Duration::from_millis(100),
            damper_window_size: 0,
            damper_fluctuate: 0,
        }
    }
}

impl SaucrConfig {
    /// The persistence strategy a peer starts with, derived from the
    /// configured initial mode and cache knobs.
    pub fn initial_strategy(&self) -> crate::persistent::PersistentStrategy {
        crate::persistent::PersistentStrategy {
            fsync: self.init_mode.is_fsync(),
            max_local_cache_size: self.max_local_cache_size,
            cache_preserve_time: self.cache_preserve_time,
        }
    }

    /// The critical flag the monitor starts with.
    pub fn initial_critical(&self) -> bool {
        self.init_mode.is_critical()
    }
}
