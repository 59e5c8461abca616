//! Situation-aware adaptive persistence and draft log reconciliation
//! layered on a Raft consensus kernel.
//!
//! A replicated-state-machine peer dynamically switches between a normal
//! mode, where log entries and hard state are buffered in volatile memory,
//! and a sheltering mode, where every write is synchronously persisted. The
//! decision is driven by a heartbeat-based connectivity monitor tracking
//! per-peer health. An independent draft subsystem reconciles competing log
//! fragments received from multiple peers through replicated message files.
//!
//! The Raft kernel itself, the storage engine and the network transport are
//! external collaborators, consumed through the traits in
//! [`saucr_node`] and [`cached_disk`].

pub mod cached_disk;
pub mod codec;
pub mod config;
pub mod draft;
pub mod error;
pub mod hb_counter;
pub mod monitor;
pub mod persistent;
pub mod saucr_node;
pub mod types;

pub use cached_disk::{LocalCachedDisk, Storage};
pub use config::{SaucrConfig, SaucrMode};
pub use error::{Result, SaucrError};
pub use hb_counter::{HbCounterKind, HeartbeatCounter};
pub use monitor::{
    InactivatedMonitor, Perceptible, PerceptibleConfig, SaucrMonitor,
};
pub use persistent::{PersistentConfig, PersistentManager, PersistentStrategy};
pub use saucr_node::{
    AdaptiveMessageSink, Apply, MemStorage, RaftKernel, ReadyHandler, SaucrModeDamper,
    SaucrNodeChannels, SaucrNodeConfig, SaucrRaftNode, Transport,
};
pub use types::{
    Entry, EntryType, HardState, Message, MessageType, PeerId, PeerRole, ReadState, Ready,
    Snapshot, SoftState, NONE,
};
