use serde::{Deserialize, Serialize};

/// Peer identifier. Zero denotes "none".
pub type PeerId = u64;

/// The null peer id.
pub const NONE: PeerId = 0;

/// Raft role of a peer, mirrored from the kernel's soft state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Leader,
    Follower,
    Candidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    Normal,
    ConfChange,
}

impl Default for EntryType {
    fn default() -> Self {
        EntryType::Normal
    }
}

/// A single replicated log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub entry_type: EntryType,
    pub term: u64,
    pub index: u64,
    pub data: Vec<u8>,
}

impl Entry {
    pub fn new(term: u64, index: u64, data: Vec<u8>) -> Self {
        Entry {
            entry_type: EntryType::Normal,
            term,
            index,
            data,
        }
    }
}

/// Durable Raft state: current term, voted-for peer and commit index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

impl HardState {
    pub fn is_empty(&self) -> bool {
        *self == HardState::default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub index: u64,
    pub term: u64,
    pub voters: Vec<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub metadata: SnapshotMetadata,
    pub data: Vec<u8>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.metadata.index == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Vote,
    VoteResp,
    PreVote,
    PreVoteResp,
    App,
    AppResp,
    Heartbeat,
    HeartbeatResp,
    PerMode,
    PerModeResp,
    DrSync,
    DrSyncResp,
}

/// Context payload of a `PerMode` broadcast.
pub const PER_MODE_DELAYED: &[u8] = b"PerModeDelayed";
pub const PER_MODE_IMMEDIATE: &[u8] = b"PerModeImmediate";

/// Context payloads of a `DrSyncResp`.
pub const DR_SYNC_PENDING: &[u8] = b"DrSyncPending";
pub const DR_SYNC_ENTRIES: &[u8] = b"DrSyncEntries";
pub const DR_SYNC_ADVANCE: &[u8] = b"DrSyncAdvance";

/// A message exchanged between peers. Carries the fields Raft normally
/// carries plus the adaptive broadcast and draft-sync kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    pub to: u64,
    pub from: u64,
    pub term: u64,
    pub log_term: u64,
    pub index: u64,
    pub entries: Vec<Entry>,
    pub commit: u64,
    pub snapshot: Option<Snapshot>,
    pub reject: bool,
    pub reject_hint: u64,
    pub context: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MessageType) -> Self {
        Message {
            msg_type,
            to: NONE,
            from: NONE,
            term: 0,
            log_term: 0,
            index: 0,
            entries: Vec::new(),
            commit: 0,
            snapshot: None,
            reject: false,
            reject_hint: 0,
            context: Vec::new(),
        }
    }
}

/// Volatile kernel state surfaced through `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftState {
    pub leader: u64,
    pub role: PeerRole,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadState {
    pub index: u64,
    pub request_ctx: Vec<u8>,
}

/// One batch of kernel output: state to persist, entries to apply and
/// messages to send. Produced by the wrapped Raft kernel and consumed by the
/// driver loop.
#[derive(Debug, Clone, Default)]
pub struct Ready {
    pub soft_state: Option<SoftState>,
    pub hard_state: HardState,
    pub read_states: Vec<ReadState>,
    pub entries: Vec<Entry>,
    pub snapshot: Option<Snapshot>,
    pub committed_entries: Vec<Entry>,
    pub messages: Vec<Message>,
}
