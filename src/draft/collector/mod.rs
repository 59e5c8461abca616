//! Log-fragment collectors.
//!
//! Collectors buffer competing log fragments and resolve conflicts the way
//! the Raft kernel would, without touching the kernel itself. The
//! [`ConsecutiveCollector`] keeps one contiguous entry run, the
//! [`BriefCollector`] keeps a compressed per-term index over accepted
//! history, and the [`LinkedListCollector`] stitches disjoint runs together.

pub mod brief;
pub mod consecutive;
pub mod fragment;
pub mod linked;

pub use brief::{extract_briefs, BriefCollector, BriefSegment};
pub use consecutive::ConsecutiveCollector;
pub use fragment::{
    EntryFragment, FragmentCollector, MultiFragmentCollector, SingleFragmentCollector,
};
pub use linked::LinkedListCollector;

/// Where a `(index, term)` probe lands relative to a collector's records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// The index is below the collector's previous-log anchor.
    Underflow,
    /// The probe matches the `(prev_log_index, prev_log_term)` anchor.
    Prev,
    /// The probe matches a record inside the collector.
    Within,
    /// The index is beyond the last record.
    Overflow,
    /// The index is in range but the terms disagree.
    Conflict,
}

/// Position queries shared by the entry and brief collectors.
pub trait Locator {
    fn match_index(&self, index: u64, term: u64) -> Location;

    /// Locates an index and reports the term recorded there.
    fn locate_index(&self, index: u64) -> (Location, u64);

    fn prev_log_term(&self) -> u64;
    fn prev_log_index(&self) -> u64;

    fn first_index(&self) -> u64;
    fn last_index(&self) -> u64;

    /// An empty collector may still carry a `(prev_log_index,
    /// prev_log_term)` anchor.
    fn is_empty(&self) -> bool;
}
