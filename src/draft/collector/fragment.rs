use crate::types::Entry;

use super::{ConsecutiveCollector, LinkedListCollector};

/// A run of entries with consecutive indices, its `(log_term, log_index)`
/// predecessor and the term of the peer that submitted it.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryFragment {
    pub log_term: u64,
    pub log_index: u64,
    pub entries: Vec<Entry>,
    pub c_term: u64,
}

impl EntryFragment {
    /// Index of the last entry, falling back to the predecessor position
    /// when the fragment is empty.
    pub fn last_index(&self) -> u64 {
        self.entries.last().map_or(self.log_index, |e| e.index)
    }

    /// The sub-fragment with index `>= start_index`, re-anchored on the
    /// entry just before the cut. `None` when nothing survives.
    pub fn with_start_index(&self, start_index: u64) -> Option<EntryFragment> {
        if self.entries.is_empty() || start_index > self.last_index() {
            return None;
        }

        if start_index <= self.log_index + 1 {
            return Some(self.clone());
        }

        let cut = (start_index - self.log_index - 1) as usize;
        let before = &self.entries[cut - 1];
        Some(EntryFragment {
            log_term: before.term,
            log_index: before.index,
            entries: self.entries[cut..].to_vec(),
            c_term: self.c_term,
        })
    }
}

/// Entry appending and conflict resolution with submitter-term guarding.
pub trait FragmentCollector: Send {
    /// Adds a run when the submitter term is legitimate; refreshes the
    /// recorded submitter on success.
    fn add_entries_with_submitter(
        &mut self,
        submitter_term: u64,
        entries: &[Entry],
        log_term: u64,
        log_index: u64,
    ) -> bool;

    /// Fetches fragments with index `>= start_index`; `None` when no entry
    /// qualifies.
    fn fetch_fragments_with_start_index(&self, start_index: u64) -> Option<Vec<EntryFragment>>;

    fn fetch_all_fragments(&self) -> Option<Vec<EntryFragment>>;

    fn is_refreshed(&self) -> bool;
    fn refresh(&mut self);
}

/// Fragment collector over one contiguous run.
pub struct SingleFragmentCollector {
    cec: ConsecutiveCollector,
    guarantor: u64,
}

impl Default for SingleFragmentCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleFragmentCollector {
    pub fn new() -> Self {
        SingleFragmentCollector {
            cec: ConsecutiveCollector::new(),
            guarantor: 0,
        }
    }
}

impl FragmentCollector for SingleFragmentCollector {
    fn add_entries_with_submitter(
        &mut self,
        submitter_term: u64,
        entries: &[Entry],
        log_term: u64,
        log_index: u64,
    ) -> bool {
        if submitter_term < self.guarantor {
            return false;
        }

        if !self.cec.try_add_entries(entries, log_term, log_index).0 {
            return false;
        }

        self.guarantor = submitter_term;
        true
    }

    fn fetch_fragments_with_start_index(&self, start_index: u64) -> Option<Vec<EntryFragment>> {
        if self.is_refreshed() {
            return None;
        }

        let (entries, log_term, log_index) = self.cec.fetch_entries_with_start_index(start_index)?;
        Some(vec![EntryFragment {
            log_term,
            log_index,
            entries,
            c_term: self.guarantor,
        }])
    }

    fn fetch_all_fragments(&self) -> Option<Vec<EntryFragment>> {
        if self.is_refreshed() {
            return None;
        }

        let (entries, log_term, log_index) = self.cec.fetch_all_entries()?;
        Some(vec![EntryFragment {
            log_term,
            log_index,
            entries,
            c_term: self.guarantor,
        }])
    }

    fn is_refreshed(&self) -> bool {
        self.cec.is_refreshed()
    }

    fn refresh(&mut self) {
        self.guarantor = 0;
        self.cec.refresh();
    }
}

/// Fragment collector over several disjoint runs.
pub struct MultiFragmentCollector {
    list: LinkedListCollector,
}

impl Default for MultiFragmentCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiFragmentCollector {
    pub fn new() -> Self {
        MultiFragmentCollector {
            list: LinkedListCollector::new(true),
        }
    }
}

impl FragmentCollector for MultiFragmentCollector {
    fn add_entries_with_submitter(
        &mut self,
        submitter_term: u64,
        entries: &[Entry],
        log_term: u64,
        log_index: u64,
    ) -> bool {
        self.list
            .add_entries_with_submitter(submitter_term, entries, log_term, log_index);
        true
    }

    fn fetch_fragments_with_start_index(&self, start_index: u64) -> Option<Vec<EntryFragment>> {
        if self.is_refreshed() {
            return None;
        }

        let fragments = self.list.fragments_from(start_index);
        if fragments.is_empty() {
            return None;
        }
        Some(fragments)
    }

    fn fetch_all_fragments(&self) -> Option<Vec<EntryFragment>> {
        if self.is_refreshed() {
            return None;
        }

        Some(self.list.fragments_from(0))
    }

    fn is_refreshed(&self) -> bool {
        self.list.is_refreshed()
    }

    fn refresh(&mut self) {
        self.list.refresh();
    }
}
