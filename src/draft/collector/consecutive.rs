use crate::types::Entry;

use super::{Location, Locator};

#[derive(Debug, Clone, Copy)]
struct TermRange {
    term: u64,
    first: usize,
    last: usize,
}

/// A contiguous entry array with raft-kernel conflict resolution.
///
/// `add_entries` may reinitialise or truncate the internal array; entries
/// that are not appendable even after those steps are not taken in, so the
/// array stays consecutive. A term-range table built by [`Self::briefing`]
/// accelerates term lookups and is invalidated by any mutation.
#[derive(Debug, Clone)]
pub struct ConsecutiveCollector {
    log_term: u64,
    log_index: u64,
    next_index: u64,

    content: Vec<Entry>,

    cached_table: Vec<TermRange>,

    initialized: bool,
}

impl Default for ConsecutiveCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsecutiveCollector {
    pub fn new() -> Self {
        ConsecutiveCollector {
            log_term: 0,
            log_index: 0,
            next_index: 0,
            content: Vec::new(),
            cached_table: Vec::new(),
            initialized: false,
        }
    }

    pub fn add_entries(&mut self, entries: &[Entry], log_term: u64, log_index: u64) -> bool {
        if self.is_refreshed() {
            self.init(entries, log_term, log_index);
            return true;
        }

        self.mimic(entries, log_term, log_index).0
    }

    /// Like `add_entries` but reports the probe location for diagnosis when
    /// the addition is rejected.
    pub fn try_add_entries(
        &mut self,
        entries: &[Entry],
        log_term: u64,
        log_index: u64,
    ) -> (bool, Location) {
        if self.is_refreshed() {
            self.init(entries, log_term, log_index);
            return (true, Location::Prev);
        }

        self.mimic(entries, log_term, log_index)
    }

    /// Fetches the maximal run of entries carrying `term`, along with the
    /// `(log_term, log_index)` immediately preceding it.
    pub fn fetch_entries(&self, term: u64) -> Option<(Vec<Entry>, u64, u64)> {
        if self.is_refreshed() {
            return None;
        }

        let len = self.content.len();
        let (found, idx) = self.locate_entry_with_term(term, 0, len);
        if !found {
            return None;
        }

        let (_, left) = self.locate_first_entry_with_term(term, 0, idx + 1);
        let (_, right) = self.locate_last_entry_with_term(term, idx, len);

        if left == 0 {
            return Some((
                self.content[..=right].to_vec(),
                self.log_term,
                self.log_index,
            ));
        }

        let prev = &self.content[left - 1];
        Some((self.content[left..=right].to_vec(), prev.term, prev.index))
    }

    /// Fetches the suffix with index `>= start_index` plus its predecessor
    /// coordinates.
    pub fn fetch_entries_with_start_index(&self, start_index: u64) -> Option<(Vec<Entry>, u64, u64)> {
        if self.is_refreshed() {
            return None;
        }

        if start_index <= self.log_index + 1 {
            return Some((self.content.clone(), self.log_term, self.log_index));
        }

        if start_index >= self.next_index {
            return None;
        }

        let (_, idx) = self.locate_entry_with_index(start_index);
        let before = &self.content[idx - 1];
        Some((self.content[idx..].to_vec(), before.term, before.index))
    }

    pub fn fetch_all_entries(&self) -> Option<(Vec<Entry>, u64, u64)> {
        if self.is_refreshed() {
            return None;
        }

        Some((self.content.clone(), self.log_term, self.log_index))
    }

    pub fn refresh(&mut self) {
        if self.is_refreshed() {
            return;
        }

        self.content = Vec::new();
        self.initialized = false;
        self.cached_table.clear();
    }

    pub fn is_refreshed(&self) -> bool {
        !self.initialized
    }

    /// Extracts the per-term brief segments of the current content and
    /// rebuilds the term-range table along the way.
    pub fn briefing(&mut self) -> Vec<super::BriefSegment> {
        if self.is_refreshed() || self.is_empty() {
            return Vec::new();
        }

        let mut result = Vec::new();
        let mut left = 0;
        let mut log_term = self.log_term;
        let len = self.content.len();

        self.cached_table.clear();
        let mut table = Vec::new();

        while left < len {
            let term = self.content[left].term;
            let (_, right) = self.locate_last_entry_with_term(term, left, len);
            result.push(super::BriefSegment {
                term,
                prev_log_term: log_term,
                first_index: self.content[left].index,
                last_index: self.content[right].index,
            });
            table.push(TermRange {
                term,
                first: left,
                last: right,
            });
            log_term = term;
            left = right + 1;
        }

        self.cached_table = table;

        result
    }

    pub fn entry_size(&self) -> usize {
        if self.is_refreshed() {
            return 0;
        }
        self.content.len()
    }

    /// Term of the last entry, if any.
    pub fn latest_term(&self) -> Option<u64> {
        if self.is_refreshed() || self.is_empty() {
            return None;
        }
        self.content.last().map(|e| e.term)
    }

    fn init(&mut self, entries: &[Entry], log_term: u64, log_index: u64) {
        self.content = entries.to_vec();
        self.log_term = log_term;
        self.log_index = log_index;
        self.next_index = log_index + entries.len() as u64 + 1;
        self.initialized = true;
        self.cached_table.clear();
    }

    fn direct_add_entries(&mut self, entries: &[Entry]) {
        if entries.is_empty() {
            return;
        }

        self.content.extend_from_slice(entries);
        self.next_index = entries[entries.len() - 1].index + 1;
    }

    fn mimic(&mut self, entries: &[Entry], log_term: u64, log_index: u64) -> (bool, Location) {
        // committed bounds are the caller's concern

        let loc = self.match_index(log_index, log_term);
        if loc != Location::Prev && loc != Location::Within {
            return (false, loc);
        }

        // find the first diverging entry
        let (_, mut c_idx) = self.locate_entry_with_index(log_index + 1);
        let c_len = self.content.len();
        let mut e_idx = 0;
        let e_len = entries.len();

        while c_idx < c_len && e_idx < e_len {
            if entries[e_idx].term != self.content[c_idx].term {
                break;
            }
            c_idx += 1;
            e_idx += 1;
        }

        if e_idx != e_len {
            self.cached_table.clear();
            let rest = &entries[e_idx..];

            let after = rest[0].index;
            if c_len > 0 && self.content[c_len - 1].index + 1 == after {
                self.direct_add_entries(rest);
            } else {
                self.resize(c_idx, log_term, log_index);
                self.direct_add_entries(rest);
            }
        }

        (true, loc)
    }

    fn resize(&mut self, length: usize, log_term: u64, log_index: u64) -> usize {
        if length >= self.content.len() {
            return self.content.len();
        }

        if length == 0 {
            self.init(&[], log_term, log_index);
            return 0;
        }

        self.content.truncate(length);
        self.next_index = self.log_index + length as u64 + 1;

        length
    }

    fn locate_entry_with_index(&self, index: u64) -> (bool, usize) {
        if index <= self.log_index {
            return (false, 0);
        }
        let rel = (index - self.log_index - 1) as usize;
        (rel < self.content.len(), rel)
    }

    fn locate_entry_with_term(&self, term: u64, from: usize, to: usize) -> (bool, usize) {
        if let Some((left, _)) = self.locate_cached_table_with_term(term, from, to) {
            return (true, left);
        }

        let mut start = from;
        let mut end = to;

        while start < end {
            let mid = (start + end) / 2;
            let t = self.content[mid].term;
            if t == term {
                return (true, mid);
            } else if t < term {
                start = mid + 1;
            } else {
                end = mid;
            }
        }

        (false, start)
    }

    fn locate_first_entry_with_term(&self, term: u64, from: usize, to: usize) -> (bool, usize) {
        if let Some((left, _)) = self.locate_cached_table_with_term(term, from, to) {
            return (true, left);
        }

        let mut start = from;
        let mut end = to;

        while start < end {
            let mid = (start + end) / 2;
            let t = self.content[mid].term;
            if t == term {
                if mid == from || self.content[mid - 1].term != term {
                    return (true, mid);
                }
                end = mid;
            } else if t < term {
                start = mid + 1;
            } else {
                end = mid;
            }
        }

        (false, start)
    }

    fn locate_last_entry_with_term(&self, term: u64, from: usize, to: usize) -> (bool, usize) {
        if let Some((_, right)) = self.locate_cached_table_with_term(term, from, to) {
            return (true, right);
        }

        let mut start = from;
        let mut end = to;

        while start < end {
            let mid = (start + end) / 2;
            let t = self.content[mid].term;
            if t == term {
                if mid == to - 1 || self.content[mid + 1].term != term {
                    return (true, mid);
                }
                start = mid + 1;
            } else if t < term {
                start = mid + 1;
            } else {
                end = mid;
            }
        }

        (false, start)
    }

    fn locate_cached_table_with_term(
        &self,
        term: u64,
        from: usize,
        to: usize,
    ) -> Option<(usize, usize)> {
        if self.cached_table.is_empty() {
            return None;
        }

        let mut start = 0;
        let mut end = self.cached_table.len();

        while start < end {
            let mid = (start + end) / 2;
            let range = self.cached_table[mid];

            if range.term == term {
                if range.first >= to || range.last < from {
                    return None;
                }
                let left = range.first.max(from);
                let right = range.last.min(to - 1);
                return Some((left, right));
            } else if range.term < term {
                start = mid + 1;
            } else {
                end = mid;
            }
        }

        None
    }
}

impl Locator for ConsecutiveCollector {
    fn match_index(&self, index: u64, term: u64) -> Location {
        if self.is_refreshed() {
            panic!("consecutive collector is not initialized");
        }

        if self.log_index > index {
            Location::Underflow
        } else if self.log_index == index {
            if self.log_term != term {
                Location::Conflict
            } else {
                Location::Prev
            }
        } else {
            let (found, idx) = self.locate_entry_with_index(index);
            if !found {
                Location::Overflow
            } else if self.content[idx].term != term {
                Location::Conflict
            } else {
                Location::Within
            }
        }
    }

    fn locate_index(&self, index: u64) -> (Location, u64) {
        if self.is_refreshed() {
            panic!("consecutive collector is not initialized");
        }

        if self.log_index > index {
            (Location::Underflow, 0)
        } else if self.log_index == index {
            (Location::Prev, self.log_term)
        } else {
            let (found, idx) = self.locate_entry_with_index(index);
            if !found {
                (Location::Overflow, 0)
            } else {
                (Location::Within, self.content[idx].term)
            }
        }
    }

    fn prev_log_term(&self) -> u64 {
        if self.is_refreshed() {
            panic!("consecutive collector is not initialized");
        }
        self.log_term
    }

    fn prev_log_index(&self) -> u64 {
        if self.is_refreshed() {
            panic!("consecutive collector is not initialized");
        }
        self.log_index
    }

    fn first_index(&self) -> u64 {
        if self.is_refreshed() || self.is_empty() {
            panic!("consecutive collector has no first index");
        }
        self.log_index + 1
    }

    fn last_index(&self) -> u64 {
        if self.is_refreshed() || self.is_empty() {
            panic!("consecutive collector has no last index");
        }
        self.log_index + self.content.len() as u64
    }

    fn is_empty(&self) -> bool {
        self.entry_size() == 0
    }
}
