use crate::types::Entry;

use super::{Location, Locator};

/// Compressed descriptor of a maximal equal-term run of log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BriefSegment {
    pub term: u64,
    pub prev_log_term: u64,
    pub first_index: u64,
    pub last_index: u64,
}

impl BriefSegment {
    pub fn hit(&self, term: u64, index: u64) -> bool {
        term == self.term && self.first_index <= index && index <= self.last_index
    }

    pub fn hit_prev(&self, term: u64, index: u64) -> bool {
        term == self.prev_log_term && self.first_index - 1 == index
    }
}

/// Compresses an entry run into brief segments, one per term change. The
/// first segment's `prev_log_term` is the provided one; later segments chain
/// off the previous segment's term.
pub fn extract_briefs(prev_log_term: u64, entries: &[Entry]) -> Vec<BriefSegment> {
    let mut result: Vec<BriefSegment> = Vec::new();
    let mut current: Option<BriefSegment> = None;

    for entry in entries {
        match current.as_mut() {
            Some(brief) if brief.term == entry.term => {
                brief.last_index = entry.index;
            }
            Some(brief) => {
                let prev_term = brief.term;
                result.push(*brief);
                current = Some(BriefSegment {
                    term: entry.term,
                    prev_log_term: prev_term,
                    first_index: entry.index,
                    last_index: entry.index,
                });
            }
            None => {
                current = Some(BriefSegment {
                    term: entry.term,
                    prev_log_term,
                    first_index: entry.index,
                    last_index: entry.index,
                });
            }
        }
    }

    if let Some(brief) = current {
        result.push(brief);
    }

    result
}

/// Strictly-ordered list of brief segments with raft-kernel add and resize
/// semantics over the compressed form.
#[derive(Debug, Clone)]
pub struct BriefCollector {
    segments: Vec<BriefSegment>,

    log_term: u64,
    log_index: u64,

    initialized: bool,
}

impl Default for BriefCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl BriefCollector {
    pub fn new() -> Self {
        BriefCollector {
            segments: Vec::new(),
            log_term: 0,
            log_index: 0,
            initialized: false,
        }
    }

    /// An empty but initialised collector anchored at `(log_term,
    /// log_index)`.
    pub fn with_anchor(log_term: u64, log_index: u64) -> Self {
        BriefCollector {
            segments: Vec::new(),
            log_term,
            log_index,
            initialized: true,
        }
    }

    pub fn add_entries_to_brief(&mut self, entries: &[Entry], log_term: u64, log_index: u64) -> bool {
        if self.is_refreshed() {
            self.init(entries, log_term, log_index);
            return true;
        }

        if self.is_empty() {
            if self.log_term == log_term && self.log_index == log_index {
                self.init(entries, log_term, log_index);
                return true;
            }
            return false;
        }

        // tightly behind the last brief, short-cut
        let last = *self.segments.last().expect("non-empty checked above");
        if last.last_index == log_index && last.term == log_term {
            let briefs = extract_briefs(log_term, entries);
            if !briefs.is_empty() {
                if briefs[0].term == last.term {
                    self.segments.last_mut().unwrap().last_index = briefs[0].last_index;
                    self.segments.extend_from_slice(&briefs[1..]);
                } else {
                    self.segments.extend_from_slice(&briefs);
                }
            }
            return true;
        }

        self.mimic(entries, log_term, log_index).0
    }

    /// Truncates so the last retained index equals `index`; reports where
    /// the request landed before truncation.
    pub fn resize_brief_to_index(&mut self, index: u64) -> (bool, Location) {
        if self.is_refreshed() {
            panic!("cannot resize a non-initialized brief collector");
        }

        if self.is_empty() {
            return match index {
                i if i < self.log_index => (false, Location::Underflow),
                i if i == self.log_index => (true, Location::Prev),
                _ => (false, Location::Overflow),
            };
        }

        let first = self.segments[0].first_index;
        let last = self.segments[self.segments.len() - 1].last_index;

        if index < first - 1 {
            (false, Location::Underflow)
        } else if index == first - 1 {
            self.segments.clear();
            (true, Location::Prev)
        } else if index > last {
            (false, Location::Overflow)
        } else {
            let idx = self.locate_segment_by_index(index, 0, self.segments.len());
            self.segments.truncate(idx + 1);
            self.segments[idx].last_index = index;
            (true, Location::Within)
        }
    }

    pub fn briefing(&self) -> &[BriefSegment] {
        &self.segments
    }

    pub fn is_refreshed(&self) -> bool {
        !self.initialized
    }

    pub fn refresh(&mut self) {
        self.segments.clear();
        self.initialized = false;
    }

    fn init(&mut self, entries: &[Entry], log_term: u64, log_index: u64) {
        self.initialized = true;
        self.log_term = log_term;
        self.log_index = log_index;
        self.segments = extract_briefs(log_term, entries);
    }

    /// Compresses the fragment into briefs, then adds them the way the raft
    /// kernel would. Not callable on an empty collector.
    fn mimic(&mut self, entries: &[Entry], log_term: u64, log_index: u64) -> (bool, Location) {
        let (loc, _) = self.match_index_in_segments(log_index, log_term);
        if loc != Location::Prev && loc != Location::Within {
            return (false, loc);
        }

        let e_len = entries.len();
        let c_len = self.segments.len();

        if e_len != 0 {
            let (head_loc, head_idx) =
                self.match_index_in_segments(entries[0].index, entries[0].term);
            if head_loc == Location::Within {
                let mut c_idx = head_idx;
                let mut e_idx = 0;

                while e_idx < e_len && c_idx < c_len {
                    let ent = &entries[e_idx];
                    if !self.segments[c_idx].hit(ent.term, ent.index) {
                        c_idx += 1;
                        if c_idx == c_len {
                            break;
                        }
                        if !self.segments[c_idx].hit(ent.term, ent.index) {
                            break;
                        }
                    }
                    e_idx += 1;
                }

                if e_idx != e_len {
                    let prev_log_term = if e_idx == 0 {
                        log_term
                    } else {
                        entries[e_idx - 1].term
                    };
                    let rest = &entries[e_idx..];
                    let after = rest[0].index;

                    let briefs = extract_briefs(prev_log_term, rest);
                    if self.segments[c_len - 1].last_index + 1 == after {
                        // direct append
                        self.absorb_briefs(&briefs);
                    } else {
                        // truncate, then append; a conflict landing on a
                        // segment's first index drops that segment whole
                        if after <= self.segments[c_idx].first_index {
                            self.segments.truncate(c_idx);
                        } else {
                            self.segments.truncate(c_idx + 1);
                            self.segments[c_idx].last_index = after - 1;
                        }
                        self.absorb_briefs(&briefs);
                    }
                }
            }
        }

        (true, loc)
    }

    fn absorb_briefs(&mut self, briefs: &[BriefSegment]) {
        if briefs.is_empty() {
            return;
        }

        let succ = briefs[0];
        let last = *self.segments.last().expect("absorb into non-empty list");

        if succ.term == last.term {
            self.segments.last_mut().unwrap().last_index = succ.last_index;
            self.segments.extend_from_slice(&briefs[1..]);
        } else if succ.prev_log_term == last.term {
            self.segments.extend_from_slice(briefs);
        }
    }

    fn locate_segment_by_term(&self, term: u64, from: usize, to: usize) -> usize {
        let mut start = from;
        let mut end = to;

        while start < end {
            let mid = (start + end) / 2;
            let t = self.segments[mid].term;

            if t < term {
                start = mid + 1;
            } else if term < t {
                end = mid;
            } else {
                return mid;
            }
        }

        start
    }

    fn locate_segment_by_index(&self, index: u64, from: usize, to: usize) -> usize {
        let mut start = from;
        let mut end = to;

        while start < end {
            let mid = (start + end) / 2;
            let (first, last) = (self.segments[mid].first_index, self.segments[mid].last_index);

            if last < index {
                start = mid + 1;
            } else if index < first {
                end = mid;
            } else {
                return mid;
            }
        }

        start
    }

    /// Matches against a non-empty segment list, also reporting which
    /// segment was hit on `Within`.
    fn match_index_in_segments(&self, index: u64, term: u64) -> (Location, usize) {
        let first = self.segments[0].first_index;
        let last = self.segments[self.segments.len() - 1].last_index;

        if index < first - 1 {
            (Location::Underflow, 0)
        } else if index == first - 1 {
            if self.segments[0].hit_prev(term, index) {
                (Location::Prev, 0)
            } else {
                (Location::Conflict, 0)
            }
        } else if index > last {
            (Location::Overflow, 0)
        } else {
            let idx = self.locate_segment_by_term(term, 0, self.segments.len());
            if idx < self.segments.len() && self.segments[idx].hit(term, index) {
                (Location::Within, idx)
            } else {
                (Location::Conflict, 0)
            }
        }
    }
}

impl Locator for BriefCollector {
    fn match_index(&self, index: u64, term: u64) -> Location {
        if self.is_refreshed() {
            panic!("brief collector is not initialized");
        }

        if self.is_empty() {
            return match index {
                i if i < self.log_index => Location::Underflow,
                i if i == self.log_index => {
                    if term == self.log_term {
                        Location::Prev
                    } else {
                        Location::Conflict
                    }
                }
                _ => Location::Overflow,
            };
        }

        self.match_index_in_segments(index, term).0
    }

    fn locate_index(&self, index: u64) -> (Location, u64) {
        if self.is_refreshed() {
            panic!("brief collector is not initialized");
        }

        if self.is_empty() {
            return match index {
                i if i < self.log_index => (Location::Underflow, 0),
                i if i == self.log_index => (Location::Prev, self.log_term),
                _ => (Location::Overflow, 0),
            };
        }

        let first = self.segments[0].first_index;
        let last = self.segments[self.segments.len() - 1].last_index;

        if index < first - 1 {
            (Location::Underflow, 0)
        } else if index == first - 1 {
            (Location::Prev, self.segments[0].prev_log_term)
        } else if index > last {
            (Location::Overflow, 0)
        } else {
            let idx = self.locate_segment_by_index(index, 0, self.segments.len());
            (Location::Within, self.segments[idx].term)
        }
    }

    fn prev_log_term(&self) -> u64 {
        if self.is_refreshed() {
            panic!("brief collector is not initialized");
        }
        self.log_term
    }

    fn prev_log_index(&self) -> u64 {
        if self.is_refreshed() {
            panic!("brief collector is not initialized");
        }
        self.log_index
    }

    fn first_index(&self) -> u64 {
        if self.is_refreshed() || self.is_empty() {
            panic!("brief collector has no first index");
        }
        self.log_index + 1
    }

    fn last_index(&self) -> u64 {
        if self.is_refreshed() || self.is_empty() {
            panic!("brief collector has no last index");
        }
        self.segments[self.segments.len() - 1].last_index
    }

    fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
}
