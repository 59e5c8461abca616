//! Mimic-raft analyzer.
//!
//! The analyzer absorbs entry fragments offered by the local kernel and by
//! remote peers, merges them under an analysis policy the way the raft
//! kernel would, and reports the resulting progress. Already-reconciled
//! history is kept compressed in a brief collector; pending work stays as a
//! consecutive entry run.

use std::collections::HashMap;

use crate::draft::collector::{
    BriefCollector, ConsecutiveCollector, EntryFragment, FragmentCollector, Location, Locator,
};
use crate::types::{Entry, PeerId, NONE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisPolicy {
    /// No fragment merging, only commit alignment.
    UpdateCommittedOnly,
    /// Scan offers forward, adopt the first anchored fragment, then merge
    /// forward laxly.
    MatchFirstFragment,
    /// Scan offers backward, adopt the last anchored fragment, then merge
    /// backward.
    MatchLastFragment,
    /// `MatchFirstFragment` with a strict forward merge.
    StrictlyMatchFirst,
    /// Legacy: only accept fragments anchoring into compacted history.
    AccordingToCompacted,
    /// Legacy: ignore compacted history and merge purely by append rules.
    IgnoreCompacted,
}

/// Outcome of an analysis round.
#[derive(Debug, Clone, PartialEq)]
pub struct RackProgress {
    pub no_progress: bool,

    pub term: u64,
    pub term_holder: PeerId,

    pub log_term: u64,
    pub log_index: u64,
    pub commit: u64,
    pub entries: Vec<Entry>,
}

impl RackProgress {
    fn none() -> Self {
        RackProgress {
            no_progress: true,
            term: 0,
            term_holder: NONE,
            log_term: 0,
            log_index: 0,
            commit: 0,
            entries: Vec::new(),
        }
    }

    fn advanced(
        term: u64,
        term_holder: PeerId,
        commit: u64,
        log_term: u64,
        log_index: u64,
        entries: Vec<Entry>,
    ) -> Self {
        RackProgress {
            no_progress: false,
            term,
            term_holder,
            log_term,
            log_index,
            commit,
            entries,
        }
    }
}

#[derive(Debug, Clone)]
struct OfferedFragment {
    fragment: EntryFragment,
    submitter: PeerId,
}

pub struct MimicRaftAnalyzer {
    /// Current term. Raised from `before_term` during analysis, never from a
    /// fragment's submitter term.
    term: u64,
    /// Committed index of the analyzer.
    commit: u64,

    /// Replication log already reconciled with the raft kernel, compressed.
    compacted: BriefCollector,
    /// Replication log not yet handed back to the kernel.
    before_compact: ConsecutiveCollector,
    /// Submitter term of the last fragment merged into `before_compact`,
    /// and the peer that offered it.
    bc_cterm: u64,
    bc_ctholder: PeerId,

    /// Whether the offer buffer has been consumed by analysis.
    analyzed: bool,

    /// Offered fragments, each paired with its submitter.
    before_analysis: Vec<OfferedFragment>,
    /// Greatest committed index ever offered.
    before_committed: u64,
    /// Greatest term ever offered. May exceed `bc_cterm` after analysis.
    before_term: u64,

    buf_size: usize,

    /// Per-submitter buckets preserved for rollback.
    rollback_buckets: Option<HashMap<PeerId, Vec<EntryFragment>>>,
}

impl MimicRaftAnalyzer {
    pub fn new(offer_buf_size: usize) -> Self {
        MimicRaftAnalyzer {
            term: 0,
            commit: 0,
            compacted: BriefCollector::with_anchor(0, 0),
            before_compact: ConsecutiveCollector::new(),
            bc_cterm: 0,
            bc_ctholder: NONE,
            // nothing offered yet, trivially analyzed
            analyzed: true,
            before_analysis: Vec::with_capacity(offer_buf_size),
            before_committed: 0,
            before_term: 0,
            buf_size: offer_buf_size,
            rollback_buckets: None,
        }
    }

    /// Deep copy for sandboxing; pending rollback buckets do not travel.
    pub fn snapshot(&self) -> Self {
        MimicRaftAnalyzer {
            term: self.term,
            commit: self.commit,
            compacted: self.compacted.clone(),
            before_compact: self.before_compact.clone(),
            bc_cterm: self.bc_cterm,
            bc_ctholder: self.bc_ctholder,
            analyzed: self.analyzed,
            before_analysis: self.before_analysis.clone(),
            before_committed: self.before_committed,
            before_term: self.before_term,
            buf_size: self.buf_size,
            rollback_buckets: None,
        }
    }

    /// Offers entries produced by the local kernel, tagged with the
    /// producer's term.
    pub fn offer_local_entries(
        &mut self,
        offer_term: u64,
        offer_id: PeerId,
        committed: u64,
        prev_log_term: u64,
        entries: &[Entry],
    ) {
        if offer_term < self.term {
            return;
        }

        self.analyzed = false;

        if offer_term > self.before_term {
            self.before_term = offer_term;
        }
        if self.before_committed < committed {
            self.before_committed = committed;
        }

        if entries.is_empty() {
            return;
        }

        if entries[0].index <= self.commit {
            // stale, already committed here
            return;
        }

        self.before_analysis.push(OfferedFragment {
            fragment: EntryFragment {
                log_term: prev_log_term,
                log_index: entries[0].index - 1,
                entries: entries.to_vec(),
                c_term: offer_term,
            },
            submitter: offer_id,
        });
    }

    /// Offers fragments collected from a remote peer's file. Fragments
    /// wholly at or below the analyzer's commit are dropped; partially
    /// covered ones are cut down to the uncommitted suffix.
    pub fn offer_remote_entries(
        &mut self,
        offer_term: u64,
        offer_id: PeerId,
        committed: u64,
        fragments: Vec<EntryFragment>,
    ) {
        if offer_term < self.term {
            return;
        }

        self.analyzed = false;

        if offer_term > self.before_term {
            self.before_term = offer_term;
        }
        if self.before_committed < committed {
            self.before_committed = committed;
        }

        for fragment in fragments {
            if let Some(cut) = fragment.with_start_index(self.commit + 1) {
                if !cut.entries.is_empty() {
                    self.before_analysis.push(OfferedFragment {
                        fragment: cut,
                        submitter: offer_id,
                    });
                }
            }
        }
    }

    pub fn analyze_and_remove_offers(&mut self, policy: AnalysisPolicy) {
        // whatever happens, the term advances first
        if self.before_term > self.term {
            self.term = self.before_term;
        }

        if self.analyzed {
            return;
        }

        match policy {
            AnalysisPolicy::UpdateCommittedOnly => {
                self.align_before_committed();
            }
            AnalysisPolicy::MatchFirstFragment => {
                self.sort_before_analysis();
                self.analyze_first_match(false);
            }
            AnalysisPolicy::MatchLastFragment => {
                self.sort_before_analysis();
                self.analyze_last_match();
            }
            AnalysisPolicy::StrictlyMatchFirst => {
                self.sort_before_analysis();
                self.analyze_first_match(true);
            }
            AnalysisPolicy::AccordingToCompacted => {
                self.sort_before_analysis();
                self.analyze_with_compacted();
            }
            AnalysisPolicy::IgnoreCompacted => {
                self.sort_before_analysis();
                self.analyze_without_compacted();
            }
        }

        self.analyzed = true;
        self.remove_offers();
    }

    pub fn committed(&self) -> u64 {
        if !self.analyzed {
            panic!("some fragments are still not analyzed");
        }
        self.commit
    }

    pub fn term(&self) -> u64 {
        if !self.analyzed {
            panic!("some fragments are still not analyzed");
        }
        self.term
    }

    pub fn analyzed(&self) -> bool {
        self.analyzed
    }

    /// Greatest term seen among offers, observable before analysis.
    pub fn offered_term(&self) -> u64 {
        self.before_term
    }

    pub fn progress(&self) -> RackProgress {
        if !self.analyzed {
            panic!("some fragments are still not analyzed");
        }

        if self.before_compact.is_empty() {
            return RackProgress::none();
        }

        let (entries, log_term, log_index) = self
            .before_compact
            .fetch_all_entries()
            .expect("non-empty collector fetches");

        if self.compacted.is_empty() {
            return RackProgress::advanced(
                self.bc_cterm,
                self.bc_ctholder,
                self.commit,
                log_term,
                log_index,
                entries,
            );
        }

        match self.compacted.match_index(log_index, log_term) {
            Location::Underflow => panic!("underflow occurs when delivering progress"),
            Location::Prev | Location::Within => RackProgress::advanced(
                self.bc_cterm,
                self.bc_ctholder,
                self.commit,
                log_term,
                log_index,
                entries,
            ),
            _ => RackProgress::none(),
        }
    }

    /// Moves the pending run into compacted history.
    pub fn compact(&mut self) {
        if self.before_compact.is_empty() {
            return;
        }

        let (entries, log_term, log_index) = self
            .before_compact
            .fetch_all_entries()
            .expect("non-empty collector fetches");
        self.compacted.add_entries_to_brief(&entries, log_term, log_index);
        self.before_compact.refresh();
    }

    /// Compacts only the prefix ending before `index`; the remainder stays
    /// pending.
    pub fn compact_before(&mut self, index: u64) -> Location {
        if self.before_compact.is_empty() {
            return Location::Underflow;
        }

        let (location, _) = self.before_compact.locate_index(index);

        match location {
            Location::Conflict => {
                panic!("detected a conflict while locating an index in the pending run")
            }
            Location::Within => {
                let (tail, tail_term, tail_index) = self
                    .before_compact
                    .fetch_entries_with_start_index(index)
                    .expect("within location fetches");
                let (all, all_term, all_index) = self
                    .before_compact
                    .fetch_all_entries()
                    .expect("non-empty collector fetches");
                let ahead = all.len() - tail.len();
                self.compacted
                    .add_entries_to_brief(&all[..ahead], all_term, all_index);
                self.before_compact.refresh();
                self.before_compact.add_entries(&tail, tail_term, tail_index);
            }
            Location::Overflow => {
                let (all, all_term, all_index) = self
                    .before_compact
                    .fetch_all_entries()
                    .expect("non-empty collector fetches");
                self.compacted.add_entries_to_brief(&all, all_term, all_index);
                self.before_compact.refresh();
            }
            _ => {}
        }

        location
    }

    pub fn try_set_term(&mut self, term: u64) -> bool {
        if self.term > term {
            return false;
        }

        self.term = term;
        true
    }

    /// Position queries against compacted history or the pending run.
    pub fn sub_locator(&self, compacted: bool) -> &dyn Locator {
        if !self.analyzed {
            panic!("locator is unreachable before analysis finishes");
        }

        if compacted {
            &self.compacted
        } else {
            &self.before_compact
        }
    }

    /// Discards the offer buffer without analyzing it.
    pub fn drop_offers(&mut self) -> bool {
        if self.analyzed {
            return false;
        }

        self.remove_offers();
        self.analyzed = true;

        true
    }

    /// Snapshots the offer buffer into per-submitter buckets, then clears
    /// it. Terms and commits do not roll back.
    pub fn prepare_rollback(&mut self) -> bool {
        if self.analyzed {
            return false;
        }

        if self.rollback_buckets.is_some() {
            panic!("duplicated rollback");
        }

        let mut buckets: HashMap<PeerId, Vec<EntryFragment>> =
            HashMap::with_capacity(self.buf_size);
        for offered in &self.before_analysis {
            buckets
                .entry(offered.submitter)
                .or_default()
                .push(offered.fragment.clone());
        }
        self.rollback_buckets = Some(buckets);

        self.remove_offers();
        self.analyzed = true;

        true
    }

    /// Re-inserts the snapshotted fragments of one submitter into `target`.
    pub fn rollback_offers(&mut self, id: PeerId, target: &mut dyn FragmentCollector) {
        let Some(buckets) = self.rollback_buckets.as_mut() else {
            return;
        };

        if let Some(fragments) = buckets.remove(&id) {
            for f in fragments {
                target.add_entries_with_submitter(f.c_term, &f.entries, f.log_term, f.log_index);
            }
        }

        if buckets.is_empty() {
            self.rollback_buckets = None;
        }
    }

    /// Yields the whole rollback snapshot.
    pub fn rollback_all(&mut self) -> Option<HashMap<PeerId, Vec<EntryFragment>>> {
        self.rollback_buckets.take()
    }

    fn sort_before_analysis(&mut self) {
        self.before_analysis.sort_by(|a, b| {
            a.fragment
                .c_term
                .cmp(&b.fragment.c_term)
                .then(a.fragment.last_index().cmp(&b.fragment.last_index()))
        });
    }

    fn adopt_into_refreshed(&mut self, offered: &OfferedFragment) {
        self.before_compact.refresh();
        self.before_compact.add_entries(
            &offered.fragment.entries,
            offered.fragment.log_term,
            offered.fragment.log_index,
        );
        self.bc_cterm = offered.fragment.c_term;
        self.bc_ctholder = offered.submitter;
    }

    fn try_extend_pending(&mut self, offered: &OfferedFragment) -> bool {
        if self.before_compact.add_entries(
            &offered.fragment.entries,
            offered.fragment.log_term,
            offered.fragment.log_index,
        ) {
            self.bc_cterm = offered.fragment.c_term;
            self.bc_ctholder = offered.submitter;
            return true;
        }
        false
    }

    fn pending_anchored_in_compacted(&self) -> bool {
        if self.before_compact.is_empty() {
            return false;
        }
        let prev_log_term = self.before_compact.prev_log_term();
        let first_index = self.before_compact.first_index();
        let loc = self.compacted.match_index(first_index - 1, prev_log_term);
        loc == Location::Prev || loc == Location::Within
    }

    fn analyze_first_match(&mut self, strict: bool) {
        let check_before_compact = self.pending_anchored_in_compacted();

        let size = self.before_analysis.len();
        let mut index = 0;

        while index < size {
            let offered = self.before_analysis[index].clone();
            match self
                .compacted
                .match_index(offered.fragment.log_index, offered.fragment.log_term)
            {
                Location::Underflow => panic!("underflow occurs when merging offered fragments"),
                Location::Prev | Location::Within => {
                    self.adopt_into_refreshed(&offered);
                    self.merge_forward(index + 1, strict);
                    self.truncate_compacted();
                    break;
                }
                Location::Overflow => {
                    if check_before_compact && self.try_extend_pending(&offered) {
                        self.merge_forward(index + 1, strict);
                        self.truncate_compacted();
                        break;
                    }
                }
                Location::Conflict => {}
            }
            index += 1;
        }

        self.align_before_committed();
    }

    fn analyze_last_match(&mut self) {
        let check_before_compact = self.pending_anchored_in_compacted();

        let size = self.before_analysis.len();
        let mut index = size as i64 - 1;

        while index >= 0 {
            let offered = self.before_analysis[index as usize].clone();
            match self
                .compacted
                .match_index(offered.fragment.log_index, offered.fragment.log_term)
            {
                Location::Underflow => panic!("underflow occurs when merging offered fragments"),
                Location::Prev | Location::Within => {
                    self.adopt_into_refreshed(&offered);
                    self.merge_backward(index as usize + 1);
                    self.truncate_compacted();
                    break;
                }
                Location::Overflow => {
                    if check_before_compact && self.try_extend_pending(&offered) {
                        self.merge_backward(index as usize + 1);
                        self.truncate_compacted();
                        break;
                    }
                }
                Location::Conflict => {}
            }
            index -= 1;
        }

        self.align_before_committed();
    }

    // legacy policy
    fn analyze_with_compacted(&mut self) {
        let size = self.before_analysis.len();
        for index in 0..size {
            let offered = self.before_analysis[index].clone();
            match self
                .compacted
                .match_index(offered.fragment.log_index, offered.fragment.log_term)
            {
                Location::Underflow => panic!("underflow occurs in compacted analysis"),
                Location::Prev | Location::Within => {
                    self.adopt_into_refreshed(&offered);
                    self.truncate_compacted();
                }
                Location::Overflow => {
                    self.try_extend_pending(&offered);
                }
                Location::Conflict => {}
            }
        }

        self.truncate_compacted();
        self.align_before_committed();
    }

    // legacy policy
    fn analyze_without_compacted(&mut self) {
        let size = self.before_analysis.len();
        for index in 0..size {
            let offered = self.before_analysis[index].clone();

            if self.before_compact.is_refreshed() {
                self.adopt_into_refreshed(&offered);
                continue;
            }

            let (ok, loc) = self.before_compact.try_add_entries(
                &offered.fragment.entries,
                offered.fragment.log_term,
                offered.fragment.log_index,
            );
            if ok {
                self.bc_cterm = offered.fragment.c_term;
                self.bc_ctholder = offered.submitter;
            } else if loc == Location::Underflow {
                self.adopt_into_refreshed(&offered);
            }
        }

        self.align_before_committed();
    }

    fn merge_forward(&mut self, from: usize, strict: bool) {
        let size = self.before_analysis.len();

        if strict {
            let mut from = from;
            while from >= 1 && from <= size {
                let picked_log_index = self.before_analysis[from - 1].fragment.log_index;
                let mut index = from;
                while index < size {
                    let offered = self.before_analysis[index].clone();
                    if offered.fragment.log_index > picked_log_index
                        && self.try_extend_pending(&offered)
                    {
                        break;
                    }
                    index += 1;
                }

                if index == size {
                    break;
                }

                from = index + 1;
            }
        } else {
            for index in from..size {
                let offered = self.before_analysis[index].clone();
                let (ok, loc) = self.before_compact.try_add_entries(
                    &offered.fragment.entries,
                    offered.fragment.log_term,
                    offered.fragment.log_index,
                );
                if ok {
                    self.bc_cterm = offered.fragment.c_term;
                    self.bc_ctholder = offered.submitter;
                } else if loc == Location::Underflow {
                    match self
                        .compacted
                        .match_index(offered.fragment.log_index, offered.fragment.log_term)
                    {
                        Location::Underflow => {
                            panic!("underflow occurs when merging offered fragments")
                        }
                        Location::Prev | Location::Within => {
                            self.adopt_into_refreshed(&offered);
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn merge_backward(&mut self, from: usize) {
        let size = self.before_analysis.len();
        let mut from = from;

        while from < size {
            let mut index = size as i64 - 1;
            while index >= from as i64 {
                let offered = self.before_analysis[index as usize].clone();
                if self.try_extend_pending(&offered) {
                    break;
                }
                index -= 1;
            }

            if index < from as i64 {
                break;
            }

            from = index as usize + 1;
        }
    }

    /// Resizes compacted history so the pending run chains directly off it,
    /// and pulls the commit forward under the pending run's last index.
    fn truncate_compacted(&mut self) {
        if self.before_compact.is_empty() {
            return;
        }

        let prev_log_term = self.before_compact.prev_log_term();
        let first_index = self.before_compact.first_index();

        match self.compacted.match_index(first_index - 1, prev_log_term) {
            Location::Underflow => {
                // the pending run claims history older than compaction knows
                panic!("an underflow occurs in the consistency check");
            }
            Location::Prev | Location::Within => {
                self.compacted.resize_brief_to_index(first_index - 1);
                let last_index = self.before_compact.last_index();
                if self.before_committed < last_index {
                    self.update_commit(self.before_committed);
                } else {
                    self.update_commit(last_index);
                }
                self.before_committed = self.commit;
            }
            Location::Conflict => panic!("a conflict occurs in the consistency check"),
            Location::Overflow => {}
        }
    }

    /// `commit <- min(before_committed, last pending index)`, never
    /// decreasing.
    fn align_before_committed(&mut self) {
        if self.before_compact.is_empty() {
            self.update_commit(self.before_committed);
        } else {
            let last_index = self.before_compact.last_index();
            if self.before_committed < last_index {
                self.update_commit(self.before_committed);
            } else {
                self.update_commit(last_index);
            }
            self.before_committed = self.commit;
        }
    }

    fn update_commit(&mut self, committed: u64) {
        if committed > self.commit {
            self.commit = committed;
        }
    }

    fn remove_offers(&mut self) {
        if self.before_analysis.len() > self.buf_size {
            self.before_analysis = Vec::with_capacity(self.buf_size);
        } else {
            self.before_analysis.clear();
        }
    }
}
