use crate::types::Entry;

use super::fragment::EntryFragment;
use super::ConsecutiveCollector;

struct FragmentNode {
    collector: ConsecutiveCollector,
    start_index: u64,
    submitter: u64,
}

impl FragmentNode {
    fn new(entries: &[Entry], log_term: u64, log_index: u64) -> Self {
        let mut collector = ConsecutiveCollector::new();
        collector.add_entries(entries, log_term, log_index);
        FragmentNode {
            collector,
            start_index: log_index + 1,
            submitter: 0,
        }
    }
}

/// Combines several disjoint consecutive entry runs, kept ordered by start
/// index.
///
/// Overlap between runs is permitted while `regularized` is off; callers
/// that keep the default regularization on get overlapping prefixes merged
/// as soon as a run is spliced in front of existing ones.
pub struct LinkedListCollector {
    nodes: Vec<FragmentNode>,

    regularized: bool,
    default_reg_opt: bool,
}

impl LinkedListCollector {
    pub fn new(default_reg_opt: bool) -> Self {
        LinkedListCollector {
            nodes: Vec::new(),
            regularized: default_reg_opt,
            default_reg_opt,
        }
    }

    pub fn add_entries(&mut self, entries: &[Entry], log_term: u64, log_index: u64) -> bool {
        if entries.is_empty() {
            return false;
        }

        self.add_entries_inner(self.regularized, entries, log_term, log_index);
        true
    }

    /// Adds a run and tags the receiving node with the submitter term.
    pub fn add_entries_with_submitter(
        &mut self,
        submitter: u64,
        entries: &[Entry],
        log_term: u64,
        log_index: u64,
    ) {
        let pos = self.add_entries_inner(false, entries, log_term, log_index);
        self.nodes[pos].submitter = submitter;
    }

    pub fn fetch_entries(&self, term: u64) -> Option<(Vec<Entry>, u64, u64)> {
        if self.is_refreshed() {
            return None;
        }

        self.nodes
            .iter()
            .find_map(|node| node.collector.fetch_entries(term))
    }

    /// Resolves only when a single run remains.
    pub fn fetch_entries_with_start_index(&self, start_index: u64) -> Option<(Vec<Entry>, u64, u64)> {
        if self.is_refreshed() || self.nodes.len() != 1 {
            return None;
        }

        self.nodes[0].collector.fetch_entries_with_start_index(start_index)
    }

    /// Resolves only when a single run remains.
    pub fn fetch_all_entries(&self) -> Option<(Vec<Entry>, u64, u64)> {
        if self.is_refreshed() || self.nodes.len() != 1 {
            return None;
        }

        self.nodes[0].collector.fetch_all_entries()
    }

    /// Fetches each run with index `>= start_index` as a fragment labeled
    /// with its node's submitter term.
    pub fn fragments_from(&self, start_index: u64) -> Vec<EntryFragment> {
        let mut result = Vec::new();

        for node in &self.nodes {
            if let Some((entries, log_term, log_index)) =
                node.collector.fetch_entries_with_start_index(start_index)
            {
                result.push(EntryFragment {
                    log_term,
                    log_index,
                    entries,
                    c_term: node.submitter,
                });
            }
        }

        result
    }

    pub fn refresh(&mut self) {
        self.nodes.clear();
        self.regularized = self.default_reg_opt;
    }

    pub fn is_refreshed(&self) -> bool {
        self.nodes.is_empty() || self.nodes[0].collector.is_refreshed()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn regularized(&self) -> bool {
        self.regularized
    }

    pub fn set_regularized(&mut self, regularized: bool) {
        self.regularized = regularized;
    }

    fn add_entries_inner(
        &mut self,
        regularize: bool,
        entries: &[Entry],
        log_term: u64,
        log_index: u64,
    ) -> usize {
        if self.nodes.is_empty() {
            self.nodes.push(FragmentNode::new(entries, log_term, log_index));
            return 0;
        }

        for pos in 0..self.nodes.len() {
            if self.nodes[pos].start_index > log_index + 1 {
                // the new run starts in front of this node, splice it in
                self.nodes
                    .insert(pos, FragmentNode::new(entries, log_term, log_index));

                if regularize {
                    self.regularize_from(pos);
                } else {
                    self.nodes.truncate(pos + 1);
                }

                return pos;
            }

            if self.nodes[pos]
                .collector
                .add_entries(entries, log_term, log_index)
            {
                self.nodes.truncate(pos + 1);
                return pos;
            }
        }

        self.nodes.push(FragmentNode::new(entries, log_term, log_index));
        self.nodes.len() - 1
    }

    /// Merges every following run that cleanly extends the run at `pos`,
    /// then drops the rest.
    fn regularize_from(&mut self, pos: usize) {
        let mut needle = pos + 1;

        while needle < self.nodes.len() {
            let Some((entries, log_term, log_index)) =
                self.nodes[needle].collector.fetch_all_entries()
            else {
                break;
            };
            if !self.nodes[pos]
                .collector
                .add_entries(&entries, log_term, log_index)
            {
                break;
            }
            needle += 1;
        }

        self.nodes.truncate(pos + 1);
    }
}
