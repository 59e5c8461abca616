//! Cross-collector fragment merging, used when several fragment collectors
//! have to be folded into one consecutive run outside an analyzer.

use super::collector::{ConsecutiveCollector, EntryFragment, FragmentCollector};

/// Merges the fragments of every `minor` collector into `out` and folds the
/// accompanying commit hints into one commit index.
pub fn merge_collectors_with_commit(
    commit: u64,
    out: &mut ConsecutiveCollector,
    minor: &[&dyn FragmentCollector],
    minor_commit: &[u64],
) -> u64 {
    merge_entry_fragments(commit, minor, out);

    let mut commit = commit;
    for &c in minor_commit {
        if c > commit {
            commit = c;
        }
    }

    commit
}

/// Draws the uncommitted fragments out of the input collectors, orders them
/// by submitter term (longer fragments first within a term), and replays
/// them into `out` with ever-increasing submitter expectations.
pub fn merge_entry_fragments(
    commit: u64,
    inputs: &[&dyn FragmentCollector],
    out: &mut ConsecutiveCollector,
) {
    if inputs.is_empty() {
        return;
    }

    let init_term = out.latest_term().unwrap_or(0);

    let mut fragments: Vec<EntryFragment> = Vec::with_capacity(inputs.len());
    for collector in inputs {
        if let Some(batch) = collector.fetch_fragments_with_start_index(commit + 1) {
            if let Some(start) = batch.iter().position(|f| f.c_term >= init_term) {
                fragments.extend(batch.into_iter().skip(start));
            }
        }
    }

    if fragments.is_empty() {
        return;
    }

    fragments.sort_by(|a, b| {
        a.c_term
            .cmp(&b.c_term)
            .then(b.entries.len().cmp(&a.entries.len()))
    });

    let mut next_term = fragments[0].c_term;

    for f in &fragments {
        if f.c_term >= next_term {
            out.try_add_entries(&f.entries, f.log_term, f.log_index);
            next_term += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::collector::SingleFragmentCollector;
    use crate::types::Entry;

    fn entries(range: std::ops::Range<u64>, term: u64) -> Vec<Entry> {
        range.map(|i| Entry::new(term, i, vec![])).collect()
    }

    #[test]
    fn fragments_replay_in_submitter_term_order() {
        let mut early = SingleFragmentCollector::new();
        early.add_entries_with_submitter(1, &entries(1..3, 1), 0, 0);

        let mut late = SingleFragmentCollector::new();
        late.add_entries_with_submitter(2, &entries(1..5, 2), 0, 0);

        let mut out = ConsecutiveCollector::new();
        let commit = merge_collectors_with_commit(
            0,
            &mut out,
            &[&early as &dyn FragmentCollector, &late],
            &[1, 3],
        );

        assert_eq!(commit, 3);
        let (all, _, _) = out.fetch_all_entries().unwrap();
        assert_eq!(all.len(), 4, "the later submitter's run wins");
        assert_eq!(all[0].term, 2);
    }

    #[test]
    fn committed_prefix_is_skipped() {
        let mut input = SingleFragmentCollector::new();
        input.add_entries_with_submitter(2, &entries(1..6, 1), 0, 0);

        let mut out = ConsecutiveCollector::new();
        merge_entry_fragments(3, &[&input as &dyn FragmentCollector], &mut out);

        let (all, log_term, log_index) = out.fetch_all_entries().unwrap();
        assert_eq!(all[0].index, 4);
        assert_eq!((log_term, log_index), (1, 3));
    }

    #[test]
    fn stale_submitters_are_filtered_against_the_output() {
        let mut out = ConsecutiveCollector::new();
        out.add_entries(&entries(1..3, 5), 0, 0);

        let mut stale = SingleFragmentCollector::new();
        stale.add_entries_with_submitter(2, &entries(1..6, 2), 0, 0);

        merge_entry_fragments(0, &[&stale as &dyn FragmentCollector], &mut out);

        let (all, _, _) = out.fetch_all_entries().unwrap();
        assert_eq!(all.len(), 2, "a lower-term submitter cannot displace the run");
        assert_eq!(all[0].term, 5);
    }
}
