//! Three-peer interpreter scenarios: peer 1 is local, peers 2 and 3
//! exercise writes against the shared message files.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use saucr::draft::imf::{ImfWriter, MemoryImf};
use saucr::draft::interpreter::{OneToOneInterpreter, OneToOneInterpreterBuilder};
use saucr::types::{Entry, Message, MessageType, DR_SYNC_ADVANCE, DR_SYNC_ENTRIES};

const RACKS: [&str; 3] = ["rack-a", "rack-b", "rack-c"];
const FILES: [&str; 3] = ["file-a", "file-b", "file-c"];

struct Cluster {
    itp: OneToOneInterpreter,
    files: HashMap<(String, String), MemoryImf>,
}

impl Cluster {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let mut files = HashMap::new();
        let mut builder = OneToOneInterpreterBuilder::new(1)
            .map(1, "rack-a", "file-a")
            .map(2, "rack-b", "file-b")
            .map(3, "rack-c", "file-c");

        for rack in RACKS {
            for file in FILES {
                let imf = MemoryImf::new();
                files.insert((rack.to_string(), file.to_string()), imf.clone());
                builder = builder.bind(
                    rack,
                    file,
                    Some(Arc::new(imf.clone())),
                    Some(Arc::new(imf)),
                );
            }
        }

        Cluster {
            itp: builder.build().expect("mapped interpreter builds"),
            files,
        }
    }

    async fn inject(&self, rack: &str, file: &str, message: Message) {
        self.files[&(rack.to_string(), file.to_string())]
            .write_imf(&message)
            .await
            .expect("mock file accepts writes");
    }
}

fn entries(range: std::ops::Range<u64>, term: u64) -> Vec<Entry> {
    range.map(|i| Entry::new(term, i, vec![])).collect()
}

fn vote(from: u64, to: u64, term: u64, log_term: u64, index: u64) -> Message {
    let mut m = Message::new(MessageType::Vote);
    m.from = from;
    m.to = to;
    m.term = term;
    m.log_term = log_term;
    m.index = index;
    m
}

fn append(from: u64, to: u64, term: u64, ents: Vec<Entry>) -> Message {
    let mut m = Message::new(MessageType::App);
    m.from = from;
    m.to = to;
    m.term = term;
    m.log_term = 0;
    m.index = ents.first().map(|e| e.index - 1).unwrap_or(0);
    m.entries = ents;
    m
}

fn dr_sync(term: u64, commit: u64) -> Message {
    let mut m = Message::new(MessageType::DrSync);
    m.to = 0;
    m.term = term;
    m.commit = commit;
    m
}

#[tokio::test]
async fn empty_files_answer_from_local_state() -> Result<()> {
    let cluster = Cluster::new();

    // nothing written anywhere: the vote is answered from the (empty)
    // local view and accepted
    let resp = cluster
        .itp
        .interpret(&vote(1, 3, 2, 0, 0))
        .await
        .expect("a vote always gets an answer");

    assert_eq!(resp.msg_type, MessageType::VoteResp);
    assert_eq!(resp.to, 1);
    assert_eq!(resp.from, 3);
    assert!(!resp.reject);

    Ok(())
}

#[tokio::test]
async fn remote_vote_with_higher_term_forces_a_rejection() -> Result<()> {
    let cluster = Cluster::new();

    // peer 2 already voted at term 5 in peer 3's rack
    cluster
        .inject("rack-c", "file-b", vote(2, 3, 5, 2, 9))
        .await;

    // our vote at term 3 arrives late and is rejected against term 5
    let resp = cluster
        .itp
        .interpret(&vote(1, 3, 3, 0, 0))
        .await
        .expect("a vote always gets an answer");

    assert!(resp.reject);
    assert_eq!(resp.term, 5);

    Ok(())
}

#[tokio::test]
async fn fresher_vote_wins_the_update_to_comparison() -> Result<()> {
    let cluster = Cluster::new();

    cluster
        .inject("rack-c", "file-b", vote(2, 3, 5, 2, 9))
        .await;

    // term 6 beats the recorded vote; the empty log cannot contradict it
    let resp = cluster
        .itp
        .interpret(&vote(1, 3, 6, 0, 0))
        .await
        .expect("a vote always gets an answer");

    assert!(!resp.reject);
    assert_eq!(resp.term, 5, "the response carries the rack's view of the term");

    Ok(())
}

#[tokio::test]
async fn competing_appends_resolve_to_the_higher_submitter_term() -> Result<()> {
    let cluster = Cluster::new();

    // peers 2 and 3 both claim index 1 in the local rack, under different
    // leader terms
    cluster
        .inject("rack-a", "file-b", append(2, 1, 2, entries(1..2, 2)))
        .await;
    cluster
        .inject("rack-a", "file-c", append(3, 1, 3, entries(1..2, 3)))
        .await;

    let resp = cluster
        .itp
        .interpret(&dr_sync(0, 0))
        .await
        .expect("progress produces a response");

    assert_eq!(resp.msg_type, MessageType::DrSyncResp);
    assert_eq!(resp.context, DR_SYNC_ENTRIES);
    assert_eq!(resp.entries.len(), 1);
    assert_eq!(resp.entries[0].term, 3, "the term-3 fragment won");
    assert_eq!(resp.from, 3, "held by the peer that offered it");

    Ok(())
}

#[tokio::test]
async fn heartbeats_are_acknowledged_at_the_rack_term() -> Result<()> {
    let cluster = Cluster::new();

    let mut hb = Message::new(MessageType::Heartbeat);
    hb.from = 1;
    hb.to = 2;
    hb.term = 4;
    hb.context = b"probe".to_vec();

    let resp = cluster.itp.interpret(&hb).await.expect("heartbeats answer");
    assert_eq!(resp.msg_type, MessageType::HeartbeatResp);
    assert_eq!(resp.term, 4);
    assert_eq!(resp.context, b"probe");

    Ok(())
}

#[tokio::test]
async fn vote_interference_rolls_the_analyzer_back() -> Result<()> {
    let cluster = Cluster::new();

    // an append from peer 2 and a higher-term vote from peer 3 whose
    // last-log coordinates contradict the appended run
    cluster
        .inject("rack-a", "file-b", append(2, 1, 2, entries(1..2, 2)))
        .await;
    cluster
        .inject("rack-a", "file-c", vote(3, 1, 5, 9, 0))
        .await;

    let resp = cluster
        .itp
        .interpret(&dr_sync(0, 0))
        .await
        .expect("a rollback is reported");

    assert_eq!(resp.msg_type, MessageType::DrSyncResp);
    assert!(resp.reject, "rollback is flagged for the caller");
    assert_ne!(resp.context, DR_SYNC_ENTRIES, "no progress was reported");

    // the next pass rediscovers the preserved vote and advances the term
    let resp = cluster
        .itp
        .interpret(&dr_sync(0, 0))
        .await
        .expect("the preserved vote advances the term");

    assert_eq!(resp.context, DR_SYNC_ADVANCE);
    assert_eq!(resp.term, 5);

    Ok(())
}

#[tokio::test]
async fn matching_vote_lets_the_sandbox_commit() -> Result<()> {
    let cluster = Cluster::new();

    // the vote's last-log coordinates agree with the appended run, so the
    // sandboxed analysis commits and progress flows out
    cluster
        .inject("rack-a", "file-b", append(2, 1, 2, entries(1..3, 2)))
        .await;
    cluster
        .inject("rack-a", "file-c", vote(3, 1, 5, 2, 2))
        .await;

    let resp = cluster
        .itp
        .interpret(&dr_sync(0, 0))
        .await
        .expect("progress produces a response");

    assert_eq!(resp.context, DR_SYNC_ENTRIES);
    assert_eq!(resp.entries.len(), 2);

    Ok(())
}

#[tokio::test]
async fn append_pipeline_acknowledges_replication() -> Result<()> {
    let cluster = Cluster::new();

    let resp = cluster
        .itp
        .interpret(&append(1, 2, 2, entries(1..4, 2)))
        .await
        .expect("appends are acknowledged");

    assert_eq!(resp.msg_type, MessageType::AppResp);
    assert!(!resp.reject);
    assert_eq!(resp.index, 3, "acknowledges up to the last new index");
    assert_eq!(resp.to, 1);
    assert_eq!(resp.from, 2);

    // replicating the next batch chains off the accepted run
    let mut next = append(1, 2, 2, entries(4..6, 2));
    next.log_term = 2;
    next.index = 3;
    let resp = cluster
        .itp
        .interpret(&next)
        .await
        .expect("appends are acknowledged");
    assert!(!resp.reject);
    assert_eq!(resp.index, 5);

    Ok(())
}

#[tokio::test]
async fn disjoint_append_is_rejected_with_a_hint() -> Result<()> {
    let cluster = Cluster::new();

    // an append claiming history this rack never saw
    let mut stray = append(1, 2, 2, entries(8..10, 2));
    stray.log_term = 2;
    stray.index = 7;

    let resp = cluster
        .itp
        .interpret(&stray)
        .await
        .expect("appends are acknowledged");

    assert!(resp.reject);
    assert_eq!(resp.index, 7);
    assert_eq!(resp.reject_hint, 9);

    Ok(())
}
