//! End-to-end driver scenarios with a mock kernel, storage and transport.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use saucr::cached_disk::Storage;
use saucr::config::{SaucrConfig, SaucrMode};
use saucr::hb_counter::HbCounterKind;
use saucr::monitor::{Perceptible, PerceptibleConfig};
use saucr::persistent::{PersistentManager, PersistentStrategy};
use saucr::saucr_node::{
    Apply, MemStorage, RaftKernel, ReadyHandler, SaucrNodeChannels, SaucrNodeConfig, SaucrRaftNode,
    Transport,
};
use saucr::types::{
    Entry, HardState, Message, MessageType, PeerRole, Ready, SoftState, NONE, PER_MODE_DELAYED,
    PER_MODE_IMMEDIATE,
};

#[derive(Default)]
struct MockKernel {
    ticks: AtomicUsize,
    advances: AtomicUsize,
    stopped: AtomicBool,
}

impl RaftKernel for MockKernel {
    fn tick(&self) {
        self.ticks.fetch_add(1, Ordering::SeqCst);
    }

    fn step(&self, _message: Message) -> saucr::Result<()> {
        Ok(())
    }

    fn advance(&self) {
        self.advances.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockDisk {
    saves: Mutex<Vec<(HardState, Vec<Entry>)>>,
    closed: AtomicBool,
}

impl MockDisk {
    fn save_count(&self) -> usize {
        self.saves.lock().len()
    }
}

impl Storage for MockDisk {
    fn save(&self, hard_state: &HardState, entries: &[Entry]) -> saucr::Result<()> {
        self.saves.lock().push((*hard_state, entries.to_vec()));
        Ok(())
    }

    fn save_snap(&self, _snap: &saucr::types::Snapshot) -> saucr::Result<()> {
        Ok(())
    }

    fn close(&self) -> saucr::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
struct MockMemStorage {
    appended: AtomicUsize,
}

impl MemStorage for MockMemStorage {
    fn append(&self, entries: &[Entry]) -> saucr::Result<()> {
        self.appended.fetch_add(entries.len(), Ordering::SeqCst);
        Ok(())
    }

    fn apply_snapshot(&self, _snapshot: &saucr::types::Snapshot) -> saucr::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct MockTransport {
    sent: Mutex<Vec<Message>>,
    stopped: AtomicBool,
}

impl MockTransport {
    fn sent_of(&self, msg_type: MessageType) -> Vec<Message> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.msg_type == msg_type)
            .cloned()
            .collect()
    }
}

impl Transport for MockTransport {
    fn send(&self, messages: Vec<Message>) {
        self.sent.lock().extend(messages);
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MockHandler {
    lead: AtomicU64,
}

impl ReadyHandler for MockHandler {
    fn lead(&self) -> u64 {
        self.lead.load(Ordering::SeqCst)
    }

    fn update_lead(&self, lead: u64) {
        self.lead.store(lead, Ordering::SeqCst);
    }

    fn update_leadership(&self, _new_leader: bool) {}

    fn update_committed_index(&self, _committed: u64) {}

    fn is_id_removed(&self, _id: u64) -> bool {
        false
    }
}

struct Harness {
    kernel: Arc<MockKernel>,
    disk: Arc<MockDisk>,
    transport: Arc<MockTransport>,
    ready_tx: mpsc::Sender<Ready>,
    _apply_rx: mpsc::Receiver<Apply>,
    _read_state_rx: mpsc::Receiver<saucr::types::ReadState>,
    stop_tx: mpsc::Sender<()>,
    done_rx: oneshot::Receiver<()>,
    monitor: Arc<dyn Perceptible>,
    persistence: Arc<dyn PersistentManager>,
    sink: saucr::saucr_node::AdaptiveMessageSink,
}

fn launch(role: PeerRole, leader: u64, critical: bool) -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let kernel = Arc::new(MockKernel::default());
    let disk = Arc::new(MockDisk::default());
    let mem = Arc::new(MockMemStorage::default());
    let transport = Arc::new(MockTransport::default());

    let (ready_tx, ready_rx) = mpsc::channel(16);
    let (apply_tx, apply_rx) = mpsc::channel(16);
    let (read_state_tx, read_state_rx) = mpsc::channel(16);
    let (stop_tx, stop_rx) = mpsc::channel(1);
    let (done_tx, done_rx) = oneshot::channel();

    let config = SaucrNodeConfig {
        saucr: SaucrConfig {
            max_local_cache_size: 100,
            cache_preserve_time: Duration::from_secs(30),
            init_mode: SaucrMode::from_critical(critical),
            use_disabled_monitor: false,
            hb_counter: HbCounterKind::Cautious { polarize: false },
            mode_sync: false,
            mode_sync_interval: Duration::from_millis(100),
            damper_window_size: 0,
            damper_fluctuate: 0,
        },
        monitor: PerceptibleConfig {
            role,
            leader,
            self_id: 1,
            critical,
            peers: vec![1, 2, 3],
        },
        strategy: PersistentStrategy {
            fsync: critical,
            max_local_cache_size: 100,
            cache_preserve_time: Duration::from_secs(30),
        },
        tick_interval: Duration::from_secs(3600),
    };

    let node = SaucrRaftNode::new(
        config,
        disk.clone(),
        kernel.clone(),
        mem,
        transport.clone(),
        SaucrNodeChannels {
            ready_rx,
            apply_tx,
            read_state_tx,
            stop_rx,
            done_tx,
        },
    )
    .expect("node construction");

    let monitor = node.monitor();
    let persistence = node.persistence();
    let sink = node.adaptive_sink();

    let handler = Arc::new(MockHandler::default());
    tokio::spawn(node.run(handler));

    Harness {
        kernel,
        disk,
        transport,
        ready_tx,
        _apply_rx: apply_rx,
        _read_state_rx: read_state_rx,
        stop_tx,
        done_rx,
        monitor,
        persistence,
        sink,
    }
}

fn entries(range: std::ops::Range<u64>, term: u64) -> Vec<Entry> {
    range.map(|i| Entry::new(term, i, vec![])).collect()
}

async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

fn leader_soft_state() -> Ready {
    Ready {
        soft_state: Some(SoftState {
            leader: 1,
            role: PeerRole::Leader,
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn healthy_leader_stays_in_normal_mode() -> Result<()> {
    let h = launch(PeerRole::Leader, 1, false);

    h.ready_tx.send(leader_soft_state()).await?;
    wait_until(
        || h.kernel.advances.load(Ordering::SeqCst) >= 1,
        "first ready processed",
    )
    .await;

    // heartbeat acknowledgements keep every follower connected
    for _ in 0..5 {
        for from in [2u64, 3] {
            let mut resp = Message::new(MessageType::PerModeResp);
            resp.from = from;
            resp.to = 1;
            assert!(h.sink.receive(&resp));
        }
    }

    // buffered entries stay below the cache bound
    h.persistence
        .save(&HardState::default(), &entries(1..4, 1))?;

    h.ready_tx.send(Ready::default()).await?;
    wait_until(
        || h.kernel.advances.load(Ordering::SeqCst) >= 2,
        "second ready processed",
    )
    .await;

    assert!(!h.monitor.is_critical());
    assert_eq!(h.disk.save_count(), 0, "nothing was forced to disk");
    assert!(h.persistence.unpersisted());
    assert!(
        h.transport.sent_of(MessageType::PerMode).is_empty(),
        "no mode broadcast without a flip"
    );

    Ok(())
}

#[tokio::test]
async fn silent_followers_shelter_the_leader() -> Result<()> {
    let h = launch(PeerRole::Leader, 1, false);

    h.ready_tx.send(leader_soft_state()).await?;
    wait_until(
        || h.kernel.advances.load(Ordering::SeqCst) >= 1,
        "first ready processed",
    )
    .await;

    h.persistence
        .save(&HardState::default(), &entries(1..3, 1))?;
    assert_eq!(h.disk.save_count(), 0);

    // both followers go silent past the cautious threshold
    for _ in 0..3 {
        h.monitor.perceive(2, false);
        h.monitor.perceive(3, false);
    }
    assert!(h.monitor.is_critical());

    h.ready_tx.send(Ready::default()).await?;
    wait_until(
        || h.disk.save_count() >= 1,
        "cache flushed on the mode flip",
    )
    .await;

    assert_eq!(h.disk.save_count(), 1, "the flip flushed exactly once");
    assert_eq!(h.disk.saves.lock()[0].1.len(), 2);
    assert!(h.persistence.get_strategy().fsync);
    assert!(!h.persistence.unpersisted());

    let broadcasts = h.transport.sent_of(MessageType::PerMode);
    assert_eq!(broadcasts.len(), 2, "one broadcast per follower");
    for b in &broadcasts {
        assert_eq!(b.context, PER_MODE_IMMEDIATE);
        assert!(b.to == 2 || b.to == 3);
    }

    Ok(())
}

#[tokio::test]
async fn follower_learns_the_mode_from_its_leader() -> Result<()> {
    let h = launch(PeerRole::Follower, 2, true);
    assert!(h.persistence.get_strategy().fsync);

    // the leader flipped back to normal and broadcast it at term 3
    let mut per_mode = Message::new(MessageType::PerMode);
    per_mode.from = 2;
    per_mode.to = 1;
    per_mode.term = 3;
    per_mode.context = PER_MODE_DELAYED.to_vec();
    assert!(h.sink.receive(&per_mode));

    // the matching hard state lands with the next ready
    let ready = Ready {
        hard_state: HardState {
            term: 3,
            vote: 2,
            commit: 0,
        },
        ..Default::default()
    };
    h.ready_tx.send(ready).await?;

    wait_until(
        || !h.persistence.get_strategy().fsync,
        "strategy relaxed to buffered writes",
    )
    .await;

    let acks = h.transport.sent_of(MessageType::PerModeResp);
    assert_eq!(acks.len(), 1, "the broadcast was acknowledged");
    assert_eq!(acks[0].to, 2);
    assert_eq!(acks[0].term, 3);
    assert!(!h.monitor.is_critical());

    Ok(())
}

#[tokio::test]
async fn becoming_candidate_forces_a_sheltering_flush() -> Result<()> {
    let h = launch(PeerRole::Follower, 2, false);

    h.persistence
        .save(&HardState::default(), &entries(1..3, 1))?;
    assert_eq!(h.disk.save_count(), 0);

    // the election timer fired: follower turns candidate
    let ready = Ready {
        soft_state: Some(SoftState {
            leader: NONE,
            role: PeerRole::Candidate,
        }),
        ..Default::default()
    };
    h.ready_tx.send(ready).await?;

    wait_until(|| h.disk.save_count() >= 1, "candidate flushed the cache").await;

    assert_eq!(h.disk.save_count(), 1, "all cached entries left in one save");
    assert_eq!(h.disk.saves.lock()[0].1.len(), 2);
    assert!(h.persistence.get_strategy().fsync);
    assert!(h.monitor.is_critical());

    Ok(())
}

#[tokio::test]
async fn stop_unwinds_kernel_transport_and_persistence() -> Result<()> {
    let h = launch(PeerRole::Follower, 2, false);

    h.persistence
        .save(&HardState::default(), &entries(1..2, 1))?;

    h.stop_tx.send(()).await?;
    h.done_rx.await?;

    assert!(h.kernel.stopped.load(Ordering::SeqCst));
    assert!(h.transport.stopped.load(Ordering::SeqCst));
    assert!(h.disk.closed.load(Ordering::SeqCst));
    assert_eq!(h.disk.save_count(), 1, "close flushed the cache");

    Ok(())
}
