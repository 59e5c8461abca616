//! The adaptive raft-driver loop.
//!
//! One task per peer consumes the kernel's tick timer, its `Ready` batches
//! and a stop signal. Every `Ready` interleaves monitor updates, persistence
//! strategy changes and mode broadcasts with the ordinary save / append /
//! send / advance processing.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::cached_disk::{LocalCachedDisk, Storage};
use crate::config::{SaucrConfig, SaucrMode};
use crate::error::{Result, SaucrError};
use crate::monitor::{
    saucr_activation, InactivatedMonitor, Perceptible, PerceptibleConfig, SaucrMonitor,
};
use crate::persistent::{PersistentManager, PersistentStrategy};
use crate::types::{
    Entry, EntryType, Message, MessageType, PeerRole, ReadState, Ready, Snapshot, NONE,
    PER_MODE_DELAYED, PER_MODE_IMMEDIATE,
};

const INTERNAL_TIMEOUT: Duration = Duration::from_secs(1);

/// The wrapped Raft kernel. `Ready` batches arrive over the channel handed
/// to the driver at construction.
pub trait RaftKernel: Send + Sync {
    fn tick(&self);
    fn step(&self, message: Message) -> Result<()>;
    fn advance(&self);
    fn stop(&self);
}

/// The kernel's in-memory log storage.
pub trait MemStorage: Send + Sync {
    fn append(&self, entries: &[Entry]) -> Result<()>;
    fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<()>;
}

/// Peer-to-peer message transport. `send` must not block.
pub trait Transport: Send + Sync {
    fn send(&self, messages: Vec<Message>);
    fn stop(&self);
}

/// Server-side callbacks consulted while processing a `Ready`.
pub trait ReadyHandler: Send + Sync {
    fn lead(&self) -> u64;
    fn update_lead(&self, lead: u64);
    fn update_leadership(&self, new_leader: bool);
    fn update_committed_index(&self, committed: u64);
    fn is_id_removed(&self, id: u64) -> bool;
}

/// One batch of committed work handed to the apply consumer. The driver
/// signals `notify` once the matching log writes are durable.
pub struct Apply {
    pub entries: Vec<Entry>,
    pub snapshot: Option<Snapshot>,
    pub notify: mpsc::Receiver<()>,
}

/// Sliding window over recent mode observations; flips are suppressed while
/// too many of the last observations were flips.
pub struct SaucrModeDamper {
    window: Vec<bool>,
    ptr: usize,
    fluctuate: usize,
    last_mode: SaucrMode,
}

impl SaucrModeDamper {
    pub fn new(window_size: usize, fluctuate: usize, init_mode: SaucrMode) -> Result<Self> {
        if window_size < fluctuate || window_size == 0 {
            return Err(SaucrError::MonitorConfig(
                "illegal damper configuration".into(),
            ));
        }

        let mut window = vec![false; window_size];
        window[0] = true;

        Ok(SaucrModeDamper {
            window,
            ptr: 0,
            fluctuate,
            last_mode: init_mode,
        })
    }

    pub fn observe(&mut self, mode: SaucrMode) {
        self.ptr = (self.ptr + 1) % self.window.len();
        self.window[self.ptr] = mode != self.last_mode;
        self.last_mode = mode;
    }

    pub fn is_fluctuate(&self) -> bool {
        self.window.iter().filter(|flip| **flip).count() >= self.fluctuate
    }
}

#[derive(Default)]
struct MsgSaucrSlot {
    term: u64,
    message: Option<Message>,
}

impl MsgSaucrSlot {
    fn receive(&mut self, message: &Message) {
        if self.term <= message.term {
            self.term = message.term;
            self.message = Some(message.clone());
        }
    }

    fn take_exactly(&mut self, term: u64) -> Option<Message> {
        let captured = if self.message.is_some() && self.term == term {
            self.message.take()
        } else {
            None
        };
        self.term = term;
        self.message = None;
        captured
    }
}

/// Intercepts incoming adaptive messages on behalf of a running driver:
/// `PerMode` broadcasts are captured term-tagged for the next `Ready`,
/// `PerModeResp` acknowledgements feed positive connectivity evidence.
#[derive(Clone)]
pub struct AdaptiveMessageSink {
    monitor: Arc<RwLock<Arc<dyn Perceptible>>>,
    slot: Arc<Mutex<MsgSaucrSlot>>,
}

impl AdaptiveMessageSink {
    /// Returns whether the message was consumed by the adaptive layer.
    pub fn receive(&self, message: &Message) -> bool {
        match message.msg_type {
            MessageType::PerMode => {
                self.slot.lock().receive(message);
                true
            }
            MessageType::PerModeResp => {
                self.monitor.read().perceive(message.from, true);
                true
            }
            _ => false,
        }
    }
}

/// Construction-time wiring of a [`SaucrRaftNode`].
pub struct SaucrNodeChannels {
    pub ready_rx: mpsc::Receiver<Ready>,
    pub apply_tx: mpsc::Sender<Apply>,
    pub read_state_tx: mpsc::Sender<ReadState>,
    pub stop_rx: mpsc::Receiver<()>,
    pub done_tx: oneshot::Sender<()>,
}

pub struct SaucrNodeConfig {
    pub saucr: SaucrConfig,
    pub monitor: PerceptibleConfig,
    pub strategy: PersistentStrategy,
    pub tick_interval: Duration,
}

pub struct SaucrRaftNode {
    self_id: u64,
    peers: Vec<u64>,
    term: u64,

    monitor: Arc<RwLock<Arc<dyn Perceptible>>>,
    monitor_activated: bool,
    manager: Arc<dyn PersistentManager>,
    current_mode: SaucrMode,

    sync_mode: bool,
    sync_mode_interval: Duration,
    sync_mode_last: Instant,

    damper: Option<SaucrModeDamper>,

    kernel: Arc<dyn RaftKernel>,
    mem_storage: Arc<dyn MemStorage>,
    transport: Arc<dyn Transport>,

    tick_interval: Duration,
    ready_rx: mpsc::Receiver<Ready>,
    apply_tx: mpsc::Sender<Apply>,
    read_state_tx: mpsc::Sender<ReadState>,
    stop_rx: mpsc::Receiver<()>,
    done_tx: Option<oneshot::Sender<()>>,

    cluster_updater: Option<Box<dyn Fn() -> Vec<u64> + Send + Sync>>,

    slot: Arc<Mutex<MsgSaucrSlot>>,
}

impl SaucrRaftNode {
    pub fn new(
        config: SaucrNodeConfig,
        storage: Arc<dyn Storage>,
        kernel: Arc<dyn RaftKernel>,
        mem_storage: Arc<dyn MemStorage>,
        transport: Arc<dyn Transport>,
        channels: SaucrNodeChannels,
    ) -> Result<Self> {
        let SaucrNodeConfig {
            saucr,
            monitor: monitor_cfg,
            strategy,
            tick_interval,
        } = config;

        let (monitor, monitor_activated): (Arc<dyn Perceptible>, bool) =
            if saucr.use_disabled_monitor {
                info!(
                    init_fsync = strategy.fsync,
                    substitute = "DisabledMonitor",
                    "adaptivity has been deactivated"
                );
                (Arc::new(InactivatedMonitor::disabled(&monitor_cfg)?), true)
            } else if monitor_cfg.peers.len() < 3 {
                info!(
                    peer_len = monitor_cfg.peers.len(),
                    substitute = "InactivatedMonitor",
                    "adaptivity requires a cluster of at least 3 peers"
                );
                (
                    Arc::new(InactivatedMonitor::new(
                        &monitor_cfg,
                        saucr_activation(saucr.hb_counter),
                    )?),
                    false,
                )
            } else {
                (
                    Arc::new(SaucrMonitor::new(saucr.hb_counter, &monitor_cfg)?),
                    true,
                )
            };

        if monitor.is_critical() != strategy.fsync {
            return Err(SaucrError::MonitorConfig(
                "inconsistent critical and fsync configuration".into(),
            ));
        }

        let damper = if saucr.damper_window_size > 0 {
            Some(SaucrModeDamper::new(
                saucr.damper_window_size,
                saucr.damper_fluctuate,
                SaucrMode::from_fsync(strategy.fsync),
            )?)
        } else {
            None
        };

        let manager = Arc::new(LocalCachedDisk::new(storage, &strategy));

        Ok(SaucrRaftNode {
            self_id: monitor_cfg.self_id,
            peers: monitor_cfg.peers,
            term: 0,
            monitor: Arc::new(RwLock::new(monitor)),
            monitor_activated,
            manager,
            current_mode: SaucrMode::from_fsync(strategy.fsync),
            sync_mode: saucr.mode_sync,
            sync_mode_interval: saucr.mode_sync_interval,
            sync_mode_last: Instant::now(),
            damper,
            kernel,
            mem_storage,
            transport,
            tick_interval,
            ready_rx: channels.ready_rx,
            apply_tx: channels.apply_tx,
            read_state_tx: channels.read_state_tx,
            stop_rx: channels.stop_rx,
            done_tx: Some(channels.done_tx),
            cluster_updater: None,
            slot: Arc::new(Mutex::new(MsgSaucrSlot::default())),
        })
    }

    /// Callback supplying fresh cluster membership for a leader's monitor.
    pub fn set_cluster_updater(&mut self, updater: Box<dyn Fn() -> Vec<u64> + Send + Sync>) {
        self.cluster_updater = Some(updater);
    }

    pub fn enable_mode_synchronization(&mut self, interval: Duration) {
        self.sync_mode = true;
        self.sync_mode_interval = interval;
    }

    pub fn disable_mode_synchronization(&mut self) {
        self.sync_mode = false;
    }

    pub fn monitor(&self) -> Arc<dyn Perceptible> {
        self.monitor.read().clone()
    }

    pub fn persistence(&self) -> Arc<dyn PersistentManager> {
        self.manager.clone()
    }

    pub fn current_mode(&self) -> SaucrMode {
        self.current_mode
    }

    /// Handle for routing incoming `PerMode` / `PerModeResp` traffic into
    /// the driver.
    pub fn adaptive_sink(&self) -> AdaptiveMessageSink {
        AdaptiveMessageSink {
            monitor: self.monitor.clone(),
            slot: self.slot.clone(),
        }
    }

    /// Drives the node until a stop signal or a fatal persistence error.
    pub async fn run(mut self, handler: Arc<dyn ReadyHandler>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let mut is_lead = false;
        let mut is_follower = true;
        let mut is_activated = self.monitor_activated;

        self.sync_mode_last = Instant::now();

        let result = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.kernel.tick();
                }
                ready = self.ready_rx.recv() => {
                    let Some(ready) = ready else { break Ok(()) };
                    match self
                        .handle_ready(ready, &handler, &mut is_lead, &mut is_follower, &mut is_activated)
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => break Ok(()),
                        Err(err) => break Err(err),
                    }
                }
                _ = self.stop_rx.recv() => break Ok(()),
            }
        };

        self.on_stop();
        result
    }

    async fn handle_ready(
        &mut self,
        ready: Ready,
        handler: &Arc<dyn ReadyHandler>,
        is_lead: &mut bool,
        is_follower: &mut bool,
        is_activated: &mut bool,
    ) -> Result<bool> {
        let mut monitor_cfg: Option<PerceptibleConfig> = None;

        if let Some(soft_state) = ready.soft_state {
            let new_leader = soft_state.leader != NONE && handler.lead() != soft_state.leader;
            handler.update_lead(soft_state.leader);
            *is_lead = soft_state.role == PeerRole::Leader;
            *is_follower = soft_state.role == PeerRole::Follower;
            handler.update_leadership(new_leader);

            monitor_cfg = Some(self.update_monitor_soft(
                self.monitor().get_config(),
                soft_state.role,
                handler.lead(),
            ));
        }

        monitor_cfg = self.update_monitor_hard(monitor_cfg, &ready.hard_state, *is_follower);
        monitor_cfg = self.update_monitor_cluster(monitor_cfg, *is_activated, *is_lead);

        if let Some(cfg) = monitor_cfg.take() {
            match self.monitor().set_config(&cfg) {
                Err(err) => {
                    warn!(
                        error = %err,
                        is_leader = *is_lead,
                        is_follower = *is_follower,
                        "failed to transform the mode of the peer monitor"
                    );
                    // fall back to the de facto monitor config
                    monitor_cfg = Some(self.monitor().get_config());
                }
                Ok(()) => {
                    info!(
                        is_leader = *is_lead,
                        is_follower = *is_follower,
                        critical = cfg.critical,
                        "transformed the mode of the peer monitor"
                    );
                    monitor_cfg = Some(cfg);
                }
            }
        }

        if let Some(read_state) = ready.read_states.last() {
            tokio::select! {
                sent = self.read_state_tx.send(read_state.clone()) => {
                    let _ = sent;
                }
                _ = tokio::time::sleep(INTERNAL_TIMEOUT) => {
                    warn!(timeout = ?INTERNAL_TIMEOUT, "timed out sending read state");
                }
                _ = self.stop_rx.recv() => return Ok(false),
            }
        }

        let (notify_tx, notify_rx) = mpsc::channel::<()>(1);
        let apply = Apply {
            entries: ready.committed_entries.clone(),
            snapshot: ready.snapshot.clone(),
            notify: notify_rx,
        };

        if let Some(last) = ready.committed_entries.last() {
            handler.update_committed_index(last.index);
        }

        tokio::select! {
            sent = self.apply_tx.send(apply) => {
                if sent.is_err() {
                    return Ok(false);
                }
            }
            _ = self.stop_rx.recv() => return Ok(false),
        }

        let mut messages = ready.messages;

        // a leader writes to its disk in parallel with replicating to the
        // followers writing to theirs (raft thesis 10.2.1)
        if *is_lead {
            let (monitor, activated) = self.monitor().try_get_activate();
            *self.monitor.write() = monitor;
            *is_activated = activated;

            let outgoing = self.process_messages(std::mem::take(&mut messages), handler);
            self.transport.send(outgoing);
        }

        let strategy = self.update_manager_mode(monitor_cfg.as_ref());

        if let Some(strategy) = &strategy {
            if let Err(err) = self.manager.set_strategy(strategy) {
                error!(
                    error = %err,
                    is_leader = *is_lead,
                    is_follower = *is_follower,
                    "failed to transform the mode of the persistence manager"
                );
                if strategy.fsync {
                    self.manager.flush()?;
                }
                return Err(err);
            }
            info!(
                is_leader = *is_lead,
                is_follower = *is_follower,
                to_fsync = strategy.fsync,
                "transformed the mode of the persistence manager"
            );
        }

        if let Err(err) = self.manager.save(&ready.hard_state, &ready.entries) {
            error!(error = %err, "failed to save hard state and entries");
            return Err(err);
        }

        if let Some(snapshot) = &ready.snapshot {
            if !snapshot.is_empty() {
                if let Err(err) = self.manager.save_snap(snapshot) {
                    error!(error = %err, "failed to save snapshot");
                    return Err(err);
                }
                // the snapshot is on disk now
                let _ = notify_tx.try_send(());

                self.mem_storage.apply_snapshot(snapshot)?;
                info!(
                    snapshot_index = snapshot.metadata.index,
                    "applied incoming snapshot"
                );
            }
        }

        self.mem_storage.append(&ready.entries)?;

        if !*is_lead {
            let outgoing = self.process_messages(messages, handler);

            // unblock the apply consumer waiting on log disk writes
            let _ = notify_tx.try_send(());

            // a candidate or follower waits for pending configuration
            // changes to be applied before sending messages, otherwise
            // votes could be counted against a staled membership
            let wait_apply = ready
                .committed_entries
                .iter()
                .any(|e| e.entry_type == EntryType::ConfChange);
            if wait_apply {
                tokio::select! {
                    sent = notify_tx.send(()) => {
                        if sent.is_err() {
                            return Ok(false);
                        }
                    }
                    _ = self.stop_rx.recv() => return Ok(false),
                }
            }

            self.transport.send(outgoing);
        } else {
            if let Some(broadcast) = self.broadcast_current_mode(strategy.as_ref()) {
                self.transport.send(broadcast);
            }
            let _ = notify_tx.try_send(());
        }

        self.kernel.advance();

        Ok(true)
    }

    fn on_stop(&mut self) {
        self.kernel.stop();
        self.transport.stop();
        if let Err(err) = self.manager.close() {
            error!(error = %err, "failed to close the persistence manager");
        }
        if let Some(done) = self.done_tx.take() {
            let _ = done.send(());
        }
    }

    /// Outbound sanitation: messages for removed peers are disarmed and
    /// only the last append response of a batch survives.
    fn process_messages(
        &self,
        mut messages: Vec<Message>,
        handler: &Arc<dyn ReadyHandler>,
    ) -> Vec<Message> {
        let mut sent_app_resp = false;

        for message in messages.iter_mut().rev() {
            if handler.is_id_removed(message.to) {
                message.to = 0;
            }

            if message.msg_type == MessageType::AppResp {
                if sent_app_resp {
                    message.to = 0;
                } else {
                    sent_app_resp = true;
                }
            }
        }

        messages
    }

    /// Broadcasts the current mode whenever the strategy flipped, or
    /// periodically when mode synchronization is on. Every outgoing
    /// broadcast doubles as a negative latency probe for its peer.
    fn broadcast_current_mode(&mut self, strategy: Option<&PersistentStrategy>) -> Option<Vec<Message>> {
        let context = if let Some(strategy) = strategy {
            if strategy.fsync {
                PER_MODE_IMMEDIATE
            } else {
                PER_MODE_DELAYED
            }
        } else if self.sync_mode && self.sync_mode_interval <= self.sync_mode_last.elapsed() {
            if self.current_mode == SaucrMode::Sheltering {
                PER_MODE_IMMEDIATE
            } else {
                PER_MODE_DELAYED
            }
        } else {
            return None;
        };

        let monitor = self.monitor();
        let mut messages = Vec::with_capacity(self.peers.len().saturating_sub(1));
        for &peer in &self.peers {
            if peer == self.self_id {
                continue;
            }
            monitor.perceive(peer, false);

            let mut m = Message::new(MessageType::PerMode);
            m.to = peer;
            m.from = self.self_id;
            m.term = self.term;
            m.context = context.to_vec();
            messages.push(m);
        }

        if self.sync_mode {
            self.sync_mode_last = Instant::now();
        }

        Some(messages)
    }

    fn update_monitor_soft(
        &self,
        mut cfg: PerceptibleConfig,
        role: PeerRole,
        leader: u64,
    ) -> PerceptibleConfig {
        cfg.role = role;
        cfg.leader = leader;
        if role == PeerRole::Candidate {
            cfg.critical = true;
        }
        cfg
    }

    fn update_monitor_hard(
        &mut self,
        cfg: Option<PerceptibleConfig>,
        hard_state: &crate::types::HardState,
        is_follower: bool,
    ) -> Option<PerceptibleConfig> {
        if !hard_state.is_empty() {
            self.term = hard_state.term;
        }

        let captured = self.slot.lock().take_exactly(self.term);
        let Some(message) = captured else { return cfg };
        if !is_follower {
            return cfg;
        }

        let mut resp = Message::new(MessageType::PerModeResp);
        resp.to = message.from;
        resp.from = self.self_id;
        resp.term = self.term;
        self.transport.send(vec![resp]);

        let critical = message.context != PER_MODE_DELAYED;

        // no update needed when the captured mode agrees with the current
        // one and nothing else asked for a refresh
        if cfg.is_none() && !self.current_mode.conflicts_with_critical(critical) {
            return None;
        }

        let mut cfg = cfg.unwrap_or_else(|| self.monitor().get_config());
        cfg.critical = critical;
        Some(cfg)
    }

    fn update_monitor_cluster(
        &mut self,
        cfg: Option<PerceptibleConfig>,
        is_activated: bool,
        is_lead: bool,
    ) -> Option<PerceptibleConfig> {
        if is_activated || !is_lead {
            return cfg;
        }

        let mut cfg = cfg.unwrap_or_else(|| self.monitor().get_config());
        if let Some(updater) = &self.cluster_updater {
            self.peers = updater();
        }
        cfg.peers = self.peers.clone();
        Some(cfg)
    }

    /// Translates the monitor's verdict into a persistence strategy change,
    /// subject to the mode damper.
    fn update_manager_mode(&mut self, cfg: Option<&PerceptibleConfig>) -> Option<PersistentStrategy> {
        let critical = match cfg {
            Some(cfg) => cfg.critical,
            None => self.monitor().is_critical(),
        };

        let proposed = SaucrMode::from_critical(critical);

        if let Some(damper) = &mut self.damper {
            damper.observe(proposed);
            if proposed != self.current_mode && damper.is_fluctuate() {
                warn!(mode = %proposed, "mode damper suppressed a flip");
                return None;
            }
        }

        if self.current_mode.conflicts_with_critical(critical) {
            self.current_mode = SaucrMode::from_critical(critical);
            let mut strategy = self.manager.get_strategy();
            strategy.fsync = self.current_mode.is_fsync();
            return Some(strategy);
        }

        None
    }
}
