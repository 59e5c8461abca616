//! Peer-connectivity monitoring.
//!
//! A [`Perceptible`] aggregates per-peer heartbeat evidence into a
//! cluster-wide critical / non-critical verdict. The active implementation
//! is [`SaucrMonitor`]; clusters too small to monitor run an
//! [`InactivatedMonitor`] that can be upgraded once peers grow.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::error::{Result, SaucrError};
use crate::hb_counter::{HbCounterKind, HeartbeatCounter};
use crate::types::{PeerId, PeerRole, NONE};

/// Mutable monitor configuration, replaced atomically by `set_config`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PerceptibleConfig {
    /// Raft role of the local peer.
    pub role: PeerRole,

    /// Current leader, `NONE` if undecided.
    pub leader: PeerId,

    /// The local peer.
    pub self_id: PeerId,

    /// Initial (or, from `get_config`, currently derived) critical flag.
    pub critical: bool,

    /// Cluster membership.
    pub peers: Vec<PeerId>,
}

/// Perceives the connectivity of peers.
pub trait Perceptible: Send + Sync {
    /// Returns the current configuration; its `critical` field carries the
    /// currently derived verdict.
    fn get_config(&self) -> PerceptibleConfig;

    /// Replaces the configuration: membership, leadership and the explicit
    /// critical flag. All internal evidence resets before the update.
    fn set_config(&self, config: &PerceptibleConfig) -> Result<()>;

    /// Feeds one piece of connectivity evidence for a peer.
    fn perceive(&self, id: PeerId, connected: bool);

    /// Whether data persistence is compulsory right now.
    fn is_critical(&self) -> bool;

    /// Returns an activated monitor if one is (or can be made) available.
    /// The boolean is false only when activation was attempted and failed.
    fn try_get_activate(self: Arc<Self>) -> (Arc<dyn Perceptible>, bool);
}

/// Replaces only the critical flag of a monitor's configuration.
pub fn set_perceptible_critical(p: &dyn Perceptible, critical: bool) -> Result<()> {
    let mut cfg = p.get_config();
    cfg.critical = critical;
    p.set_config(&cfg)
}

/// Replaces only the role of a monitor's configuration.
pub fn set_perceptible_role(p: &dyn Perceptible, role: PeerRole) -> Result<()> {
    let mut cfg = p.get_config();
    cfg.role = role;
    p.set_config(&cfg)
}

struct MonitorState {
    leader: PeerId,
    self_id: PeerId,
    role: PeerRole,

    peers: Vec<PeerId>,
    unconnected: Vec<bool>,
    counters: Vec<Box<dyn HeartbeatCounter>>,

    threshold: usize,
    must_critical: bool,
}

impl MonitorState {
    fn find_index(&self, key: PeerId) -> Option<usize> {
        self.peers.iter().position(|p| *p == key)
    }

    fn count_unconnected_except_self(&self) -> usize {
        self.unconnected
            .iter()
            .zip(self.peers.iter())
            .filter(|(u, p)| **u && **p != self.self_id)
            .count()
    }

    fn evaluate(&self) -> bool {
        if self.must_critical {
            // an explicit latch wins over evidence
            return true;
        }

        match self.role {
            PeerRole::Leader => self.count_unconnected_except_self() >= self.threshold,
            PeerRole::Follower => {
                if self.leader != NONE {
                    if let Some(idx) = self.find_index(self.leader) {
                        return self.unconnected[idx];
                    }
                }
                true
            }
            PeerRole::Candidate => true,
        }
    }

    fn refresh_role(&mut self, role: PeerRole, init_critical: bool) -> Result<()> {
        self.role = role;

        match role {
            PeerRole::Leader => {
                // a leader decides by evidence
                self.must_critical = false;
            }
            PeerRole::Follower => {
                self.must_critical = init_critical;
            }
            PeerRole::Candidate => {
                self.must_critical = init_critical;
                if !init_critical {
                    return Err(SaucrError::MonitorConfig(
                        "candidate cannot refresh to a non-critical state".into(),
                    ));
                }
            }
        }

        Ok(())
    }

    fn refresh_peers(&mut self, peers: &[PeerId], kind: &HbCounterKind, init_critical: bool) -> Result<()> {
        if peers.is_empty() {
            return Err(SaucrError::MonitorConfig(
                "monitor is refreshed by an empty peer list".into(),
            ));
        }
        if peers.len() < 3 {
            return Err(SaucrError::MonitorConfig(
                "monitor is refreshed by a peer list with fewer than 3 peers".into(),
            ));
        }

        if self.peers.len() != peers.len() {
            self.unconnected = vec![false; peers.len()];
            self.counters = (0..peers.len()).map(|_| kind.build()).collect();
        }

        self.peers = peers.to_vec();

        for i in 0..self.peers.len() {
            self.counters[i].init(!init_critical);
            self.unconnected[i] = init_critical;
        }

        self.threshold = (self.peers.len() - 1) / 2;

        Ok(())
    }
}

/// The active connectivity monitor. Leaders count unreachable followers
/// against a majority threshold; followers watch the leader; candidates are
/// always critical.
pub struct SaucrMonitor {
    kind: HbCounterKind,
    inner: Mutex<MonitorState>,
}

impl SaucrMonitor {
    pub fn new(kind: HbCounterKind, config: &PerceptibleConfig) -> Result<Self> {
        let monitor = SaucrMonitor {
            kind,
            inner: Mutex::new(MonitorState {
                leader: NONE,
                self_id: NONE,
                role: PeerRole::Follower,
                peers: Vec::new(),
                unconnected: Vec::new(),
                counters: Vec::new(),
                threshold: 0,
                must_critical: true,
            }),
        };
        monitor.set_config(config)?;
        Ok(monitor)
    }
}

impl Perceptible for SaucrMonitor {
    fn get_config(&self) -> PerceptibleConfig {
        let inner = self.inner.lock();
        PerceptibleConfig {
            role: inner.role,
            leader: inner.leader,
            self_id: inner.self_id,
            critical: inner.evaluate(),
            peers: inner.peers.clone(),
        }
    }

    fn set_config(&self, config: &PerceptibleConfig) -> Result<()> {
        let mut inner = self.inner.lock();

        if config.role == PeerRole::Leader && config.leader != config.self_id {
            let err = SaucrError::MonitorConfig("incoherent leader settings".into());
            error!(
                monitor_self_id = inner.self_id,
                error = %err,
                "monitor config is illegal"
            );
            return Err(err);
        }

        inner.leader = config.leader;
        inner.self_id = config.self_id;

        if let Err(err) = inner.refresh_role(config.role, config.critical) {
            error!(
                monitor_self_id = inner.self_id,
                error = %err,
                "monitor is not properly refreshed"
            );
            return Err(err);
        }

        let kind = self.kind;
        if let Err(err) = inner.refresh_peers(&config.peers, &kind, config.critical) {
            error!(
                monitor_self_id = inner.self_id,
                error = %err,
                "monitor is not properly refreshed"
            );
            return Err(err);
        }

        Ok(())
    }

    fn perceive(&self, id: PeerId, connected: bool) {
        let mut inner = self.inner.lock();

        if id == inner.self_id {
            return;
        }
        if inner.role != PeerRole::Leader {
            return;
        }

        match inner.find_index(id) {
            Some(index) => {
                if connected {
                    inner.counters[index].positive();
                } else {
                    inner.counters[index].negative();
                }
                let reachable = inner.counters[index].report();
                inner.unconnected[index] = !reachable;
            }
            None => {
                warn!(
                    self_id = inner.self_id,
                    perceived_id = id,
                    "monitor failed to perceive connectivity from an unknown id"
                );
            }
        }
    }

    fn is_critical(&self) -> bool {
        self.inner.lock().evaluate()
    }

    fn try_get_activate(self: Arc<Self>) -> (Arc<dyn Perceptible>, bool) {
        (self, true)
    }
}

/// Closure producing an activated monitor from the current configuration.
pub type ActivationFn =
    Box<dyn Fn(&PerceptibleConfig) -> Result<Arc<dyn Perceptible>> + Send + Sync>;

/// Activation that upgrades to a [`SaucrMonitor`] once the cluster holds at
/// least three peers.
pub fn saucr_activation(kind: HbCounterKind) -> ActivationFn {
    Box::new(move |config| {
        if config.peers.len() < 3 {
            return Err(SaucrError::MonitorConfig("cluster is not prepared yet".into()));
        }
        Ok(Arc::new(SaucrMonitor::new(kind, config)?) as Arc<dyn Perceptible>)
    })
}

struct InactiveState {
    leader: PeerId,
    self_id: PeerId,
    role: PeerRole,
    peers: Vec<PeerId>,
    must_critical: bool,
}

/// Placeholder monitor for clusters that cannot be monitored yet. Reports
/// its configured critical flag unconditionally and ignores evidence.
pub struct InactivatedMonitor {
    inner: Mutex<InactiveState>,
    activation: ActivationFn,
    give_up_if_fail: bool,
    disable_critical_update: bool,
}

impl InactivatedMonitor {
    pub fn new(config: &PerceptibleConfig, activation: ActivationFn) -> Result<Self> {
        let monitor = InactivatedMonitor {
            inner: Mutex::new(InactiveState {
                leader: NONE,
                self_id: NONE,
                role: PeerRole::Follower,
                peers: Vec::new(),
                must_critical: false,
            }),
            activation,
            give_up_if_fail: false,
            disable_critical_update: false,
        };
        monitor.set_config(config)?;
        Ok(monitor)
    }

    /// A permanently deactivated monitor: activation always fails quietly
    /// and the critical flag is frozen at its initial value.
    pub fn disabled(config: &PerceptibleConfig) -> Result<Self> {
        let mut monitor = InactivatedMonitor::new(
            config,
            Box::new(|_| Err(SaucrError::ActivationDisabled)),
        )?;
        monitor.give_up_if_fail = true;
        monitor.disable_critical_update = true;
        Ok(monitor)
    }
}

impl Perceptible for InactivatedMonitor {
    fn get_config(&self) -> PerceptibleConfig {
        let inner = self.inner.lock();
        PerceptibleConfig {
            role: inner.role,
            leader: inner.leader,
            self_id: inner.self_id,
            critical: inner.must_critical,
            peers: inner.peers.clone(),
        }
    }

    fn set_config(&self, config: &PerceptibleConfig) -> Result<()> {
        let mut inner = self.inner.lock();

        inner.role = config.role;
        inner.leader = config.leader;
        inner.self_id = config.self_id;
        inner.peers = config.peers.clone();

        if !self.disable_critical_update {
            inner.must_critical = config.critical;
        } else if inner.must_critical != config.critical {
            return Err(SaucrError::MonitorConfig(
                "critical update has been disabled".into(),
            ));
        }

        Ok(())
    }

    fn perceive(&self, _id: PeerId, _connected: bool) {}

    fn is_critical(&self) -> bool {
        self.inner.lock().must_critical
    }

    fn try_get_activate(self: Arc<Self>) -> (Arc<dyn Perceptible>, bool) {
        match (self.activation)(&self.get_config()) {
            Ok(activated) => (activated, true),
            Err(err) => {
                if self.give_up_if_fail {
                    (self, true)
                } else {
                    error!(
                        error = %err,
                        substitute = "InactivatedMonitor",
                        "failed to activate"
                    );
                    // no verdict can be formed, shelter permanently
                    self.inner.lock().must_critical = true;
                    (self, false)
                }
            }
        }
    }
}
