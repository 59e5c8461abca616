//! Cached persistence manager.
//!
//! [`LocalCachedDisk`] wraps a [`Storage`] handle and, while the strategy
//! permits, buffers hard-state and log-entry writes in memory. The buffer is
//! flushed when the preserve deadline has passed, when it would outgrow the
//! cache bound, when fsync is (re)enabled, and on snapshot or close.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::error::Result;
use crate::persistent::{PersistentConfig, PersistentManager, PersistentStrategy};
use crate::types::{Entry, HardState, Snapshot};

/// The wrapped disk. `save` must be atomic with respect to subsequent reads.
pub trait Storage: Send + Sync {
    fn save(&self, hard_state: &HardState, entries: &[Entry]) -> Result<()>;
    fn save_snap(&self, snap: &Snapshot) -> Result<()>;
    fn close(&self) -> Result<()>;
}

struct CacheState {
    fsync: bool,

    cached_hard_state: HardState,
    cached_entries: Vec<Entry>,

    max_local_cache_size: usize,
    cache_preserve_time: std::time::Duration,

    // armed on each cached write, cancelled on each flush, checked inline
    // inside save/save_snap
    preserve_deadline: Option<Instant>,
}

impl CacheState {
    fn deadline_passed(&self) -> bool {
        self.preserve_deadline
            .map_or(false, |deadline| Instant::now() >= deadline)
    }
}

pub struct LocalCachedDisk {
    disk: Arc<dyn Storage>,
    inner: Mutex<CacheState>,
}

impl LocalCachedDisk {
    pub fn new(disk: Arc<dyn Storage>, strategy: &PersistentStrategy) -> Self {
        info!(
            fsync = strategy.fsync,
            max_local_cache_size = strategy.max_local_cache_size,
            cache_preserve_time = ?strategy.cache_preserve_time,
            "apply strategy"
        );

        LocalCachedDisk {
            disk,
            inner: Mutex::new(CacheState {
                fsync: strategy.fsync,
                cached_hard_state: HardState::default(),
                cached_entries: Vec::with_capacity(strategy.max_local_cache_size),
                max_local_cache_size: strategy.max_local_cache_size,
                cache_preserve_time: strategy.cache_preserve_time,
                preserve_deadline: None,
            }),
        }
    }

    fn flush_locked(
        &self,
        state: &mut CacheState,
        caller: &'static str,
        other_hard_state: Option<&HardState>,
        other_entries: Option<Vec<Entry>>,
    ) -> Result<()> {
        let hard_state = match other_hard_state {
            Some(hs) if !hs.is_empty() => *hs,
            _ => state.cached_hard_state,
        };

        let entries = match other_entries {
            Some(ents) => ents,
            None => state.cached_entries.clone(),
        };

        if entries.is_empty() {
            if !hard_state.is_empty() {
                let result = self.disk.save(&hard_state, &[]);
                match &result {
                    Err(err) => error!(op = caller, error = %err, "failed to persist cached hard state"),
                    Ok(()) => {
                        state.cached_hard_state = HardState::default();
                        state.preserve_deadline = None;
                    }
                }
                return result;
            }
            return Ok(());
        }

        let result = self.disk.save(&hard_state, &entries);

        state.preserve_deadline = None;
        state.cached_entries.clear();
        state.cached_hard_state = HardState::default();

        if let Err(err) = &result {
            error!(op = caller, error = %err, "failed to persist cached entries and hard state");
        }

        result
    }

    fn update_strategy_locked(&self, state: &mut CacheState, strategy: &PersistentStrategy) {
        state.fsync = strategy.fsync;
        state.max_local_cache_size = strategy.max_local_cache_size;
        state.cache_preserve_time = strategy.cache_preserve_time;

        let wanted = state.max_local_cache_size + 1;
        if wanted > state.cached_entries.capacity() {
            let additional = wanted - state.cached_entries.len();
            state.cached_entries.reserve(additional);
        }

        info!(
            fsync = state.fsync,
            max_local_cache_size = state.max_local_cache_size,
            cache_preserve_time = ?state.cache_preserve_time,
            "apply new strategy"
        );
    }

    fn apply_strategy_locked(
        &self,
        state: &mut CacheState,
        strategy: &PersistentStrategy,
        caller: &'static str,
    ) -> Result<()> {
        self.update_strategy_locked(state, strategy);

        if strategy.fsync
            && (!state.cached_entries.is_empty() || !state.cached_hard_state.is_empty())
        {
            // entering fsync mode with a live buffer, drain it now
            return self.flush_locked(state, caller, None, None);
        }

        Ok(())
    }
}

impl PersistentManager for LocalCachedDisk {
    fn save(&self, hard_state: &HardState, entries: &[Entry]) -> Result<()> {
        let mut state = self.inner.lock();

        let cur_len = state.cached_entries.len();
        let new_len = entries.len();

        if state.deadline_passed() {
            let mut send = Vec::with_capacity(cur_len + new_len);
            send.extend_from_slice(&state.cached_entries);
            send.extend_from_slice(entries);
            return self.flush_locked(&mut state, "save", Some(hard_state), Some(send));
        }

        if !state.fsync && cur_len + new_len < state.max_local_cache_size {
            state.cached_entries.extend_from_slice(entries);

            if !hard_state.is_empty() {
                state.cached_hard_state = *hard_state;
            }

            if state.preserve_deadline.is_none() {
                state.preserve_deadline = Some(Instant::now() + state.cache_preserve_time);
            }

            return Ok(());
        }

        let mut send = Vec::with_capacity(cur_len + new_len);
        send.extend_from_slice(&state.cached_entries);
        send.extend_from_slice(entries);
        self.flush_locked(&mut state, "save", Some(hard_state), Some(send))
    }

    fn save_snap(&self, snap: &Snapshot) -> Result<()> {
        let mut state = self.inner.lock();

        if snap.is_empty() {
            if state.deadline_passed() {
                return self.flush_locked(&mut state, "save_snap", None, None);
            }
            return Ok(());
        }

        let _ = self.flush_locked(&mut state, "save_snap", None, None);
        self.disk.save_snap(snap)
    }

    fn close(&self) -> Result<()> {
        let mut state = self.inner.lock();
        let _ = self.flush_locked(&mut state, "close", None, None);
        self.disk.close()
    }

    fn unpersisted(&self) -> bool {
        let state = self.inner.lock();
        !state.cached_hard_state.is_empty() || !state.cached_entries.is_empty()
    }

    fn flush(&self) -> Result<()> {
        let mut state = self.inner.lock();
        self.flush_locked(&mut state, "flush", None, None)
    }

    fn get_config(&self) -> PersistentConfig {
        PersistentConfig {
            strategy: Some(self.get_strategy()),
            remotes: None,
        }
    }

    fn set_config(&self, config: &PersistentConfig) -> Result<()> {
        let mut state = self.inner.lock();

        if config.remotes.is_some() {
            return Err(crate::error::SaucrError::PersistentConfig(
                "remote disk is not supported".into(),
            ));
        }

        if let Some(strategy) = &config.strategy {
            return self.apply_strategy_locked(&mut state, strategy, "set_config");
        }

        Ok(())
    }

    fn get_strategy(&self) -> PersistentStrategy {
        let state = self.inner.lock();
        PersistentStrategy {
            fsync: state.fsync,
            max_local_cache_size: state.max_local_cache_size,
            cache_preserve_time: state.cache_preserve_time,
        }
    }

    fn set_strategy(&self, strategy: &PersistentStrategy) -> Result<()> {
        let mut state = self.inner.lock();
        self.apply_strategy_locked(&mut state, strategy, "set_strategy")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct DiskLog {
        saves: Vec<(HardState, Vec<Entry>)>,
        snaps: Vec<Snapshot>,
        closed: bool,
    }

    #[derive(Default)]
    struct MockDisk {
        log: Mutex<DiskLog>,
    }

    impl MockDisk {
        fn save_count(&self) -> usize {
            self.log.lock().saves.len()
        }

        fn last_save(&self) -> (HardState, Vec<Entry>) {
            self.log.lock().saves.last().cloned().unwrap()
        }
    }

    impl Storage for MockDisk {
        fn save(&self, hard_state: &HardState, entries: &[Entry]) -> Result<()> {
            self.log
                .lock()
                .saves
                .push((*hard_state, entries.to_vec()));
            Ok(())
        }

        fn save_snap(&self, snap: &Snapshot) -> Result<()> {
            self.log.lock().snaps.push(snap.clone());
            Ok(())
        }

        fn close(&self) -> Result<()> {
            self.log.lock().closed = true;
            Ok(())
        }
    }

    fn entries(range: std::ops::Range<u64>, term: u64) -> Vec<Entry> {
        range.map(|i| Entry::new(term, i, vec![])).collect()
    }

    fn buffered_strategy(cache: usize) -> PersistentStrategy {
        PersistentStrategy {
            fsync: false,
            max_local_cache_size: cache,
            cache_preserve_time: Duration::from_secs(30),
        }
    }

    #[test]
    fn writes_below_the_cache_bound_stay_in_memory() {
        let disk = Arc::new(MockDisk::default());
        let lcd = LocalCachedDisk::new(disk.clone(), &buffered_strategy(10));

        let hs = HardState {
            term: 1,
            vote: 2,
            commit: 0,
        };
        lcd.save(&hs, &entries(1..3, 1)).unwrap();
        lcd.save(&HardState::default(), &entries(3..5, 1)).unwrap();
        lcd.save(&hs, &entries(5..7, 1)).unwrap();

        assert_eq!(disk.save_count(), 0);
        assert!(lcd.unpersisted());

        lcd.flush().unwrap();
        assert_eq!(disk.save_count(), 1);
        let (saved_hs, saved_ents) = disk.last_save();
        assert_eq!(saved_hs, hs);
        assert_eq!(saved_ents.len(), 6);
        assert!(!lcd.unpersisted());
    }

    #[test]
    fn crossing_the_cache_bound_forces_one_combined_save() {
        let disk = Arc::new(MockDisk::default());
        let lcd = LocalCachedDisk::new(disk.clone(), &buffered_strategy(5));

        lcd.save(&HardState::default(), &entries(1..4, 1)).unwrap();
        assert_eq!(disk.save_count(), 0);

        // 3 cached + 2 new reaches the bound
        lcd.save(&HardState::default(), &entries(4..6, 1)).unwrap();
        assert_eq!(disk.save_count(), 1);
        assert_eq!(disk.last_save().1.len(), 5);
        assert!(!lcd.unpersisted());
    }

    #[test]
    fn enabling_fsync_flushes_the_combined_buffer_once() {
        let disk = Arc::new(MockDisk::default());
        let lcd = LocalCachedDisk::new(disk.clone(), &buffered_strategy(100));

        let hs = HardState {
            term: 3,
            vote: 1,
            commit: 2,
        };
        lcd.save(&hs, &entries(1..5, 3)).unwrap();
        assert_eq!(disk.save_count(), 0);

        let mut strategy = lcd.get_strategy();
        strategy.fsync = true;
        lcd.set_strategy(&strategy).unwrap();

        assert_eq!(disk.save_count(), 1);
        let (saved_hs, saved_ents) = disk.last_save();
        assert_eq!(saved_hs, hs);
        assert_eq!(saved_ents.len(), 4);
        assert!(!lcd.unpersisted());

        // From now on every save goes straight through.
        lcd.save(&HardState::default(), &entries(5..6, 3)).unwrap();
        assert_eq!(disk.save_count(), 2);
        assert!(!lcd.unpersisted());
    }

    #[test]
    fn flush_clears_a_hard_state_only_buffer() {
        let disk = Arc::new(MockDisk::default());
        let lcd = LocalCachedDisk::new(disk.clone(), &buffered_strategy(10));

        let hs = HardState {
            term: 2,
            vote: 0,
            commit: 1,
        };
        lcd.save(&hs, &[]).unwrap();
        assert!(lcd.unpersisted());

        lcd.flush().unwrap();
        assert!(!lcd.unpersisted());
        assert_eq!(disk.save_count(), 1);
        assert_eq!(disk.last_save().0, hs);
    }

    #[test]
    fn expired_preserve_deadline_flushes_on_the_next_save() {
        let disk = Arc::new(MockDisk::default());
        let strategy = PersistentStrategy {
            fsync: false,
            max_local_cache_size: 100,
            cache_preserve_time: Duration::from_millis(10),
        };
        let lcd = LocalCachedDisk::new(disk.clone(), &strategy);

        lcd.save(&HardState::default(), &entries(1..2, 1)).unwrap();
        assert_eq!(disk.save_count(), 0);

        std::thread::sleep(Duration::from_millis(20));

        lcd.save(&HardState::default(), &entries(2..3, 1)).unwrap();
        assert_eq!(disk.save_count(), 1);
        assert_eq!(disk.last_save().1.len(), 2);
    }

    #[test]
    fn snapshots_flush_first_then_delegate() {
        let disk = Arc::new(MockDisk::default());
        let lcd = LocalCachedDisk::new(disk.clone(), &buffered_strategy(10));

        lcd.save(&HardState::default(), &entries(1..3, 1)).unwrap();

        // An empty snapshot with an unexpired deadline does nothing.
        lcd.save_snap(&Snapshot::default()).unwrap();
        assert_eq!(disk.save_count(), 0);
        assert!(disk.log.lock().snaps.is_empty());

        let mut snap = Snapshot::default();
        snap.metadata.index = 2;
        snap.metadata.term = 1;
        lcd.save_snap(&snap).unwrap();

        assert_eq!(disk.save_count(), 1);
        assert_eq!(disk.log.lock().snaps.len(), 1);
        assert!(!lcd.unpersisted());
    }

    #[test]
    fn close_flushes_then_closes_the_disk() {
        let disk = Arc::new(MockDisk::default());
        let lcd = LocalCachedDisk::new(disk.clone(), &buffered_strategy(10));

        lcd.save(&HardState::default(), &entries(1..2, 1)).unwrap();
        lcd.close().unwrap();

        assert_eq!(disk.save_count(), 1);
        assert!(disk.log.lock().closed);
    }

    #[test]
    fn remote_disks_are_rejected() {
        let disk = Arc::new(MockDisk::default());
        let lcd = LocalCachedDisk::new(disk, &buffered_strategy(10));

        let config = PersistentConfig {
            strategy: None,
            remotes: Some(vec![Default::default()]),
        };
        assert!(matches!(
            lcd.set_config(&config),
            Err(crate::error::SaucrError::PersistentConfig(_))
        ));
    }

    #[test]
    fn zero_cache_size_forces_immediate_flushes() {
        let disk = Arc::new(MockDisk::default());
        let lcd = LocalCachedDisk::new(disk.clone(), &buffered_strategy(0));

        lcd.save(&HardState::default(), &entries(1..2, 1)).unwrap();
        assert_eq!(disk.save_count(), 1);
        assert!(!lcd.unpersisted());
    }
}
