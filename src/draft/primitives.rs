//! Draft synchronization primitives.
//!
//! The [`PrimitiveProvider`] owns, per `(rack, file)` pair, a write grant, a
//! read cursor and a fragment collector. `get_update` drains every record
//! past the cursor and folds it by message kind: a vote or pre-vote becomes
//! the pending vote-of-record, an append or heartbeat clears it and folds
//! into one in-progress append-update. A rolled-back pass can `preserve` the
//! collector and a prefix vote so the next pass rediscovers them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::draft::collector::{EntryFragment, FragmentCollector, MultiFragmentCollector};
use crate::error::{Result, SaucrError};
use crate::draft::imf::{ImfReader, ImfWriter};
use crate::types::{Message, MessageType};

/// Folded view of the append traffic found in one read.
#[derive(Debug, Clone, PartialEq)]
pub struct AeUpdate {
    pub term: u64,
    pub commit: u64,
    pub fragments: Vec<EntryFragment>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdatePayload {
    /// Nothing new was found in the file.
    ZeroDelta,
    Delta {
        app: Option<AeUpdate>,
        vote: Option<Message>,
    },
}

/// What one file yielded, or the error that aborted the read.
pub struct Update {
    pub source_file: String,
    pub payload: Result<UpdatePayload>,
}

/// Synchronous and spawning access to the draft message files.
#[async_trait]
pub trait Primitives: Send + Sync {
    /// Persists a draft message to the specific destination.
    async fn write(&self, rack: &str, file: &str, message: &Message) -> Result<()>;

    /// Fetches and categorizes the delta of the specific destination.
    async fn get_update(&self, rack: &str, file: &str) -> Update;

    /// Runs `get_update` on a background task, delivering the result over
    /// `tx`.
    fn spawn_get_update(&self, rack: &str, file: &str, tx: mpsc::Sender<Update>) -> Result<()>;
}

/// Primitives that can hold the result of the last update for the next
/// pass.
pub trait PreservablePrimitives: Primitives {
    fn preserve(&self, rack: &str, file: &str, vote: Option<Message>) -> Result<()>;

    /// Rewinds a file cursor, optionally refreshing the fragment collector.
    fn reset_read(&self, rack: &str, file: &str, index: usize, refresh_collector: bool) -> bool;
}

struct ReadProgress {
    next: usize,
    collector: MultiFragmentCollector,
    refresh: bool,
    prefix_vote: Option<Message>,
}

struct FileEntry {
    reader: Arc<dyn ImfReader>,
    progress: Mutex<ReadProgress>,
}

#[derive(Default)]
pub struct PrimitiveProvider {
    writers: HashMap<String, Arc<dyn ImfWriter>>,
    readers: HashMap<String, Arc<FileEntry>>,
}

fn signature(rack: &str, file: &str) -> String {
    format!("{}/{}", rack, file)
}

impl PrimitiveProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant_write(&mut self, rack: &str, file: &str, writer: Arc<dyn ImfWriter>) {
        self.writers.insert(signature(rack, file), writer);
    }

    pub fn grant_read(&mut self, rack: &str, file: &str, reader: Arc<dyn ImfReader>) {
        self.readers.insert(
            signature(rack, file),
            Arc::new(FileEntry {
                reader,
                progress: Mutex::new(ReadProgress {
                    next: 0,
                    collector: MultiFragmentCollector::new(),
                    refresh: true,
                    prefix_vote: None,
                }),
            }),
        );
    }

    async fn perform_get_update(entry: Arc<FileEntry>, file: String) -> Update {
        // resolve the preserved state before touching the file, so a
        // preserve-then-update sequence behaves deterministically
        let (from, prefix_vote) = {
            let mut progress = entry.progress.lock();
            let prefix_vote = if progress.refresh {
                progress.collector.refresh();
                None
            } else {
                progress.refresh = true;
                progress.prefix_vote.take()
            };
            (progress.next, prefix_vote)
        };

        let messages = match entry.reader.read_imf(from).await {
            Ok(messages) => messages,
            Err(err) => {
                return Update {
                    source_file: file,
                    payload: Err(err),
                }
            }
        };

        let mut progress = entry.progress.lock();
        progress.next = from + messages.len();

        if messages.is_empty() {
            // a preserved vote still counts as a delta
            let payload = match prefix_vote {
                Some(vote) => UpdatePayload::Delta {
                    app: None,
                    vote: Some(vote),
                },
                None => UpdatePayload::ZeroDelta,
            };
            return Update {
                source_file: file,
                payload: Ok(payload),
            };
        }

        let mut vote = prefix_vote;
        let mut app: Option<AeUpdate> = None;

        for m in &messages {
            match m.msg_type {
                MessageType::PreVote | MessageType::Vote => {
                    vote = Some(m.clone());
                }
                MessageType::App => {
                    vote = None;
                    app = Some(refresh_ae_update(app, m.term, m.commit));
                    progress
                        .collector
                        .add_entries_with_submitter(m.term, &m.entries, m.log_term, m.index);
                }
                MessageType::Heartbeat => {
                    vote = None;
                    app = Some(refresh_ae_update(app, m.term, m.commit));
                }
                _ => {}
            }
        }

        if let Some(ae) = app.as_mut() {
            ae.fragments = progress
                .collector
                .fetch_all_fragments()
                .unwrap_or_default();
        }

        Update {
            source_file: file,
            payload: Ok(UpdatePayload::Delta { app, vote }),
        }
    }
}

fn refresh_ae_update(app: Option<AeUpdate>, term: u64, commit: u64) -> AeUpdate {
    match app {
        None => AeUpdate {
            term,
            commit,
            fragments: Vec::new(),
        },
        Some(mut app) => {
            if app.term < term {
                app.term = term;
            }
            if app.commit < commit {
                app.commit = commit;
            }
            app
        }
    }
}

#[async_trait]
impl Primitives for PrimitiveProvider {
    async fn write(&self, rack: &str, file: &str, message: &Message) -> Result<()> {
        match self.writers.get(&signature(rack, file)) {
            Some(writer) => writer.write_imf(message).await,
            None => Err(SaucrError::NotFound {
                kind: "writer",
                rack: rack.to_string(),
                file: file.to_string(),
            }),
        }
    }

    async fn get_update(&self, rack: &str, file: &str) -> Update {
        match self.readers.get(&signature(rack, file)) {
            Some(entry) => Self::perform_get_update(entry.clone(), file.to_string()).await,
            None => Update {
                source_file: file.to_string(),
                payload: Err(SaucrError::NotFound {
                    kind: "reader",
                    rack: rack.to_string(),
                    file: file.to_string(),
                }),
            },
        }
    }

    fn spawn_get_update(&self, rack: &str, file: &str, tx: mpsc::Sender<Update>) -> Result<()> {
        let Some(entry) = self.readers.get(&signature(rack, file)) else {
            return Err(SaucrError::NotFound {
                kind: "reader",
                rack: rack.to_string(),
                file: file.to_string(),
            });
        };

        let entry = entry.clone();
        let file = file.to_string();
        tokio::spawn(async move {
            let update = PrimitiveProvider::perform_get_update(entry, file).await;
            let _ = tx.send(update).await;
        });

        Ok(())
    }
}

impl PreservablePrimitives for PrimitiveProvider {
    fn preserve(&self, rack: &str, file: &str, vote: Option<Message>) -> Result<()> {
        match self.readers.get(&signature(rack, file)) {
            Some(entry) => {
                let mut progress = entry.progress.lock();
                progress.refresh = false;
                progress.prefix_vote = vote;
                Ok(())
            }
            None => Err(SaucrError::NotFound {
                kind: "reader",
                rack: rack.to_string(),
                file: file.to_string(),
            }),
        }
    }

    fn reset_read(&self, rack: &str, file: &str, index: usize, refresh_collector: bool) -> bool {
        match self.readers.get(&signature(rack, file)) {
            Some(entry) => {
                let mut progress = entry.progress.lock();
                progress.next = index;
                progress.refresh = true;
                if refresh_collector {
                    progress.collector.refresh();
                }
                progress.prefix_vote = None;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::imf::MemoryImf;
    use crate::types::Entry;

    fn app_message(term: u64, commit: u64, log_term: u64, log_index: u64, len: u64) -> Message {
        let mut m = Message::new(MessageType::App);
        m.term = term;
        m.commit = commit;
        m.log_term = log_term;
        m.index = log_index;
        m.entries = (log_index + 1..=log_index + len)
            .map(|i| Entry::new(term, i, vec![]))
            .collect();
        m
    }

    fn vote_message(term: u64, log_term: u64, index: u64) -> Message {
        let mut m = Message::new(MessageType::Vote);
        m.term = term;
        m.log_term = log_term;
        m.index = index;
        m
    }

    fn provider_with(file: &str, imf: &MemoryImf) -> PrimitiveProvider {
        let mut provider = PrimitiveProvider::new();
        provider.grant_read("r1", file, Arc::new(imf.clone()));
        provider.grant_write("r1", file, Arc::new(imf.clone()));
        provider
    }

    #[tokio::test]
    async fn empty_file_yields_zero_delta() {
        let imf = MemoryImf::new();
        let provider = provider_with("a", &imf);

        let update = provider.get_update("r1", "a").await;
        assert_eq!(update.payload.unwrap(), UpdatePayload::ZeroDelta);
    }

    #[tokio::test]
    async fn appends_fold_into_one_update() {
        let imf = MemoryImf::new();
        let provider = provider_with("a", &imf);

        provider
            .write("r1", "a", &app_message(2, 0, 0, 0, 2))
            .await
            .unwrap();
        provider
            .write("r1", "a", &app_message(3, 1, 2, 2, 1))
            .await
            .unwrap();

        let update = provider.get_update("r1", "a").await;
        match update.payload.unwrap() {
            UpdatePayload::Delta { app: Some(ae), vote } => {
                assert!(vote.is_none());
                assert_eq!(ae.term, 3);
                assert_eq!(ae.commit, 1);
                let total: usize = ae.fragments.iter().map(|f| f.entries.len()).sum();
                assert_eq!(total, 3);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn append_after_vote_clears_the_vote_of_record() {
        let imf = MemoryImf::new();
        let provider = provider_with("a", &imf);

        provider
            .write("r1", "a", &vote_message(5, 2, 9))
            .await
            .unwrap();
        provider
            .write("r1", "a", &app_message(5, 0, 0, 0, 1))
            .await
            .unwrap();

        let update = provider.get_update("r1", "a").await;
        match update.payload.unwrap() {
            UpdatePayload::Delta { app, vote } => {
                assert!(app.is_some());
                assert!(vote.is_none(), "the append overrode the pending vote");
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn cursor_only_reads_new_records() {
        let imf = MemoryImf::new();
        let provider = provider_with("a", &imf);

        provider
            .write("r1", "a", &vote_message(4, 1, 3))
            .await
            .unwrap();
        let first = provider.get_update("r1", "a").await;
        assert!(matches!(
            first.payload.unwrap(),
            UpdatePayload::Delta { vote: Some(_), .. }
        ));

        let second = provider.get_update("r1", "a").await;
        assert_eq!(second.payload.unwrap(), UpdatePayload::ZeroDelta);
    }

    #[tokio::test]
    async fn preserved_vote_resurfaces_on_the_next_pass() {
        let imf = MemoryImf::new();
        let provider = provider_with("a", &imf);

        provider.preserve("r1", "a", Some(vote_message(6, 3, 7))).unwrap();

        let update = provider.get_update("r1", "a").await;
        match update.payload.unwrap() {
            UpdatePayload::Delta { app, vote } => {
                assert!(app.is_none());
                assert_eq!(vote.unwrap().term, 6);
            }
            other => panic!("unexpected payload {:?}", other),
        }

        // the preserved state was consumed
        let after = provider.get_update("r1", "a").await;
        assert_eq!(after.payload.unwrap(), UpdatePayload::ZeroDelta);
    }

    #[tokio::test]
    async fn spawned_updates_arrive_over_the_channel() {
        let imf = MemoryImf::new();
        let provider = provider_with("a", &imf);

        provider
            .write("r1", "a", &app_message(2, 0, 0, 0, 1))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(1);
        provider.spawn_get_update("r1", "a", tx).unwrap();

        let update = rx.recv().await.unwrap();
        assert_eq!(update.source_file, "a");
        assert!(matches!(
            update.payload.unwrap(),
            UpdatePayload::Delta { app: Some(_), .. }
        ));
    }

    #[tokio::test]
    async fn missing_grants_surface_not_found() {
        let provider = PrimitiveProvider::new();

        let m = Message::new(MessageType::Heartbeat);
        assert!(matches!(
            provider.write("r1", "ghost", &m).await,
            Err(SaucrError::NotFound { kind: "writer", .. })
        ));

        let update = provider.get_update("r1", "ghost").await;
        assert!(matches!(
            update.payload,
            Err(SaucrError::NotFound { kind: "reader", .. })
        ));

        let (tx, _rx) = mpsc::channel(1);
        assert!(provider.spawn_get_update("r1", "ghost", tx).is_err());
    }

    #[tokio::test]
    async fn reset_read_rewinds_the_cursor() {
        let imf = MemoryImf::new();
        let provider = provider_with("a", &imf);

        provider
            .write("r1", "a", &app_message(2, 0, 0, 0, 1))
            .await
            .unwrap();
        let _ = provider.get_update("r1", "a").await;

        assert!(provider.reset_read("r1", "a", 0, true));
        let again = provider.get_update("r1", "a").await;
        assert!(matches!(
            again.payload.unwrap(),
            UpdatePayload::Delta { app: Some(_), .. }
        ));
    }
}
