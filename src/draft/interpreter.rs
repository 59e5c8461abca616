//! Message interpretation.
//!
//! The interpreter maps every outgoing kernel message onto a write to the
//! destination peer's file, asynchronously reads what the other peers have
//! written, feeds the result to the analyzer bound to the destination rack,
//! and synthesizes the response the kernel would have received had the
//! peers talked to it directly.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::draft::analyzer::{AnalysisPolicy, MimicRaftAnalyzer, RackProgress};
use crate::draft::collector::{Location, Locator};
use crate::draft::imf::{ImfReader, ImfWriter};
use crate::draft::parallel::ParallelInterpreter;
use crate::draft::primitives::{
    PreservablePrimitives, PrimitiveProvider, Update, UpdatePayload,
};
use crate::error::Result;
use crate::types::{
    Message, MessageType, PeerId, DR_SYNC_ADVANCE, DR_SYNC_ENTRIES, DR_SYNC_PENDING,
};

/// Builds a [`OneToOneInterpreter`], mapping each peer id to one rack and
/// one file and binding the message-file grants.
pub struct OneToOneInterpreterBuilder {
    self_id: PeerId,
    q_size: usize,

    ids: Vec<PeerId>,
    racks: Vec<String>,
    files: Vec<String>,

    p2r: HashMap<PeerId, String>,
    p2f: HashMap<PeerId, String>,
    f2p: HashMap<String, PeerId>,

    provider: PrimitiveProvider,
    custom: Option<Arc<dyn PreservablePrimitives>>,
}

impl OneToOneInterpreterBuilder {
    pub fn new(self_id: PeerId) -> Self {
        OneToOneInterpreterBuilder {
            self_id,
            q_size: 0,
            ids: Vec::new(),
            racks: Vec::new(),
            files: Vec::new(),
            p2r: HashMap::new(),
            p2f: HashMap::new(),
            f2p: HashMap::new(),
            provider: PrimitiveProvider::new(),
            custom: None,
        }
    }

    pub fn map(mut self, id: PeerId, rack: &str, file: &str) -> Self {
        if self.racks.iter().any(|r| r == rack) || self.f2p.contains_key(file) {
            panic!("multiple mapping detected");
        }

        self.q_size += 1;
        self.f2p.insert(file.to_string(), id);
        self.p2r.insert(id, rack.to_string());
        self.p2f.insert(id, file.to_string());

        self.ids.push(id);
        self.racks.push(rack.to_string());
        self.files.push(file.to_string());

        self
    }

    pub fn bind(
        mut self,
        rack: &str,
        file: &str,
        writer: Option<Arc<dyn ImfWriter>>,
        reader: Option<Arc<dyn ImfReader>>,
    ) -> Self {
        if let Some(writer) = writer {
            self.provider.grant_write(rack, file, writer);
        }
        if let Some(reader) = reader {
            self.provider.grant_read(rack, file, reader);
        }
        self
    }

    /// Replaces the default primitives with custom ones.
    pub fn use_custom_primitives(mut self, primitives: Arc<dyn PreservablePrimitives>) -> Self {
        self.custom = Some(primitives);
        self
    }

    pub fn build(self) -> Option<OneToOneInterpreter> {
        if self.q_size == 0 {
            return None;
        }

        let analyzers = self
            .racks
            .iter()
            .map(|rack| {
                (
                    rack.clone(),
                    tokio::sync::Mutex::new(MimicRaftAnalyzer::new(self.q_size)),
                )
            })
            .collect();

        let drp: Arc<dyn PreservablePrimitives> = match self.custom {
            Some(custom) => custom,
            None => Arc::new(self.provider),
        };

        Some(OneToOneInterpreter {
            sync_rack: self.p2r.get(&self.self_id).cloned().unwrap_or_default(),
            p2r: self.p2r,
            files: self.files,
            p2f: self.p2f,
            f2p: self.f2p,
            drp,
            analyzers,
        })
    }

    pub fn build_parallel(self, channel_buf_size: usize) -> Option<ParallelInterpreter> {
        let ids = self.ids.clone();
        let itp = self.build()?;
        Some(ParallelInterpreter::new(
            Arc::new(itp),
            ids,
            channel_buf_size,
        ))
    }
}

/// Interpreter with a one-to-one binding between peer ids and racks.
pub struct OneToOneInterpreter {
    sync_rack: String,
    p2r: HashMap<PeerId, String>,

    files: Vec<String>,
    p2f: HashMap<PeerId, String>,
    f2p: HashMap<String, PeerId>,

    drp: Arc<dyn PreservablePrimitives>,
    analyzers: HashMap<String, tokio::sync::Mutex<MimicRaftAnalyzer>>,
}

impl OneToOneInterpreter {
    /// Whether translation service is available for this message.
    pub fn is_supported(&self, m: &Message) -> bool {
        matches!(
            m.msg_type,
            MessageType::Vote
                | MessageType::PreVote
                | MessageType::App
                | MessageType::Heartbeat
                | MessageType::DrSync
        )
    }

    /// Takes in a request and gives out the response the peers would have
    /// produced.
    pub async fn interpret(&self, m: &Message) -> Option<Message> {
        match m.msg_type {
            MessageType::PreVote | MessageType::Vote => {
                let (rack, file) = self.locate(m)?;
                self.interpret_vote(&rack, &file, m).await
            }
            MessageType::App => {
                let (rack, file) = self.locate(m)?;
                self.interpret_app(&rack, &file, m).await
            }
            MessageType::Heartbeat => {
                let (rack, file) = self.locate(m)?;
                self.interpret_hb(&rack, &file, m).await
            }
            MessageType::DrSync => {
                if m.to == 0 {
                    let rack = self.sync_rack.clone();
                    self.interpret_ds(&rack, m).await
                } else {
                    let (rack, _) = self.locate(m)?;
                    self.interpret_ds(&rack, m).await
                }
            }
            _ => None,
        }
    }

    fn locate(&self, m: &Message) -> Option<(String, String)> {
        let Some(rack) = self.p2r.get(&m.to) else {
            warn!(peer_id = m.to, "peer id is not bound to any rack");
            return None;
        };

        let Some(file) = self.p2f.get(&m.from) else {
            warn!(peer_id = m.from, "peer id is not bound to any file");
            return None;
        };

        Some((rack.clone(), file.clone()))
    }

    async fn interpret_vote(&self, rack: &str, file: &str, m: &Message) -> Option<Message> {
        let mut an = self.analyzers.get(rack)?.lock().await;

        if an.term() > m.term {
            warn!(
                msg_term = m.term,
                itp_term = an.term(),
                "dropped a staled vote from the kernel"
            );
            return None;
        }

        if let Err(err) = self.write_to_target_file(m, rack, file, None).await {
            error!(msg = "vote", error = %err, "abort interpretation due to a write error");
            return None;
        }

        let (updated, votes) = match self
            .updates_from_other_files(rack, Some(file), Some(&mut *an))
            .await
        {
            Ok(result) => result,
            Err(err) => {
                error!(msg = "vote", error = %err, "abort interpretation due to a read error");
                return None;
            }
        };

        if !updated {
            let resp = handle_request_vote(m, an.term(), an.sub_locator(true));
            an.try_set_term(m.term);
            return Some(resp);
        }

        an.analyze_and_remove_offers(AnalysisPolicy::MatchFirstFragment);
        for v in &votes {
            an.try_set_term(v.term);
        }

        // compare against the pending run when the analysis produced one,
        // otherwise against compacted history
        let use_pending = !an.progress().no_progress;
        let resp = handle_request_vote(m, an.term(), an.sub_locator(!use_pending));
        an.try_set_term(m.term);
        Some(resp)
    }

    async fn interpret_app(&self, rack: &str, file: &str, m: &Message) -> Option<Message> {
        let mut an = self.analyzers.get(rack)?.lock().await;

        if an.term() > m.term {
            warn!(
                msg_term = m.term,
                itp_term = an.term(),
                "dropped a staled append from the kernel"
            );
            return None;
        }

        if let Err(err) = self.write_to_target_file(m, rack, file, Some(&mut *an)).await {
            error!(msg = "app", error = %err, "abort interpretation due to a write error");
            return None;
        }

        let (updated, votes) = match self
            .updates_from_other_files(rack, Some(file), Some(&mut *an))
            .await
        {
            Ok(result) => result,
            Err(err) => {
                error!(msg = "app", error = %err, "abort interpretation due to a read error");
                return None;
            }
        };

        if !updated {
            // only the local offer to merge
            an.analyze_and_remove_offers(AnalysisPolicy::MatchFirstFragment);
            an.compact();
            return Some(handle_append_entries(
                m,
                an.committed(),
                an.term(),
                an.sub_locator(true),
            ));
        }

        an.analyze_and_remove_offers(AnalysisPolicy::MatchFirstFragment);
        an.try_set_term(m.term);
        for v in &votes {
            an.try_set_term(v.term);
        }

        let pg = an.progress();

        if pg.no_progress || pg.term == m.term {
            // our progress was not overwritten: the rack is lagging or saw
            // staled entries from other processors, safe to proceed
            an.compact();
            return Some(handle_append_entries(
                m,
                an.committed(),
                an.term(),
                an.sub_locator(true),
            ));
        }

        // the progress was overwritten, locate our position
        let use_compacted = {
            let compacted = an.sub_locator(true);
            !compacted.is_empty() && compacted.last_index() >= m.index
        };
        Some(handle_append_entries(
            m,
            an.committed(),
            an.term(),
            an.sub_locator(use_compacted),
        ))
    }

    async fn interpret_hb(&self, rack: &str, file: &str, m: &Message) -> Option<Message> {
        let mut an = self.analyzers.get(rack)?.lock().await;

        if an.term() > m.term {
            warn!(
                msg_term = m.term,
                itp_term = an.term(),
                "dropped a staled heartbeat from the kernel"
            );
            return None;
        }

        if let Err(err) = self.write_to_target_file(m, rack, file, Some(&mut *an)).await {
            error!(msg = "heartbeat", error = %err, "abort interpretation due to a write error");
            return None;
        }

        let (updated, votes) = match self
            .updates_from_other_files(rack, Some(file), Some(&mut *an))
            .await
        {
            Ok(result) => result,
            Err(err) => {
                error!(msg = "heartbeat", error = %err, "abort interpretation due to a read error");
                return None;
            }
        };

        if !updated {
            an.analyze_and_remove_offers(AnalysisPolicy::MatchLastFragment);
            an.compact();
            return Some(handle_heartbeat(m, an.term()));
        }

        an.analyze_and_remove_offers(AnalysisPolicy::MatchLastFragment);
        an.try_set_term(m.term);
        for v in &votes {
            an.try_set_term(v.term);
        }

        Some(handle_heartbeat(m, an.term()))
    }

    async fn interpret_ds(&self, rack: &str, m: &Message) -> Option<Message> {
        let mut an = self.analyzers.get(rack)?.lock().await;

        let (ready, rollback) = match self.dr_sync(rack, m.term, &mut *an).await {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "abort synchronization due to a read error");
                return None;
            }
        };

        let pg = an.progress();

        if !pg.no_progress {
            an.compact();
            return Some(dr_sync_resp_entries(&pg));
        }
        if an.term() > m.term || an.committed() > m.commit {
            return Some(dr_sync_resp_advance(an.term(), an.committed()));
        }
        if ready {
            return Some(dr_sync_resp_pending(false));
        }
        if rollback {
            return Some(dr_sync_resp_pending(true));
        }
        None
    }

    /// The draft-sync read half: gathers updates, analyzes when it is safe,
    /// and falls back to a sandboxed trial when concurrent voting could be
    /// interfered with.
    async fn dr_sync(
        &self,
        rack: &str,
        local_term: u64,
        an: &mut MimicRaftAnalyzer,
    ) -> Result<(bool, bool)> {
        if !an.analyzed() {
            panic!("illegal state of analyzer");
        }

        let (updated, votes) = self.updates_from_other_files(rack, None, Some(an)).await?;

        if !updated {
            // nothing for analysis
            an.try_set_term(local_term);
            return Ok((false, false));
        }

        if votes.is_empty() {
            // log replication undergoing
            an.analyze_and_remove_offers(AnalysisPolicy::MatchLastFragment);
            an.try_set_term(local_term);
            return Ok((true, false));
        }

        if an.analyzed() {
            // no append update from the rack, a leader does not appear yet
            an.try_set_term(local_term);
            for v in &votes {
                an.try_set_term(v.term);
            }
            return Ok((true, false));
        }

        // append updates arrived together with votes, be alert
        let offered_term = an.offered_term();
        let on_voting = votes.iter().any(|v| v.term > offered_term);

        if !on_voting {
            // the election has come out a result, safe to analyze
            an.analyze_and_remove_offers(AnalysisPolicy::MatchLastFragment);
            an.try_set_term(local_term);
            return Ok((true, false));
        }

        // the election is undergoing, check for a progress conflict on a
        // snapshot of the analyzer
        let mut sba = crate::draft::sandbox::AnalyzerSandbox::new(&mut *an);
        sba.sandbox_mut()
            .analyze_and_remove_offers(AnalysisPolicy::MatchLastFragment);
        let sbx_pg = sba.sandbox().progress();

        if sbx_pg.no_progress || has_matched_vote(&sbx_pg, &votes) {
            // no interference, commit the sandbox
            sba.commit();
            an.try_set_term(local_term);
            for v in &votes {
                an.try_set_term(v.term);
            }
            Ok((true, false))
        } else {
            // would interfere with the election, roll back
            drop(sba);
            self.rollback_analyzer(rack, an, &votes);
            Ok((false, true))
        }
    }

    async fn write_to_target_file(
        &self,
        m: &Message,
        rack: &str,
        file: &str,
        an: Option<&mut MimicRaftAnalyzer>,
    ) -> Result<()> {
        if let Err(err) = self.drp.write(rack, file, m).await {
            warn!(
                op = "write",
                rack,
                file,
                error = %err,
                "error occurred while performing draft primitives"
            );
            return Err(err);
        }

        if let Some(an) = an {
            an.offer_local_entries(
                m.term,
                self.f2p.get(file).copied().unwrap_or_default(),
                m.commit,
                m.log_term,
                &m.entries,
            );
        }

        Ok(())
    }

    async fn updates_from_other_files(
        &self,
        rack: &str,
        except_file: Option<&str>,
        mut an: Option<&mut MimicRaftAnalyzer>,
    ) -> Result<(bool, Vec<Message>)> {
        let files: Vec<String> = self
            .files
            .iter()
            .filter(|f| Some(f.as_str()) != except_file)
            .cloned()
            .collect();

        if files.is_empty() {
            return Ok((false, Vec::new()));
        }

        let (tx, mut rx) = mpsc::channel::<Update>(files.len());
        for file in &files {
            self.drp.spawn_get_update(rack, file, tx.clone())?;
        }
        drop(tx);

        let mut updated = false;
        let mut votes = Vec::new();
        let mut failure = None;

        for _ in 0..files.len() {
            let Some(update) = rx.recv().await else {
                break;
            };

            match update.payload {
                Err(err) => {
                    warn!(
                        op = "get-update",
                        rack,
                        file = %update.source_file,
                        error = %err,
                        "error occurred while performing draft primitives"
                    );
                    failure = Some(err);
                    break;
                }
                Ok(UpdatePayload::ZeroDelta) => {}
                Ok(UpdatePayload::Delta { app, vote }) => {
                    updated = true;
                    info!(
                        rack,
                        file = %update.source_file,
                        has_app = app.is_some(),
                        has_vote = vote.is_some(),
                        "received an update from another file"
                    );

                    if let (Some(an), Some(app)) = (an.as_deref_mut(), app) {
                        let submitter = self
                            .f2p
                            .get(&update.source_file)
                            .copied()
                            .unwrap_or_default();
                        an.offer_remote_entries(app.term, submitter, app.commit, app.fragments);
                    }

                    if let Some(vote) = vote {
                        // only pending voting is surfaced to the caller
                        votes.push(vote);
                    }
                }
            }
        }

        match failure {
            Some(err) => Err(err),
            None => Ok((updated, votes)),
        }
    }

    fn rollback_analyzer(&self, rack: &str, an: &mut MimicRaftAnalyzer, votes: &[Message]) {
        an.drop_offers();

        let mut preserved: HashMap<&str, Message> = HashMap::with_capacity(votes.len());
        for v in votes {
            if let Some(file) = self.p2f.get(&v.from) {
                preserved.insert(file.as_str(), v.clone());
            }
        }

        for file in &self.files {
            let _ = self
                .drp
                .preserve(rack, file, preserved.get(file.as_str()).cloned());
        }
    }
}

fn handle_append_entries(
    app: &Message,
    committed: u64,
    term: u64,
    locator: &dyn Locator,
) -> Message {
    // mimic the kernel's append handling

    if app.index < committed {
        return app_resp_accept(app.from, app.to, term, committed);
    }

    let last_new_index = app.index + app.entries.len() as u64;

    match locator.match_index(app.index, app.log_term) {
        Location::Underflow => panic!("underflow occurs when making a response"),
        Location::Prev | Location::Within => {
            app_resp_accept(app.from, app.to, term, last_new_index)
        }
        _ => app_resp_reject(app.from, app.to, term, app.index, last_new_index),
    }
}

fn handle_request_vote(vote: &Message, term: u64, locator: &dyn Locator) -> Message {
    let pre_vote = vote.msg_type == MessageType::PreVote;

    // a vote at the rack's own term is rejected outright, in case of a
    // parallel vote-accept
    if vote.term <= term {
        return vote_resp_reject(pre_vote, vote.from, vote.to, term);
    }

    if is_update_to(vote, locator) {
        vote_resp_accept(pre_vote, vote.from, vote.to, term)
    } else {
        vote_resp_reject(pre_vote, vote.from, vote.to, term)
    }
}

fn handle_heartbeat(hb: &Message, term: u64) -> Message {
    hb_resp_accept(hb.from, hb.to, term, hb.context.clone())
}

fn is_update_to(m: &Message, locator: &dyn Locator) -> bool {
    let (last_term, last_index) = if locator.is_empty() {
        (locator.prev_log_term(), locator.prev_log_index())
    } else {
        let last_index = locator.last_index();
        let (_, last_term) = locator.locate_index(last_index);
        (last_term, last_index)
    };

    m.log_term > last_term || (m.log_term == last_term && m.index >= last_index)
}

fn has_matched_vote(pg: &RackProgress, votes: &[Message]) -> bool {
    let Some(last) = pg.entries.last() else {
        return false;
    };

    votes
        .iter()
        .any(|v| v.log_term == last.term && v.index >= last.index)
}

fn vote_resp_accept(pre_vote: bool, sender: PeerId, responder: PeerId, term: u64) -> Message {
    let mut m = Message::new(if pre_vote {
        MessageType::PreVoteResp
    } else {
        MessageType::VoteResp
    });
    m.to = sender;
    m.from = responder;
    m.term = term;
    m
}

fn vote_resp_reject(pre_vote: bool, sender: PeerId, responder: PeerId, term: u64) -> Message {
    let mut m = vote_resp_accept(pre_vote, sender, responder, term);
    m.reject = true;
    m
}

fn app_resp_accept(sender: PeerId, responder: PeerId, term: u64, index: u64) -> Message {
    let mut m = Message::new(MessageType::AppResp);
    m.to = sender;
    m.from = responder;
    m.term = term;
    m.index = index;
    m
}

fn app_resp_reject(
    sender: PeerId,
    responder: PeerId,
    term: u64,
    index: u64,
    reject_hint: u64,
) -> Message {
    let mut m = app_resp_accept(sender, responder, term, index);
    m.reject = true;
    m.reject_hint = reject_hint;
    m
}

fn hb_resp_accept(sender: PeerId, responder: PeerId, term: u64, context: Vec<u8>) -> Message {
    let mut m = Message::new(MessageType::HeartbeatResp);
    m.to = sender;
    m.from = responder;
    m.term = term;
    m.context = context;
    m
}

fn dr_sync_resp_pending(for_rollback: bool) -> Message {
    let mut m = Message::new(MessageType::DrSyncResp);
    m.reject = for_rollback;
    m.context = DR_SYNC_PENDING.to_vec();
    m
}

fn dr_sync_resp_entries(pg: &RackProgress) -> Message {
    let mut m = Message::new(MessageType::DrSyncResp);
    m.term = pg.term;
    m.from = pg.term_holder;
    m.index = pg.log_index;
    m.log_term = pg.log_term;
    m.entries = pg.entries.clone();
    m.commit = pg.commit;
    m.context = DR_SYNC_ENTRIES.to_vec();
    m
}

fn dr_sync_resp_advance(term: u64, committed: u64) -> Message {
    let mut m = Message::new(MessageType::DrSyncResp);
    m.term = term;
    m.commit = committed;
    m.context = DR_SYNC_ADVANCE.to_vec();
    m
}
