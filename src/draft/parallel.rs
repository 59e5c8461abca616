//! Parallel interpretation.
//!
//! One worker task per destination peer; a dispatcher routes messages by
//! their `to` field. Responses funnel into one channel the embedder drains.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::draft::interpreter::OneToOneInterpreter;
use crate::error::{Result, SaucrError};
use crate::types::{Message, PeerId};

struct ParallelState {
    running: bool,
    out: Option<mpsc::Sender<Message>>,
    inputs: HashMap<PeerId, mpsc::Sender<Message>>,
}

pub struct ParallelInterpreter {
    itp: Arc<OneToOneInterpreter>,
    reach: Vec<PeerId>,
    buf_size: usize,

    inner: Mutex<ParallelState>,
}

impl ParallelInterpreter {
    pub(crate) fn new(itp: Arc<OneToOneInterpreter>, reach: Vec<PeerId>, buf_size: usize) -> Self {
        ParallelInterpreter {
            itp,
            reach,
            buf_size,
            inner: Mutex::new(ParallelState {
                running: false,
                out: None,
                inputs: HashMap::new(),
            }),
        }
    }

    pub fn start(&self) -> Result<()> {
        let mut state = self.inner.lock();

        if state.running {
            return Err(SaucrError::DuplicateStart);
        }

        let Some(out) = state.out.clone() else {
            return Err(SaucrError::ResponseChannelUnset);
        };

        state.inputs = HashMap::with_capacity(self.reach.len());
        for &id in &self.reach {
            let (tx, rx) = mpsc::channel(self.buf_size.max(1));
            state.inputs.insert(id, tx);
            tokio::spawn(Self::run(self.itp.clone(), id, rx, out.clone()));
        }

        state.running = true;
        Ok(())
    }

    /// Idempotent: stopping a stopped interpreter is a no-op.
    pub fn stop(&self) -> Result<()> {
        let mut state = self.inner.lock();

        if state.running {
            // dropping the input senders lets every worker drain and exit
            state.inputs.clear();
            state.running = false;
        }

        Ok(())
    }

    pub fn set_response_channel(&self, out: mpsc::Sender<Message>) -> Result<()> {
        let mut state = self.inner.lock();

        if state.running {
            return Err(SaucrError::Unchangeable("response channel"));
        }

        state.out = Some(out);
        Ok(())
    }

    /// Routes each message to its destination's worker.
    pub async fn interpret_parallel(&self, messages: Vec<Message>) -> Result<()> {
        let inputs = {
            let state = self.inner.lock();
            state.inputs.clone()
        };

        for message in messages {
            match inputs.get(&message.to) {
                Some(tx) => {
                    if tx.send(message).await.is_err() {
                        warn!("draft transporter worker is gone, message dropped");
                    }
                }
                None => {
                    warn!(to = message.to, "unknown destination, message dropped");
                }
            }
        }

        Ok(())
    }

    async fn run(
        itp: Arc<OneToOneInterpreter>,
        service_id: PeerId,
        mut rx: mpsc::Receiver<Message>,
        out: mpsc::Sender<Message>,
    ) {
        while let Some(message) = rx.recv().await {
            if itp.is_supported(&message) {
                if let Some(resp) = itp.interpret(&message).await {
                    if out.send(resp).await.is_err() {
                        break;
                    }
                }
            } else {
                warn!(
                    service_id,
                    message_type = ?message.msg_type,
                    "draft transporter received an unsupported message, dropped"
                );
            }
        }

        info!(service_id, "draft transporter service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::draft::interpreter::OneToOneInterpreterBuilder;
    use crate::types::MessageType;

    fn three_peer_parallel() -> ParallelInterpreter {
        use crate::draft::imf::MemoryImf;

        let fa = MemoryImf::new();
        let fb = MemoryImf::new();
        let fc = MemoryImf::new();

        let mut builder = OneToOneInterpreterBuilder::new(1)
            .map(1, "rack-a", "file-a")
            .map(2, "rack-b", "file-b")
            .map(3, "rack-c", "file-c");

        for (file, imf) in [("file-a", &fa), ("file-b", &fb), ("file-c", &fc)] {
            for rack in ["rack-a", "rack-b", "rack-c"] {
                builder = builder.bind(
                    rack,
                    file,
                    Some(Arc::new(imf.clone())),
                    Some(Arc::new(imf.clone())),
                );
            }
        }

        builder.build_parallel(8).unwrap()
    }

    #[tokio::test]
    async fn start_requires_a_response_channel_and_rejects_restarts() {
        let pi = three_peer_parallel();

        assert!(matches!(pi.start(), Err(SaucrError::ResponseChannelUnset)));

        let (tx, _rx) = mpsc::channel(8);
        pi.set_response_channel(tx).unwrap();
        pi.start().unwrap();

        assert!(matches!(pi.start(), Err(SaucrError::DuplicateStart)));

        let (tx2, _rx2) = mpsc::channel(8);
        assert!(matches!(
            pi.set_response_channel(tx2),
            Err(SaucrError::Unchangeable(_))
        ));

        pi.stop().unwrap();
        pi.stop().unwrap();
    }

    #[tokio::test]
    async fn routed_messages_produce_responses() {
        let pi = three_peer_parallel();

        let (tx, mut rx) = mpsc::channel(8);
        pi.set_response_channel(tx).unwrap();
        pi.start().unwrap();

        let mut hb = Message::new(MessageType::Heartbeat);
        hb.from = 1;
        hb.to = 2;
        hb.term = 1;
        pi.interpret_parallel(vec![hb]).await.unwrap();

        let resp = rx.recv().await.unwrap();
        assert_eq!(resp.msg_type, MessageType::HeartbeatResp);
        assert_eq!(resp.to, 1);
        assert_eq!(resp.from, 2);

        pi.stop().unwrap();
    }
}
