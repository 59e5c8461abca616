//! Message files.
//!
//! A message file ("IMF": in-memory file) is a growable sequence of message
//! records. Writers append one record at a time; readers page in everything
//! past a cursor. [`MemoryImf`] is the canonical in-memory implementation;
//! durable implementations live with the embedder and typically frame
//! records through [`crate::codec`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Result, SaucrError};
use crate::types::Message;

#[async_trait]
pub trait ImfReader: Send + Sync {
    /// Reads every record at or past `from_index`.
    async fn read_imf(&self, from_index: usize) -> Result<Vec<Message>>;
}

#[async_trait]
pub trait ImfWriter: Send + Sync {
    async fn write_imf(&self, message: &Message) -> Result<()>;
}

/// Shared in-memory message file.
#[derive(Clone, Default)]
pub struct MemoryImf {
    records: Arc<RwLock<Vec<Message>>>,
}

impl MemoryImf {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle whose writes are denied.
    pub fn read_only(&self) -> ReadOnlyImf {
        ReadOnlyImf {
            inner: self.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl ImfReader for MemoryImf {
    async fn read_imf(&self, from_index: usize) -> Result<Vec<Message>> {
        let records = self.records.read();
        if from_index >= records.len() {
            return Ok(Vec::new());
        }
        Ok(records[from_index..].to_vec())
    }
}

#[async_trait]
impl ImfWriter for MemoryImf {
    async fn write_imf(&self, message: &Message) -> Result<()> {
        self.records.write().push(message.clone());
        Ok(())
    }
}

/// Read-only view over a [`MemoryImf`].
#[derive(Clone)]
pub struct ReadOnlyImf {
    inner: MemoryImf,
}

#[async_trait]
impl ImfReader for ReadOnlyImf {
    async fn read_imf(&self, from_index: usize) -> Result<Vec<Message>> {
        self.inner.read_imf(from_index).await
    }
}

#[async_trait]
impl ImfWriter for ReadOnlyImf {
    async fn write_imf(&self, _message: &Message) -> Result<()> {
        Err(SaucrError::ImfDenied("read-only message file".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageType;

    #[tokio::test]
    async fn reads_page_in_from_the_cursor() {
        let imf = MemoryImf::new();

        for term in 1..=3 {
            let mut m = Message::new(MessageType::Heartbeat);
            m.term = term;
            imf.write_imf(&m).await.unwrap();
        }

        let all = imf.read_imf(0).await.unwrap();
        assert_eq!(all.len(), 3);

        let tail = imf.read_imf(2).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].term, 3);

        assert!(imf.read_imf(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_only_handles_deny_writes() {
        let imf = MemoryImf::new();
        let ro = imf.read_only();

        let m = Message::new(MessageType::Vote);
        assert!(matches!(
            ro.write_imf(&m).await,
            Err(SaucrError::ImfDenied(_))
        ));

        imf.write_imf(&m).await.unwrap();
        assert_eq!(ro.read_imf(0).await.unwrap().len(), 1);
    }
}
