//! Optional on-device persistence.
//!
//! The storage engine is an external collaborator behind [`Persistence`].
//! The client loads cached channels and messages at startup and writes
//! confirmed mutations through a [`StoreWriter`], which applies them in
//! order on a background task. A failed write is logged and otherwise
//! ignored; the in-memory state stays authoritative.

use async_trait::async_trait;
use chatsync_types::{ChannelDescriptor, ChannelSid, Message};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The storage engine failed.
    #[error("storage error: {0}")]
    Backend(String),

    /// Stored data could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Storage backend for cached chat state.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Load every cached channel.
    async fn load_channels(&self) -> Result<Vec<ChannelDescriptor>, StoreError>;

    /// Load cached messages of one channel.
    async fn load_messages(&self, channel: &ChannelSid) -> Result<Vec<Message>, StoreError>;

    /// Store or replace a channel.
    async fn put_channel(&self, channel: &ChannelDescriptor) -> Result<(), StoreError>;

    /// Delete a channel and its messages.
    async fn remove_channel(&self, channel: &ChannelSid) -> Result<(), StoreError>;

    /// Store or replace a message.
    async fn put_message(&self, channel: &ChannelSid, message: &Message) -> Result<(), StoreError>;

    /// Delete a message.
    async fn remove_message(&self, channel: &ChannelSid, index: u64) -> Result<(), StoreError>;
}

/// One queued write.
#[derive(Debug, Clone)]
pub enum StoreWrite {
    /// Store a channel.
    PutChannel(ChannelDescriptor),
    /// Delete a channel.
    RemoveChannel(ChannelSid),
    /// Store a message.
    PutMessage(ChannelSid, Message),
    /// Delete a message.
    RemoveMessage(ChannelSid, u64),
}

/// Applies writes to a [`Persistence`] in submission order.
#[derive(Debug, Default)]
pub struct StoreWriter {
    tx: Option<mpsc::UnboundedSender<StoreWrite>>,
    task: Option<JoinHandle<()>>,
}

impl StoreWriter {
    /// A writer that discards everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Start a background writer for `store`.
    pub fn spawn(store: Arc<dyn Persistence>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<StoreWrite>();
        let task = tokio::spawn(async move {
            while let Some(write) = rx.recv().await {
                let result = match &write {
                    StoreWrite::PutChannel(channel) => store.put_channel(channel).await,
                    StoreWrite::RemoveChannel(sid) => store.remove_channel(sid).await,
                    StoreWrite::PutMessage(sid, message) => store.put_message(sid, message).await,
                    StoreWrite::RemoveMessage(sid, index) => store.remove_message(sid, *index).await,
                };
                if let Err(e) = result {
                    tracing::warn!("Persistence write {:?} failed: {}", write, e);
                }
            }
        });
        Self {
            tx: Some(tx),
            task: Some(task),
        }
    }

    /// Queue a write.
    pub fn submit(&self, write: StoreWrite) {
        if let Some(tx) = &self.tx {
            if tx.send(write).is_err() {
                tracing::warn!("Persistence writer stopped; write dropped");
            }
        }
    }

    /// Stop accepting writes and wait for queued ones to finish.
    pub async fn flush_and_stop(&mut self) {
        self.tx = None;
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("Persistence writer ended abnormally: {}", e);
            }
        }
    }
}

/// In-memory [`Persistence`] for tests. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    channels: BTreeMap<ChannelSid, ChannelDescriptor>,
    messages: HashMap<ChannelSid, BTreeMap<u64, Message>>,
    fail_writes: bool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed a channel.
    pub fn with_channel(self, channel: ChannelDescriptor) -> Self {
        self.lock().channels.insert(channel.sid.clone(), channel);
        self
    }

    /// Seed messages for a channel.
    pub fn with_messages(self, channel: &ChannelSid, messages: Vec<Message>) -> Self {
        {
            let mut inner = self.lock();
            let stored = inner.messages.entry(channel.clone()).or_default();
            for message in messages {
                stored.insert(message.index, message);
            }
        }
        self
    }

    /// Stored channel sids, sorted.
    pub fn channel_sids(&self) -> Vec<ChannelSid> {
        self.lock().channels.keys().cloned().collect()
    }

    /// A stored channel.
    pub fn channel(&self, sid: &ChannelSid) -> Option<ChannelDescriptor> {
        self.lock().channels.get(sid).cloned()
    }

    /// Stored message indices of a channel, ascending.
    pub fn message_indices(&self, channel: &ChannelSid) -> Vec<u64> {
        self.lock()
            .messages
            .get(channel)
            .map(|m| m.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Make every write fail.
    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    fn write<F>(&self, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut MemoryStoreInner),
    {
        let mut inner = self.lock();
        if inner.fail_writes {
            return Err(StoreError::Backend("writes disabled".into()));
        }
        apply(&mut inner);
        Ok(())
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn load_channels(&self) -> Result<Vec<ChannelDescriptor>, StoreError> {
        Ok(self.lock().channels.values().cloned().collect())
    }

    async fn load_messages(&self, channel: &ChannelSid) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .lock()
            .messages
            .get(channel)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn put_channel(&self, channel: &ChannelDescriptor) -> Result<(), StoreError> {
        self.write(|inner| {
            inner.channels.insert(channel.sid.clone(), channel.clone());
        })
    }

    async fn remove_channel(&self, channel: &ChannelSid) -> Result<(), StoreError> {
        self.write(|inner| {
            inner.channels.remove(channel);
            inner.messages.remove(channel);
        })
    }

    async fn put_message(&self, channel: &ChannelSid, message: &Message) -> Result<(), StoreError> {
        self.write(|inner| {
            inner
                .messages
                .entry(channel.clone())
                .or_default()
                .insert(message.index, message.clone());
        })
    }

    async fn remove_message(&self, channel: &ChannelSid, index: u64) -> Result<(), StoreError> {
        self.write(|inner| {
            if let Some(messages) = inner.messages.get_mut(channel) {
                messages.remove(&index);
            }
        })
    }
}
