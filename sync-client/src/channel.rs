//! Channel and message handles.
//!
//! A [`Channel`] or [`Messages`] handle carries only a sid. Reads copy out
//! of the engine-owned state; writes go through the engine queue. Once a
//! channel is destroyed or deleted every access fails with
//! [`ChatError::NotFound`]. Member reads need metadata and window reads need
//! a synchronized channel; a failed channel or client answers them with
//! [`ChatError::InvalidState`].

use std::sync::Arc;

use chatsync_core::{ChannelSnapshot, ChannelState, ChannelSyncStatus, MemberView};
use chatsync_types::{
    Anchor, Attributes, ChannelSid, ChannelStatus, ChannelUpdate, ChatError, Identity,
    MembershipAction, Message, MessageUpdate, PendingMessage,
};

use crate::client::ClientInner;
use crate::engine::{gone, ClientState, ConsumptionChange, Operation};
use crate::observer::{ChatObserver, Subscription};

/// Handle to one channel.
#[derive(Clone)]
pub struct Channel {
    sid: ChannelSid,
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel").field("sid", &self.sid).finish()
    }
}

/// Read a channel that has not been removed.
async fn read<T>(
    inner: &ClientInner,
    sid: &ChannelSid,
    f: impl FnOnce(&ClientState, &ChannelState) -> T,
) -> Result<T, ChatError> {
    let state = inner.state.lock().await;
    let channel = state.directory.get(sid).ok_or_else(|| gone(sid))?;
    Ok(f(&*state, channel))
}

/// Read a channel that has reached `need` on a client that has not failed.
async fn read_at<T>(
    inner: &ClientInner,
    sid: &ChannelSid,
    need: ChannelSyncStatus,
    f: impl FnOnce(&ClientState, &ChannelState) -> T,
) -> Result<T, ChatError> {
    let state = inner.state.lock().await;
    let channel = state.channel(sid, need)?;
    Ok(f(&*state, channel))
}

impl Channel {
    pub(crate) fn new(sid: ChannelSid, inner: Arc<ClientInner>) -> Self {
        Self { sid, inner }
    }

    /// Channel identifier.
    pub fn sid(&self) -> &ChannelSid {
        &self.sid
    }

    /// Metadata and sync status.
    pub async fn snapshot(&self) -> Result<ChannelSnapshot, ChatError> {
        read(&self.inner, &self.sid, |_, channel| channel.snapshot()).await
    }

    /// Human-readable name.
    pub async fn friendly_name(&self) -> Result<Option<String>, ChatError> {
        read(&self.inner, &self.sid, |_, channel| {
            channel.friendly_name().map(str::to_string)
        })
        .await
    }

    /// Unique name.
    pub async fn unique_name(&self) -> Result<Option<String>, ChatError> {
        read(&self.inner, &self.sid, |_, channel| {
            channel.unique_name().map(str::to_string)
        })
        .await
    }

    /// Developer-defined attributes.
    pub async fn attributes(&self) -> Result<Attributes, ChatError> {
        read(&self.inner, &self.sid, |_, channel| channel.attributes().clone()).await
    }

    /// The signed-in user's participation.
    pub async fn status(&self) -> Result<ChannelStatus, ChatError> {
        read(&self.inner, &self.sid, |_, channel| channel.status()).await
    }

    /// Synchronization status.
    pub async fn synchronization_status(&self) -> Result<ChannelSyncStatus, ChatError> {
        read(&self.inner, &self.sid, |_, channel| channel.sync_status()).await
    }

    /// Load members and the initial message window.
    ///
    /// Returns at once if the channel is already synchronized or a
    /// synchronize pass is running.
    pub async fn synchronize(&self) -> Result<(), ChatError> {
        let channel = self.sid.clone();
        self.inner
            .submit(|reply| Operation::Synchronize { channel, reply })
            .await
    }

    /// Rename the channel.
    pub async fn set_friendly_name(&self, name: &str) -> Result<(), ChatError> {
        self.update(ChannelUpdate::FriendlyName(name.to_string())).await
    }

    /// Change the unique name.
    pub async fn set_unique_name(&self, name: &str) -> Result<(), ChatError> {
        self.update(ChannelUpdate::UniqueName(name.to_string())).await
    }

    /// Replace the attributes.
    pub async fn set_attributes(&self, attributes: Attributes) -> Result<(), ChatError> {
        self.update(ChannelUpdate::Attributes(attributes)).await
    }

    async fn update(&self, update: ChannelUpdate) -> Result<(), ChatError> {
        let channel = self.sid.clone();
        self.inner
            .submit(|reply| Operation::UpdateChannel {
                channel,
                update,
                reply,
            })
            .await
    }

    /// Join the channel.
    pub async fn join(&self) -> Result<(), ChatError> {
        self.membership(MembershipAction::Join).await
    }

    /// Decline a pending invitation.
    pub async fn decline_invitation(&self) -> Result<(), ChatError> {
        self.membership(MembershipAction::Decline).await
    }

    /// Leave the channel.
    pub async fn leave(&self) -> Result<(), ChatError> {
        self.membership(MembershipAction::Leave).await
    }

    async fn membership(&self, action: MembershipAction) -> Result<(), ChatError> {
        let channel = self.sid.clone();
        self.inner
            .submit(|reply| Operation::Membership {
                channel,
                action,
                reply,
            })
            .await
    }

    /// Delete the channel on the backend and drop it locally.
    pub async fn destroy(&self) -> Result<(), ChatError> {
        let channel = self.sid.clone();
        self.inner
            .submit(|reply| Operation::Destroy { channel, reply })
            .await
    }

    /// Tell other members the user is typing.
    pub async fn typing(&self) -> Result<(), ChatError> {
        let channel = self.sid.clone();
        self.inner
            .submit(|reply| Operation::Typing { channel, reply })
            .await
    }

    /// Every member, sorted by identity. Empty until the roster has loaded.
    pub async fn members(&self) -> Result<Vec<MemberView>, ChatError> {
        read_at(&self.inner, &self.sid, ChannelSyncStatus::Metadata, |state, channel| {
            channel.members.views(&state.users)
        })
        .await
    }

    /// One member, if known and the roster has loaded.
    pub async fn member_with_identity(
        &self,
        identity: &Identity,
    ) -> Result<Option<MemberView>, ChatError> {
        read_at(&self.inner, &self.sid, ChannelSyncStatus::Metadata, |state, channel| {
            channel.members.view(identity, &state.users)
        })
        .await
    }

    /// The channel's messages.
    pub fn messages(&self) -> Messages {
        Messages {
            sid: self.sid.clone(),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Register an observer for this channel's events only.
    pub fn subscribe(&self, observer: &Arc<dyn ChatObserver>) -> Subscription {
        self.inner.subscribe(observer, Some(self.sid.clone()))
    }
}

/// Handle to a channel's message window.
#[derive(Clone)]
pub struct Messages {
    sid: ChannelSid,
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Messages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Messages").field("sid", &self.sid).finish()
    }
}

impl Messages {
    /// An unsent message. Nothing is cached until [`send`](Self::send)
    /// succeeds.
    pub fn create_message(&self, body: &str) -> PendingMessage {
        PendingMessage::new(body)
    }

    /// Send a message. Returns the backend-confirmed copy.
    pub async fn send(&self, message: PendingMessage) -> Result<Message, ChatError> {
        let channel = self.sid.clone();
        self.inner
            .submit(|reply| Operation::SendMessage {
                channel,
                message,
                reply,
            })
            .await
    }

    /// Delete a cached message on the backend.
    pub async fn remove(&self, message: &Message) -> Result<(), ChatError> {
        let channel = self.sid.clone();
        let index = message.index;
        self.inner
            .submit(|reply| Operation::RemoveMessage {
                channel,
                index,
                reply,
            })
            .await
    }

    /// Replace a cached message's body.
    pub async fn update_body(&self, index: u64, body: &str) -> Result<Message, ChatError> {
        self.update(index, MessageUpdate::Body(body.to_string())).await
    }

    /// Replace a cached message's attributes.
    pub async fn set_message_attributes(
        &self,
        index: u64,
        attributes: Attributes,
    ) -> Result<Message, ChatError> {
        self.update(index, MessageUpdate::Attributes(attributes)).await
    }

    async fn update(&self, index: u64, update: MessageUpdate) -> Result<Message, ChatError> {
        let channel = self.sid.clone();
        self.inner
            .submit(|reply| Operation::UpdateMessage {
                channel,
                index,
                update,
                reply,
            })
            .await
    }

    /// The newest `count` messages, ascending.
    pub async fn get_last(&self, count: usize) -> Result<Vec<Message>, ChatError> {
        self.fetch(Anchor::Last, count).await
    }

    /// Up to `count` messages ending at `index`, ascending.
    pub async fn get_before(&self, index: u64, count: usize) -> Result<Vec<Message>, ChatError> {
        self.fetch(Anchor::Before(index), count).await
    }

    /// Up to `count` messages starting at `index`, ascending.
    pub async fn get_after(&self, index: u64, count: usize) -> Result<Vec<Message>, ChatError> {
        self.fetch(Anchor::After(index), count).await
    }

    async fn fetch(&self, anchor: Anchor, count: usize) -> Result<Vec<Message>, ChatError> {
        let channel = self.sid.clone();
        self.inner
            .submit(|reply| Operation::FetchMessages {
                channel,
                anchor,
                count,
                reply,
            })
            .await
    }

    /// The cached message at `index`.
    pub async fn message_with_index(&self, index: u64) -> Result<Option<Message>, ChatError> {
        read_at(&self.inner, &self.sid, ChannelSyncStatus::All, |_, channel| {
            channel.window.message_with_index(index).cloned()
        })
        .await
    }

    /// The cached message at `index`, or the first cached one after it.
    pub async fn message_for_consumption_index(
        &self,
        index: u64,
    ) -> Result<Option<Message>, ChatError> {
        read_at(&self.inner, &self.sid, ChannelSyncStatus::All, |_, channel| {
            channel.window.message_for_consumption_index(index).cloned()
        })
        .await
    }

    /// The consumption horizon.
    pub async fn last_consumed_message_index(&self) -> Result<Option<u64>, ChatError> {
        read_at(&self.inner, &self.sid, ChannelSyncStatus::All, |_, channel| {
            channel.window.last_consumed()
        })
        .await
    }

    /// Overwrite the consumption horizon.
    pub async fn set_last_consumed_message_index(&self, index: u64) -> Result<Option<u64>, ChatError> {
        self.consume(ConsumptionChange::Set(index)).await
    }

    /// Move the consumption horizon forward; a lower index is ignored.
    pub async fn advance_last_consumed_message_index(
        &self,
        index: u64,
    ) -> Result<Option<u64>, ChatError> {
        self.consume(ConsumptionChange::Advance(index)).await
    }

    /// Mark everything consumed.
    ///
    /// Uses the highest cached index, so messages the client has not loaded
    /// are not covered.
    pub async fn set_all_messages_consumed(&self) -> Result<Option<u64>, ChatError> {
        self.consume(ConsumptionChange::All).await
    }

    /// Clear the consumption horizon.
    pub async fn set_no_messages_consumed(&self) -> Result<Option<u64>, ChatError> {
        self.consume(ConsumptionChange::None).await
    }

    async fn consume(&self, change: ConsumptionChange) -> Result<Option<u64>, ChatError> {
        let channel = self.sid.clone();
        self.inner
            .submit(|reply| Operation::Consumption {
                channel,
                change,
                reply,
            })
            .await
    }
}
