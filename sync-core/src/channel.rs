//! Per-channel state: metadata, sync status, members and message window.

use chatsync_types::{
    Attributes, ChannelDescriptor, ChannelSid, ChannelStatus, ChannelType, ChatError, Identity,
};

use crate::members::MemberRegistry;
use crate::state::ChannelSyncStatus;
use crate::window::MessageWindow;

/// Everything the client knows about one channel.
#[derive(Debug, Clone)]
pub struct ChannelState {
    descriptor: ChannelDescriptor,
    sync: ChannelSyncStatus,
    /// Set while a synchronize pass is running.
    syncing: bool,
    /// Channel roster.
    pub members: MemberRegistry,
    /// Cached message history.
    pub window: MessageWindow,
}

/// A point-in-time copy of a channel's metadata and sync status.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSnapshot {
    /// Backend metadata.
    pub descriptor: ChannelDescriptor,
    /// Synchronization status when the snapshot was taken.
    pub sync: ChannelSyncStatus,
}

impl ChannelSnapshot {
    /// Channel identifier.
    pub fn sid(&self) -> &ChannelSid {
        &self.descriptor.sid
    }
}

impl ChannelState {
    /// A channel known only by sid, such as one the user was just added to.
    pub fn from_sid(sid: ChannelSid) -> Self {
        Self {
            descriptor: ChannelDescriptor::new(sid),
            sync: ChannelSyncStatus::Identifier,
            syncing: false,
            members: MemberRegistry::new(),
            window: MessageWindow::new(),
        }
    }

    /// A channel with backend metadata.
    pub fn from_descriptor(descriptor: ChannelDescriptor) -> Self {
        Self {
            descriptor,
            sync: ChannelSyncStatus::Metadata,
            syncing: false,
            members: MemberRegistry::new(),
            window: MessageWindow::new(),
        }
    }

    /// Channel identifier.
    pub fn sid(&self) -> &ChannelSid {
        &self.descriptor.sid
    }

    /// Backend metadata.
    pub fn descriptor(&self) -> &ChannelDescriptor {
        &self.descriptor
    }

    /// Human-readable name.
    pub fn friendly_name(&self) -> Option<&str> {
        self.descriptor.friendly_name.as_deref()
    }

    /// Unique name.
    pub fn unique_name(&self) -> Option<&str> {
        self.descriptor.unique_name.as_deref()
    }

    /// Developer-defined attributes.
    pub fn attributes(&self) -> &Attributes {
        &self.descriptor.attributes
    }

    /// Visibility.
    pub fn channel_type(&self) -> ChannelType {
        self.descriptor.channel_type
    }

    /// The current user's participation.
    pub fn status(&self) -> ChannelStatus {
        self.descriptor.status
    }

    /// Synchronization status.
    pub fn sync_status(&self) -> ChannelSyncStatus {
        self.sync
    }

    /// Advance the sync status. Returns the new status if it changed.
    pub fn advance_sync(&mut self, target: ChannelSyncStatus) -> Option<ChannelSyncStatus> {
        let next = self.sync.advance(target)?;
        self.sync = next;
        Some(next)
    }

    /// True while a synchronize pass is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing
    }

    /// Mark a synchronize pass as started or finished.
    pub fn set_syncing(&mut self, syncing: bool) {
        self.syncing = syncing;
    }

    /// Replace metadata with the backend's canonical copy.
    ///
    /// Returns true if anything observable changed. Also lifts the sync
    /// status to at least `Metadata`.
    pub fn apply_descriptor(&mut self, descriptor: ChannelDescriptor) -> bool {
        let changed = self.descriptor != descriptor;
        self.descriptor = descriptor;
        self.advance_sync(ChannelSyncStatus::Metadata);
        changed
    }

    /// Set the user's membership status locally.
    pub fn set_status(&mut self, status: ChannelStatus) -> bool {
        if self.descriptor.status == status {
            return false;
        }
        self.descriptor.status = status;
        true
    }

    /// Fail unless metadata is loaded.
    pub fn require_metadata(&self) -> Result<(), ChatError> {
        self.require(ChannelSyncStatus::Metadata)
    }

    /// Fail unless members and messages are loaded.
    pub fn require_synced(&self) -> Result<(), ChatError> {
        self.require(ChannelSyncStatus::All)
    }

    /// Fail unless the channel has reached `wanted` (a failed channel never has).
    pub fn require(&self, wanted: ChannelSyncStatus) -> Result<(), ChatError> {
        if self.sync.at_least(wanted) {
            Ok(())
        } else {
            Err(ChatError::InvalidState(format!(
                "channel {} is {:?}, needs {:?}",
                self.descriptor.sid, self.sync, wanted
            )))
        }
    }

    /// Take the consumption horizon from `local`'s roster entry.
    pub fn seed_consumption(&mut self, local: &Identity) {
        let Some(member) = self.members.get(local) else {
            return;
        };
        match member.last_consumed {
            Some(index) => self.window.set_last_consumed(index),
            None => self.window.set_none_consumed(),
        }
    }

    /// Copy the window's horizon into `local`'s roster entry.
    ///
    /// Returns true if the entry changed.
    pub fn mirror_consumption(&mut self, local: &Identity) -> bool {
        let horizon = self.window.last_consumed();
        self.members.set_last_consumed(local, horizon)
    }

    /// Copy out metadata and sync status.
    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            descriptor: self.descriptor.clone(),
            sync: self.sync,
        }
    }
}
