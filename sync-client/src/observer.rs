//! Change notifications.
//!
//! Applications implement [`ChatObserver`], overriding only the callbacks
//! they care about, and register it with [`crate::ChatClient::subscribe`] or
//! [`crate::Channel::subscribe`]. The registry holds observers weakly: an
//! observer that is dropped simply stops receiving callbacks, and dropping
//! the returned [`Subscription`] deregisters it.
//!
//! Callbacks run on the client's engine task in the order state changed.
//! They must not block.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chatsync_core::{
    ChannelSnapshot, ChannelSyncStatus, ClientSyncStatus, ConnectionState, MemberView,
};
use chatsync_types::{ChannelSid, ChatError, Message, UserInfo, UserInfoUpdate};

/// Everything the client reports to observers.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// The connection state changed.
    ConnectionStateChanged(ConnectionState),
    /// Client-wide synchronization progressed.
    SynchronizationStatusChanged(ClientSyncStatus),
    /// A channel became visible.
    ChannelAdded(ChannelSnapshot),
    /// A channel's metadata or membership status changed.
    ChannelChanged(ChannelSnapshot),
    /// A channel was deleted or destroyed.
    ChannelDeleted(ChannelSnapshot),
    /// A channel's synchronization status changed.
    ChannelSynchronizationStatusChanged {
        /// The channel.
        channel: ChannelSid,
        /// New status.
        status: ChannelSyncStatus,
    },
    /// A member joined a channel.
    MemberJoined {
        /// The channel.
        channel: ChannelSid,
        /// The member.
        member: MemberView,
    },
    /// A member changed.
    MemberChanged {
        /// The channel.
        channel: ChannelSid,
        /// The member.
        member: MemberView,
    },
    /// A member left a channel.
    MemberLeft {
        /// The channel.
        channel: ChannelSid,
        /// The member as last known.
        member: MemberView,
    },
    /// The user info behind a member changed.
    MemberUserInfoUpdated {
        /// The channel.
        channel: ChannelSid,
        /// The member with updated info.
        member: MemberView,
        /// Which field changed.
        update: UserInfoUpdate,
    },
    /// A message was added to a synchronized channel.
    MessageAdded {
        /// The channel.
        channel: ChannelSid,
        /// The message.
        message: Message,
    },
    /// A cached message changed.
    MessageChanged {
        /// The channel.
        channel: ChannelSid,
        /// The message.
        message: Message,
    },
    /// A cached message was deleted.
    MessageDeleted {
        /// The channel.
        channel: ChannelSid,
        /// The message as last known.
        message: Message,
    },
    /// The current user's info changed.
    UserInfoUpdated {
        /// New user info.
        user: UserInfo,
        /// Which field changed.
        update: UserInfoUpdate,
    },
    /// A member started typing.
    TypingStarted {
        /// The channel.
        channel: ChannelSid,
        /// Who is typing.
        member: MemberView,
    },
    /// A member stopped typing.
    TypingEnded {
        /// The channel.
        channel: ChannelSid,
        /// Who stopped typing.
        member: MemberView,
    },
    /// Push registration succeeded.
    ToastSubscribed,
    /// A push notification was handled.
    ToastReceived {
        /// The channel it refers to.
        channel: ChannelSid,
        /// The message index, if the payload carried one.
        message_index: Option<u64>,
        /// The message, if the channel is synchronized and the message could be loaded.
        message: Option<Message>,
    },
    /// Push registration failed.
    ToastRegistrationFailed(ChatError),
    /// A background operation failed.
    Error(ChatError),
}

impl ChatEvent {
    /// The channel this event concerns, if any.
    pub fn channel(&self) -> Option<&ChannelSid> {
        match self {
            ChatEvent::ChannelAdded(snapshot)
            | ChatEvent::ChannelChanged(snapshot)
            | ChatEvent::ChannelDeleted(snapshot) => Some(snapshot.sid()),
            ChatEvent::ChannelSynchronizationStatusChanged { channel, .. }
            | ChatEvent::MemberJoined { channel, .. }
            | ChatEvent::MemberChanged { channel, .. }
            | ChatEvent::MemberLeft { channel, .. }
            | ChatEvent::MemberUserInfoUpdated { channel, .. }
            | ChatEvent::MessageAdded { channel, .. }
            | ChatEvent::MessageChanged { channel, .. }
            | ChatEvent::MessageDeleted { channel, .. }
            | ChatEvent::TypingStarted { channel, .. }
            | ChatEvent::TypingEnded { channel, .. }
            | ChatEvent::ToastReceived { channel, .. } => Some(channel),
            _ => None,
        }
    }
}

/// Receives change notifications. Every method defaults to doing nothing.
#[allow(unused_variables)]
pub trait ChatObserver: Send + Sync {
    /// The connection state changed.
    fn on_connection_state(&self, state: ConnectionState) {}

    /// Client-wide synchronization progressed.
    fn on_synchronization_status(&self, status: ClientSyncStatus) {}

    /// A channel became visible.
    fn on_channel_added(&self, channel: &ChannelSnapshot) {}

    /// A channel changed.
    fn on_channel_changed(&self, channel: &ChannelSnapshot) {}

    /// A channel was deleted.
    fn on_channel_deleted(&self, channel: &ChannelSnapshot) {}

    /// A channel's synchronization status changed.
    fn on_channel_synchronization_status(&self, channel: &ChannelSid, status: ChannelSyncStatus) {}

    /// A member joined.
    fn on_member_joined(&self, channel: &ChannelSid, member: &MemberView) {}

    /// A member changed.
    fn on_member_changed(&self, channel: &ChannelSid, member: &MemberView) {}

    /// A member left.
    fn on_member_left(&self, channel: &ChannelSid, member: &MemberView) {}

    /// A member's user info changed.
    fn on_member_user_info_updated(
        &self,
        channel: &ChannelSid,
        member: &MemberView,
        update: UserInfoUpdate,
    ) {
    }

    /// A message was added.
    fn on_message_added(&self, channel: &ChannelSid, message: &Message) {}

    /// A message changed.
    fn on_message_changed(&self, channel: &ChannelSid, message: &Message) {}

    /// A message was deleted.
    fn on_message_deleted(&self, channel: &ChannelSid, message: &Message) {}

    /// The current user's info changed.
    fn on_user_info_updated(&self, user: &UserInfo, update: UserInfoUpdate) {}

    /// A member started typing.
    fn on_typing_started(&self, channel: &ChannelSid, member: &MemberView) {}

    /// A member stopped typing.
    fn on_typing_ended(&self, channel: &ChannelSid, member: &MemberView) {}

    /// Push registration succeeded.
    fn on_toast_subscribed(&self) {}

    /// A push notification was handled.
    fn on_toast_received(&self, channel: &ChannelSid, message_index: Option<u64>, message: Option<&Message>) {}

    /// Push registration failed.
    fn on_toast_registration_failed(&self, error: &ChatError) {}

    /// A background operation failed.
    fn on_error(&self, error: &ChatError) {}

    /// Route an event to its callback.
    ///
    /// Override this instead of the individual methods to see every event.
    fn on_event(&self, event: &ChatEvent) {
        match event {
            ChatEvent::ConnectionStateChanged(state) => self.on_connection_state(*state),
            ChatEvent::SynchronizationStatusChanged(status) => self.on_synchronization_status(*status),
            ChatEvent::ChannelAdded(channel) => self.on_channel_added(channel),
            ChatEvent::ChannelChanged(channel) => self.on_channel_changed(channel),
            ChatEvent::ChannelDeleted(channel) => self.on_channel_deleted(channel),
            ChatEvent::ChannelSynchronizationStatusChanged { channel, status } => {
                self.on_channel_synchronization_status(channel, *status)
            }
            ChatEvent::MemberJoined { channel, member } => self.on_member_joined(channel, member),
            ChatEvent::MemberChanged { channel, member } => self.on_member_changed(channel, member),
            ChatEvent::MemberLeft { channel, member } => self.on_member_left(channel, member),
            ChatEvent::MemberUserInfoUpdated {
                channel,
                member,
                update,
            } => self.on_member_user_info_updated(channel, member, *update),
            ChatEvent::MessageAdded { channel, message } => self.on_message_added(channel, message),
            ChatEvent::MessageChanged { channel, message } => {
                self.on_message_changed(channel, message)
            }
            ChatEvent::MessageDeleted { channel, message } => {
                self.on_message_deleted(channel, message)
            }
            ChatEvent::UserInfoUpdated { user, update } => self.on_user_info_updated(user, *update),
            ChatEvent::TypingStarted { channel, member } => self.on_typing_started(channel, member),
            ChatEvent::TypingEnded { channel, member } => self.on_typing_ended(channel, member),
            ChatEvent::ToastSubscribed => self.on_toast_subscribed(),
            ChatEvent::ToastReceived {
                channel,
                message_index,
                message,
            } => self.on_toast_received(channel, *message_index, message.as_ref()),
            ChatEvent::ToastRegistrationFailed(error) => self.on_toast_registration_failed(error),
            ChatEvent::Error(error) => self.on_error(error),
        }
    }
}

struct Entry {
    id: u64,
    scope: Option<ChannelSid>,
    observer: Weak<dyn ChatObserver>,
}

/// Registry of observers and the emitter that calls them.
pub(crate) struct Fanout {
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Fanout {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        })
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register an observer, optionally limited to one channel's events.
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        observer: &Arc<dyn ChatObserver>,
        scope: Option<ChannelSid>,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries().push(Entry {
            id,
            scope,
            observer: Arc::downgrade(observer),
        });
        Subscription {
            id,
            fanout: Arc::downgrade(self),
        }
    }

    fn unsubscribe(&self, id: u64) {
        self.entries().retain(|entry| entry.id != id);
    }

    fn is_registered(&self, id: u64) -> bool {
        self.entries().iter().any(|entry| entry.id == id)
    }

    /// Deliver one event to every matching live observer.
    pub(crate) fn emit(&self, event: &ChatEvent) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        // Snapshot so observers may subscribe or unsubscribe from a callback.
        let targets: Vec<(u64, Weak<dyn ChatObserver>)> = {
            let mut entries = self.entries();
            entries.retain(|entry| entry.observer.strong_count() > 0);
            entries
                .iter()
                .filter(|entry| match &entry.scope {
                    None => true,
                    Some(sid) => event.channel() == Some(sid),
                })
                .map(|entry| (entry.id, entry.observer.clone()))
                .collect()
        };

        for (id, observer) in targets {
            if self.closed.load(Ordering::Acquire) || !self.is_registered(id) {
                continue;
            }
            if let Some(observer) = observer.upgrade() {
                observer.on_event(event);
            }
        }
    }

    /// Deliver events in order.
    pub(crate) fn emit_all(&self, events: Vec<ChatEvent>) {
        for event in &events {
            self.emit(event);
        }
    }

    /// Stop all delivery. Nothing is emitted after this returns.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.entries().clear();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries().len()
    }
}

/// Keeps an observer registered. Dropping it deregisters the observer.
#[must_use = "dropping the subscription deregisters the observer"]
pub struct Subscription {
    id: u64,
    fanout: Weak<Fanout>,
}

impl Subscription {
    /// Deregister now.
    pub fn cancel(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.unsubscribe(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
