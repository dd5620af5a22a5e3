//! Backend model types for chatsync.
//!
//! These mirror what the backend reports about channels, members, messages
//! and users. The client keeps its own richer state on top of them.

use serde::{Deserialize, Serialize};

use crate::{ChannelSid, Identity, LocalId, MessageSid};

/// Developer-defined attributes (string, number, array, object or null).
pub type Attributes = serde_json::Value;

/// Visibility of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    /// Publicly visible.
    #[default]
    Public,
    /// Only visible to invited members.
    Private,
}

/// The current user's participation in a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    /// Invited but not joined.
    Invited,
    /// Joined.
    Joined,
    /// Not participating.
    #[default]
    NotParticipating,
}

/// Which part of a [`UserInfo`] changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserInfoUpdate {
    /// The friendly name changed.
    FriendlyName,
    /// The attributes changed.
    Attributes,
    /// The online flag changed.
    ReachabilityOnline,
    /// The notifiable flag changed.
    ReachabilityNotifiable,
}

/// Information about a user, shared by every channel the user appears in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    /// The user's identity.
    pub identity: Identity,
    /// Human-readable name, if set.
    #[serde(default)]
    pub friendly_name: Option<String>,
    /// Developer-defined attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// Whether the user is online.
    #[serde(default)]
    pub online: bool,
    /// Whether the user can receive push notifications.
    #[serde(default)]
    pub notifiable: bool,
}

impl UserInfo {
    /// Create a bare user with no name, attributes or reachability.
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            friendly_name: None,
            attributes: Attributes::Null,
            online: false,
            notifiable: false,
        }
    }

    /// Set the friendly name.
    pub fn with_friendly_name(mut self, name: &str) -> Self {
        self.friendly_name = Some(name.to_string());
        self
    }
}

/// Channel metadata as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Channel identifier.
    pub sid: ChannelSid,
    /// Human-readable name.
    #[serde(default)]
    pub friendly_name: Option<String>,
    /// Name unique among the user's visible channels.
    #[serde(default)]
    pub unique_name: Option<String>,
    /// Developer-defined attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// Visibility.
    #[serde(default)]
    pub channel_type: ChannelType,
    /// The current user's participation.
    #[serde(default)]
    pub status: ChannelStatus,
    /// Unix timestamp of creation.
    #[serde(default)]
    pub created_at: u64,
    /// Unix timestamp of the last update.
    #[serde(default)]
    pub updated_at: u64,
}

impl ChannelDescriptor {
    /// Create a descriptor with only a sid and defaults for everything else.
    pub fn new(sid: ChannelSid) -> Self {
        Self {
            sid,
            friendly_name: None,
            unique_name: None,
            attributes: Attributes::Null,
            channel_type: ChannelType::default(),
            status: ChannelStatus::default(),
            created_at: 0,
            updated_at: 0,
        }
    }
}

/// A channel member as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberDescriptor {
    /// The member's user information.
    pub user: UserInfo,
    /// Index of the last message this member consumed.
    #[serde(default)]
    pub last_consumed_message_index: Option<u64>,
}

/// A backend-confirmed message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message identifier.
    pub sid: MessageSid,
    /// Position in the channel's message stream.
    pub index: u64,
    /// Identity of the author.
    pub author: Identity,
    /// Message body.
    pub body: String,
    /// Developer-defined attributes.
    #[serde(default)]
    pub attributes: Attributes,
    /// Unix timestamp of creation.
    #[serde(default)]
    pub created_at: u64,
    /// Unix timestamp of the last update.
    #[serde(default)]
    pub updated_at: u64,
    /// Who last updated the message.
    #[serde(default)]
    pub last_updated_by: Option<Identity>,
}

/// A message created locally and not yet accepted by the backend.
///
/// It has no sid and no index, and it never enters a message window.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    /// Client-generated identifier.
    pub local_id: LocalId,
    /// Message body.
    pub body: String,
    /// Developer-defined attributes.
    pub attributes: Attributes,
}

impl PendingMessage {
    /// Create a placeholder with the given body.
    pub fn new(body: &str) -> Self {
        Self {
            local_id: LocalId::new(),
            body: body.to_string(),
            attributes: Attributes::Null,
        }
    }

    /// Set attributes to send along with the body.
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Options for creating a channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Human-readable name.
    pub friendly_name: Option<String>,
    /// Unique name.
    pub unique_name: Option<String>,
    /// Visibility.
    pub channel_type: ChannelType,
    /// Developer-defined attributes.
    pub attributes: Option<Attributes>,
}

impl ChannelOptions {
    /// Create empty options (public channel, no names).
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the friendly name.
    pub fn with_friendly_name(mut self, name: &str) -> Self {
        self.friendly_name = Some(name.to_string());
        self
    }

    /// Set the unique name.
    pub fn with_unique_name(mut self, name: &str) -> Self {
        self.unique_name = Some(name.to_string());
        self
    }

    /// Set the visibility.
    pub fn with_type(mut self, channel_type: ChannelType) -> Self {
        self.channel_type = channel_type;
        self
    }

    /// Set the attributes.
    pub fn with_attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = Some(attributes);
        self
    }
}

/// A channel and message reference decoded from a push payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToastRef {
    /// The channel the push refers to.
    #[serde(rename = "channel_sid")]
    pub channel: ChannelSid,
    /// The message index, when the payload carries one.
    #[serde(default)]
    pub message_index: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_fills_defaults() {
        let desc: ChannelDescriptor = serde_json::from_value(json!({ "sid": "CH1" })).unwrap();
        assert_eq!(desc, ChannelDescriptor::new(ChannelSid::new("CH1")));
    }

    #[test]
    fn enums_use_snake_case() {
        let status = serde_json::to_value(ChannelStatus::NotParticipating).unwrap();
        assert_eq!(status, json!("not_participating"));

        let update: UserInfoUpdate = serde_json::from_value(json!("reachability_online")).unwrap();
        assert_eq!(update, UserInfoUpdate::ReachabilityOnline);
    }

    #[test]
    fn pending_messages_get_distinct_local_ids() {
        let a = PendingMessage::new("hi");
        let b = PendingMessage::new("hi");
        assert_ne!(a.local_id, b.local_id);
        assert_eq!(a.attributes, Attributes::Null);
    }

    #[test]
    fn toast_ref_reads_channel_sid_key() {
        let toast: ToastRef =
            serde_json::from_value(json!({ "channel_sid": "CH9", "message_index": 4 })).unwrap();
        assert_eq!(toast.channel, ChannelSid::new("CH9"));
        assert_eq!(toast.message_index, Some(4));
    }
}
