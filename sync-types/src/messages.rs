//! Protocol boundary types for chatsync.
//!
//! [`Request`] and [`Response`] are what the client hands to and receives
//! from the transport. [`RawEvent`] is an inbound realtime event as the
//! transport delivers it; [`InboundEvent::decode`] turns it into a typed event.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{
    Attributes, ChannelDescriptor, ChannelOptions, ChannelSid, ChatError, Identity,
    MemberDescriptor, Message, UserInfo, UserInfoUpdate,
};

/// Where a message range starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    /// The most recent messages.
    Last,
    /// Messages at or before this index.
    Before(u64),
    /// Messages at or after this index.
    After(u64),
}

/// A change to channel metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelUpdate {
    /// New friendly name.
    FriendlyName(String),
    /// New unique name.
    UniqueName(String),
    /// New attributes.
    Attributes(Attributes),
}

/// A change to a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageUpdate {
    /// New body.
    Body(String),
    /// New attributes.
    Attributes(Attributes),
}

/// A change to the current user's info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserInfoChange {
    /// New friendly name.
    FriendlyName(String),
    /// New attributes.
    Attributes(Attributes),
}

impl UserInfoChange {
    /// Which field this change touches.
    pub fn kind(&self) -> UserInfoUpdate {
        match self {
            UserInfoChange::FriendlyName(_) => UserInfoUpdate::FriendlyName,
            UserInfoChange::Attributes(_) => UserInfoUpdate::Attributes,
        }
    }
}

/// Membership operations on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MembershipAction {
    /// Join the channel.
    Join,
    /// Decline an invitation.
    Decline,
    /// Leave the channel.
    Leave,
}

/// Requests the client sends through the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// List every channel visible to the user.
    FetchChannels,
    /// Fetch one channel's metadata.
    FetchChannel {
        /// Target channel.
        channel: ChannelSid,
    },
    /// Create a channel.
    CreateChannel {
        /// Creation options.
        options: ChannelOptions,
    },
    /// Change channel metadata.
    UpdateChannel {
        /// Target channel.
        channel: ChannelSid,
        /// The change.
        update: ChannelUpdate,
    },
    /// Join, decline or leave.
    Membership {
        /// Target channel.
        channel: ChannelSid,
        /// The action.
        action: MembershipAction,
    },
    /// Destroy a channel.
    Destroy {
        /// Target channel.
        channel: ChannelSid,
    },
    /// Fetch the member roster.
    FetchMembers {
        /// Target channel.
        channel: ChannelSid,
    },
    /// Fetch a range of messages.
    FetchMessages {
        /// Target channel.
        channel: ChannelSid,
        /// Range start.
        anchor: Anchor,
        /// Maximum number of messages.
        count: u32,
    },
    /// Append a message.
    SendMessage {
        /// Target channel.
        channel: ChannelSid,
        /// Message body.
        body: String,
        /// Message attributes.
        attributes: Attributes,
    },
    /// Delete a message.
    RemoveMessage {
        /// Target channel.
        channel: ChannelSid,
        /// Message index.
        index: u64,
    },
    /// Edit a message.
    UpdateMessage {
        /// Target channel.
        channel: ChannelSid,
        /// Message index.
        index: u64,
        /// The change.
        update: MessageUpdate,
    },
    /// Record the user's consumption horizon.
    SetConsumption {
        /// Target channel.
        channel: ChannelSid,
        /// Last consumed index, or none.
        index: Option<u64>,
    },
    /// Signal that the user is typing.
    Typing {
        /// Target channel.
        channel: ChannelSid,
    },
    /// Change the current user's info.
    UpdateUserInfo {
        /// The change.
        change: UserInfoChange,
    },
}

impl Request {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::FetchChannels => "fetch_channels",
            Request::FetchChannel { .. } => "fetch_channel",
            Request::CreateChannel { .. } => "create_channel",
            Request::UpdateChannel { .. } => "update_channel",
            Request::Membership { .. } => "membership",
            Request::Destroy { .. } => "destroy",
            Request::FetchMembers { .. } => "fetch_members",
            Request::FetchMessages { .. } => "fetch_messages",
            Request::SendMessage { .. } => "send_message",
            Request::RemoveMessage { .. } => "remove_message",
            Request::UpdateMessage { .. } => "update_message",
            Request::SetConsumption { .. } => "set_consumption",
            Request::Typing { .. } => "typing",
            Request::UpdateUserInfo { .. } => "update_user_info",
        }
    }
}

/// Responses the transport returns for a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Response {
    /// The channel roster.
    Channels(Vec<ChannelDescriptor>),
    /// One channel's canonical metadata.
    Channel(ChannelDescriptor),
    /// A member roster.
    Members(Vec<MemberDescriptor>),
    /// A message range.
    Messages(Vec<Message>),
    /// One canonical message.
    Message(Message),
    /// Canonical user info.
    UserInfo(UserInfo),
    /// Success with no body.
    Ack,
    /// The backend refused the request.
    Rejected {
        /// Backend error code.
        code: i64,
        /// Backend error message.
        message: String,
    },
}

impl Response {
    /// Turn a `Rejected` response into an error.
    pub fn into_result(self) -> Result<Response, ChatError> {
        match self {
            Response::Rejected { code, message } => {
                Err(ChatError::BackendRejected { code, message })
            }
            other => Ok(other),
        }
    }

    /// Expect a channel roster.
    pub fn into_channels(self) -> Result<Vec<ChannelDescriptor>, ChatError> {
        match self.into_result()? {
            Response::Channels(channels) => Ok(channels),
            other => Err(unexpected("channels", &other)),
        }
    }

    /// Expect one channel.
    pub fn into_channel(self) -> Result<ChannelDescriptor, ChatError> {
        match self.into_result()? {
            Response::Channel(channel) => Ok(channel),
            other => Err(unexpected("channel", &other)),
        }
    }

    /// Expect a member roster.
    pub fn into_members(self) -> Result<Vec<MemberDescriptor>, ChatError> {
        match self.into_result()? {
            Response::Members(members) => Ok(members),
            other => Err(unexpected("members", &other)),
        }
    }

    /// Expect a message range.
    pub fn into_messages(self) -> Result<Vec<Message>, ChatError> {
        match self.into_result()? {
            Response::Messages(messages) => Ok(messages),
            other => Err(unexpected("messages", &other)),
        }
    }

    /// Expect one message.
    pub fn into_message(self) -> Result<Message, ChatError> {
        match self.into_result()? {
            Response::Message(message) => Ok(message),
            other => Err(unexpected("message", &other)),
        }
    }

    /// Expect user info.
    pub fn into_user_info(self) -> Result<UserInfo, ChatError> {
        match self.into_result()? {
            Response::UserInfo(user) => Ok(user),
            other => Err(unexpected("user info", &other)),
        }
    }

    /// Expect a bare acknowledgement.
    ///
    /// Any non-rejected response counts; some backends echo the changed entity.
    pub fn into_ack(self) -> Result<(), ChatError> {
        self.into_result().map(|_| ())
    }
}

fn unexpected(expected: &str, got: &Response) -> ChatError {
    ChatError::Generic(format!("expected {} response, got {:?}", expected, got))
}

/// An inbound realtime event as delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    /// Event type discriminator, e.g. `message_added`.
    pub event_type: String,
    /// Channel the event is scoped to, if any.
    #[serde(default)]
    pub channel_sid: Option<ChannelSid>,
    /// Event body.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl RawEvent {
    /// Create an event that is not scoped to a channel.
    pub fn new(event_type: &str, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            channel_sid: None,
            payload,
        }
    }

    /// Create an event scoped to a channel.
    pub fn for_channel(event_type: &str, channel: &ChannelSid, payload: serde_json::Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            channel_sid: Some(channel.clone()),
            payload,
        }
    }
}

/// A decoded inbound realtime event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// The user gained visibility of a channel.
    ChannelAdded(ChannelDescriptor),
    /// Channel metadata or the user's status in it changed.
    ChannelUpdated(ChannelDescriptor),
    /// A channel was deleted.
    ChannelDeleted {
        /// The channel.
        channel: ChannelSid,
    },
    /// A member joined.
    MemberJoined {
        /// The channel.
        channel: ChannelSid,
        /// The member.
        member: MemberDescriptor,
    },
    /// A member changed (e.g. consumption index).
    MemberUpdated {
        /// The channel.
        channel: ChannelSid,
        /// The member.
        member: MemberDescriptor,
    },
    /// A member left.
    MemberLeft {
        /// The channel.
        channel: ChannelSid,
        /// The member's identity.
        identity: Identity,
    },
    /// A message was appended.
    MessageAdded {
        /// The channel.
        channel: ChannelSid,
        /// The message.
        message: Message,
    },
    /// A message was edited.
    MessageUpdated {
        /// The channel.
        channel: ChannelSid,
        /// The message.
        message: Message,
    },
    /// A message was deleted.
    MessageRemoved {
        /// The channel.
        channel: ChannelSid,
        /// The message index.
        index: u64,
    },
    /// A user's info changed.
    UserInfoUpdated {
        /// The new user info.
        user: UserInfo,
        /// Which field changed.
        update: UserInfoUpdate,
    },
    /// A member started typing.
    TypingStarted {
        /// The channel.
        channel: ChannelSid,
        /// Who is typing.
        identity: Identity,
    },
    /// A member stopped typing.
    TypingEnded {
        /// The channel.
        channel: ChannelSid,
        /// Who stopped typing.
        identity: Identity,
    },
    /// The realtime session dropped.
    SessionLost {
        /// Reason reported by the transport.
        reason: String,
    },
    /// The realtime session came back.
    SessionRestored,
    /// The credentials were refused.
    SessionDenied,
    /// The session entered an error state.
    SessionError {
        /// Reason reported by the transport.
        reason: String,
    },
    /// The backend reported an error not tied to a request.
    Error {
        /// Backend error code.
        code: i64,
        /// Backend error message.
        message: String,
    },
}

#[derive(Deserialize)]
struct IdentityBody {
    identity: Identity,
}

#[derive(Deserialize)]
struct IndexBody {
    index: u64,
}

#[derive(Deserialize)]
struct ReasonBody {
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct UserInfoBody {
    user: UserInfo,
    update: UserInfoUpdate,
}

#[derive(Deserialize)]
struct ErrorBody {
    code: i64,
    message: String,
}

impl InboundEvent {
    /// Decode a raw transport event.
    ///
    /// Fails with [`ChatError::Generic`] for unknown event types, malformed
    /// payloads, or channel-scoped events that arrive without a channel sid.
    pub fn decode(raw: &RawEvent) -> Result<Self, ChatError> {
        let event = match raw.event_type.as_str() {
            "channel_added" => InboundEvent::ChannelAdded(payload(raw)?),
            "channel_updated" => InboundEvent::ChannelUpdated(payload(raw)?),
            "channel_deleted" => InboundEvent::ChannelDeleted {
                channel: channel_of(raw)?,
            },
            "member_joined" => InboundEvent::MemberJoined {
                channel: channel_of(raw)?,
                member: payload(raw)?,
            },
            "member_updated" => InboundEvent::MemberUpdated {
                channel: channel_of(raw)?,
                member: payload(raw)?,
            },
            "member_left" => InboundEvent::MemberLeft {
                channel: channel_of(raw)?,
                identity: payload::<IdentityBody>(raw)?.identity,
            },
            "message_added" => InboundEvent::MessageAdded {
                channel: channel_of(raw)?,
                message: payload(raw)?,
            },
            "message_updated" => InboundEvent::MessageUpdated {
                channel: channel_of(raw)?,
                message: payload(raw)?,
            },
            "message_removed" => InboundEvent::MessageRemoved {
                channel: channel_of(raw)?,
                index: payload::<IndexBody>(raw)?.index,
            },
            "user_info_updated" => {
                let body: UserInfoBody = payload(raw)?;
                InboundEvent::UserInfoUpdated {
                    user: body.user,
                    update: body.update,
                }
            }
            "typing_started" => InboundEvent::TypingStarted {
                channel: channel_of(raw)?,
                identity: payload::<IdentityBody>(raw)?.identity,
            },
            "typing_ended" => InboundEvent::TypingEnded {
                channel: channel_of(raw)?,
                identity: payload::<IdentityBody>(raw)?.identity,
            },
            "session_lost" => InboundEvent::SessionLost {
                reason: payload::<ReasonBody>(raw)?.reason,
            },
            "session_restored" => InboundEvent::SessionRestored,
            "session_denied" => InboundEvent::SessionDenied,
            "session_error" => InboundEvent::SessionError {
                reason: payload::<ReasonBody>(raw)?.reason,
            },
            "error" => {
                let body: ErrorBody = payload(raw)?;
                InboundEvent::Error {
                    code: body.code,
                    message: body.message,
                }
            }
            other => {
                return Err(ChatError::Generic(format!(
                    "unknown event type: {}",
                    other
                )))
            }
        };
        Ok(event)
    }

    /// The channel this event is scoped to, if any.
    pub fn channel(&self) -> Option<&ChannelSid> {
        match self {
            InboundEvent::ChannelAdded(desc) | InboundEvent::ChannelUpdated(desc) => Some(&desc.sid),
            InboundEvent::ChannelDeleted { channel }
            | InboundEvent::MemberJoined { channel, .. }
            | InboundEvent::MemberUpdated { channel, .. }
            | InboundEvent::MemberLeft { channel, .. }
            | InboundEvent::MessageAdded { channel, .. }
            | InboundEvent::MessageUpdated { channel, .. }
            | InboundEvent::MessageRemoved { channel, .. }
            | InboundEvent::TypingStarted { channel, .. }
            | InboundEvent::TypingEnded { channel, .. } => Some(channel),
            _ => None,
        }
    }
}

fn payload<T: DeserializeOwned>(raw: &RawEvent) -> Result<T, ChatError> {
    // Session events may arrive with no body at all.
    let value = if raw.payload.is_null() {
        serde_json::Value::Object(Default::default())
    } else {
        raw.payload.clone()
    };
    serde_json::from_value(value).map_err(|e| {
        ChatError::Generic(format!("malformed {} payload: {}", raw.event_type, e))
    })
}

fn channel_of(raw: &RawEvent) -> Result<ChannelSid, ChatError> {
    raw.channel_sid.clone().ok_or_else(|| {
        ChatError::Generic(format!("{} event without channel sid", raw.event_type))
    })
}
