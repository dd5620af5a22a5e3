//! # chatsync-types
//!
//! Model and protocol types for the chatsync messaging client.
//!
//! This crate provides the foundational types used across all chatsync crates:
//! - [`ChannelSid`], [`MessageSid`], [`Identity`], [`LocalId`] - Identity types
//! - [`ChannelDescriptor`], [`Message`], [`UserInfo`] - Backend model
//! - [`Request`], [`Response`], [`RawEvent`], [`InboundEvent`] - Protocol boundary
//! - [`ChatError`] - Error taxonomy

#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod ids;
mod messages;
mod model;

pub use error::{ChatError, GENERIC_ERROR_CODE};
pub use ids::{ChannelSid, Identity, LocalId, MessageSid};
pub use messages::{
    Anchor, ChannelUpdate, InboundEvent, MembershipAction, MessageUpdate, RawEvent, Request,
    Response, UserInfoChange,
};
pub use model::{
    Attributes, ChannelDescriptor, ChannelOptions, ChannelStatus, ChannelType, MemberDescriptor,
    Message, PendingMessage, ToastRef, UserInfo, UserInfoUpdate,
};
