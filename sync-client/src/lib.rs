//! # chatsync-client
//!
//! Client-side synchronization engine for the chatsync messaging SDK.
//!
//! Applications use this crate to keep a local, observable copy of their
//! channels, members and message history in step with the backend.
//!
//! ## Features
//!
//! - **Single-owner engine**: one task applies every mutation in order
//! - **Windowed message cache**: serves history from cache when the range
//!   is covered, fetches and merges otherwise
//! - **Shared user info**: one store behind every channel's roster
//! - **Weak observers**: subscriptions deregister on drop, nothing fires
//!   after shutdown
//! - **Transport Abstraction**: Pluggable transport, push and persistence
//!   collaborators (mocks included)
//! - **Pure State Machines**: Uses chatsync-core for side-effect-free logic
//!
//! ## Example
//!
//! ```ignore
//! use chatsync_client::{ChatClient, Credentials, MockTransport};
//!
//! let client = ChatClient::builder(Credentials::new("alice", "token"), MockTransport::new())
//!     .initialize()?;
//!
//! let channels = client.channels_list().await?;
//! let channel = channels.channel_with_unique_name("general").await.unwrap();
//! channel.synchronize().await?;
//!
//! let messages = channel.messages();
//! messages.send(messages.create_message("hello")).await?;
//! let recent = messages.get_last(20).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod client;
pub mod config;
mod engine;
pub mod observer;
pub mod push;
pub mod store;
pub mod transport;

pub use channel::{Channel, Messages};
pub use client::{ChannelsList, ChatClient, ChatClientBuilder};
pub use config::{ClientProperties, ConfigError, Credentials, SynchronizationStrategy};
pub use observer::{ChatEvent, ChatObserver, Subscription};
pub use push::{decode_toast, MockPush, PushError, PushRegistrar};
pub use store::{MemoryStore, Persistence, StoreError};
pub use transport::{MockTransport, Session, Transport, TransportError};

pub use chatsync_core::{
    ChannelSnapshot, ChannelSyncStatus, ClientSyncStatus, ConnectionState, MemberView,
};
pub use chatsync_types::{
    Attributes, ChannelDescriptor, ChannelOptions, ChannelSid, ChannelStatus, ChannelType,
    ChatError, Identity, MemberDescriptor, Message, PendingMessage, RawEvent, Request, Response,
    ToastRef, UserInfo, UserInfoUpdate,
};

/// SDK version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
