//! # chatsync-core
//!
//! Pure synchronization state for chatsync (no I/O, instant tests).
//!
//! This crate holds the local replica of channels, members, messages and
//! users, and the state machines that say how far each part is synchronized.
//! Nothing here performs network or disk I/O.
//!
//! ## Design Philosophy
//!
//! All modules in this crate are **pure** - they take input and produce output
//! without side effects. This enables:
//! - Instant unit tests (no mocks, no async)
//! - Deterministic behavior (same input → same output)
//! - Easy reasoning about state transitions
//!
//! The actual I/O is performed by `chatsync-client`, which owns one instance
//! of this state on its engine task and applies backend results to it.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod directory;
pub mod members;
pub mod state;
pub mod users;
pub mod window;

pub use channel::{ChannelSnapshot, ChannelState};
pub use directory::ChannelDirectory;
pub use members::{Member, MemberChange, MemberRegistry, MemberView};
pub use state::{
    ChannelSyncStatus, ClientSyncStatus, ConnectionAction, ConnectionEvent, ConnectionState,
};
pub use users::UserInfoStore;
pub use window::{Coverage, MessageWindow, OPEN_END};
