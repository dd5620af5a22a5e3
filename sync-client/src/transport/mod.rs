//! Transport abstraction for chatsync.
//!
//! The realtime session layer is an external collaborator. The client only
//! needs four things from it:
//! - `connect()` presents credentials and opens a session
//! - `send()` issues one backend request and waits for its response
//! - `next_event()` yields the next inbound realtime event
//! - `close()` tears the session down
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! transport.respond_with(|request| match request {
//!     Request::FetchChannels => Response::Channels(vec![]),
//!     _ => Response::Ack,
//! });
//! let session = transport.connect(&credentials).await?;
//! let channels = transport.send(Request::FetchChannels).await?.into_channels()?;
//! ```

mod mock;

pub use mock::MockTransport;

use async_trait::async_trait;
use chatsync_types::{ChatError, RawEvent, Request, Response, UserInfo};
use thiserror::Error;

use crate::config::Credentials;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// The backend refused the credentials.
    #[error("credentials denied: {0}")]
    Denied(String),

    /// Not connected.
    #[error("not connected")]
    NotConnected,

    /// Connection closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),
}

impl From<TransportError> for ChatError {
    fn from(err: TransportError) -> Self {
        ChatError::Transport(err.to_string())
    }
}

/// What the backend reports when a session opens.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    /// The signed-in user's info.
    pub user: UserInfo,
    /// Whether online/notifiable flags are reported for users.
    pub reachability_enabled: bool,
}

/// Transport trait for talking to the messaging backend.
///
/// Implementations handle the underlying session mechanism (websocket,
/// long-poll, mock, etc). `send` may be called concurrently from several
/// tasks while one task is parked in `next_event`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a session with the given credentials.
    async fn connect(&self, credentials: &Credentials) -> Result<Session, TransportError>;

    /// Issue a request and wait for the backend's response.
    async fn send(&self, request: Request) -> Result<Response, TransportError>;

    /// Wait for the next inbound realtime event.
    ///
    /// Returns `ConnectionClosed` once no more events will arrive.
    async fn next_event(&self) -> Result<RawEvent, TransportError>;

    /// Check if currently connected.
    fn is_connected(&self) -> bool;

    /// Close the session.
    async fn close(&self) -> Result<(), TransportError>;
}
