//! Synchronization and connection state machines for chatsync.
//!
//! Everything here is pure: a status is advanced by calling a method, and the
//! connection machine takes an event and returns the new state plus the
//! actions the client must carry out.

/// How far a channel's local state reflects the backend.
///
/// Ordered `None < Identifier < Metadata < All`. `Failed` sits outside the
/// ordering and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ChannelSyncStatus {
    /// Nothing known beyond existence.
    #[default]
    None,
    /// The sid is known.
    Identifier,
    /// Metadata is known; members may be queried.
    Metadata,
    /// Members and the initial message window are loaded.
    All,
    /// Synchronization failed.
    Failed,
}

impl ChannelSyncStatus {
    fn rank(self) -> Option<u8> {
        match self {
            Self::None => Some(0),
            Self::Identifier => Some(1),
            Self::Metadata => Some(2),
            Self::All => Some(3),
            Self::Failed => None,
        }
    }

    /// Move toward `target`.
    ///
    /// Returns the new status if it differs from the current one. Backward
    /// moves and any move out of `Failed` are ignored.
    pub fn advance(self, target: Self) -> Option<Self> {
        match (self.rank(), target.rank()) {
            (None, _) => None,
            (Some(_), None) => Some(Self::Failed),
            (Some(current), Some(next)) if next > current => Some(target),
            _ => None,
        }
    }

    /// True if this status is at or past `other` (never true when failed).
    pub fn at_least(self, other: Self) -> bool {
        match (self.rank(), other.rank()) {
            (Some(current), Some(wanted)) => current >= wanted,
            _ => false,
        }
    }

    /// True for the terminal failure state.
    pub fn is_failed(self) -> bool {
        self == Self::Failed
    }
}

/// How far client-wide synchronization has progressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ClientSyncStatus {
    /// Synchronization started.
    #[default]
    Started,
    /// The channel directory is loaded.
    ChannelsListCompleted,
    /// Everything the strategy asks for is loaded.
    Completed,
    /// Synchronization failed.
    Failed,
}

impl ClientSyncStatus {
    fn rank(self) -> Option<u8> {
        match self {
            Self::Started => Some(0),
            Self::ChannelsListCompleted => Some(1),
            Self::Completed => Some(2),
            Self::Failed => None,
        }
    }

    /// Move toward `target`, forward only. `Failed` is terminal.
    pub fn advance(self, target: Self) -> Option<Self> {
        match (self.rank(), target.rank()) {
            (None, _) => None,
            (Some(_), None) => Some(Self::Failed),
            (Some(current), Some(next)) if next > current => Some(target),
            _ => None,
        }
    }

    /// True once the channel directory can be handed out.
    pub fn channels_available(self) -> bool {
        matches!(self, Self::ChannelsListCompleted | Self::Completed)
    }
}

/// Connection to the messaging backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    /// Nothing attempted yet.
    #[default]
    Unknown,
    /// Connecting.
    Connecting,
    /// Connected.
    Connected,
    /// Disconnected; may come back.
    Disconnected,
    /// Credentials refused.
    Denied,
    /// Connection failed.
    Error,
}

impl ConnectionState {
    /// Process an event and return the new state plus actions to execute.
    pub fn on_event(self, event: ConnectionEvent) -> (Self, Vec<ConnectionAction>) {
        use ConnectionEvent as E;

        let next = match (self, event) {
            (Self::Unknown | Self::Disconnected | Self::Error, E::ConnectRequested) => {
                Self::Connecting
            }
            (Self::Connecting, E::SessionEstablished) => Self::Connected,
            (Self::Connected, E::SessionLost) => {
                return (
                    Self::Disconnected,
                    vec![
                        ConnectionAction::SealCoverage,
                        ConnectionAction::Notify(Self::Disconnected),
                    ],
                );
            }
            (Self::Disconnected | Self::Connecting, E::SessionRestored) => Self::Connected,
            (Self::Denied, E::Denied) | (Self::Disconnected, E::ShutdownRequested) => {
                return (self, vec![]);
            }
            (_, E::Denied) => Self::Denied,
            (Self::Denied, E::Failed) => return (self, vec![]),
            (_, E::Failed) => Self::Error,
            (_, E::ShutdownRequested) => Self::Disconnected,
            (state, _) => return (state, vec![]),
        };

        if next == self {
            return (self, vec![]);
        }
        let mut actions = Vec::new();
        if self == Self::Connected {
            actions.push(ConnectionAction::SealCoverage);
        }
        actions.push(ConnectionAction::Notify(next));
        (next, actions)
    }

    /// Check if currently connected.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

/// Events that drive [`ConnectionState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The client started connecting.
    ConnectRequested,
    /// The transport established a session.
    SessionEstablished,
    /// The transport reported the session dropped.
    SessionLost,
    /// The transport reported the session came back.
    SessionRestored,
    /// The credentials were refused.
    Denied,
    /// The connection failed.
    Failed,
    /// The client is shutting down.
    ShutdownRequested,
}

/// Actions the client carries out after a connection transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Tell observers about the new state.
    Notify(ConnectionState),
    /// Close open-ended cache coverage; realtime events may have been missed.
    SealCoverage,
}
