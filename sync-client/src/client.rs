//! ChatClient - the main interface for chatsync.
//!
//! # Architecture
//!
//! [`ChatClient`] is a cheap handle. Writes are submitted to the engine task
//! and answered through a oneshot reply; reads lock the shared state and
//! copy out a snapshot.
//!
//! ```text
//! Application → ChatClient / Channel / Messages ──ops──► Engine → Transport
//!                       ↑                                  │
//!                       └──── snapshots ◄── ClientState ◄──┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use chatsync_client::{ChatClient, ClientProperties, Credentials, MockTransport};
//!
//! let client = ChatClient::builder(Credentials::new("alice", "token"), MockTransport::new())
//!     .properties(ClientProperties::default())
//!     .observer(my_observer)
//!     .initialize()?;
//!
//! let channels = client.channels_list().await?;
//! for channel in channels.channels().await {
//!     println!("{:?}", channel.friendly_name());
//! }
//! client.shutdown().await;
//! ```

use std::sync::Arc;

use chatsync_core::{ChannelSnapshot, ClientSyncStatus, ConnectionState};
use chatsync_types::{Attributes, ChannelOptions, ChannelSid, ChatError, UserInfo, UserInfoChange};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::channel::Channel;
use crate::config::{ClientProperties, ConfigError, Credentials};
use crate::engine::{ClientState, Command, Engine, EngineConfig, Operation, Reply};
use crate::observer::{ChatObserver, Fanout, Subscription};
use crate::push::PushRegistrar;
use crate::store::Persistence;
use crate::transport::Transport;

impl From<ConfigError> for ChatError {
    fn from(err: ConfigError) -> Self {
        ChatError::Generic(err.to_string())
    }
}

fn shut_down() -> ChatError {
    ChatError::InvalidState("client is shut down".into())
}

/// Shared by every handle of one client.
pub(crate) struct ClientInner {
    pub(crate) state: Arc<Mutex<ClientState>>,
    commands: mpsc::UnboundedSender<Command>,
    fanout: Arc<Fanout>,
    properties: ClientProperties,
    _observer: Option<(Arc<dyn ChatObserver>, Subscription)>,
}

impl ClientInner {
    /// Submit an operation to the engine and wait for its reply.
    pub(crate) async fn submit<T>(
        &self,
        operation: impl FnOnce(Reply<T>) -> Operation,
    ) -> Result<T, ChatError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Op(operation(reply)))
            .map_err(|_| shut_down())?;
        rx.await.map_err(|_| shut_down())?
    }

    pub(crate) fn subscribe(
        &self,
        observer: &Arc<dyn ChatObserver>,
        scope: Option<ChannelSid>,
    ) -> Subscription {
        self.fanout.subscribe(observer, scope)
    }
}

/// Builder for [`ChatClient`].
pub struct ChatClientBuilder {
    credentials: Credentials,
    transport: Arc<dyn Transport>,
    properties: ClientProperties,
    push: Option<Arc<dyn PushRegistrar>>,
    store: Option<Arc<dyn Persistence>>,
    observer: Option<Arc<dyn ChatObserver>>,
}

impl ChatClientBuilder {
    /// Set client properties.
    pub fn properties(mut self, properties: ClientProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Set the push collaborator.
    pub fn push(mut self, push: impl PushRegistrar + 'static) -> Self {
        self.push = Some(Arc::new(push));
        self
    }

    /// Enable on-device persistence.
    pub fn persistence(mut self, store: impl Persistence + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Set the client-level observer. The client keeps it alive.
    pub fn observer(mut self, observer: Arc<dyn ChatObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Validate the properties and start synchronizing.
    ///
    /// Must be called from within a tokio runtime.
    pub fn initialize(self) -> Result<ChatClient, ChatError> {
        self.properties.validate()?;

        let state = Arc::new(Mutex::new(ClientState::default()));
        let fanout = Fanout::new();
        // Subscribe before the engine starts so the first notifications land.
        let observer = self.observer.map(|observer| {
            let subscription = fanout.subscribe(&observer, None);
            (observer, subscription)
        });

        tracing::info!(
            "Initializing chat client for {} ({:?} strategy, region {})",
            self.credentials.identity,
            self.properties.synchronization_strategy,
            self.properties.region
        );

        let commands = Engine::start(EngineConfig {
            state: Arc::clone(&state),
            fanout: Arc::clone(&fanout),
            transport: self.transport,
            push: self.push,
            store: self.store,
            properties: self.properties.clone(),
            credentials: self.credentials,
        });

        Ok(ChatClient {
            inner: Arc::new(ClientInner {
                state,
                commands,
                fanout,
                properties: self.properties,
                _observer: observer,
            }),
        })
    }
}

/// The chat client.
///
/// Cloning is cheap; clones share one engine. The engine stops when
/// [`shutdown`](Self::shutdown) is called or the last handle is dropped.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for ChatClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatClient")
            .field("properties", &self.inner.properties)
            .finish()
    }
}

impl ChatClient {
    /// Start building a client.
    pub fn builder(credentials: Credentials, transport: impl Transport + 'static) -> ChatClientBuilder {
        ChatClientBuilder {
            credentials,
            transport: Arc::new(transport),
            properties: ClientProperties::default(),
            push: None,
            store: None,
            observer: None,
        }
    }

    /// Properties the client was started with.
    pub fn properties(&self) -> &ClientProperties {
        &self.inner.properties
    }

    /// Current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        self.inner.state.lock().await.connection
    }

    /// Current client synchronization status.
    pub async fn synchronization_status(&self) -> ClientSyncStatus {
        self.inner.state.lock().await.sync
    }

    /// The signed-in user's info, once connected.
    pub async fn user_info(&self) -> Option<UserInfo> {
        let state = self.inner.state.lock().await;
        let identity = state.local_user.as_ref()?;
        state.users.get(identity)
    }

    /// Whether the backend reports online/notifiable flags.
    pub async fn is_reachability_enabled(&self) -> bool {
        self.inner.state.lock().await.users.reachability_enabled()
    }

    /// The channel directory.
    ///
    /// Fails with [`ChatError::InvalidState`] until the channel list has
    /// loaded.
    pub async fn channels_list(&self) -> Result<ChannelsList, ChatError> {
        let state = self.inner.state.lock().await;
        state.check_client()?;
        if !state.sync.channels_available() {
            return Err(ChatError::InvalidState(format!(
                "channel list not loaded (client is {:?})",
                state.sync
            )));
        }
        Ok(ChannelsList {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Change the signed-in user's friendly name.
    pub async fn set_user_friendly_name(&self, name: &str) -> Result<(), ChatError> {
        let change = UserInfoChange::FriendlyName(name.to_string());
        self.inner
            .submit(|reply| Operation::UpdateUserInfo { change, reply })
            .await
    }

    /// Replace the signed-in user's attributes.
    pub async fn set_user_attributes(&self, attributes: Attributes) -> Result<(), ChatError> {
        let change = UserInfoChange::Attributes(attributes);
        self.inner
            .submit(|reply| Operation::UpdateUserInfo { change, reply })
            .await
    }

    /// Register a device token with the push collaborator.
    pub async fn register_push_token(&self, token: &[u8]) -> Result<(), ChatError> {
        let token = token.to_vec();
        self.inner
            .submit(|reply| Operation::RegisterPush {
                token,
                register: true,
                reply,
            })
            .await
    }

    /// Deregister a device token.
    pub async fn deregister_push_token(&self, token: &[u8]) -> Result<(), ChatError> {
        let token = token.to_vec();
        self.inner
            .submit(|reply| Operation::RegisterPush {
                token,
                register: false,
                reply,
            })
            .await
    }

    /// Turn a push payload into a toast notification.
    pub async fn handle_notification(&self, payload: serde_json::Value) -> Result<(), ChatError> {
        self.inner
            .submit(|reply| Operation::HandleNotification { payload, reply })
            .await
    }

    /// Register an additional observer for every event.
    ///
    /// The client holds the observer weakly; keep the `Arc` alive for as
    /// long as events should be delivered.
    pub fn subscribe(&self, observer: &Arc<dyn ChatObserver>) -> Subscription {
        self.inner.subscribe(observer, None)
    }

    /// Stop the client.
    ///
    /// In-flight operations fail, the connection moves to `Disconnected`
    /// and no observer is called after this returns. Calling it again is a
    /// no-op.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.inner.commands.send(Command::Shutdown(ack)).is_err() {
            return;
        }
        // A dropped ack means another shutdown already finished.
        let _ = done.await;
    }
}

/// The channel directory, available once the channel list has loaded.
#[derive(Clone)]
pub struct ChannelsList {
    inner: Arc<ClientInner>,
}

impl ChannelsList {
    /// Snapshots of every known channel, sorted by sid.
    pub async fn channels(&self) -> Vec<ChannelSnapshot> {
        let state = self.inner.state.lock().await;
        state
            .directory
            .sids()
            .iter()
            .filter_map(|sid| state.directory.get(sid))
            .map(|channel| channel.snapshot())
            .collect()
    }

    /// Handle for a known channel.
    pub async fn channel_with_sid(&self, sid: &ChannelSid) -> Option<Channel> {
        let state = self.inner.state.lock().await;
        state
            .directory
            .contains(sid)
            .then(|| Channel::new(sid.clone(), Arc::clone(&self.inner)))
    }

    /// Handle for the channel with this unique name.
    pub async fn channel_with_unique_name(&self, name: &str) -> Option<Channel> {
        let state = self.inner.state.lock().await;
        state
            .directory
            .by_unique_name(name)
            .map(|channel| Channel::new(channel.sid().clone(), Arc::clone(&self.inner)))
    }

    /// Create a channel on the backend.
    ///
    /// The channel is in the directory, and `on_channel_added` has fired,
    /// by the time this returns.
    pub async fn create_channel(&self, options: ChannelOptions) -> Result<Channel, ChatError> {
        let sid = self
            .inner
            .submit(|reply| Operation::CreateChannel { options, reply })
            .await?;
        Ok(Channel::new(sid, Arc::clone(&self.inner)))
    }
}

impl std::fmt::Debug for ChannelsList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelsList").finish_non_exhaustive()
    }
}
