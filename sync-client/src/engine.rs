//! The client engine.
//!
//! One tokio task owns every mutation of the client's state. Inbound
//! realtime events, user operations and backend completions all arrive on
//! its command queue and are processed one at a time:
//!
//! ```text
//! Transport ──events──┐
//! ChatClient ──ops────┼──► Engine ──► ClientState (chatsync-core) ──► Fanout ──► observers
//! backend tasks ──────┘       │
//!                             └──spawn──► Transport::send
//! ```
//!
//! Backend calls run as spawned tasks in a `JoinSet` and post a
//! [`Completion`] back to the queue, so the engine never waits on the
//! network. Handles read state through the shared mutex; only the engine
//! writes it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chatsync_core::{
    ChannelDirectory, ChannelState, ChannelSyncStatus, ClientSyncStatus, ConnectionAction,
    ConnectionEvent, ConnectionState, MemberChange, MemberView, UserInfoStore,
};
use chatsync_types::{
    Anchor, ChannelDescriptor, ChannelOptions, ChannelSid, ChannelStatus, ChannelUpdate,
    ChatError, Identity, InboundEvent, MemberDescriptor, MembershipAction, Message,
    MessageUpdate, PendingMessage, RawEvent, Request, Response, UserInfo, UserInfoChange,
    UserInfoUpdate,
};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::{ClientProperties, Credentials, SynchronizationStrategy};
use crate::observer::{ChatEvent, Fanout};
use crate::push::{decode_toast, PushRegistrar};
use crate::store::{Persistence, StoreWrite, StoreWriter};
use crate::transport::{Session, Transport, TransportError};

/// Reply channel for one user operation.
pub(crate) type Reply<T> = oneshot::Sender<Result<T, ChatError>>;

/// Replies held back until the matching notifications have been emitted.
#[derive(Default)]
struct Replies(Vec<Box<dyn FnOnce() + Send>>);

impl Replies {
    fn push<T: Send + 'static>(&mut self, reply: Reply<T>, outcome: Result<T, ChatError>) {
        self.0.push(Box::new(move || {
            let _ = reply.send(outcome);
        }));
    }

    fn send_all(self) {
        for send in self.0 {
            send();
        }
    }
}

/// State shared between the engine (writer) and client handles (readers).
#[derive(Debug, Default)]
pub(crate) struct ClientState {
    pub(crate) connection: ConnectionState,
    pub(crate) sync: ClientSyncStatus,
    pub(crate) directory: ChannelDirectory,
    pub(crate) users: UserInfoStore,
    pub(crate) local_user: Option<Identity>,
}

impl ClientState {
    pub(crate) fn check_client(&self) -> Result<(), ChatError> {
        if self.sync == ClientSyncStatus::Failed {
            return Err(ChatError::InvalidState(
                "client synchronization failed".into(),
            ));
        }
        Ok(())
    }

    /// Look up a channel that has reached `need`.
    pub(crate) fn channel(
        &self,
        sid: &ChannelSid,
        need: ChannelSyncStatus,
    ) -> Result<&ChannelState, ChatError> {
        self.check_client()?;
        let channel = self.directory.get(sid).ok_or_else(|| gone(sid))?;
        channel.require(need)?;
        Ok(channel)
    }

    fn member_or_bare(&self, channel: &ChannelState, identity: &Identity) -> MemberView {
        channel
            .members
            .view(identity, &self.users)
            .unwrap_or_else(|| MemberView {
                identity: identity.clone(),
                user: self
                    .users
                    .get(identity)
                    .unwrap_or_else(|| UserInfo::new(identity.clone())),
                last_consumed: None,
            })
    }
}

pub(crate) fn gone(sid: &ChannelSid) -> ChatError {
    ChatError::NotFound(format!("channel {}", sid))
}

fn missing_message(index: u64) -> ChatError {
    ChatError::NotFound(format!("message {}", index))
}

/// How a consumption operation moves the horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConsumptionChange {
    Set(u64),
    Advance(u64),
    All,
    None,
}

/// User operations submitted by client handles.
pub(crate) enum Operation {
    CreateChannel {
        options: ChannelOptions,
        reply: Reply<ChannelSid>,
    },
    Synchronize {
        channel: ChannelSid,
        reply: Reply<()>,
    },
    UpdateChannel {
        channel: ChannelSid,
        update: ChannelUpdate,
        reply: Reply<()>,
    },
    Membership {
        channel: ChannelSid,
        action: MembershipAction,
        reply: Reply<()>,
    },
    Destroy {
        channel: ChannelSid,
        reply: Reply<()>,
    },
    FetchMessages {
        channel: ChannelSid,
        anchor: Anchor,
        count: usize,
        reply: Reply<Vec<Message>>,
    },
    SendMessage {
        channel: ChannelSid,
        message: PendingMessage,
        reply: Reply<Message>,
    },
    RemoveMessage {
        channel: ChannelSid,
        index: u64,
        reply: Reply<()>,
    },
    UpdateMessage {
        channel: ChannelSid,
        index: u64,
        update: MessageUpdate,
        reply: Reply<Message>,
    },
    Consumption {
        channel: ChannelSid,
        change: ConsumptionChange,
        reply: Reply<Option<u64>>,
    },
    Typing {
        channel: ChannelSid,
        reply: Reply<()>,
    },
    UpdateUserInfo {
        change: UserInfoChange,
        reply: Reply<()>,
    },
    RegisterPush {
        token: Vec<u8>,
        register: bool,
        reply: Reply<()>,
    },
    HandleNotification {
        payload: serde_json::Value,
        reply: Reply<()>,
    },
}

/// Everything the engine queue carries.
pub(crate) enum Command {
    Inbound(RawEvent),
    EventsClosed(String),
    Op(Operation),
    Completed(Completion),
    Shutdown(oneshot::Sender<()>),
}

/// A finished background task.
pub(crate) enum Completion {
    Connected(Result<Session, TransportError>),
    ChannelsListed(Result<Vec<ChannelDescriptor>, ChatError>),
    ChannelLoaded {
        channel: ChannelSid,
        result: Result<ChannelLoad, ChatError>,
    },
    Backend {
        result: Result<Response, ChatError>,
        followup: Followup,
    },
    Push {
        register: bool,
        result: Result<(), ChatError>,
        reply: Reply<()>,
    },
}

/// What a channel synchronize pass fetched.
pub(crate) struct ChannelLoad {
    descriptor: Option<ChannelDescriptor>,
    members: Vec<MemberDescriptor>,
    messages: Vec<Message>,
    count: usize,
}

/// What to do with a backend response.
pub(crate) enum Followup {
    Created(Reply<ChannelSid>),
    ChannelUpdated {
        channel: ChannelSid,
        update: ChannelUpdate,
        reply: Reply<()>,
    },
    Membership {
        channel: ChannelSid,
        action: MembershipAction,
        reply: Reply<()>,
    },
    Destroyed {
        channel: ChannelSid,
        reply: Reply<()>,
    },
    MessagesFetched {
        channel: ChannelSid,
        anchor: Anchor,
        count: usize,
        reply: Reply<Vec<Message>>,
    },
    MessageSent {
        channel: ChannelSid,
        reply: Reply<Message>,
    },
    MessageRemoved {
        channel: ChannelSid,
        index: u64,
        reply: Reply<()>,
    },
    MessageUpdated {
        channel: ChannelSid,
        index: u64,
        update: MessageUpdate,
        reply: Reply<Message>,
    },
    ConsumptionSaved,
    Typing(Reply<()>),
    UserInfoUpdated {
        change: UserInfoChange,
        reply: Reply<()>,
    },
    ToastFetched {
        channel: ChannelSid,
        index: u64,
    },
}

/// Collaborators and settings the engine is started with.
pub(crate) struct EngineConfig {
    pub(crate) state: Arc<Mutex<ClientState>>,
    pub(crate) fanout: Arc<Fanout>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) push: Option<Arc<dyn PushRegistrar>>,
    pub(crate) store: Option<Arc<dyn Persistence>>,
    pub(crate) properties: ClientProperties,
    pub(crate) credentials: Credentials,
}

pub(crate) struct Engine {
    state: Arc<Mutex<ClientState>>,
    fanout: Arc<Fanout>,
    transport: Arc<dyn Transport>,
    push: Option<Arc<dyn PushRegistrar>>,
    store: Option<Arc<dyn Persistence>>,
    writer: StoreWriter,
    properties: ClientProperties,
    credentials: Credentials,
    commands: mpsc::UnboundedReceiver<Command>,
    self_tx: mpsc::WeakUnboundedSender<Command>,
    tasks: JoinSet<()>,
    pump: Option<JoinHandle<()>>,
    /// Joined channels still loading during initial sync under `All`.
    pending_initial: HashSet<ChannelSid>,
    /// Callers waiting for a channel's synchronize pass.
    sync_waiters: HashMap<ChannelSid, Vec<Reply<()>>>,
    /// Message events that arrived while a channel's synchronize pass was running.
    live_backlog: HashMap<ChannelSid, Vec<LiveMessage>>,
}

/// A realtime message event held back until its channel has loaded.
enum LiveMessage {
    Added(Message),
    Updated(Message),
}

fn post(tx: &mpsc::WeakUnboundedSender<Command>, command: Command) {
    // A closed queue means the client is gone; nothing is waiting.
    if let Some(tx) = tx.upgrade() {
        let _ = tx.send(command);
    }
}

fn apply_connection(state: &mut ClientState, event: ConnectionEvent) -> Vec<ChatEvent> {
    let (next, actions) = state.connection.on_event(event);
    state.connection = next;

    let mut events = Vec::new();
    for action in actions {
        match action {
            ConnectionAction::SealCoverage => {
                for channel in state.directory.iter_mut() {
                    channel.window.seal();
                }
            }
            ConnectionAction::Notify(connection) => {
                tracing::info!("Connection state: {:?}", connection);
                events.push(ChatEvent::ConnectionStateChanged(connection));
            }
        }
    }
    events
}

fn advance_client(state: &mut ClientState, target: ClientSyncStatus) -> Vec<ChatEvent> {
    match state.sync.advance(target) {
        Some(next) => {
            state.sync = next;
            tracing::info!("Client synchronization: {:?}", next);
            vec![ChatEvent::SynchronizationStatusChanged(next)]
        }
        None => Vec::new(),
    }
}

fn advance_channel(
    channel: &mut ChannelState,
    target: ChannelSyncStatus,
    events: &mut Vec<ChatEvent>,
) {
    if let Some(status) = channel.advance_sync(target) {
        tracing::debug!("Channel {} synchronization: {:?}", channel.sid(), status);
        events.push(ChatEvent::ChannelSynchronizationStatusChanged {
            channel: channel.sid().clone(),
            status,
        });
    }
}

fn user_info_events(state: &ClientState, identity: &Identity, update: UserInfoUpdate) -> Vec<ChatEvent> {
    let mut events = Vec::new();
    if state.local_user.as_ref() == Some(identity) {
        if let Some(user) = state.users.get(identity) {
            events.push(ChatEvent::UserInfoUpdated { user, update });
        }
    }
    for sid in state.directory.sids() {
        let member = state
            .directory
            .get(&sid)
            .and_then(|channel| channel.members.view(identity, &state.users));
        if let Some(member) = member {
            events.push(ChatEvent::MemberUserInfoUpdated {
                channel: sid,
                member,
                update,
            });
        }
    }
    events
}

async fn load_channel(
    transport: Arc<dyn Transport>,
    channel: ChannelSid,
    needs_metadata: bool,
    count: usize,
) -> Result<ChannelLoad, ChatError> {
    let descriptor = if needs_metadata {
        let request = Request::FetchChannel {
            channel: channel.clone(),
        };
        Some(transport.send(request).await?.into_channel()?)
    } else {
        None
    };

    let members = transport
        .send(Request::FetchMembers {
            channel: channel.clone(),
        })
        .await?
        .into_members()?;

    let messages = transport
        .send(Request::FetchMessages {
            channel,
            anchor: Anchor::Last,
            count: wire_count(count),
        })
        .await?
        .into_messages()?;

    Ok(ChannelLoad {
        descriptor,
        members,
        messages,
        count,
    })
}

fn wire_count(count: usize) -> u32 {
    u32::try_from(count).unwrap_or(u32::MAX)
}

impl Engine {
    /// Start the engine task and return its command queue.
    pub(crate) fn start(config: EngineConfig) -> mpsc::UnboundedSender<Command> {
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = match &config.store {
            Some(store) => StoreWriter::spawn(Arc::clone(store)),
            None => StoreWriter::disabled(),
        };
        let engine = Engine {
            state: config.state,
            fanout: config.fanout,
            transport: config.transport,
            push: config.push,
            store: config.store,
            writer,
            properties: config.properties,
            credentials: config.credentials,
            commands: rx,
            self_tx: tx.downgrade(),
            tasks: JoinSet::new(),
            pump: None,
            pending_initial: HashSet::new(),
            sync_waiters: HashMap::new(),
            live_backlog: HashMap::new(),
        };
        tokio::spawn(engine.run());
        tx
    }

    async fn run(mut self) {
        self.restore().await;
        self.begin_connect().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("All client handles dropped");
                        self.teardown().await;
                        break;
                    };
                    if let Command::Shutdown(ack) = command {
                        self.teardown().await;
                        let _ = ack.send(());
                        break;
                    }
                    self.handle(command).await;
                }
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            tracing::error!("Backend task panicked: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Inbound(raw) => self.on_inbound(raw).await,
            Command::EventsClosed(reason) => self.on_events_closed(reason).await,
            Command::Op(operation) => self.on_operation(operation).await,
            Command::Completed(completion) => self.on_completion(completion).await,
            Command::Shutdown(_) => {}
        }
    }

    fn emit(&self, events: Vec<ChatEvent>) {
        self.fanout.emit_all(events);
    }

    fn persist(&self, write: StoreWrite) {
        self.writer.submit(write);
    }

    fn spawn_request(&mut self, request: Request, followup: Followup) {
        let transport = Arc::clone(&self.transport);
        let tx = self.self_tx.clone();
        let kind = request.kind();
        self.tasks.spawn(async move {
            let result = match transport.send(request).await {
                Ok(response) => response.into_result(),
                Err(e) => Err(ChatError::from(e)),
            };
            if let Err(e) = &result {
                tracing::debug!("Request {} failed: {}", kind, e);
            }
            post(&tx, Command::Completed(Completion::Backend { result, followup }));
        });
    }

    // ===========================================
    // Startup
    // ===========================================

    async fn restore(&mut self) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let channels = match store.load_channels().await {
            Ok(channels) => channels,
            Err(e) => {
                tracing::warn!("Failed to load cached channels: {}", e);
                return;
            }
        };

        let mut restored = Vec::with_capacity(channels.len());
        for descriptor in channels {
            let mut channel = ChannelState::from_descriptor(descriptor);
            match store.load_messages(channel.sid()).await {
                Ok(messages) => channel.window.restore(messages),
                Err(e) => tracing::warn!("Failed to load cached messages for {}: {}", channel.sid(), e),
            }
            restored.push(channel);
        }

        let count = restored.len();
        let mut state = self.state.lock().await;
        for channel in restored {
            state.directory.insert(channel);
        }
        tracing::info!("Restored {} cached channels", count);
    }

    async fn begin_connect(&mut self) {
        let events = {
            let mut state = self.state.lock().await;
            let mut events = apply_connection(&mut state, ConnectionEvent::ConnectRequested);
            events.push(ChatEvent::SynchronizationStatusChanged(state.sync));
            events
        };
        self.emit(events);

        let transport = Arc::clone(&self.transport);
        let credentials = self.credentials.clone();
        let tx = self.self_tx.clone();
        tracing::info!("Connecting as {}", credentials.identity);
        self.tasks.spawn(async move {
            let result = transport.connect(&credentials).await;
            post(&tx, Command::Completed(Completion::Connected(result)));
        });
    }

    fn start_pump(&mut self) {
        let transport = Arc::clone(&self.transport);
        let tx = self.self_tx.clone();
        self.pump = Some(tokio::spawn(async move {
            loop {
                match transport.next_event().await {
                    Ok(event) => {
                        let Some(sender) = tx.upgrade() else { break };
                        if sender.send(Command::Inbound(event)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        post(&tx, Command::EventsClosed(e.to_string()));
                        break;
                    }
                }
            }
        }));
    }

    fn spawn_channels_fetch(&mut self) {
        let transport = Arc::clone(&self.transport);
        let tx = self.self_tx.clone();
        self.tasks.spawn(async move {
            let result = match transport.send(Request::FetchChannels).await {
                Ok(response) => response.into_channels(),
                Err(e) => Err(ChatError::from(e)),
            };
            post(&tx, Command::Completed(Completion::ChannelsListed(result)));
        });
    }

    // ===========================================
    // Completions
    // ===========================================

    async fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Connected(result) => self.on_connected(result).await,
            Completion::ChannelsListed(result) => self.on_channels_listed(result).await,
            Completion::ChannelLoaded { channel, result } => {
                self.on_channel_loaded(channel, result).await
            }
            Completion::Backend { result, followup } => self.on_backend(result, followup).await,
            Completion::Push {
                register,
                result,
                reply,
            } => {
                if register {
                    let event = match &result {
                        Ok(()) => ChatEvent::ToastSubscribed,
                        Err(e) => ChatEvent::ToastRegistrationFailed(e.clone()),
                    };
                    self.emit(vec![event]);
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn on_connected(&mut self, result: Result<Session, TransportError>) {
        match result {
            Ok(session) => {
                let events = {
                    let mut state = self.state.lock().await;
                    let events = apply_connection(&mut state, ConnectionEvent::SessionEstablished);
                    state.users.set_reachability_enabled(session.reachability_enabled);
                    state.local_user = Some(session.user.identity.clone());
                    state.users.upsert(session.user);
                    events
                };
                self.emit(events);
                self.start_pump();
                self.spawn_channels_fetch();
            }
            Err(e) => {
                tracing::warn!("Connection failed: {}", e);
                let event = match e {
                    TransportError::Denied(_) => ConnectionEvent::Denied,
                    _ => ConnectionEvent::Failed,
                };
                let events = {
                    let mut state = self.state.lock().await;
                    let mut events = apply_connection(&mut state, event);
                    events.extend(advance_client(&mut state, ClientSyncStatus::Failed));
                    events.push(ChatEvent::Error(ChatError::from(e)));
                    events
                };
                self.emit(events);
            }
        }
    }

    async fn on_channels_listed(&mut self, result: Result<Vec<ChannelDescriptor>, ChatError>) {
        let shared = Arc::clone(&self.state);
        let mut state = shared.lock().await;
        let mut events = Vec::new();

        match result {
            Err(e) => {
                tracing::warn!("Channel list failed: {}", e);
                events.extend(advance_client(&mut state, ClientSyncStatus::Failed));
                events.push(ChatEvent::Error(e));
            }
            Ok(list) => {
                tracing::info!("Channel list loaded: {} channels", list.len());
                let keep: HashSet<ChannelSid> = list.iter().map(|d| d.sid.clone()).collect();

                for descriptor in list {
                    self.persist(StoreWrite::PutChannel(descriptor.clone()));
                    let sid = descriptor.sid.clone();
                    let (is_new, changed) = state.directory.upsert_descriptor(descriptor);
                    if let Some(channel) = state.directory.get(&sid) {
                        if is_new {
                            events.push(ChatEvent::ChannelAdded(channel.snapshot()));
                        } else if changed {
                            events.push(ChatEvent::ChannelChanged(channel.snapshot()));
                        }
                    }
                }

                for channel in state.directory.retain_only(&keep) {
                    tracing::debug!("Channel {} no longer listed", channel.sid());
                    self.live_backlog.remove(channel.sid());
                    self.persist(StoreWrite::RemoveChannel(channel.sid().clone()));
                    events.push(ChatEvent::ChannelDeleted(channel.snapshot()));
                }

                events.extend(advance_client(
                    &mut state,
                    ClientSyncStatus::ChannelsListCompleted,
                ));

                match self.properties.synchronization_strategy {
                    SynchronizationStrategy::All => {
                        let joined: Vec<ChannelSid> = state
                            .directory
                            .iter()
                            .filter(|c| c.status() == ChannelStatus::Joined)
                            .map(|c| c.sid().clone())
                            .collect();
                        for sid in joined {
                            if self.begin_channel_sync(&mut state, &sid, None) {
                                self.pending_initial.insert(sid);
                            }
                        }
                        if self.pending_initial.is_empty() {
                            events.extend(advance_client(&mut state, ClientSyncStatus::Completed));
                        }
                    }
                    SynchronizationStrategy::ChannelsList => {
                        events.extend(advance_client(&mut state, ClientSyncStatus::Completed));
                    }
                }
            }
        }

        drop(state);
        self.emit(events);
    }

    /// Start loading a channel's members and initial window.
    ///
    /// Returns true if a load was started. An already synchronized or
    /// synchronizing channel answers `reply` at once.
    fn begin_channel_sync(
        &mut self,
        state: &mut ClientState,
        sid: &ChannelSid,
        reply: Option<Reply<()>>,
    ) -> bool {
        let checked = state
            .check_client()
            .and_then(|()| state.directory.get(sid).ok_or_else(|| gone(sid)))
            .and_then(|channel| channel.require(ChannelSyncStatus::Identifier).map(|()| channel));
        let channel = match checked {
            Ok(channel) => channel,
            Err(e) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Err(e));
                }
                return false;
            }
        };

        if channel.sync_status() == ChannelSyncStatus::All || channel.is_syncing() {
            if let Some(reply) = reply {
                let _ = reply.send(Ok(()));
            }
            return false;
        }

        let needs_metadata = !channel.sync_status().at_least(ChannelSyncStatus::Metadata);
        if let Some(channel) = state.directory.get_mut(sid) {
            channel.set_syncing(true);
        }
        if let Some(reply) = reply {
            self.sync_waiters.entry(sid.clone()).or_default().push(reply);
        }

        tracing::debug!("Synchronizing channel {}", sid);
        let transport = Arc::clone(&self.transport);
        let tx = self.self_tx.clone();
        let channel = sid.clone();
        let count = self.properties.initial_message_count as usize;
        self.tasks.spawn(async move {
            let result = load_channel(transport, channel.clone(), needs_metadata, count).await;
            post(
                &tx,
                Command::Completed(Completion::ChannelLoaded { channel, result }),
            );
        });
        true
    }

    /// Under the `All` strategy, joined channels are kept synchronized.
    fn auto_sync(&mut self, state: &mut ClientState, sid: &ChannelSid) {
        if self.properties.synchronization_strategy != SynchronizationStrategy::All {
            return;
        }
        let joined = state
            .directory
            .get(sid)
            .is_some_and(|c| c.status() == ChannelStatus::Joined);
        if joined {
            self.begin_channel_sync(state, sid, None);
        }
    }

    async fn on_channel_loaded(&mut self, sid: ChannelSid, result: Result<ChannelLoad, ChatError>) {
        let shared = Arc::clone(&self.state);
        let mut state = shared.lock().await;
        let mut events = Vec::new();
        let mut replies = Replies::default();
        let backlog = self.live_backlog.remove(&sid).unwrap_or_default();

        let outcome = match result {
            Err(e) => {
                tracing::warn!("Channel {} synchronization failed: {}", sid, e);
                if let Some(channel) = state.directory.get_mut(&sid) {
                    channel.set_syncing(false);
                    advance_channel(channel, ChannelSyncStatus::Failed, &mut events);
                    events.push(ChatEvent::Error(e.clone()));
                }
                Err(e)
            }
            Ok(load) => self.apply_channel_load(&mut state, &sid, load, backlog, &mut events),
        };

        for waiter in self.sync_waiters.remove(&sid).unwrap_or_default() {
            replies.push(waiter, outcome.clone());
        }
        if self.pending_initial.remove(&sid) && self.pending_initial.is_empty() {
            events.extend(advance_client(&mut state, ClientSyncStatus::Completed));
        }

        drop(state);
        self.emit(events);
        replies.send_all();
    }

    fn apply_channel_load(
        &self,
        state: &mut ClientState,
        sid: &ChannelSid,
        load: ChannelLoad,
        backlog: Vec<LiveMessage>,
        events: &mut Vec<ChatEvent>,
    ) -> Result<(), ChatError> {
        let before = state
            .directory
            .get(sid)
            .map(|c| c.sync_status())
            .ok_or_else(|| gone(sid))?;
        if let Some(descriptor) = load.descriptor {
            self.persist(StoreWrite::PutChannel(descriptor.clone()));
            state.directory.upsert_descriptor(descriptor);
        }

        let ClientState {
            directory,
            users,
            connection,
            local_user,
            ..
        } = &mut *state;
        let live = connection.is_connected();
        let channel = directory.get_mut(sid).ok_or_else(|| gone(sid))?;
        channel.set_syncing(false);

        // The descriptor upsert lifts the status without reporting it.
        channel.advance_sync(ChannelSyncStatus::Metadata);
        if !before.at_least(ChannelSyncStatus::Metadata)
            && channel.sync_status().at_least(ChannelSyncStatus::Metadata)
        {
            events.push(ChatEvent::ChannelSynchronizationStatusChanged {
                channel: sid.clone(),
                status: ChannelSyncStatus::Metadata,
            });
        }

        let user_changes = channel.members.replace_roster(load.members, users);
        if let Some(local) = local_user.as_ref() {
            channel.seed_consumption(local);
        }
        let stored = channel
            .window
            .merge_fetch(Anchor::Last, load.count, load.messages, live);
        for message in stored {
            self.persist(StoreWrite::PutMessage(sid.clone(), message));
        }
        advance_channel(channel, ChannelSyncStatus::All, events);

        // Events held during the load apply on top of its snapshot.
        for held in backlog {
            match held {
                LiveMessage::Added(message) => {
                    if channel.window.insert_live(message.clone()) {
                        self.persist(StoreWrite::PutMessage(sid.clone(), message.clone()));
                        events.push(ChatEvent::MessageAdded {
                            channel: sid.clone(),
                            message,
                        });
                    }
                }
                LiveMessage::Updated(message) => {
                    if channel.window.update(message.clone()) {
                        self.persist(StoreWrite::PutMessage(sid.clone(), message.clone()));
                        events.push(ChatEvent::MessageChanged {
                            channel: sid.clone(),
                            message,
                        });
                    }
                }
            }
        }

        for (identity, update) in user_changes {
            events.extend(user_info_events(state, &identity, update));
        }
        Ok(())
    }

    async fn on_backend(&mut self, result: Result<Response, ChatError>, followup: Followup) {
        let shared = Arc::clone(&self.state);
        let mut state = shared.lock().await;
        let mut events = Vec::new();
        let mut replies = Replies::default();

        match followup {
            Followup::Created(reply) => {
                let outcome = result.and_then(Response::into_channel).map(|descriptor| {
                    self.persist(StoreWrite::PutChannel(descriptor.clone()));
                    let sid = descriptor.sid.clone();
                    let (is_new, changed) = state.directory.upsert_descriptor(descriptor);
                    if let Some(channel) = state.directory.get(&sid) {
                        if is_new {
                            events.push(ChatEvent::ChannelAdded(channel.snapshot()));
                        } else if changed {
                            events.push(ChatEvent::ChannelChanged(channel.snapshot()));
                        }
                    }
                    sid
                });
                if let Ok(sid) = &outcome {
                    self.auto_sync(&mut state, sid);
                }
                replies.push(reply, outcome);
            }

            Followup::ChannelUpdated {
                channel,
                update,
                reply,
            } => {
                let outcome = result.and_then(|response| {
                    let descriptor = match response {
                        Response::Channel(descriptor) => descriptor,
                        _ => {
                            let current = state.directory.get(&channel).ok_or_else(|| gone(&channel))?;
                            let mut descriptor = current.descriptor().clone();
                            match update {
                                ChannelUpdate::FriendlyName(name) => descriptor.friendly_name = Some(name),
                                ChannelUpdate::UniqueName(name) => descriptor.unique_name = Some(name),
                                ChannelUpdate::Attributes(attributes) => descriptor.attributes = attributes,
                            }
                            descriptor
                        }
                    };
                    self.persist(StoreWrite::PutChannel(descriptor.clone()));
                    let (_, changed) = state.directory.upsert_descriptor(descriptor);
                    if changed {
                        if let Some(current) = state.directory.get(&channel) {
                            events.push(ChatEvent::ChannelChanged(current.snapshot()));
                        }
                    }
                    Ok(())
                });
                replies.push(reply, outcome);
            }

            Followup::Membership {
                channel,
                action,
                reply,
            } => {
                let outcome = result.and_then(|response| {
                    let changed = match response {
                        Response::Channel(descriptor) => state.directory.upsert_descriptor(descriptor).1,
                        _ => {
                            let entry = state.directory.get_mut(&channel).ok_or_else(|| gone(&channel))?;
                            entry.set_status(match action {
                                MembershipAction::Join => ChannelStatus::Joined,
                                MembershipAction::Decline | MembershipAction::Leave => {
                                    ChannelStatus::NotParticipating
                                }
                            })
                        }
                    };
                    if let Some(entry) = state.directory.get(&channel) {
                        self.persist(StoreWrite::PutChannel(entry.descriptor().clone()));
                        if changed {
                            events.push(ChatEvent::ChannelChanged(entry.snapshot()));
                        }
                    }
                    Ok(())
                });
                if outcome.is_ok() && action == MembershipAction::Join {
                    self.auto_sync(&mut state, &channel);
                }
                replies.push(reply, outcome);
            }

            Followup::Destroyed { channel, reply } => {
                let outcome = result.map(|_| {
                    self.remove_channel(&mut state, &channel, &mut events);
                });
                replies.push(reply, outcome);
            }

            Followup::MessagesFetched {
                channel,
                anchor,
                count,
                reply,
            } => {
                let live = state.connection.is_connected();
                let outcome = result.and_then(Response::into_messages).and_then(|batch| {
                    let entry = state.directory.get_mut(&channel).ok_or_else(|| gone(&channel))?;
                    for message in entry.window.merge_fetch(anchor, count, batch, live) {
                        self.persist(StoreWrite::PutMessage(channel.clone(), message));
                    }
                    Ok(entry.window.answer(anchor, count))
                });
                replies.push(reply, outcome);
            }

            Followup::MessageSent { channel, reply } => {
                let outcome = result.and_then(Response::into_message).and_then(|message| {
                    let entry = state.directory.get_mut(&channel).ok_or_else(|| gone(&channel))?;
                    if entry.window.insert_live(message.clone()) {
                        self.persist(StoreWrite::PutMessage(channel.clone(), message.clone()));
                        events.push(ChatEvent::MessageAdded {
                            channel: channel.clone(),
                            message: message.clone(),
                        });
                    }
                    Ok(message)
                });
                replies.push(reply, outcome);
            }

            Followup::MessageRemoved {
                channel,
                index,
                reply,
            } => {
                let outcome = result.and_then(|_| {
                    let entry = state.directory.get_mut(&channel).ok_or_else(|| gone(&channel))?;
                    if let Some(message) = entry.window.remove(index) {
                        self.persist(StoreWrite::RemoveMessage(channel.clone(), index));
                        events.push(ChatEvent::MessageDeleted {
                            channel: channel.clone(),
                            message,
                        });
                    }
                    Ok(())
                });
                replies.push(reply, outcome);
            }

            Followup::MessageUpdated {
                channel,
                index,
                update,
                reply,
            } => {
                let outcome = result.and_then(|response| {
                    let entry = state.directory.get_mut(&channel).ok_or_else(|| gone(&channel))?;
                    let message = match response {
                        Response::Message(message) => message,
                        _ => {
                            let mut message = entry
                                .window
                                .message_with_index(index)
                                .cloned()
                                .ok_or_else(|| missing_message(index))?;
                            match update {
                                MessageUpdate::Body(body) => message.body = body,
                                MessageUpdate::Attributes(attributes) => message.attributes = attributes,
                            }
                            message
                        }
                    };
                    if entry.window.update(message.clone()) {
                        self.persist(StoreWrite::PutMessage(channel.clone(), message.clone()));
                        events.push(ChatEvent::MessageChanged {
                            channel: channel.clone(),
                            message: message.clone(),
                        });
                    }
                    Ok(message)
                });
                replies.push(reply, outcome);
            }

            Followup::ConsumptionSaved => {
                if let Err(e) = result {
                    tracing::warn!("Failed to save consumption horizon: {}", e);
                    events.push(ChatEvent::Error(e));
                }
            }

            Followup::Typing(reply) => {
                replies.push(reply, result.map(|_| ()));
            }

            Followup::UserInfoUpdated { change, reply } => {
                let outcome = result.and_then(|response| {
                    let identity = state
                        .local_user
                        .clone()
                        .ok_or_else(|| ChatError::InvalidState("not connected".into()))?;
                    let kind = change.kind();
                    let user = match response {
                        Response::UserInfo(user) => user,
                        _ => {
                            let mut user = state.users.get_or_create(&identity);
                            match change {
                                UserInfoChange::FriendlyName(name) => user.friendly_name = Some(name),
                                UserInfoChange::Attributes(attributes) => user.attributes = attributes,
                            }
                            user
                        }
                    };
                    if state.users.apply_update(&user, kind) {
                        events.extend(user_info_events(&state, &identity, kind));
                    }
                    Ok(())
                });
                replies.push(reply, outcome);
            }

            Followup::ToastFetched { channel, index } => {
                let live = state.connection.is_connected();
                let message = match result.and_then(Response::into_messages) {
                    Ok(batch) => state
                        .directory
                        .get_mut(&channel)
                        .filter(|entry| entry.sync_status() == ChannelSyncStatus::All)
                        .and_then(|entry| {
                            for message in entry.window.merge_fetch(Anchor::After(index), 1, batch, live) {
                                self.persist(StoreWrite::PutMessage(channel.clone(), message));
                            }
                            entry.window.message_with_index(index).cloned()
                        }),
                    Err(e) => {
                        tracing::debug!("Toast message {} in {} not loaded: {}", index, channel, e);
                        None
                    }
                };
                events.push(ChatEvent::ToastReceived {
                    channel,
                    message_index: Some(index),
                    message,
                });
            }
        }

        drop(state);
        self.emit(events);
        replies.send_all();
    }

    fn remove_channel(&mut self, state: &mut ClientState, sid: &ChannelSid, events: &mut Vec<ChatEvent>) {
        if let Some(channel) = state.directory.remove(sid) {
            tracing::debug!("Channel {} removed", sid);
            self.persist(StoreWrite::RemoveChannel(sid.clone()));
            events.push(ChatEvent::ChannelDeleted(channel.snapshot()));
        }
        self.live_backlog.remove(sid);
        for waiter in self.sync_waiters.remove(sid).unwrap_or_default() {
            let _ = waiter.send(Err(gone(sid)));
        }
        if self.pending_initial.remove(sid) && self.pending_initial.is_empty() {
            events.extend(advance_client(state, ClientSyncStatus::Completed));
        }
    }

    // ===========================================
    // User operations
    // ===========================================

    async fn on_operation(&mut self, operation: Operation) {
        let shared = Arc::clone(&self.state);
        let mut state = shared.lock().await;
        let mut events = Vec::new();
        let mut replies = Replies::default();

        match operation {
            Operation::CreateChannel { options, reply } => match state.check_client() {
                Ok(()) => self.spawn_request(Request::CreateChannel { options }, Followup::Created(reply)),
                Err(e) => {
                    replies.push(reply, Err(e));
                }
            },

            Operation::Synchronize { channel, reply } => {
                self.begin_channel_sync(&mut state, &channel, Some(reply));
            }

            Operation::UpdateChannel {
                channel,
                update,
                reply,
            } => match state.channel(&channel, ChannelSyncStatus::Metadata) {
                Ok(_) => {
                    let request = Request::UpdateChannel {
                        channel: channel.clone(),
                        update: update.clone(),
                    };
                    self.spawn_request(
                        request,
                        Followup::ChannelUpdated {
                            channel,
                            update,
                            reply,
                        },
                    );
                }
                Err(e) => {
                    replies.push(reply, Err(e));
                }
            },

            Operation::Membership {
                channel,
                action,
                reply,
            } => match state.channel(&channel, ChannelSyncStatus::Identifier) {
                Ok(_) => {
                    let request = Request::Membership {
                        channel: channel.clone(),
                        action,
                    };
                    self.spawn_request(
                        request,
                        Followup::Membership {
                            channel,
                            action,
                            reply,
                        },
                    );
                }
                Err(e) => {
                    replies.push(reply, Err(e));
                }
            },

            Operation::Destroy { channel, reply } => {
                match state.channel(&channel, ChannelSyncStatus::Identifier) {
                    Ok(_) => {
                        let request = Request::Destroy {
                            channel: channel.clone(),
                        };
                        self.spawn_request(request, Followup::Destroyed { channel, reply });
                    }
                    Err(e) => {
                        replies.push(reply, Err(e));
                    }
                }
            }

            Operation::FetchMessages {
                channel,
                anchor,
                count,
                reply,
            } => {
                let cached = state
                    .channel(&channel, ChannelSyncStatus::All)
                    .map(|entry| entry.window.lookup(anchor, count));
                match cached {
                    Ok(Some(messages)) => {
                        replies.push(reply, Ok(messages));
                    }
                    Ok(None) => {
                        let request = Request::FetchMessages {
                            channel: channel.clone(),
                            anchor,
                            count: wire_count(count),
                        };
                        self.spawn_request(
                            request,
                            Followup::MessagesFetched {
                                channel,
                                anchor,
                                count,
                                reply,
                            },
                        );
                    }
                    Err(e) => {
                        replies.push(reply, Err(e));
                    }
                }
            }

            Operation::SendMessage {
                channel,
                message,
                reply,
            } => match state.channel(&channel, ChannelSyncStatus::All) {
                Ok(_) => {
                    tracing::debug!("Sending {} to {}", message.local_id, channel);
                    let request = Request::SendMessage {
                        channel: channel.clone(),
                        body: message.body,
                        attributes: message.attributes,
                    };
                    self.spawn_request(request, Followup::MessageSent { channel, reply });
                }
                Err(e) => {
                    replies.push(reply, Err(e));
                }
            },

            Operation::RemoveMessage {
                channel,
                index,
                reply,
            } => {
                let checked = state.channel(&channel, ChannelSyncStatus::All).and_then(|entry| {
                    entry
                        .window
                        .message_with_index(index)
                        .map(|_| ())
                        .ok_or_else(|| missing_message(index))
                });
                match checked {
                    Ok(()) => {
                        let request = Request::RemoveMessage {
                            channel: channel.clone(),
                            index,
                        };
                        self.spawn_request(
                            request,
                            Followup::MessageRemoved {
                                channel,
                                index,
                                reply,
                            },
                        );
                    }
                    Err(e) => {
                        replies.push(reply, Err(e));
                    }
                }
            }

            Operation::UpdateMessage {
                channel,
                index,
                update,
                reply,
            } => {
                let checked = state.channel(&channel, ChannelSyncStatus::All).and_then(|entry| {
                    entry
                        .window
                        .message_with_index(index)
                        .map(|_| ())
                        .ok_or_else(|| missing_message(index))
                });
                match checked {
                    Ok(()) => {
                        let request = Request::UpdateMessage {
                            channel: channel.clone(),
                            index,
                            update: update.clone(),
                        };
                        self.spawn_request(
                            request,
                            Followup::MessageUpdated {
                                channel,
                                index,
                                update,
                                reply,
                            },
                        );
                    }
                    Err(e) => {
                        replies.push(reply, Err(e));
                    }
                }
            }

            Operation::Consumption {
                channel,
                change,
                reply,
            } => {
                let checked = state.channel(&channel, ChannelSyncStatus::All).map(|_| ());
                let ClientState {
                    directory,
                    users,
                    local_user,
                    ..
                } = &mut *state;
                if let Err(e) = checked {
                    replies.push(reply, Err(e));
                } else if let Some(entry) = directory.get_mut(&channel) {
                    let window = &mut entry.window;
                    let before = window.last_consumed();
                    let after = match change {
                        ConsumptionChange::Set(index) => {
                            window.set_last_consumed(index);
                            window.last_consumed()
                        }
                        ConsumptionChange::Advance(index) => {
                            window.advance_last_consumed(index);
                            window.last_consumed()
                        }
                        ConsumptionChange::All => window.set_all_consumed(),
                        ConsumptionChange::None => {
                            window.set_none_consumed();
                            None
                        }
                    };
                    if after != before {
                        let request = Request::SetConsumption {
                            channel: channel.clone(),
                            index: after,
                        };
                        self.spawn_request(request, Followup::ConsumptionSaved);
                    }
                    // The local member's entry carries the same horizon.
                    if let Some(local) = local_user.as_ref() {
                        if entry.mirror_consumption(local) {
                            if let Some(member) = entry.members.view(local, users) {
                                events.push(ChatEvent::MemberChanged {
                                    channel: channel.clone(),
                                    member,
                                });
                            }
                        }
                    }
                    replies.push(reply, Ok(after));
                }
            }

            Operation::Typing { channel, reply } => {
                match state.channel(&channel, ChannelSyncStatus::Metadata) {
                    Ok(_) => self.spawn_request(Request::Typing { channel }, Followup::Typing(reply)),
                    Err(e) => {
                        replies.push(reply, Err(e));
                    }
                }
            }

            Operation::UpdateUserInfo { change, reply } => match state.check_client() {
                Ok(()) => {
                    let request = Request::UpdateUserInfo {
                        change: change.clone(),
                    };
                    self.spawn_request(request, Followup::UserInfoUpdated { change, reply });
                }
                Err(e) => {
                    replies.push(reply, Err(e));
                }
            },

            Operation::RegisterPush {
                token,
                register,
                reply,
            } => match self.push.clone() {
                Some(push) => {
                    let tx = self.self_tx.clone();
                    self.tasks.spawn(async move {
                        let result = if register {
                            push.register_token(&token).await
                        } else {
                            push.deregister_token(&token).await
                        };
                        let result = result.map_err(ChatError::from);
                        post(
                            &tx,
                            Command::Completed(Completion::Push {
                                register,
                                result,
                                reply,
                            }),
                        );
                    });
                }
                None => {
                    let error = ChatError::InvalidState("push notifications are not configured".into());
                    replies.push(reply, Err(error));
                }
            },

            Operation::HandleNotification { payload, reply } => {
                let decoded = match &self.push {
                    Some(push) => push.decode_payload(&payload),
                    None => decode_toast(&payload),
                };
                match decoded {
                    Err(e) => {
                        tracing::debug!("Ignoring push payload: {}", e);
                        replies.push(reply, Err(ChatError::from(e)));
                    }
                    Ok(toast) => {
                        let synced = state
                            .directory
                            .get(&toast.channel)
                            .filter(|c| c.sync_status() == ChannelSyncStatus::All);
                        match (synced, toast.message_index) {
                            (Some(entry), Some(index)) => {
                                match entry.window.message_with_index(index).cloned() {
                                    Some(message) => events.push(ChatEvent::ToastReceived {
                                        channel: toast.channel,
                                        message_index: Some(index),
                                        message: Some(message),
                                    }),
                                    None => {
                                        let request = Request::FetchMessages {
                                            channel: toast.channel.clone(),
                                            anchor: Anchor::After(index),
                                            count: 1,
                                        };
                                        self.spawn_request(
                                            request,
                                            Followup::ToastFetched {
                                                channel: toast.channel,
                                                index,
                                            },
                                        );
                                    }
                                }
                            }
                            _ => events.push(ChatEvent::ToastReceived {
                                channel: toast.channel,
                                message_index: toast.message_index,
                                message: None,
                            }),
                        }
                        replies.push(reply, Ok(()));
                    }
                }
            }
        }

        drop(state);
        self.emit(events);
        replies.send_all();
    }

    // ===========================================
    // Inbound realtime events
    // ===========================================

    async fn on_inbound(&mut self, raw: RawEvent) {
        let event = match InboundEvent::decode(&raw) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("Dropping inbound {} event: {}", raw.event_type, e);
                self.emit(vec![ChatEvent::Error(e)]);
                return;
            }
        };

        let shared = Arc::clone(&self.state);
        let mut state = shared.lock().await;
        let mut events = Vec::new();

        match event {
            InboundEvent::ChannelAdded(descriptor) | InboundEvent::ChannelUpdated(descriptor) => {
                let sid = descriptor.sid.clone();
                self.persist(StoreWrite::PutChannel(descriptor.clone()));
                let (is_new, changed) = state.directory.upsert_descriptor(descriptor);
                if let Some(channel) = state.directory.get(&sid) {
                    if is_new {
                        events.push(ChatEvent::ChannelAdded(channel.snapshot()));
                    } else if changed {
                        events.push(ChatEvent::ChannelChanged(channel.snapshot()));
                    }
                }
                self.auto_sync(&mut state, &sid);
            }

            InboundEvent::ChannelDeleted { channel } => {
                self.remove_channel(&mut state, &channel, &mut events);
            }

            InboundEvent::MemberJoined { channel, member }
            | InboundEvent::MemberUpdated { channel, member } => {
                let identity = member.user.identity.clone();
                let is_local = state.local_user.as_ref() == Some(&identity);
                if is_local && !state.directory.contains(&channel) {
                    // Added to a channel the list has not shown us yet.
                    let mut entry = ChannelState::from_sid(channel.clone());
                    entry.set_status(ChannelStatus::Joined);
                    tracing::debug!("Added to unlisted channel {}", channel);
                    events.push(ChatEvent::ChannelAdded(entry.snapshot()));
                    state.directory.insert(entry);
                    self.auto_sync(&mut state, &channel);
                }

                let ClientState {
                    directory, users, ..
                } = &mut *state;
                let updates = match directory.get_mut(&channel) {
                    Some(entry) => {
                        let (change, updates) = entry.members.upsert(member, users);
                        if is_local {
                            entry.seed_consumption(&identity);
                        }
                        if let Some(view) = entry.members.view(&identity, users) {
                            match change {
                                MemberChange::Joined => events.push(ChatEvent::MemberJoined {
                                    channel,
                                    member: view,
                                }),
                                MemberChange::Changed => events.push(ChatEvent::MemberChanged {
                                    channel,
                                    member: view,
                                }),
                                MemberChange::Unchanged => {}
                            }
                        }
                        updates
                    }
                    None => {
                        tracing::debug!("Member event for unknown channel {}", channel);
                        Vec::new()
                    }
                };
                for update in updates {
                    events.extend(user_info_events(&state, &identity, update));
                }
            }

            InboundEvent::MemberLeft { channel, identity } => {
                let ClientState {
                    directory, users, ..
                } = &mut *state;
                if let Some(entry) = directory.get_mut(&channel) {
                    let view = entry.members.view(&identity, users);
                    if entry.members.remove(&identity).is_some() {
                        if let Some(member) = view {
                            events.push(ChatEvent::MemberLeft { channel, member });
                        }
                    }
                }
            }

            InboundEvent::MessageAdded { channel, message } => match state.directory.get_mut(&channel) {
                Some(entry) if entry.sync_status() == ChannelSyncStatus::All => {
                    if entry.window.insert_live(message.clone()) {
                        self.persist(StoreWrite::PutMessage(channel.clone(), message.clone()));
                        events.push(ChatEvent::MessageAdded { channel, message });
                    }
                }
                Some(entry) if entry.is_syncing() => {
                    tracing::debug!("Holding message {} for {} until it loads", message.index, channel);
                    self.live_backlog
                        .entry(channel)
                        .or_default()
                        .push(LiveMessage::Added(message));
                }
                _ => tracing::debug!("Message for unsynchronized channel {}", channel),
            },

            InboundEvent::MessageUpdated { channel, message } => match state.directory.get_mut(&channel) {
                Some(entry) if entry.is_syncing() => {
                    self.live_backlog
                        .entry(channel)
                        .or_default()
                        .push(LiveMessage::Updated(message));
                }
                Some(entry) => {
                    if entry.window.update(message.clone()) {
                        self.persist(StoreWrite::PutMessage(channel.clone(), message.clone()));
                        events.push(ChatEvent::MessageChanged { channel, message });
                    }
                }
                None => {}
            },

            InboundEvent::MessageRemoved { channel, index } => {
                if let Some(entry) = state.directory.get_mut(&channel) {
                    if let Some(message) = entry.window.remove(index) {
                        self.persist(StoreWrite::RemoveMessage(channel.clone(), index));
                        events.push(ChatEvent::MessageDeleted { channel, message });
                    }
                }
            }

            InboundEvent::UserInfoUpdated { user, update } => {
                let identity = user.identity.clone();
                if state.users.apply_update(&user, update) {
                    events.extend(user_info_events(&state, &identity, update));
                }
            }

            InboundEvent::TypingStarted { channel, identity } => {
                if let Some(entry) = state.directory.get(&channel) {
                    let member = state.member_or_bare(entry, &identity);
                    events.push(ChatEvent::TypingStarted { channel, member });
                }
            }

            InboundEvent::TypingEnded { channel, identity } => {
                if let Some(entry) = state.directory.get(&channel) {
                    let member = state.member_or_bare(entry, &identity);
                    events.push(ChatEvent::TypingEnded { channel, member });
                }
            }

            InboundEvent::SessionLost { reason } => {
                tracing::warn!("Session lost: {}", reason);
                events.extend(apply_connection(&mut state, ConnectionEvent::SessionLost));
            }

            InboundEvent::SessionRestored => {
                events.extend(apply_connection(&mut state, ConnectionEvent::SessionRestored));
            }

            InboundEvent::SessionDenied => {
                events.extend(apply_connection(&mut state, ConnectionEvent::Denied));
            }

            InboundEvent::SessionError { reason } => {
                tracing::warn!("Session error: {}", reason);
                events.extend(apply_connection(&mut state, ConnectionEvent::Failed));
                events.push(ChatEvent::Error(ChatError::Transport(reason)));
            }

            InboundEvent::Error { code, message } => {
                events.push(ChatEvent::Error(ChatError::BackendRejected { code, message }));
            }
        }

        drop(state);
        self.emit(events);
    }

    async fn on_events_closed(&mut self, reason: String) {
        tracing::warn!("Inbound event stream closed: {}", reason);
        self.pump = None;
        let events = {
            let mut state = self.state.lock().await;
            apply_connection(&mut state, ConnectionEvent::SessionLost)
        };
        self.emit(events);
    }

    // ===========================================
    // Shutdown
    // ===========================================

    async fn teardown(&mut self) {
        // Dropping in-flight tasks drops their reply senders; callers see the client as shut down.
        self.tasks.abort_all();
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        for (_, waiters) in self.sync_waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(ChatError::InvalidState("client is shut down".into())));
            }
        }
        self.pending_initial.clear();
        self.live_backlog.clear();

        let events = {
            let mut state = self.state.lock().await;
            let events = apply_connection(&mut state, ConnectionEvent::ShutdownRequested);
            state.directory.clear();
            state.users.clear();
            state.sync = ClientSyncStatus::default();
            state.local_user = None;
            events
        };
        self.emit(events);
        self.fanout.close();

        self.writer.flush_and_stop().await;
        if let Err(e) = self.transport.close().await {
            tracing::warn!("Transport close failed: {}", e);
        }
        tracing::info!("Chat client shut down");
    }
}
