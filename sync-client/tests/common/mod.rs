//! Shared fixtures for the chatsync-client integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chatsync_client::{
    ChannelDescriptor, ChannelSid, ChannelStatus, ChatClient, ChatEvent, ChatObserver,
    ClientProperties, ClientSyncStatus, Credentials, Identity, MemberDescriptor, Message,
    MockTransport, Request, Response, SynchronizationStrategy, UserInfo,
};
use chatsync_types::{
    Anchor, ChannelUpdate, MembershipAction, MessageSid, MessageUpdate, UserInfoChange,
};

pub const ME: &str = "alice";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn message(index: u64, body: &str) -> Message {
    Message {
        sid: MessageSid::new(format!("IM{}", index)),
        index,
        author: Identity::new("bob"),
        body: body.to_string(),
        attributes: serde_json::Value::Null,
        created_at: index,
        updated_at: index,
        last_updated_by: None,
    }
}

pub fn member(identity: &str) -> MemberDescriptor {
    MemberDescriptor {
        user: UserInfo::new(Identity::new(identity)),
        last_consumed_message_index: None,
    }
}

#[derive(Default)]
struct BackendState {
    channels: BTreeMap<ChannelSid, ChannelDescriptor>,
    members: HashMap<ChannelSid, Vec<MemberDescriptor>>,
    messages: HashMap<ChannelSid, BTreeMap<u64, Message>>,
    user: Option<UserInfo>,
    rejected: HashSet<&'static str>,
    created: u64,
}

/// An in-memory messaging backend behind a [`MockTransport`].
#[derive(Clone)]
pub struct FakeBackend {
    pub transport: MockTransport,
    state: Arc<Mutex<BackendState>>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let transport = MockTransport::new();
        let state = Arc::new(Mutex::new(BackendState {
            user: Some(UserInfo::new(Identity::new(ME))),
            ..Default::default()
        }));
        let handler_state = Arc::clone(&state);
        transport.respond_with(move |request| {
            let mut state = handler_state.lock().unwrap();
            state.answer(request)
        });
        Self { transport, state }
    }

    /// Add a joined channel with a friendly name.
    pub fn with_channel(self, sid: &str, name: &str) -> Self {
        self.add_channel(sid, name);
        self
    }

    /// Add a joined channel on a running backend.
    pub fn add_channel(&self, sid: &str, name: &str) {
        let mut desc = ChannelDescriptor::new(ChannelSid::new(sid));
        desc.friendly_name = Some(name.to_string());
        desc.unique_name = Some(name.to_lowercase());
        desc.status = ChannelStatus::Joined;
        self.state.lock().unwrap().channels.insert(desc.sid.clone(), desc);
    }

    /// Add a channel the user is not part of.
    pub fn with_foreign_channel(self, sid: &str) -> Self {
        let mut desc = ChannelDescriptor::new(ChannelSid::new(sid));
        desc.status = ChannelStatus::NotParticipating;
        self.state.lock().unwrap().channels.insert(desc.sid.clone(), desc);
        self
    }

    pub fn with_members(self, sid: &str, identities: &[&str]) -> Self {
        self.state
            .lock()
            .unwrap()
            .members
            .insert(ChannelSid::new(sid), identities.iter().map(|i| member(i)).collect());
        self
    }

    /// Set a member's consumption index in the roster.
    pub fn with_consumed(self, sid: &str, identity: &str, index: u64) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let roster = state.members.entry(ChannelSid::new(sid)).or_default();
            for entry in roster.iter_mut() {
                if entry.user.identity.as_str() == identity {
                    entry.last_consumed_message_index = Some(index);
                }
            }
        }
        self
    }

    /// Seed messages with the given indices.
    pub fn with_messages(self, sid: &str, indices: impl IntoIterator<Item = u64>) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let stored = state.messages.entry(ChannelSid::new(sid)).or_default();
            for index in indices {
                stored.insert(index, message(index, &format!("message {}", index)));
            }
        }
        self
    }

    /// Answer every request of this kind with a rejection.
    pub fn reject(&self, kind: &'static str) {
        self.state.lock().unwrap().rejected.insert(kind);
    }

    pub fn accept(&self, kind: &'static str) {
        self.state.lock().unwrap().rejected.remove(kind);
    }

    /// Append a message on the backend only, as another client would.
    pub fn append_remote(&self, sid: &str, body: &str) -> Message {
        let mut state = self.state.lock().unwrap();
        let stored = state.messages.entry(ChannelSid::new(sid)).or_default();
        let index = stored.keys().next_back().map(|i| i + 1).unwrap_or(0);
        let message = message(index, body);
        stored.insert(index, message.clone());
        message
    }

    pub fn fetches(&self) -> usize {
        self.transport
            .count_sent(|r| matches!(r, Request::FetchMessages { .. }))
    }

    pub fn count(&self, kind: &str) -> usize {
        self.transport.count_sent(|r| r.kind() == kind)
    }
}

impl BackendState {
    fn answer(&mut self, request: &Request) -> Response {
        if self.rejected.contains(request.kind()) {
            return Response::Rejected {
                code: 50_000,
                message: format!("{} refused", request.kind()),
            };
        }

        match request {
            Request::FetchChannels => Response::Channels(self.channels.values().cloned().collect()),
            Request::FetchChannel { channel } => match self.channels.get(channel) {
                Some(desc) => Response::Channel(desc.clone()),
                None => not_found(),
            },
            Request::CreateChannel { options } => {
                self.created += 1;
                let mut desc = ChannelDescriptor::new(ChannelSid::new(format!("CHNEW{}", self.created)));
                desc.friendly_name = options.friendly_name.clone();
                desc.unique_name = options.unique_name.clone();
                desc.channel_type = options.channel_type;
                desc.attributes = options.attributes.clone().unwrap_or_default();
                desc.status = ChannelStatus::Joined;
                self.channels.insert(desc.sid.clone(), desc.clone());
                self.members
                    .insert(desc.sid.clone(), vec![member(ME)]);
                Response::Channel(desc)
            }
            Request::UpdateChannel { channel, update } => match self.channels.get_mut(channel) {
                Some(desc) => {
                    match update {
                        ChannelUpdate::FriendlyName(name) => desc.friendly_name = Some(name.clone()),
                        ChannelUpdate::UniqueName(name) => desc.unique_name = Some(name.clone()),
                        ChannelUpdate::Attributes(attrs) => desc.attributes = attrs.clone(),
                    }
                    Response::Channel(desc.clone())
                }
                None => not_found(),
            },
            Request::Membership { channel, action } => match self.channels.get_mut(channel) {
                Some(desc) => {
                    desc.status = match action {
                        MembershipAction::Join => ChannelStatus::Joined,
                        _ => ChannelStatus::NotParticipating,
                    };
                    Response::Channel(desc.clone())
                }
                None => not_found(),
            },
            Request::Destroy { channel } => {
                self.channels.remove(channel);
                self.messages.remove(channel);
                Response::Ack
            }
            Request::FetchMembers { channel } => {
                Response::Members(self.members.get(channel).cloned().unwrap_or_default())
            }
            Request::FetchMessages {
                channel,
                anchor,
                count,
            } => {
                let count = *count as usize;
                let stored = self.messages.get(channel).cloned().unwrap_or_default();
                let batch: Vec<Message> = match anchor {
                    Anchor::Last => {
                        let mut last: Vec<Message> = stored.values().rev().take(count).cloned().collect();
                        last.reverse();
                        last
                    }
                    Anchor::Before(index) => {
                        let mut before: Vec<Message> =
                            stored.range(..=*index).rev().take(count).map(|(_, m)| m.clone()).collect();
                        before.reverse();
                        before
                    }
                    Anchor::After(index) => stored
                        .range(*index..)
                        .take(count)
                        .map(|(_, m)| m.clone())
                        .collect(),
                };
                Response::Messages(batch)
            }
            Request::SendMessage {
                channel,
                body,
                attributes,
            } => {
                let stored = self.messages.entry(channel.clone()).or_default();
                let index = stored.keys().next_back().map(|i| i + 1).unwrap_or(0);
                let mut sent = message(index, body);
                sent.author = Identity::new(ME);
                sent.attributes = attributes.clone();
                stored.insert(index, sent.clone());
                Response::Message(sent)
            }
            Request::RemoveMessage { channel, index } => {
                if let Some(stored) = self.messages.get_mut(channel) {
                    stored.remove(index);
                }
                Response::Ack
            }
            Request::UpdateMessage {
                channel,
                index,
                update,
            } => match self.messages.get_mut(channel).and_then(|m| m.get_mut(index)) {
                Some(stored) => {
                    match update {
                        MessageUpdate::Body(body) => stored.body = body.clone(),
                        MessageUpdate::Attributes(attrs) => stored.attributes = attrs.clone(),
                    }
                    stored.updated_at += 1;
                    Response::Message(stored.clone())
                }
                None => not_found(),
            },
            Request::SetConsumption { .. } | Request::Typing { .. } => Response::Ack,
            Request::UpdateUserInfo { change } => {
                let user = self.user.get_or_insert_with(|| UserInfo::new(Identity::new(ME)));
                match change {
                    UserInfoChange::FriendlyName(name) => user.friendly_name = Some(name.clone()),
                    UserInfoChange::Attributes(attrs) => user.attributes = attrs.clone(),
                }
                Response::UserInfo(user.clone())
            }
        }
    }
}

fn not_found() -> Response {
    Response::Rejected {
        code: 404,
        message: "not found".into(),
    }
}

/// Records every event it is handed.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<ChatEvent>>,
}

impl ChatObserver for Recorder {
    fn on_event(&self, event: &ChatEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

impl Recorder {
    pub fn events(&self) -> Vec<ChatEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn count(&self, predicate: impl Fn(&ChatEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| predicate(e)).count()
    }

    /// Poll until an event matching `predicate` has been recorded.
    pub async fn wait_for(&self, predicate: impl Fn(&ChatEvent) -> bool) {
        for _ in 0..400 {
            if self.count(&predicate) > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("event never arrived; recorded: {:#?}", self.events());
    }
}

pub fn properties(strategy: SynchronizationStrategy) -> ClientProperties {
    ClientProperties::new()
        .with_strategy(strategy)
        .with_initial_message_count(5)
}

/// Start a client against `backend` and wait for the initial sync.
pub async fn start(
    backend: &FakeBackend,
    strategy: SynchronizationStrategy,
) -> (ChatClient, Arc<Recorder>) {
    init_tracing();
    let recorder = Arc::new(Recorder::default());
    let client = ChatClient::builder(Credentials::new(ME, "token"), backend.transport.clone())
        .properties(properties(strategy))
        .observer(recorder.clone())
        .initialize()
        .unwrap();
    recorder
        .wait_for(|e| *e == ChatEvent::SynchronizationStatusChanged(ClientSyncStatus::Completed))
        .await;
    (client, recorder)
}

/// Poll until `check` passes.
pub async fn eventually<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never held");
}

pub fn indices(messages: &[Message]) -> Vec<u64> {
    messages.iter().map(|m| m.index).collect()
}
