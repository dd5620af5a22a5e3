//! End-to-end tests of the client engine against an in-memory backend.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chatsync_client::{
    ChannelOptions, ChannelSid, ChannelStatus, ChannelSyncStatus, ChatClient, ChatError,
    ChatEvent, ChatObserver, ClientSyncStatus, ConnectionState, Credentials, Identity,
    MemoryStore, MockPush, RawEvent, Request, SynchronizationStrategy, UserInfoUpdate,
};
use common::{indices, message, start, FakeBackend, Recorder, ME};
use serde_json::json;

fn sid(value: &str) -> ChannelSid {
    ChannelSid::new(value)
}

fn general() -> FakeBackend {
    FakeBackend::new()
        .with_channel("CH1", "General")
        .with_members("CH1", &[ME, "bob"])
        .with_messages("CH1", 0..=40)
}

async fn synced_general() -> (FakeBackend, ChatClient, Arc<Recorder>, chatsync_client::Channel) {
    let backend = general();
    let (client, recorder) = start(&backend, SynchronizationStrategy::ChannelsList).await;
    let channel = client
        .channels_list()
        .await
        .unwrap()
        .channel_with_sid(&sid("CH1"))
        .await
        .unwrap();
    channel.synchronize().await.unwrap();
    (backend, client, recorder, channel)
}

fn rank(status: ChannelSyncStatus) -> u8 {
    match status {
        ChannelSyncStatus::None => 0,
        ChannelSyncStatus::Identifier => 1,
        ChannelSyncStatus::Metadata => 2,
        ChannelSyncStatus::All => 3,
        ChannelSyncStatus::Failed => 4,
    }
}

fn channel_statuses(recorder: &Recorder, channel: &str) -> Vec<ChannelSyncStatus> {
    recorder
        .events()
        .into_iter()
        .filter_map(|event| match event {
            ChatEvent::ChannelSynchronizationStatusChanged { channel: c, status }
                if c.as_str() == channel =>
            {
                Some(status)
            }
            _ => None,
        })
        .collect()
}

fn assert_strictly_ascending(messages: &[chatsync_client::Message]) {
    for pair in messages.windows(2) {
        assert!(
            pair[0].index < pair[1].index,
            "not strictly ascending: {:?}",
            indices(messages)
        );
    }
}

// ===========================================
// Synchronization
// ===========================================

#[tokio::test]
async fn channel_sync_status_only_moves_forward() {
    let backend = general().with_channel("CH2", "Random");
    let (client, recorder) = start(&backend, SynchronizationStrategy::ChannelsList).await;
    let list = client.channels_list().await.unwrap();

    let ch1 = list.channel_with_sid(&sid("CH1")).await.unwrap();
    assert_eq!(
        ch1.synchronization_status().await.unwrap(),
        ChannelSyncStatus::Metadata
    );
    ch1.synchronize().await.unwrap();
    ch1.synchronize().await.unwrap();
    assert_eq!(ch1.synchronization_status().await.unwrap(), ChannelSyncStatus::All);

    backend.reject("fetch_members");
    let ch2 = list.channel_with_sid(&sid("CH2")).await.unwrap();
    assert!(matches!(
        ch2.synchronize().await,
        Err(ChatError::BackendRejected { .. })
    ));
    assert_eq!(ch2.synchronization_status().await.unwrap(), ChannelSyncStatus::Failed);

    // Failed is terminal.
    backend.accept("fetch_members");
    assert!(matches!(ch2.synchronize().await, Err(ChatError::InvalidState(_))));
    assert!(matches!(ch2.set_friendly_name("x").await, Err(ChatError::InvalidState(_))));

    for channel in ["CH1", "CH2"] {
        let statuses = channel_statuses(&recorder, channel);
        assert!(
            statuses.windows(2).all(|w| rank(w[0]) < rank(w[1])),
            "{}: {:?}",
            channel,
            statuses
        );
    }
    assert_eq!(channel_statuses(&recorder, "CH1"), vec![ChannelSyncStatus::All]);
    assert_eq!(channel_statuses(&recorder, "CH2"), vec![ChannelSyncStatus::Failed]);

    // A failed channel does not fail the client.
    assert_eq!(client.synchronization_status().await, ClientSyncStatus::Completed);
    client.shutdown().await;
}

#[tokio::test]
async fn all_strategy_syncs_joined_channels() {
    let backend = general()
        .with_channel("CH2", "Random")
        .with_members("CH2", &[ME])
        .with_foreign_channel("CH3");
    let (client, recorder) = start(&backend, SynchronizationStrategy::All).await;

    let list = client.channels_list().await.unwrap();
    for (channel, expected) in [
        ("CH1", ChannelSyncStatus::All),
        ("CH2", ChannelSyncStatus::All),
        ("CH3", ChannelSyncStatus::Metadata),
    ] {
        let handle = list.channel_with_sid(&sid(channel)).await.unwrap();
        assert_eq!(handle.synchronization_status().await.unwrap(), expected);
    }

    // Client statuses are reported in order, each once.
    let client_statuses: Vec<ClientSyncStatus> = recorder
        .events()
        .into_iter()
        .filter_map(|event| match event {
            ChatEvent::SynchronizationStatusChanged(status) => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(
        client_statuses,
        vec![
            ClientSyncStatus::Started,
            ClientSyncStatus::ChannelsListCompleted,
            ClientSyncStatus::Completed
        ]
    );

    let messages = list.channel_with_sid(&sid("CH1")).await.unwrap().messages();
    let fetches = backend.fetches();
    assert_eq!(indices(&messages.get_last(5).await.unwrap()), vec![36, 37, 38, 39, 40]);
    assert_eq!(backend.fetches(), fetches);
    client.shutdown().await;
}

#[tokio::test]
async fn channel_list_failure_fails_client() {
    let backend = general();
    backend.reject("fetch_channels");
    let recorder = Arc::new(Recorder::default());
    let client = ChatClient::builder(Credentials::new(ME, "token"), backend.transport.clone())
        .observer(recorder.clone())
        .initialize()
        .unwrap();

    recorder
        .wait_for(|e| *e == ChatEvent::SynchronizationStatusChanged(ClientSyncStatus::Failed))
        .await;
    assert!(recorder.count(|e| matches!(e, ChatEvent::Error(_))) >= 1);
    assert!(matches!(
        client.channels_list().await,
        Err(ChatError::InvalidState(_))
    ));
    client.shutdown().await;
}

#[tokio::test]
async fn operations_need_a_synchronized_channel() {
    let backend = general();
    let (client, _recorder) = start(&backend, SynchronizationStrategy::ChannelsList).await;
    let channel = client
        .channels_list()
        .await
        .unwrap()
        .channel_with_sid(&sid("CH1"))
        .await
        .unwrap();

    let messages = channel.messages();
    assert!(matches!(messages.get_last(5).await, Err(ChatError::InvalidState(_))));
    assert!(matches!(
        messages.send(messages.create_message("hi")).await,
        Err(ChatError::InvalidState(_))
    ));
    assert!(channel.members().await.unwrap().is_empty());
    assert_eq!(
        channel.member_with_identity(&Identity::new("bob")).await.unwrap(),
        None
    );
    client.shutdown().await;
}

#[tokio::test]
async fn failed_channel_rejects_reads() {
    let backend = general();
    let (client, _recorder) = start(&backend, SynchronizationStrategy::ChannelsList).await;
    let channel = client
        .channels_list()
        .await
        .unwrap()
        .channel_with_sid(&sid("CH1"))
        .await
        .unwrap();

    backend.reject("fetch_messages");
    assert!(channel.synchronize().await.is_err());
    assert_eq!(channel.synchronization_status().await.unwrap(), ChannelSyncStatus::Failed);

    assert!(matches!(channel.members().await, Err(ChatError::InvalidState(_))));
    assert!(matches!(
        channel.member_with_identity(&Identity::new("bob")).await,
        Err(ChatError::InvalidState(_))
    ));
    let messages = channel.messages();
    assert!(matches!(
        messages.message_with_index(40).await,
        Err(ChatError::InvalidState(_))
    ));
    assert!(matches!(
        messages.message_for_consumption_index(0).await,
        Err(ChatError::InvalidState(_))
    ));
    assert!(matches!(
        messages.last_consumed_message_index().await,
        Err(ChatError::InvalidState(_))
    ));
    client.shutdown().await;
}

// ===========================================
// Message window
// ===========================================

#[tokio::test]
async fn overlapping_fetches_merge_into_one_range() {
    let (backend, client, _recorder, channel) = synced_general().await;
    let messages = channel.messages();
    assert_eq!(backend.fetches(), 1);

    let first = messages.get_before(20, 11).await.unwrap();
    assert_eq!(indices(&first), (10..=20).collect::<Vec<_>>());
    let second = messages.get_before(25, 11).await.unwrap();
    assert_eq!(indices(&second), (15..=25).collect::<Vec<_>>());
    assert_eq!(backend.fetches(), 3);

    // 10..25 is now one covered range and served without a fetch.
    let merged = messages.get_after(10, 16).await.unwrap();
    assert_eq!(indices(&merged), (10..=25).collect::<Vec<_>>());
    assert_eq!(backend.fetches(), 3);

    // Fetching an already covered range again changes nothing.
    assert_eq!(messages.get_before(20, 11).await.unwrap(), first);
    assert_eq!(backend.fetches(), 3);
    client.shutdown().await;
}

#[tokio::test]
async fn range_queries_are_ascending_without_duplicates() {
    let (_backend, client, _recorder, channel) = synced_general().await;
    let messages = channel.messages();

    let queries = [
        messages.get_last(8).await.unwrap(),
        messages.get_before(36, 10).await.unwrap(),
        messages.get_after(30, 12).await.unwrap(),
        messages.get_before(3, 10).await.unwrap(),
        messages.get_last(50).await.unwrap(),
    ];
    for result in &queries {
        assert_strictly_ascending(result);
    }
    assert_eq!(indices(&queries[0]), (33..=40).collect::<Vec<_>>());
    assert_eq!(indices(&queries[1]), (27..=36).collect::<Vec<_>>());
    assert_eq!(indices(&queries[2]), (30..=40).collect::<Vec<_>>());
    assert_eq!(indices(&queries[3]), (0..=3).collect::<Vec<_>>());
    assert_eq!(queries[4].len(), 41);
    client.shutdown().await;
}

#[tokio::test]
async fn point_lookups_are_cache_only() {
    let (backend, client, _recorder, channel) = synced_general().await;
    let messages = channel.messages();
    let fetches = backend.fetches();

    assert_eq!(messages.message_with_index(38).await.unwrap().unwrap().index, 38);
    assert_eq!(messages.message_with_index(10).await.unwrap(), None);
    assert_eq!(
        messages.message_for_consumption_index(20).await.unwrap().unwrap().index,
        36
    );
    assert_eq!(messages.message_for_consumption_index(41).await.unwrap(), None);
    assert_eq!(backend.fetches(), fetches);
    client.shutdown().await;
}

#[tokio::test]
async fn consumption_horizon_only_advances_forward() {
    let (backend, client, _recorder, channel) = synced_general().await;
    let messages = channel.messages();

    assert_eq!(messages.set_last_consumed_message_index(5).await.unwrap(), Some(5));
    assert_eq!(messages.advance_last_consumed_message_index(3).await.unwrap(), Some(5));
    assert_eq!(messages.advance_last_consumed_message_index(7).await.unwrap(), Some(7));
    assert_eq!(messages.set_last_consumed_message_index(5).await.unwrap(), Some(5));
    assert_eq!(messages.advance_last_consumed_message_index(5).await.unwrap(), Some(5));
    assert_eq!(messages.last_consumed_message_index().await.unwrap(), Some(5));

    // Uses the newest cached index.
    assert_eq!(messages.set_all_messages_consumed().await.unwrap(), Some(40));
    assert_eq!(messages.set_no_messages_consumed().await.unwrap(), None);

    // 5, 7, 5, 40, none: one request per change.
    let backend = &backend;
    common::eventually(|| async move { backend.count("set_consumption") == 5 }).await;
    client.shutdown().await;
}

#[tokio::test]
async fn consumption_horizon_starts_from_the_roster() {
    let backend = general().with_consumed("CH1", ME, 12);
    let (client, recorder) = start(&backend, SynchronizationStrategy::ChannelsList).await;
    let channel = client
        .channels_list()
        .await
        .unwrap()
        .channel_with_sid(&sid("CH1"))
        .await
        .unwrap();
    channel.synchronize().await.unwrap();
    let messages = channel.messages();

    assert_eq!(messages.last_consumed_message_index().await.unwrap(), Some(12));
    assert_eq!(messages.advance_last_consumed_message_index(3).await.unwrap(), Some(12));
    assert_eq!(backend.count("set_consumption"), 0);

    assert_eq!(messages.advance_last_consumed_message_index(20).await.unwrap(), Some(20));
    let me = channel
        .member_with_identity(&Identity::new(ME))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(me.last_consumed, Some(20));
    assert_eq!(
        recorder.count(|e| matches!(
            e,
            ChatEvent::MemberChanged { member, .. } if member.last_consumed == Some(20)
        )),
        1
    );

    let backend = &backend;
    common::eventually(|| async move { backend.count("set_consumption") == 1 }).await;
    client.shutdown().await;
}

#[tokio::test]
async fn failed_send_leaves_cache_unchanged() {
    let (backend, client, recorder, channel) = synced_general().await;
    let messages = channel.messages();
    let before = messages.get_last(5).await.unwrap();

    let pending = messages.create_message("hello");
    assert_eq!(messages.message_with_index(41).await.unwrap(), None);

    backend.transport.fail_next_send("network down");
    assert!(matches!(
        messages.send(pending).await,
        Err(ChatError::Transport(_))
    ));

    assert_eq!(messages.get_last(5).await.unwrap(), before);
    assert_eq!(messages.message_with_index(41).await.unwrap(), None);
    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::MessageAdded { .. })),
        0
    );
    client.shutdown().await;
}

#[tokio::test]
async fn send_inserts_confirmed_message_once() {
    let (backend, client, recorder, channel) = synced_general().await;
    let messages = channel.messages();

    let sent = messages
        .send(messages.create_message("hello").with_attributes(json!({ "k": 1 })))
        .await
        .unwrap();
    assert_eq!(sent.index, 41);
    assert_eq!(sent.attributes, json!({ "k": 1 }));
    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::MessageAdded { .. })),
        1
    );

    // The realtime echo of our own send is not a second message.
    backend.transport.push_event(RawEvent::for_channel(
        "message_added",
        &sid("CH1"),
        serde_json::to_value(&sent).unwrap(),
    ));
    backend.transport.push_event(RawEvent::for_channel(
        "typing_started",
        &sid("CH1"),
        json!({ "identity": "bob" }),
    ));
    recorder
        .wait_for(|e| matches!(e, ChatEvent::TypingStarted { .. }))
        .await;
    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::MessageAdded { .. })),
        1
    );

    let fetches = backend.fetches();
    assert_eq!(indices(&messages.get_last(2).await.unwrap()), vec![40, 41]);
    assert_eq!(backend.fetches(), fetches);
    client.shutdown().await;
}

#[tokio::test]
async fn remote_messages_arrive_through_events() {
    let (backend, client, recorder, channel) = synced_general().await;
    let remote = backend.append_remote("CH1", "from bob");

    backend.transport.push_event(RawEvent::for_channel(
        "message_added",
        &sid("CH1"),
        serde_json::to_value(&remote).unwrap(),
    ));
    recorder
        .wait_for(|e| matches!(e, ChatEvent::MessageAdded { message, .. } if message.index == 41))
        .await;

    let cached = channel.messages().message_with_index(41).await.unwrap().unwrap();
    assert_eq!(cached.body, "from bob");

    backend.transport.push_event(RawEvent::for_channel(
        "message_removed",
        &sid("CH1"),
        json!({ "index": 41 }),
    ));
    recorder
        .wait_for(|e| matches!(e, ChatEvent::MessageDeleted { .. }))
        .await;
    assert_eq!(channel.messages().message_with_index(41).await.unwrap(), None);
    client.shutdown().await;
}

#[tokio::test]
async fn remove_and_edit_are_backend_confirmed() {
    let (backend, client, recorder, channel) = synced_general().await;
    let messages = channel.messages();

    let newest = messages.message_with_index(40).await.unwrap().unwrap();
    messages.remove(&newest).await.unwrap();
    assert_eq!(messages.message_with_index(40).await.unwrap(), None);
    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::MessageDeleted { .. })),
        1
    );

    // Only cached messages can be removed.
    assert!(matches!(
        messages.remove(&message(3, "old")).await,
        Err(ChatError::NotFound(_))
    ));
    assert_eq!(backend.count("remove_message"), 1);

    let edited = messages.update_body(39, "edited").await.unwrap();
    assert_eq!(edited.body, "edited");
    assert_eq!(messages.message_with_index(39).await.unwrap().unwrap().body, "edited");
    assert_eq!(
        recorder.count(|e| matches!(
            e,
            ChatEvent::MessageChanged { message, .. } if message.body == "edited"
        )),
        1
    );

    let attributed = messages
        .set_message_attributes(38, json!({ "pinned": true }))
        .await
        .unwrap();
    assert_eq!(attributed.attributes, json!({ "pinned": true }));
    client.shutdown().await;
}

#[tokio::test]
async fn lost_session_seals_open_coverage() {
    let (backend, client, recorder, channel) = synced_general().await;
    let messages = channel.messages();

    backend.transport.push_event(RawEvent::new(
        "session_lost",
        json!({ "reason": "socket closed" }),
    ));
    recorder
        .wait_for(|e| *e == ChatEvent::ConnectionStateChanged(ConnectionState::Disconnected))
        .await;

    // Cached messages stay readable but the newest end must be re-fetched.
    assert!(messages.message_with_index(40).await.unwrap().is_some());
    let fetches = backend.fetches();
    messages.get_last(3).await.unwrap();
    assert_eq!(backend.fetches(), fetches + 1);

    backend.transport.push_event(RawEvent::new("session_restored", json!(null)));
    recorder
        .wait_for(|e| *e == ChatEvent::ConnectionStateChanged(ConnectionState::Connected))
        .await;
    client.shutdown().await;
}

// ===========================================
// Interleaving
// ===========================================

fn is_fetch(request: &Request) -> bool {
    matches!(request, Request::FetchMessages { .. })
}

#[tokio::test]
async fn messages_arriving_during_sync_are_kept() {
    let backend = general();
    let (client, recorder) = start(&backend, SynchronizationStrategy::ChannelsList).await;
    let backend = &backend;
    let channel = client
        .channels_list()
        .await
        .unwrap()
        .channel_with_sid(&sid("CH1"))
        .await
        .unwrap();

    backend.transport.hold_responses_matching(is_fetch);
    let syncing = tokio::spawn({
        let channel = channel.clone();
        async move { channel.synchronize().await }
    });
    common::eventually(|| async move { backend.fetches() == 1 }).await;

    // The load's page ends at 40; 41 is announced while it is in flight.
    let late = backend.append_remote("CH1", "late");
    backend.transport.push_event(RawEvent::for_channel(
        "message_added",
        &sid("CH1"),
        serde_json::to_value(&late).unwrap(),
    ));
    backend.transport.push_event(RawEvent::for_channel(
        "typing_started",
        &sid("CH1"),
        json!({ "identity": "bob" }),
    ));
    recorder
        .wait_for(|e| matches!(e, ChatEvent::TypingStarted { .. }))
        .await;

    backend.transport.release_responses();
    syncing.await.unwrap().unwrap();

    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::MessageAdded { message, .. } if message.index == 41)),
        1
    );
    let messages = channel.messages();
    assert_eq!(indices(&messages.get_last(5).await.unwrap()), vec![37, 38, 39, 40, 41]);
    assert_eq!(backend.fetches(), 1);
    client.shutdown().await;
}

#[tokio::test]
async fn removal_during_a_fetch_is_not_undone() {
    let (backend, client, recorder, channel) = synced_general().await;
    let backend = &backend;
    let messages = channel.messages();

    backend.transport.hold_responses_matching(is_fetch);
    let page = tokio::spawn({
        let messages = messages.clone();
        async move { messages.get_before(38, 10).await }
    });
    common::eventually(|| async move { backend.fetches() == 2 }).await;

    // The held page was read on the backend before either removal.
    let doomed = messages.message_with_index(38).await.unwrap().unwrap();
    messages.remove(&doomed).await.unwrap();
    backend.transport.push_event(RawEvent::for_channel(
        "message_removed",
        &sid("CH1"),
        json!({ "index": 37 }),
    ));
    recorder
        .wait_for(|e| matches!(e, ChatEvent::MessageDeleted { message, .. } if message.index == 37))
        .await;

    backend.transport.release_responses();
    let page = page.await.unwrap().unwrap();
    assert_eq!(indices(&page), (29..=36).collect::<Vec<_>>());
    assert_eq!(messages.message_with_index(38).await.unwrap(), None);
    assert_eq!(messages.message_with_index(37).await.unwrap(), None);

    // The gap is known to be empty: answered from cache.
    assert_eq!(indices(&messages.get_after(36, 5).await.unwrap()), vec![36, 39, 40]);
    assert_eq!(backend.fetches(), 2);
    client.shutdown().await;
}

#[tokio::test]
async fn concurrent_fetches_merge_in_any_completion_order() {
    let (backend, client, _recorder, channel) = synced_general().await;
    let backend = &backend;
    let messages = channel.messages();

    backend.transport.hold_responses_matching(is_fetch);
    let older = tokio::spawn({
        let messages = messages.clone();
        async move { messages.get_before(20, 11).await }
    });
    let newer = tokio::spawn({
        let messages = messages.clone();
        async move { messages.get_before(25, 11).await }
    });
    common::eventually(|| async move { backend.fetches() == 3 }).await;
    backend.transport.release_responses();

    let older = older.await.unwrap().unwrap();
    let newer = newer.await.unwrap().unwrap();
    assert_eq!(indices(&older), (10..=20).collect::<Vec<_>>());
    assert_eq!(indices(&newer), (15..=25).collect::<Vec<_>>());

    let merged = messages.get_after(10, 16).await.unwrap();
    assert_eq!(indices(&merged), (10..=25).collect::<Vec<_>>());
    assert_eq!(backend.fetches(), 3);
    client.shutdown().await;
}

// ===========================================
// Channels
// ===========================================

#[tokio::test]
async fn destroyed_channel_is_gone() {
    let (_backend, client, recorder, channel) = synced_general().await;
    let list = client.channels_list().await.unwrap();

    channel.destroy().await.unwrap();

    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::ChannelDeleted(s) if s.sid().as_str() == "CH1")),
        1
    );
    assert!(list.channel_with_sid(&sid("CH1")).await.is_none());
    assert!(matches!(channel.members().await, Err(ChatError::NotFound(_))));
    assert!(matches!(
        channel.member_with_identity(&Identity::new("bob")).await,
        Err(ChatError::NotFound(_))
    ));
    assert!(matches!(
        channel.messages().get_last(5).await,
        Err(ChatError::NotFound(_))
    ));
    assert!(matches!(
        channel.messages().message_with_index(40).await,
        Err(ChatError::NotFound(_))
    ));
    assert!(matches!(channel.snapshot().await, Err(ChatError::NotFound(_))));
    client.shutdown().await;
}

#[tokio::test]
async fn created_channel_is_listed_before_create_returns() {
    let backend = general();
    let (client, recorder) = start(&backend, SynchronizationStrategy::ChannelsList).await;
    let list = client.channels_list().await.unwrap();

    let channel = list
        .create_channel(
            ChannelOptions::new()
                .with_friendly_name("Project")
                .with_unique_name("project"),
        )
        .await
        .unwrap();

    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::ChannelAdded(s) if s.sid() == channel.sid())),
        1
    );
    assert_eq!(channel.friendly_name().await.unwrap().as_deref(), Some("Project"));
    assert!(channel
        .synchronization_status()
        .await
        .unwrap()
        .at_least(ChannelSyncStatus::Metadata));
    let by_name = list.channel_with_unique_name("project").await.unwrap();
    assert_eq!(by_name.sid(), channel.sid());
    client.shutdown().await;
}

#[tokio::test]
async fn metadata_updates_are_backend_confirmed() {
    let backend = general();
    let (client, recorder) = start(&backend, SynchronizationStrategy::ChannelsList).await;
    let channel = client
        .channels_list()
        .await
        .unwrap()
        .channel_with_sid(&sid("CH1"))
        .await
        .unwrap();

    backend.reject("update_channel");
    assert!(channel.set_friendly_name("Renamed").await.is_err());
    assert_eq!(channel.friendly_name().await.unwrap().as_deref(), Some("General"));

    backend.accept("update_channel");
    channel.set_friendly_name("Renamed").await.unwrap();
    channel.set_attributes(json!({ "topic": "rust" })).await.unwrap();
    assert_eq!(channel.friendly_name().await.unwrap().as_deref(), Some("Renamed"));
    assert_eq!(channel.attributes().await.unwrap(), json!({ "topic": "rust" }));
    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::ChannelChanged(_))),
        2
    );
    client.shutdown().await;
}

#[tokio::test]
async fn joining_a_channel_updates_status() {
    let backend = general().with_foreign_channel("CH9").with_members("CH9", &["bob"]);
    let (client, _recorder) = start(&backend, SynchronizationStrategy::All).await;
    let channel = client
        .channels_list()
        .await
        .unwrap()
        .channel_with_sid(&sid("CH9"))
        .await
        .unwrap();
    assert_eq!(channel.status().await.unwrap(), ChannelStatus::NotParticipating);

    channel.join().await.unwrap();
    assert_eq!(channel.status().await.unwrap(), ChannelStatus::Joined);

    // Joined channels are kept synchronized under the `all` strategy.
    let channel = &channel;
    common::eventually(|| async move {
        channel.synchronization_status().await.ok() == Some(ChannelSyncStatus::All)
    })
    .await;

    channel.leave().await.unwrap();
    assert_eq!(channel.status().await.unwrap(), ChannelStatus::NotParticipating);
    client.shutdown().await;
}

#[tokio::test]
async fn inbound_channel_events_update_directory() {
    let backend = general();
    let (client, recorder) = start(&backend, SynchronizationStrategy::ChannelsList).await;

    backend.transport.push_event(RawEvent::new(
        "channel_added",
        json!({ "sid": "CH5", "friendly_name": "Fresh" }),
    ));
    recorder
        .wait_for(|e| matches!(e, ChatEvent::ChannelAdded(s) if s.sid().as_str() == "CH5"))
        .await;

    backend.transport.push_event(RawEvent::for_channel(
        "channel_deleted",
        &sid("CH5"),
        json!(null),
    ));
    recorder
        .wait_for(|e| matches!(e, ChatEvent::ChannelDeleted(s) if s.sid().as_str() == "CH5"))
        .await;

    let list = client.channels_list().await.unwrap();
    assert!(list.channel_with_sid(&sid("CH5")).await.is_none());
    client.shutdown().await;
}

#[tokio::test]
async fn being_added_to_an_unlisted_channel_registers_it() {
    let backend = general();
    let (client, recorder) = start(&backend, SynchronizationStrategy::ChannelsList).await;

    backend.add_channel("CH7", "Lobby");
    backend.transport.push_event(RawEvent::for_channel(
        "member_joined",
        &sid("CH7"),
        json!({ "user": { "identity": ME } }),
    ));
    recorder
        .wait_for(|e| matches!(e, ChatEvent::ChannelAdded(s) if s.sid().as_str() == "CH7"))
        .await;

    let channel = client
        .channels_list()
        .await
        .unwrap()
        .channel_with_sid(&sid("CH7"))
        .await
        .unwrap();
    assert_eq!(
        channel.synchronization_status().await.unwrap(),
        ChannelSyncStatus::Identifier
    );
    assert_eq!(channel.status().await.unwrap(), ChannelStatus::Joined);

    channel.synchronize().await.unwrap();
    assert_eq!(backend.count("fetch_channel"), 1);
    assert_eq!(channel.friendly_name().await.unwrap().as_deref(), Some("Lobby"));
    assert_eq!(
        channel_statuses(&recorder, "CH7"),
        vec![ChannelSyncStatus::Metadata, ChannelSyncStatus::All]
    );
    client.shutdown().await;
}

#[tokio::test]
async fn malformed_events_are_reported_and_ignored() {
    let backend = general();
    let (client, recorder) = start(&backend, SynchronizationStrategy::ChannelsList).await;

    backend
        .transport
        .push_event(RawEvent::new("message_added", json!({ "index": 1 })));
    backend.transport.push_event(RawEvent::new("mystery", json!({})));
    let recorder = &recorder;
    common::eventually(|| async move {
        recorder.count(|e| matches!(e, ChatEvent::Error(_))) == 2
    })
    .await;

    let list = client.channels_list().await.unwrap();
    assert_eq!(list.channels().await.len(), 1);
    client.shutdown().await;
}

// ===========================================
// Members and users
// ===========================================

#[tokio::test]
async fn friendly_name_is_shared_across_channels() {
    let backend = general()
        .with_channel("CH2", "Random")
        .with_members("CH2", &[ME, "bob"]);
    let (client, recorder) = start(&backend, SynchronizationStrategy::All).await;
    let list = client.channels_list().await.unwrap();
    let ch1 = list.channel_with_sid(&sid("CH1")).await.unwrap();
    let ch2 = list.channel_with_sid(&sid("CH2")).await.unwrap();

    backend.transport.push_event(RawEvent::new(
        "user_info_updated",
        json!({
            "user": { "identity": "bob", "friendly_name": "Bobby" },
            "update": "friendly_name"
        }),
    ));
    let recorder = &recorder;
    common::eventually(|| async move {
        recorder.count(|e| matches!(e, ChatEvent::MemberUserInfoUpdated { .. })) == 2
    })
    .await;

    let bob = Identity::new("bob");
    for channel in [&ch1, &ch2] {
        let member = channel.member_with_identity(&bob).await.unwrap().unwrap();
        assert_eq!(member.user.friendly_name.as_deref(), Some("Bobby"));
    }
    // Not the local user.
    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::UserInfoUpdated { .. })),
        0
    );
    client.shutdown().await;
}

#[tokio::test]
async fn member_events_maintain_roster() {
    let (backend, client, recorder, channel) = synced_general().await;

    backend.transport.push_event(RawEvent::for_channel(
        "member_joined",
        &sid("CH1"),
        json!({ "user": { "identity": "carol" } }),
    ));
    recorder
        .wait_for(|e| matches!(e, ChatEvent::MemberJoined { member, .. } if member.identity.as_str() == "carol"))
        .await;

    backend.transport.push_event(RawEvent::for_channel(
        "member_updated",
        &sid("CH1"),
        json!({ "user": { "identity": "carol" }, "last_consumed_message_index": 12 }),
    ));
    recorder
        .wait_for(|e| matches!(e, ChatEvent::MemberChanged { member, .. } if member.last_consumed == Some(12)))
        .await;

    backend.transport.push_event(RawEvent::for_channel(
        "member_left",
        &sid("CH1"),
        json!({ "identity": "bob" }),
    ));
    recorder
        .wait_for(|e| matches!(e, ChatEvent::MemberLeft { .. }))
        .await;

    let identities: Vec<String> = channel
        .members()
        .await
        .unwrap()
        .into_iter()
        .map(|m| m.identity.to_string())
        .collect();
    assert_eq!(identities, vec!["alice", "carol"]);
    client.shutdown().await;
}

#[tokio::test]
async fn member_events_carry_user_info_changes() {
    let backend = general()
        .with_channel("CH2", "Random")
        .with_members("CH2", &[ME, "bob"]);
    let (client, recorder) = start(&backend, SynchronizationStrategy::All).await;

    backend.transport.push_event(RawEvent::for_channel(
        "member_updated",
        &sid("CH1"),
        json!({ "user": { "identity": "bob", "friendly_name": "Bobby" } }),
    ));
    let recorder = &recorder;
    common::eventually(|| async move {
        recorder.count(|e| matches!(
            e,
            ChatEvent::MemberUserInfoUpdated { update: UserInfoUpdate::FriendlyName, .. }
        )) == 2
    })
    .await;
    // Bob's consumption index did not move.
    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::MemberChanged { .. })),
        0
    );

    let ch2 = client
        .channels_list()
        .await
        .unwrap()
        .channel_with_sid(&sid("CH2"))
        .await
        .unwrap();
    let bob = ch2
        .member_with_identity(&Identity::new("bob"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(bob.user.friendly_name.as_deref(), Some("Bobby"));
    client.shutdown().await;
}

#[tokio::test]
async fn local_user_info_updates() {
    let backend = general();
    let (client, recorder) = start(&backend, SynchronizationStrategy::All).await;
    assert_eq!(client.user_info().await.unwrap().identity.as_str(), ME);
    assert!(!client.is_reachability_enabled().await);

    client.set_user_friendly_name("Alice").await.unwrap();
    assert_eq!(
        client.user_info().await.unwrap().friendly_name.as_deref(),
        Some("Alice")
    );
    assert_eq!(
        recorder.count(|e| matches!(
            e,
            ChatEvent::UserInfoUpdated { update: UserInfoUpdate::FriendlyName, .. }
        )),
        1
    );
    // Alice is a member of CH1.
    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::MemberUserInfoUpdated { .. })),
        1
    );
    client.shutdown().await;
}

#[tokio::test]
async fn typing_is_forwarded() {
    let (backend, client, recorder, channel) = synced_general().await;
    channel.typing().await.unwrap();
    assert_eq!(backend.count("typing"), 1);

    backend.transport.push_event(RawEvent::for_channel(
        "typing_ended",
        &sid("CH1"),
        json!({ "identity": "bob" }),
    ));
    recorder
        .wait_for(|e| matches!(e, ChatEvent::TypingEnded { member, .. } if member.identity.as_str() == "bob"))
        .await;
    client.shutdown().await;
}

// ===========================================
// Observers
// ===========================================

#[derive(Default)]
struct MessageCounter {
    added: std::sync::atomic::AtomicUsize,
}

impl ChatObserver for MessageCounter {
    fn on_message_added(&self, _channel: &ChannelSid, _message: &chatsync_client::Message) {
        self.added.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[tokio::test]
async fn channel_observers_are_scoped_and_weak() {
    let backend = general()
        .with_channel("CH2", "Random")
        .with_members("CH2", &[ME]);
    let (client, _recorder) = start(&backend, SynchronizationStrategy::All).await;
    let list = client.channels_list().await.unwrap();
    let ch1 = list.channel_with_sid(&sid("CH1")).await.unwrap();
    let ch2 = list.channel_with_sid(&sid("CH2")).await.unwrap();

    let counter = Arc::new(MessageCounter::default());
    let observer: Arc<dyn ChatObserver> = counter.clone();
    let subscription = ch1.subscribe(&observer);

    ch1.messages()
        .send(ch1.messages().create_message("one"))
        .await
        .unwrap();
    ch2.messages()
        .send(ch2.messages().create_message("elsewhere"))
        .await
        .unwrap();
    assert_eq!(counter.added.load(std::sync::atomic::Ordering::SeqCst), 1);

    drop(subscription);
    ch1.messages()
        .send(ch1.messages().create_message("two"))
        .await
        .unwrap();
    assert_eq!(counter.added.load(std::sync::atomic::Ordering::SeqCst), 1);
    client.shutdown().await;
}

#[tokio::test]
async fn no_callbacks_after_shutdown() {
    let (backend, client, recorder, channel) = synced_general().await;
    let messages = channel.messages();

    backend.transport.hold_responses();
    let in_flight = tokio::spawn({
        let messages = messages.clone();
        async move { messages.send(messages.create_message("stuck")).await }
    });
    let backend = &backend;
    common::eventually(|| async move { backend.count("send_message") == 1 }).await;

    client.shutdown().await;
    let last = recorder.events().last().cloned();
    assert_eq!(
        last,
        Some(ChatEvent::ConnectionStateChanged(ConnectionState::Disconnected))
    );
    let seen = recorder.len();

    backend.transport.release_responses();
    backend.transport.push_event(RawEvent::for_channel(
        "typing_started",
        &sid("CH1"),
        json!({ "identity": "bob" }),
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(recorder.len(), seen);
    assert!(matches!(
        in_flight.await.unwrap(),
        Err(ChatError::InvalidState(_))
    ));
    assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    assert!(matches!(
        client.channels_list().await,
        Err(ChatError::InvalidState(_))
    ));
}

// ===========================================
// Push
// ===========================================

#[tokio::test]
async fn push_registration_is_reported() {
    let backend = general();
    let push = MockPush::new();
    let recorder = Arc::new(Recorder::default());
    let client = ChatClient::builder(Credentials::new(ME, "token"), backend.transport.clone())
        .push(push.clone())
        .observer(recorder.clone())
        .initialize()
        .unwrap();

    client.register_push_token(b"device").await.unwrap();
    assert_eq!(push.registered(), vec![b"device".to_vec()]);
    assert_eq!(recorder.count(|e| *e == ChatEvent::ToastSubscribed), 1);

    push.fail_next_register("apns down");
    assert!(client.register_push_token(b"other").await.is_err());
    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::ToastRegistrationFailed(_))),
        1
    );

    client.deregister_push_token(b"device").await.unwrap();
    assert!(push.registered().is_empty());
    client.shutdown().await;
}

#[tokio::test]
async fn push_without_registrar_is_rejected() {
    let backend = general();
    let (client, _recorder) = start(&backend, SynchronizationStrategy::ChannelsList).await;
    assert!(matches!(
        client.register_push_token(b"device").await,
        Err(ChatError::InvalidState(_))
    ));
    client.shutdown().await;
}

#[tokio::test]
async fn notifications_load_the_message_for_synced_channels() {
    let (backend, client, recorder, _channel) = synced_general().await;
    let fetches = backend.fetches();

    client
        .handle_notification(json!({ "channel_sid": "CH1", "message_index": 20 }))
        .await
        .unwrap();
    recorder
        .wait_for(|e| matches!(e, ChatEvent::ToastReceived { message: Some(m), .. } if m.index == 20))
        .await;
    assert_eq!(backend.fetches(), fetches + 1);

    // Cached now; no second fetch.
    client
        .handle_notification(json!({ "channel_sid": "CH1", "message_index": 20 }))
        .await
        .unwrap();
    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::ToastReceived { message: Some(_), .. })),
        2
    );
    assert_eq!(backend.fetches(), fetches + 1);

    assert!(client.handle_notification(json!({ "aps": {} })).await.is_err());
    client.shutdown().await;
}

#[tokio::test]
async fn notifications_for_unsynced_channels_leave_cache_alone() {
    let backend = general();
    let (client, recorder) = start(&backend, SynchronizationStrategy::ChannelsList).await;

    client
        .handle_notification(json!({ "channel_sid": "CH1", "message_index": 7 }))
        .await
        .unwrap();
    assert_eq!(
        recorder.count(|e| matches!(
            e,
            ChatEvent::ToastReceived { message: None, message_index: Some(7), .. }
        )),
        1
    );
    assert_eq!(backend.fetches(), 0);
    client.shutdown().await;
}

// ===========================================
// Persistence
// ===========================================

#[tokio::test]
async fn cached_channels_are_reconciled_with_the_backend() {
    let backend = general();
    let mut stale = chatsync_client::ChannelDescriptor::new(sid("CHOLD"));
    stale.status = ChannelStatus::Joined;
    let store = MemoryStore::new()
        .with_channel(stale)
        .with_messages(&sid("CHOLD"), vec![message(0, "old")]);

    let recorder = Arc::new(Recorder::default());
    let client = ChatClient::builder(Credentials::new(ME, "token"), backend.transport.clone())
        .properties(common::properties(SynchronizationStrategy::ChannelsList))
        .persistence(store.clone())
        .observer(recorder.clone())
        .initialize()
        .unwrap();
    recorder
        .wait_for(|e| *e == ChatEvent::SynchronizationStatusChanged(ClientSyncStatus::Completed))
        .await;

    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::ChannelDeleted(s) if s.sid().as_str() == "CHOLD")),
        1
    );
    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::ChannelAdded(s) if s.sid().as_str() == "CH1")),
        1
    );

    let channel = client
        .channels_list()
        .await
        .unwrap()
        .channel_with_sid(&sid("CH1"))
        .await
        .unwrap();
    channel.synchronize().await.unwrap();

    // Shutdown flushes pending writes.
    client.shutdown().await;
    assert_eq!(store.channel_sids(), vec![sid("CH1")]);
    assert_eq!(store.message_indices(&sid("CH1")), vec![36, 37, 38, 39, 40]);
    assert!(store.message_indices(&sid("CHOLD")).is_empty());
}

#[tokio::test]
async fn restored_channels_are_available_after_listing() {
    let backend = general();
    let store = MemoryStore::new()
        .with_channel({
            let mut desc = chatsync_client::ChannelDescriptor::new(sid("CH1"));
            desc.friendly_name = Some("General".into());
            desc.unique_name = Some("general".into());
            desc.status = ChannelStatus::Joined;
            desc
        })
        .with_messages(&sid("CH1"), vec![message(1, "cached")]);

    let recorder = Arc::new(Recorder::default());
    let client = ChatClient::builder(Credentials::new(ME, "token"), backend.transport.clone())
        .properties(common::properties(SynchronizationStrategy::ChannelsList))
        .persistence(store)
        .observer(recorder.clone())
        .initialize()
        .unwrap();
    recorder
        .wait_for(|e| *e == ChatEvent::SynchronizationStatusChanged(ClientSyncStatus::Completed))
        .await;

    // Same metadata as the backend: no added or changed notification.
    assert_eq!(
        recorder.count(|e| matches!(e, ChatEvent::ChannelAdded(_) | ChatEvent::ChannelChanged(_))),
        0
    );

    let channel = client
        .channels_list()
        .await
        .unwrap()
        .channel_with_sid(&sid("CH1"))
        .await
        .unwrap();
    // Restored messages are not served before the channel synchronizes.
    assert!(matches!(
        channel.messages().message_with_index(1).await,
        Err(ChatError::InvalidState(_))
    ));
    channel.synchronize().await.unwrap();
    let cached = channel.messages().message_with_index(1).await.unwrap().unwrap();
    assert_eq!(cached.body, "cached");
    client.shutdown().await;
}

#[tokio::test]
async fn requests_carry_the_anchor() {
    let (backend, client, _recorder, channel) = synced_general().await;
    channel.messages().get_after(2, 3).await.unwrap();

    let last = backend
        .transport
        .sent_requests()
        .into_iter()
        .rev()
        .find(|r| matches!(r, Request::FetchMessages { .. }));
    assert_eq!(
        last,
        Some(Request::FetchMessages {
            channel: sid("CH1"),
            anchor: chatsync_types::Anchor::After(2),
            count: 3,
        })
    );
    client.shutdown().await;
}
