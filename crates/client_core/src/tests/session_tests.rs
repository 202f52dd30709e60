use shared::protocol::MessageStatus;

use super::*;

#[path = "support.rs"]
mod support;

use support::*;

fn test_env(
    transport: Arc<TestTransport>,
    store: Arc<MemoryStore>,
    directory: Arc<TestDirectory>,
) -> Arc<SessionEnv> {
    let profiles = Arc::new(ProfileCache::new(UserId::from("1"), directory));
    SessionEnv::new(
        profiles,
        transport,
        Arc::clone(&store) as Arc<dyn shared::cache::SessionCache>,
        store,
    )
}

fn default_env() -> Arc<SessionEnv> {
    test_env(
        TestTransport::confirming(),
        MemoryStore::new(),
        TestDirectory::with_profiles(vec![("2", "Bea")]),
    )
}

fn direct_session(env: &Arc<SessionEnv>) -> Arc<Session> {
    Session::new(
        SessionId::from("1_2"),
        SessionKind::Direct,
        UserId::from("2"),
        Arc::clone(env),
    )
}

fn stream_wire(cli_mid: &str, seq: i64, content: &str, status: MessageStatus) -> WireMessage {
    WireMessage {
        mid: 7,
        cli_mid: cli_mid.to_string(),
        seq,
        from: UserId::from("bot"),
        to: UserId::from("1"),
        content: content.to_string(),
        kind: MessageKind::StreamText,
        status,
        send_at: 1_000,
    }
}

#[tokio::test]
async fn send_upgrades_pending_to_confirmed_in_place() {
    let store = MemoryStore::new();
    let env = test_env(
        TestTransport::confirming(),
        Arc::clone(&store),
        TestDirectory::with_profiles(vec![("2", "Bea")]),
    );
    let session = direct_session(&env);

    let sent = session.send_text("hi").await.expect("send");

    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].client_id, sent.client_id);
    assert_eq!(messages[0].client_id.as_str().len(), 32);
    assert_eq!(messages[0].server_id, 42);
    assert_eq!(messages[0].sequence, 1);
    assert_eq!(messages[0].delivery, DeliveryState::Sent);

    let stored = store
        .stored_message(sent.client_id.as_str())
        .await
        .expect("persisted");
    assert_eq!(stored.server_id, 42);

    let info = session.info().await;
    assert_eq!(info.last_message, "hi");
    assert_eq!(info.last_message_sender, "You");
    assert_eq!(info.unread_count, 0);
}

#[tokio::test]
async fn failed_send_keeps_pending_row_marked_failed() {
    let env = test_env(
        TestTransport::failing("wire down"),
        MemoryStore::new(),
        TestDirectory::with_profiles(vec![]),
    );
    let session = direct_session(&env);

    let result = session.send_text("hi").await;
    assert!(matches!(result, Err(CoreError::Transport { .. })));

    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].delivery, DeliveryState::Failed);
}

#[tokio::test]
async fn inbound_messages_sort_by_order_key() {
    let env = default_env();
    let session = direct_session(&env);

    for (cli, seq) in [("c-b", 2_i64), ("c-a", 1), ("c-c", 3)] {
        let mut wire = text_wire(cli, "2", "1", cli, 100);
        wire.seq = seq;
        session.on_inbound_message(&wire).await.expect("inbound");
    }

    let messages = session.messages().await;
    let seqs: Vec<i64> = messages.iter().map(|m| m.sequence).collect();
    assert_eq!(seqs, [1, 2, 3]);
    assert_eq!(messages.len(), 3);
}

#[tokio::test]
async fn duplicate_client_id_updates_in_place() {
    let env = default_env();
    let session = direct_session(&env);

    let mut first = text_wire("c-1", "2", "1", "one", 100);
    first.seq = 1;
    session.on_inbound_message(&first).await.expect("first");

    let mut second = text_wire("c-2", "2", "1", "two", 200);
    second.seq = 2;
    session.on_inbound_message(&second).await.expect("second");

    // Redeliver the first message with a later ordering key; it must update
    // in place and keep its original position.
    let mut retransmit = text_wire("c-1", "2", "1", "one, edited", 300);
    retransmit.seq = 9;
    session.on_inbound_message(&retransmit).await.expect("dup");

    let messages = session.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].client_id.as_str(), "c-1");
    assert_eq!(messages[0].body, "one, edited");
    assert_eq!(messages[1].client_id.as_str(), "c-2");
}

#[tokio::test]
async fn unread_counts_only_novel_foreign_unselected_messages() {
    let env = default_env();
    let session = direct_session(&env);

    // Own echo never counts.
    session
        .on_inbound_message(&text_wire("c-mine", "1", "2", "mine", 100))
        .await
        .expect("own");
    assert_eq!(session.unread_count().await, 0);

    // Foreign message on an unselected session counts once.
    session
        .on_inbound_message(&text_wire("c-1", "2", "1", "hello", 200))
        .await
        .expect("foreign");
    assert_eq!(session.unread_count().await, 1);

    // In-place update of a known message never counts.
    session
        .on_inbound_message(&text_wire("c-1", "2", "1", "hello again", 300))
        .await
        .expect("dup");
    assert_eq!(session.unread_count().await, 1);

    // Selected sessions absorb silently.
    *env.selected.write().await = Some(SessionId::from("1_2"));
    session
        .on_inbound_message(&text_wire("c-2", "2", "1", "more", 400))
        .await
        .expect("selected");
    assert_eq!(session.unread_count().await, 1);
}

#[tokio::test]
async fn clear_unread_is_idempotent() {
    let env = default_env();
    let session = direct_session(&env);

    session
        .on_inbound_message(&text_wire("c-1", "2", "1", "hello", 100))
        .await
        .expect("inbound");
    assert_eq!(session.unread_count().await, 1);

    session.clear_unread().await.expect("clear");
    assert_eq!(session.unread_count().await, 0);
    session.clear_unread().await.expect("clear again");
    assert_eq!(session.unread_count().await, 0);
}

#[tokio::test]
async fn clear_message_history_empties_memory_and_store() {
    let store = MemoryStore::new();
    let env = test_env(
        TestTransport::confirming(),
        Arc::clone(&store),
        TestDirectory::with_profiles(vec![("2", "Bea")]),
    );
    let session = direct_session(&env);

    session
        .on_inbound_message(&text_wire("c-1", "2", "1", "hello", 100))
        .await
        .expect("inbound");
    assert_eq!(store.message_count().await, 1);

    session.clear_message_history().await.expect("clear");
    assert!(session.messages().await.is_empty());
    assert_eq!(store.message_count().await, 0);
    assert_eq!(session.info().await.last_message, "-");
}

#[tokio::test]
async fn clear_history_failure_still_clears_memory() {
    let store = MemoryStore::new();
    let env = test_env(
        TestTransport::confirming(),
        Arc::clone(&store),
        TestDirectory::with_profiles(vec![]),
    );
    let session = direct_session(&env);

    session
        .on_inbound_message(&text_wire("c-1", "2", "1", "hello", 100))
        .await
        .expect("inbound");

    store.fail_writes(true);
    let result = session.clear_message_history().await;
    assert!(matches!(result, Err(CoreError::Persistence { .. })));
    assert!(session.messages().await.is_empty());
}

#[tokio::test]
async fn persistence_failure_on_inbound_surfaces_without_rollback() {
    let store = MemoryStore::new();
    let env = test_env(
        TestTransport::confirming(),
        Arc::clone(&store),
        TestDirectory::with_profiles(vec![]),
    );
    let session = direct_session(&env);

    store.fail_writes(true);
    let result = session
        .on_inbound_message(&text_wire("c-1", "2", "1", "hello", 100))
        .await;
    assert!(matches!(result, Err(CoreError::Persistence { .. })));
    assert_eq!(session.messages().await.len(), 1);
}

#[tokio::test]
async fn merged_message_round_trips_through_snapshot() {
    let env = default_env();
    let session = direct_session(&env);

    let mut wire = text_wire("c-1", "2", "1", "hello", 123);
    wire.seq = 5;
    session.on_inbound_message(&wire).await.expect("inbound");

    let messages = session.messages().await;
    assert_eq!(messages[0].client_id.as_str(), "c-1");
    assert_eq!(messages[0].body, "hello");
    assert_eq!(messages[0].order_key, 5);
}

#[tokio::test]
async fn message_history_returns_entries_before_bound() {
    let env = default_env();
    let session = direct_session(&env);

    assert!(session.message_history(None).await.is_empty());

    for (cli, seq) in [("c-1", 1_i64), ("c-2", 2), ("c-3", 3)] {
        let mut wire = text_wire(cli, "2", "1", cli, 100);
        wire.seq = seq;
        session.on_inbound_message(&wire).await.expect("inbound");
    }

    let all = session.message_history(None).await;
    assert_eq!(all.len(), 3);

    let older = session.message_history(Some(3)).await;
    let seqs: Vec<i64> = older.iter().map(|m| m.sequence).collect();
    assert_eq!(seqs, [1, 2]);
}

#[tokio::test]
async fn events_fire_for_new_messages_and_updates() {
    let env = default_env();
    let session = direct_session(&env);

    let mut messages_rx = session.subscribe_messages();
    let mut updates_rx = session.subscribe_updates();

    session
        .on_inbound_message(&text_wire("c-1", "2", "1", "hello", 100))
        .await
        .expect("inbound");

    let snapshot = tokio::time::timeout(Duration::from_secs(1), messages_rx.recv())
        .await
        .expect("timely")
        .expect("new message event");
    assert_eq!(snapshot.body, "hello");

    let info = tokio::time::timeout(Duration::from_secs(1), updates_rx.recv())
        .await
        .expect("timely")
        .expect("update event");
    assert_eq!(info.unread_count, 1);
    assert_eq!(info.last_message, "hello");

    // An in-place update emits only the session-updated event.
    session
        .on_inbound_message(&text_wire("c-1", "2", "1", "hello again", 200))
        .await
        .expect("dup");
    let info = tokio::time::timeout(Duration::from_secs(1), updates_rx.recv())
        .await
        .expect("timely")
        .expect("update event");
    assert_eq!(info.last_message, "hello");
    assert!(messages_rx.try_recv().is_err());
}

#[tokio::test]
async fn streaming_reply_reassembles_into_one_row() {
    let env = default_env();
    let session = direct_session(&env);

    session
        .on_inbound_message(&stream_wire("s-1", 0, "", MessageStatus::StreamStart))
        .await
        .expect("start");
    for (seq, body) in [(2, "c"), (0, "a"), (1, "b")] {
        session
            .on_inbound_message(&stream_wire("s-1", seq, body, MessageStatus::StreamSending))
            .await
            .expect("chunk");
    }
    session
        .on_inbound_message(&stream_wire("s-1", 3, "", MessageStatus::StreamFinish))
        .await
        .expect("finish");

    let messages = session.messages().await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].body, "abc");
    assert_eq!(messages[0].status, MessageStatus::StreamFinish);
}

#[tokio::test]
async fn sender_names_resolve_through_the_directory() {
    let env = default_env();
    let session = direct_session(&env);

    session
        .on_inbound_message(&text_wire("c-1", "2", "1", "hello", 100))
        .await
        .expect("inbound");
    assert_eq!(session.info().await.last_message_sender, "Bea");
}

#[tokio::test]
async fn hydrate_restores_history_without_unread_or_events() {
    let env = default_env();
    let session = direct_session(&env);
    let mut updates_rx = session.subscribe_updates();

    let records: Vec<MessageRecord> = [("c-1", 1_i64), ("c-2", 2)]
        .iter()
        .map(|(cli, seq)| MessageRecord {
            client_id: ClientMessageId::from(*cli),
            server_id: *seq,
            session_id: SessionId::from("1_2"),
            sequence: *seq,
            kind: MessageKind::Text,
            status: MessageStatus::Normal,
            body: cli.to_string(),
            sender: UserId::from("2"),
            recipient: UserId::from("1"),
            send_at: seq * 100,
            receive_at: 0,
        })
        .collect();

    session.hydrate(&records).await;
    session.hydrate(&records).await;

    assert_eq!(session.messages().await.len(), 2);
    assert_eq!(session.unread_count().await, 0);
    assert!(updates_rx.try_recv().is_err());
}

#[tokio::test]
async fn typing_signal_reports_recent_refreshes() {
    let env = default_env();
    let session = direct_session(&env);

    assert!(!session.is_typing().await);
    session.note_typing().await;
    assert!(session.is_typing().await);
}

#[test]
fn typing_signal_expires_without_refresh() {
    let mut typing = TypingState::default();
    let now = Instant::now();
    typing.refresh(now);
    assert!(typing.is_typing(now + TYPING_WINDOW / 2));
    assert!(!typing.is_typing(now + TYPING_WINDOW));
}
