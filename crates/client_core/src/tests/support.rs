#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use shared::{
    cache::{MessageCache, MessageRecord, SessionCache, SessionRecord},
    domain::{ClientMessageId, SessionId, SessionKind, UserId},
    protocol::{
        MessageKind, MessageStatus, SessionSummary, TransportFrame, UserProfile, WireMessage,
    },
};
use tokio::sync::{broadcast, Mutex};

use crate::{api::SessionListing, directory::Directory, transport::Transport};

pub fn text_wire(cli_mid: &str, from: &str, to: &str, content: &str, send_at: i64) -> WireMessage {
    WireMessage {
        mid: 0,
        cli_mid: cli_mid.to_string(),
        seq: 0,
        from: UserId::from(from),
        to: UserId::from(to),
        content: content.to_string(),
        kind: MessageKind::Text,
        status: MessageStatus::Normal,
        send_at,
    }
}

/// In-memory stand-in for the sqlite store, with a switch to make every
/// write fail.
pub struct MemoryStore {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
    messages: Mutex<HashMap<ClientMessageId, MessageRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
            fail_writes: AtomicBool::new(false),
        })
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(anyhow!("simulated store failure"))
        } else {
            Ok(())
        }
    }

    pub async fn message_count(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn stored_message(&self, client_id: &str) -> Option<MessageRecord> {
        self.messages
            .lock()
            .await
            .get(&ClientMessageId::from(client_id))
            .cloned()
    }

    pub async fn stored_session(&self, session_id: &str) -> Option<SessionRecord> {
        self.sessions
            .lock()
            .await
            .get(&SessionId::from(session_id))
            .cloned()
    }

    pub async fn seed_session(&self, record: SessionRecord) {
        self.sessions
            .lock()
            .await
            .insert(record.session_id.clone(), record);
    }
}

#[async_trait]
impl SessionCache for MemoryStore {
    async fn upsert_session(&self, record: &SessionRecord) -> Result<()> {
        self.check_write()?;
        self.sessions
            .lock()
            .await
            .insert(record.session_id.clone(), record.clone());
        Ok(())
    }

    async fn remove_session(&self, session_id: &SessionId) -> Result<()> {
        self.check_write()?;
        self.sessions.lock().await.remove(session_id);
        Ok(())
    }

    async fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.lock().await.get(session_id).cloned())
    }

    async fn get_all_sessions(&self) -> Result<Vec<SessionRecord>> {
        let mut records: Vec<SessionRecord> = self.sessions.lock().await.values().cloned().collect();
        records.sort_by(|a, b| b.update_at.cmp(&a.update_at));
        Ok(records)
    }

    async fn session_count(&self) -> Result<i64> {
        Ok(self.sessions.lock().await.len() as i64)
    }

    async fn clear_all_sessions(&self) -> Result<()> {
        self.check_write()?;
        self.sessions.lock().await.clear();
        Ok(())
    }
}

#[async_trait]
impl MessageCache for MemoryStore {
    async fn add_message(&self, record: &MessageRecord) -> Result<()> {
        self.check_write()?;
        self.messages
            .lock()
            .await
            .insert(record.client_id.clone(), record.clone());
        Ok(())
    }

    async fn add_messages(&self, records: &[MessageRecord]) -> Result<()> {
        for record in records {
            self.add_message(record).await?;
        }
        Ok(())
    }

    async fn update_message(&self, record: &MessageRecord) -> Result<()> {
        self.add_message(record).await
    }

    async fn update_status_by_client_id(
        &self,
        client_id: &ClientMessageId,
        status: MessageStatus,
    ) -> Result<()> {
        self.check_write()?;
        if let Some(record) = self.messages.lock().await.get_mut(client_id) {
            record.status = status;
        }
        Ok(())
    }

    async fn delete_message_by_client_id(&self, client_id: &ClientMessageId) -> Result<()> {
        self.check_write()?;
        self.messages.lock().await.remove(client_id);
        Ok(())
    }

    async fn delete_messages_for_session(&self, session_id: &SessionId) -> Result<()> {
        self.check_write()?;
        self.messages
            .lock()
            .await
            .retain(|_, record| record.session_id != *session_id);
        Ok(())
    }

    async fn get_message_by_client_id(
        &self,
        client_id: &ClientMessageId,
    ) -> Result<Option<MessageRecord>> {
        Ok(self.messages.lock().await.get(client_id).cloned())
    }

    async fn get_message_by_server_id(&self, server_id: i64) -> Result<Option<MessageRecord>> {
        Ok(self
            .messages
            .lock()
            .await
            .values()
            .find(|record| record.server_id == server_id)
            .cloned())
    }

    async fn latest_message_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<MessageRecord>> {
        Ok(self
            .messages
            .lock()
            .await
            .values()
            .filter(|record| record.session_id == *session_id)
            .max_by_key(|record| record.send_at)
            .cloned())
    }

    async fn messages_before_sequence(
        &self,
        session_id: &SessionId,
        before_seq: i64,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        let mut records: Vec<MessageRecord> = self
            .messages
            .lock()
            .await
            .values()
            .filter(|r| r.session_id == *session_id && r.sequence > 0 && r.sequence < before_seq)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.sequence);
        let skip = records.len().saturating_sub(limit as usize);
        Ok(records.split_off(skip))
    }

    async fn messages_before_time(
        &self,
        session_id: &SessionId,
        before: i64,
        limit: u32,
    ) -> Result<Vec<MessageRecord>> {
        let mut records: Vec<MessageRecord> = self
            .messages
            .lock()
            .await
            .values()
            .filter(|r| r.session_id == *session_id && r.send_at < before)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.send_at);
        let skip = records.len().saturating_sub(limit as usize);
        Ok(records.split_off(skip))
    }
}

/// Transport fake: either confirms sends with incrementing server ids or
/// fails them all. Inbound frames are injected through `events`.
pub struct TestTransport {
    events: broadcast::Sender<TransportFrame>,
    fail_with: Option<String>,
    next_mid: AtomicI64,
    next_seq: AtomicI64,
    sent: Mutex<Vec<WireMessage>>,
}

impl TestTransport {
    pub fn confirming() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            fail_with: None,
            next_mid: AtomicI64::new(42),
            next_seq: AtomicI64::new(1),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(err: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            fail_with: Some(err.into()),
            next_mid: AtomicI64::new(42),
            next_seq: AtomicI64::new(1),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn inject(&self, frame: TransportFrame) {
        let _ = self.events.send(frame);
    }

    pub async fn sent_messages(&self) -> Vec<WireMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Transport for TestTransport {
    async fn send_message(&self, _kind: SessionKind, message: WireMessage) -> Result<WireMessage> {
        self.sent.lock().await.push(message.clone());
        if let Some(err) = &self.fail_with {
            return Err(anyhow!(err.clone()));
        }
        let mut confirmed = message;
        confirmed.mid = self.next_mid.fetch_add(1, Ordering::SeqCst);
        confirmed.seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        Ok(confirmed)
    }

    fn subscribe_inbound(&self) -> broadcast::Receiver<TransportFrame> {
        self.events.subscribe()
    }
}

/// Directory fake with a fixed profile table.
pub struct TestDirectory {
    profiles: Vec<UserProfile>,
    fail_with: Option<String>,
    calls: AtomicI64,
}

impl TestDirectory {
    pub fn with_profiles(profiles: Vec<(&str, &str)>) -> Arc<Self> {
        Arc::new(Self {
            profiles: profiles
                .into_iter()
                .map(|(id, name)| UserProfile {
                    user_id: UserId::from(id),
                    display_name: name.to_string(),
                    avatar_url: format!("https://example.test/avatar/{id}.png"),
                })
                .collect(),
            fail_with: None,
            calls: AtomicI64::new(0),
        })
    }

    pub fn failing(err: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            profiles: Vec::new(),
            fail_with: Some(err.into()),
            calls: AtomicI64::new(0),
        })
    }

    pub fn call_count(&self) -> i64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Directory for TestDirectory {
    async fn resolve_users(&self, ids: &[UserId]) -> Result<Vec<UserProfile>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.fail_with {
            return Err(anyhow!(err.clone()));
        }
        Ok(self
            .profiles
            .iter()
            .filter(|profile| ids.contains(&profile.user_id))
            .cloned()
            .collect())
    }
}

/// Listing fake returning a fixed set of session summaries.
pub struct TestListing {
    summaries: Vec<SessionSummary>,
    fail_with: Option<String>,
}

impl TestListing {
    pub fn with_sessions(summaries: Vec<(&str, SessionKind)>) -> Arc<Self> {
        Arc::new(Self {
            summaries: summaries
                .into_iter()
                .map(|(to, kind)| SessionSummary {
                    to: UserId::from(to),
                    kind,
                    update_at: 0,
                })
                .collect(),
            fail_with: None,
        })
    }

    pub fn failing(err: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            summaries: Vec::new(),
            fail_with: Some(err.into()),
        })
    }
}

#[async_trait]
impl SessionListing for TestListing {
    async fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        if let Some(err) = &self.fail_with {
            return Err(anyhow!(err.clone()));
        }
        Ok(self.summaries.clone())
    }
}
