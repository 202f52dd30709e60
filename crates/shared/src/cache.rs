use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ClientMessageId, SessionId, SessionKind, UserId};
use crate::protocol::{MessageKind, MessageStatus};

/// Durable form of a session's denormalized header, scoped to the signed-in
/// identity that owns the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub kind: SessionKind,
    pub peer: UserId,
    pub title: String,
    pub avatar: String,
    pub unread_count: u32,
    pub last_message: String,
    pub last_message_sender: String,
    pub update_at: i64,
}

/// Durable form of one message. Delivery progress of locally-originated sends
/// is in-memory state and is intentionally not part of this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub client_id: ClientMessageId,
    pub server_id: i64,
    pub session_id: SessionId,
    pub sequence: i64,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub body: String,
    pub sender: UserId,
    pub recipient: UserId,
    pub send_at: i64,
    pub receive_at: i64,
}

/// Durable mirror of the session set. Every operation fails fast; callers do
/// not retry and in-memory state is never rolled back on failure.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn upsert_session(&self, record: &SessionRecord) -> Result<()>;
    async fn remove_session(&self, session_id: &SessionId) -> Result<()>;
    async fn get_session(&self, session_id: &SessionId) -> Result<Option<SessionRecord>>;
    async fn get_all_sessions(&self) -> Result<Vec<SessionRecord>>;
    async fn session_count(&self) -> Result<i64>;
    async fn clear_all_sessions(&self) -> Result<()>;
}

/// Durable mirror of message history. A message durably added must be
/// retrievable by its client id and, once assigned, by its server id.
#[async_trait]
pub trait MessageCache: Send + Sync {
    async fn add_message(&self, record: &MessageRecord) -> Result<()>;
    async fn add_messages(&self, records: &[MessageRecord]) -> Result<()>;
    async fn update_message(&self, record: &MessageRecord) -> Result<()>;
    async fn update_status_by_client_id(
        &self,
        client_id: &ClientMessageId,
        status: MessageStatus,
    ) -> Result<()>;
    async fn delete_message_by_client_id(&self, client_id: &ClientMessageId) -> Result<()>;
    async fn delete_messages_for_session(&self, session_id: &SessionId) -> Result<()>;
    async fn get_message_by_client_id(
        &self,
        client_id: &ClientMessageId,
    ) -> Result<Option<MessageRecord>>;
    async fn get_message_by_server_id(&self, server_id: i64) -> Result<Option<MessageRecord>>;
    async fn latest_message_for_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Option<MessageRecord>>;
    /// Messages with a server sequence strictly below `before_seq`, oldest
    /// first, at most `limit` rows ending just under the bound.
    async fn messages_before_sequence(
        &self,
        session_id: &SessionId,
        before_seq: i64,
        limit: u32,
    ) -> Result<Vec<MessageRecord>>;
    /// Messages sent strictly before `before` (epoch millis), oldest first,
    /// at most `limit` rows ending just under the bound.
    async fn messages_before_time(
        &self,
        session_id: &SessionId,
        before: i64,
        limit: u32,
    ) -> Result<Vec<MessageRecord>>;
}
