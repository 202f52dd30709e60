use std::{
    collections::BTreeMap,
    fmt,
    time::{Duration, Instant},
};

use chrono::{Local, TimeZone, Utc};
use shared::{
    cache::MessageRecord,
    domain::{ClientMessageId, SessionId, UserId},
    protocol::{MessageKind, MessageStatus, WireMessage},
};
use tracing::warn;
use uuid::Uuid;

use crate::directory::DisplayNames;

/// How long the chunk buffer of a finished/cancelled stream is kept so that
/// stragglers which raced the closing marker can still merge. Chunks arriving
/// after the window are dropped.
pub const STREAM_BUFFER_GRACE: Duration = Duration::from_secs(2);

/// Local delivery progress of a message, orthogonal to the server-side
/// stream status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryState {
    #[default]
    Unknown,
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Updated,
    Rejected,
}

pub type UpdateToken = u64;

type UpdateListener = Box<dyn Fn(&ChatMessage) + Send + Sync>;

/// One chat message: immutable identity, mutable delivery/stream state, and
/// the chunk buffer used to reassemble incrementally streamed bodies.
pub struct ChatMessage {
    pub session_id: SessionId,
    pub client_id: ClientMessageId,
    pub server_id: i64,
    pub sequence: i64,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub body: String,
    pub sender: UserId,
    pub recipient: UserId,
    pub send_at: i64,
    pub receive_at: i64,
    pub delivery: DeliveryState,
    pub from_me: bool,
    stream: StreamBuffer,
    listeners: Vec<(UpdateToken, UpdateListener)>,
    next_token: UpdateToken,
}

#[derive(Debug, Default)]
struct StreamBuffer {
    chunks: BTreeMap<i64, String>,
    clear_after: Option<Instant>,
    closed: bool,
}

impl StreamBuffer {
    fn purge_expired(&mut self, now: Instant) {
        if let Some(deadline) = self.clear_after {
            if now >= deadline {
                self.chunks.clear();
                self.clear_after = None;
            }
        }
    }

    fn accepts_chunks(&self) -> bool {
        !self.closed || self.clear_after.is_some()
    }
}

/// Plain-data copy of a message for consumers outside the session lock.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSnapshot {
    pub session_id: SessionId,
    pub client_id: ClientMessageId,
    pub server_id: i64,
    pub sequence: i64,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub body: String,
    pub sender: UserId,
    pub recipient: UserId,
    pub send_at: i64,
    pub receive_at: i64,
    pub delivery: DeliveryState,
    pub from_me: bool,
    pub order_key: i64,
}

impl ChatMessage {
    /// Decodes a transport payload. When the wire carries no client id the
    /// decimal server id doubles as the merge key; the fallback lives only
    /// here so no two consumers can disagree on a message's key.
    pub fn from_wire(session_id: SessionId, current_user: &UserId, wire: &WireMessage) -> Self {
        let client_id = if wire.cli_mid.is_empty() {
            if wire.mid == 0 {
                warn!(session_id = %session_id, "inbound message carries neither client id nor server id");
            }
            ClientMessageId(wire.mid.to_string())
        } else {
            ClientMessageId(wire.cli_mid.clone())
        };

        Self {
            session_id,
            client_id,
            server_id: wire.mid,
            sequence: wire.seq,
            kind: wire.kind,
            status: wire.status,
            body: wire.content.clone(),
            sender: wire.from.clone(),
            recipient: wire.to.clone(),
            send_at: wire.send_at,
            receive_at: Utc::now().timestamp_millis(),
            delivery: DeliveryState::Unknown,
            from_me: wire.from == *current_user,
            stream: StreamBuffer::default(),
            listeners: Vec::new(),
            next_token: 0,
        }
    }

    /// Synthesizes a locally-originated message awaiting acknowledgement.
    pub fn pending(
        session_id: SessionId,
        from: UserId,
        to: UserId,
        body: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            session_id,
            client_id: ClientMessageId(Uuid::new_v4().simple().to_string()),
            server_id: 0,
            sequence: 0,
            kind,
            status: MessageStatus::Normal,
            body: body.into(),
            sender: from,
            recipient: to,
            send_at: Utc::now().timestamp_millis(),
            receive_at: 0,
            delivery: DeliveryState::Sending,
            from_me: true,
            stream: StreamBuffer::default(),
            listeners: Vec::new(),
            next_token: 0,
        }
    }

    pub fn from_record(current_user: &UserId, record: &MessageRecord) -> Self {
        let from_me = record.sender == *current_user;
        Self {
            session_id: record.session_id.clone(),
            client_id: record.client_id.clone(),
            server_id: record.server_id,
            sequence: record.sequence,
            kind: record.kind,
            status: record.status,
            body: record.body.clone(),
            sender: record.sender.clone(),
            recipient: record.recipient.clone(),
            send_at: record.send_at,
            receive_at: record.receive_at,
            delivery: if from_me {
                DeliveryState::Sent
            } else {
                DeliveryState::Unknown
            },
            from_me,
            stream: StreamBuffer::default(),
            listeners: Vec::new(),
            next_token: 0,
        }
    }

    pub fn to_record(&self) -> MessageRecord {
        MessageRecord {
            client_id: self.client_id.clone(),
            server_id: self.server_id,
            session_id: self.session_id.clone(),
            sequence: self.sequence,
            kind: self.kind,
            status: self.status,
            body: self.body.clone(),
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            send_at: self.send_at,
            receive_at: self.receive_at,
        }
    }

    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            mid: self.server_id,
            cli_mid: self.client_id.0.clone(),
            seq: self.sequence,
            from: self.sender.clone(),
            to: self.recipient.clone(),
            content: self.body.clone(),
            kind: self.kind,
            status: self.status,
            send_at: self.send_at,
        }
    }

    /// Key the session orders by: the server sequence once assigned, the
    /// client send time until then.
    pub fn order_key(&self) -> i64 {
        if self.sequence > 0 {
            self.sequence
        } else {
            self.send_at
        }
    }

    pub fn snapshot(&self) -> MessageSnapshot {
        MessageSnapshot {
            session_id: self.session_id.clone(),
            client_id: self.client_id.clone(),
            server_id: self.server_id,
            sequence: self.sequence,
            kind: self.kind,
            status: self.status,
            body: self.body.clone(),
            sender: self.sender.clone(),
            recipient: self.recipient.clone(),
            send_at: self.send_at,
            receive_at: self.receive_at,
            delivery: self.delivery,
            from_me: self.from_me,
            order_key: self.order_key(),
        }
    }

    /// Folds a duplicate delivery of this message into the existing entry.
    /// Streaming kinds dispatch on the incoming stream status; everything
    /// else is a last-write-wins field replacement.
    pub fn merge(&mut self, incoming: &ChatMessage) -> MergeOutcome {
        self.merge_at(incoming, Instant::now())
    }

    pub(crate) fn merge_at(&mut self, incoming: &ChatMessage, now: Instant) -> MergeOutcome {
        let outcome = if self.kind.is_streaming() {
            self.merge_stream(incoming, now)
        } else {
            self.merge_plain(incoming)
        };
        if outcome == MergeOutcome::Updated {
            self.notify_update();
        }
        outcome
    }

    fn merge_plain(&mut self, incoming: &ChatMessage) -> MergeOutcome {
        self.sender = incoming.sender.clone();
        self.recipient = incoming.recipient.clone();
        self.body = incoming.body.clone();
        self.server_id = incoming.server_id;
        self.sequence = incoming.sequence;
        self.status = incoming.status;
        self.delivery = incoming.delivery;
        self.send_at = incoming.send_at;
        self.receive_at = incoming.receive_at;
        MergeOutcome::Updated
    }

    fn merge_stream(&mut self, incoming: &ChatMessage, now: Instant) -> MergeOutcome {
        self.stream.purge_expired(now);
        match incoming.status {
            MessageStatus::StreamStart => {
                self.stream.chunks.clear();
                self.stream.clear_after = None;
                self.stream.closed = false;
                self.body.clear();
                self.status = MessageStatus::StreamStart;
                MergeOutcome::Updated
            }
            MessageStatus::StreamSending => {
                if !self.stream.accepts_chunks() {
                    warn!(
                        client_id = %self.client_id,
                        chunk_seq = incoming.sequence,
                        "dropping stream chunk that arrived after the buffer grace window"
                    );
                    return MergeOutcome::Rejected;
                }
                // Chunks are keyed by their sequence, so out-of-order arrival
                // sorts itself out and a retransmitted chunk replaces rather
                // than double-counts.
                self.stream
                    .chunks
                    .insert(incoming.sequence, incoming.body.clone());
                self.body = self.stream.chunks.values().map(String::as_str).collect();
                self.status = MessageStatus::StreamSending;
                MergeOutcome::Updated
            }
            MessageStatus::StreamFinish => {
                self.status = MessageStatus::StreamFinish;
                self.stream.closed = true;
                self.stream.clear_after = Some(now + STREAM_BUFFER_GRACE);
                MergeOutcome::Updated
            }
            MessageStatus::StreamCancel => {
                self.body = incoming.body.clone();
                self.status = MessageStatus::StreamCancel;
                self.stream.closed = true;
                self.stream.clear_after = Some(now + STREAM_BUFFER_GRACE);
                MergeOutcome::Updated
            }
            MessageStatus::Normal => {
                warn!(
                    client_id = %self.client_id,
                    "rejecting non-stream update routed to a streaming message"
                );
                MergeOutcome::Rejected
            }
        }
    }

    /// Registers an update listener, invoked synchronously in registration
    /// order after every successful merge. The token unregisters it.
    pub fn on_update(
        &mut self,
        listener: impl Fn(&ChatMessage) + Send + Sync + 'static,
    ) -> UpdateToken {
        let token = self.next_token;
        self.next_token += 1;
        self.listeners.push((token, Box::new(listener)));
        token
    }

    pub fn remove_update_listener(&mut self, token: UpdateToken) {
        self.listeners.retain(|(t, _)| *t != token);
    }

    fn notify_update(&self) {
        for (_, listener) in &self.listeners {
            listener(self);
        }
    }

    /// Text shown for this message in session lists and notifications.
    pub fn display_content(&self, names: &dyn DisplayNames) -> String {
        match self.kind {
            MessageKind::Image => "[image]".to_string(),
            MessageKind::Audio => "[audio]".to_string(),
            MessageKind::Location => "[location]".to_string(),
            MessageKind::File => "[file]".to_string(),
            MessageKind::EnterChannel | MessageKind::LeaveChannel => {
                // The body carries the id of the user who entered or left.
                let subject = UserId(self.body.clone());
                let verb = if self.kind == MessageKind::EnterChannel {
                    "joined"
                } else {
                    "left"
                };
                if names.is_current_user(&subject) {
                    format!("You {verb} the channel")
                } else {
                    format!("{} {verb} the channel", names.display_name(&subject))
                }
            }
            MessageKind::Text | MessageKind::StreamMarkdown | MessageKind::StreamText => {
                self.body.clone()
            }
        }
    }

    /// HH:MM of the send time, for list rows.
    pub fn display_time(&self) -> String {
        match Local.timestamp_millis_opt(self.send_at) {
            chrono::LocalResult::Single(t) => t.format("%H:%M").to_string(),
            _ => "--:--".to_string(),
        }
    }
}

impl fmt::Debug for ChatMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatMessage")
            .field("session_id", &self.session_id)
            .field("client_id", &self.client_id)
            .field("server_id", &self.server_id)
            .field("sequence", &self.sequence)
            .field("kind", &self.kind)
            .field("status", &self.status)
            .field("delivery", &self.delivery)
            .field("from_me", &self.from_me)
            .finish()
    }
}

#[cfg(test)]
#[path = "tests/message_tests.rs"]
mod tests;
