use serde::{Deserialize, Serialize};

use crate::domain::{SessionKind, UserId};

/// Content kind of a message, with stable numeric wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum MessageKind {
    Text,
    Image,
    Audio,
    Location,
    File,
    /// Incrementally streamed markdown (bot replies).
    StreamMarkdown,
    /// Incrementally streamed plain text.
    StreamText,
    EnterChannel,
    LeaveChannel,
}

impl MessageKind {
    pub fn is_streaming(self) -> bool {
        matches!(self, MessageKind::StreamMarkdown | MessageKind::StreamText)
    }
}

impl TryFrom<i32> for MessageKind {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::Text),
            2 => Ok(MessageKind::Image),
            3 => Ok(MessageKind::Audio),
            4 => Ok(MessageKind::Location),
            5 => Ok(MessageKind::File),
            11 => Ok(MessageKind::StreamMarkdown),
            12 => Ok(MessageKind::StreamText),
            100 => Ok(MessageKind::EnterChannel),
            101 => Ok(MessageKind::LeaveChannel),
            other => Err(format!("unknown message kind code {other}")),
        }
    }
}

impl From<MessageKind> for i32 {
    fn from(value: MessageKind) -> Self {
        match value {
            MessageKind::Text => 1,
            MessageKind::Image => 2,
            MessageKind::Audio => 3,
            MessageKind::Location => 4,
            MessageKind::File => 5,
            MessageKind::StreamMarkdown => 11,
            MessageKind::StreamText => 12,
            MessageKind::EnterChannel => 100,
            MessageKind::LeaveChannel => 101,
        }
    }
}

/// Server-side status of a message. The stream variants drive incremental
/// reassembly of `StreamMarkdown`/`StreamText` bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum MessageStatus {
    #[default]
    Normal,
    StreamStart,
    StreamSending,
    StreamFinish,
    StreamCancel,
}

impl TryFrom<i32> for MessageStatus {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageStatus::Normal),
            1 => Ok(MessageStatus::StreamStart),
            2 => Ok(MessageStatus::StreamSending),
            3 => Ok(MessageStatus::StreamFinish),
            4 => Ok(MessageStatus::StreamCancel),
            other => Err(format!("unknown message status code {other}")),
        }
    }
}

impl From<MessageStatus> for i32 {
    fn from(value: MessageStatus) -> Self {
        match value {
            MessageStatus::Normal => 0,
            MessageStatus::StreamStart => 1,
            MessageStatus::StreamSending => 2,
            MessageStatus::StreamFinish => 3,
            MessageStatus::StreamCancel => 4,
        }
    }
}

/// One message as carried by the transport, in either direction.
///
/// `mid` and `seq` are server-assigned and stay 0 until the send is
/// acknowledged. `cli_mid` is generated by the sending client and is the
/// stable merge key for the message's whole lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub mid: i64,
    #[serde(default)]
    pub cli_mid: String,
    #[serde(default)]
    pub seq: i64,
    pub from: UserId,
    pub to: UserId,
    #[serde(default)]
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub status: MessageStatus,
    #[serde(default)]
    pub send_at: i64,
}

/// Frames exchanged with the transport endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum TransportFrame {
    DirectMessage { message: WireMessage },
    ChannelMessage { message: WireMessage },
    /// Acknowledgement for an outbound send; `message` is the confirmed copy
    /// carrying the assigned `mid`/`seq`.
    Ack { message: WireMessage },
}

/// One row of the server's authoritative session listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub to: UserId,
    pub kind: SessionKind,
    #[serde(default)]
    pub update_at: i64,
}

/// Display metadata for a user or channel, as served by the directory API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: String,
}
