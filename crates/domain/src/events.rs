//! 下发给实时连接的事件
//!
//! 统一序列化为 `{"event": "...", "data": {...}}`。

use serde::{Deserialize, Serialize};

use crate::call::Call;
use crate::message::{Message, Reaction, Tombstone};
use crate::value_objects::{CallId, ChatId, MessageId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    TypingStart,
    TypingStop,
    Recording,
}

/// 呼叫失败原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallFailure {
    RecipientUnreachable,
    RecipientBusy,
    NoAnswer,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    PresenceChanged {
        user_id: UserId,
        online: bool,
        last_seen_at: Option<Timestamp>,
    },
    NewMessage {
        chat_id: ChatId,
        message: Message,
    },
    /// 发送者自己的确认
    MessageSent {
        client_ref: Option<String>,
        message: Message,
    },
    MessageEdited {
        chat_id: ChatId,
        message: Message,
    },
    MessageDeleted {
        chat_id: ChatId,
        message_id: MessageId,
        reason: Tombstone,
    },
    MessageReaction {
        chat_id: ChatId,
        message_id: MessageId,
        reactions: Vec<Reaction>,
    },
    MessagesRead {
        chat_id: ChatId,
        user_id: UserId,
        message_ids: Vec<MessageId>,
    },
    MessagesDelivered {
        chat_id: ChatId,
        user_id: UserId,
        message_ids: Vec<MessageId>,
    },
    Typing {
        chat_id: ChatId,
        user_id: UserId,
        kind: SignalKind,
    },
    /// 主叫自己的确认，携带通话 ID
    CallInitiated {
        call: Call,
    },
    IncomingCall {
        call: Call,
    },
    CallAccepted {
        call: Call,
        user_id: UserId,
    },
    CallDeclined {
        call: Call,
        user_id: UserId,
    },
    CallEnded {
        call: Call,
        ended_by: Option<UserId>,
    },
    CallFailed {
        call_id: CallId,
        reason: CallFailure,
    },
    SignalRelay {
        call_id: CallId,
        from_user_id: UserId,
        payload: serde_json::Value,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerEvent {
    /// 事件名，用于日志
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::PresenceChanged { .. } => "presence-changed",
            ServerEvent::NewMessage { .. } => "new-message",
            ServerEvent::MessageSent { .. } => "message-sent",
            ServerEvent::MessageEdited { .. } => "message-edited",
            ServerEvent::MessageDeleted { .. } => "message-deleted",
            ServerEvent::MessageReaction { .. } => "message-reaction",
            ServerEvent::MessagesRead { .. } => "messages-read",
            ServerEvent::MessagesDelivered { .. } => "messages-delivered",
            ServerEvent::Typing { .. } => "typing",
            ServerEvent::CallInitiated { .. } => "call-initiated",
            ServerEvent::IncomingCall { .. } => "incoming-call",
            ServerEvent::CallAccepted { .. } => "call-accepted",
            ServerEvent::CallDeclined { .. } => "call-declined",
            ServerEvent::CallEnded { .. } => "call-ended",
            ServerEvent::CallFailed { .. } => "call-failed",
            ServerEvent::SignalRelay { .. } => "signal-relay",
            ServerEvent::Error { .. } => "error",
        }
    }
}
