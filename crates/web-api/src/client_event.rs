//! 客户端上行事件及其分发
//!
//! 上行帧格式与下行一致：`{"event": "...", "data": {...}}`。

use application::{
    ApplicationError, InitiateCallRequest, RealtimeCore, SendMessageRequest, SendOptions,
};
use domain::{
    CallId, CallMedium, ChatId, MessageId, MessageType, ServerEvent, SessionId, SignalKind,
    Timestamp, UserId,
};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessagePayload {
    pub chat_id: ChatId,
    #[serde(default)]
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub attachment_ref: Option<String>,
    /// 客户端自带的关联标识，原样放进 `message-sent` 确认
    #[serde(default)]
    pub client_ref: Option<String>,
    #[serde(default)]
    pub options: SendOptionsPayload,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SendOptionsPayload {
    #[serde(default)]
    pub reply_to: Option<MessageId>,
    #[serde(default)]
    pub forwarded_from: Option<MessageId>,
    #[serde(default)]
    pub mentions: Vec<UserId>,
    #[serde(default)]
    pub scheduled_at: Option<Timestamp>,
    #[serde(default)]
    pub self_destruct_secs: Option<u32>,
}

fn default_message_type() -> MessageType {
    MessageType::Text
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    SendMessage(SendMessagePayload),
    MarkRead {
        chat_id: ChatId,
        message_ids: Vec<MessageId>,
    },
    MarkDelivered {
        message_ids: Vec<MessageId>,
    },
    EditMessage {
        message_id: MessageId,
        content: String,
    },
    DeleteMessage {
        message_id: MessageId,
        #[serde(default)]
        for_everyone: bool,
    },
    /// `emoji` 为空表示撤回自己的表情
    React {
        message_id: MessageId,
        #[serde(default)]
        emoji: Option<String>,
    },
    Typing {
        chat_id: ChatId,
    },
    StopTyping {
        chat_id: ChatId,
    },
    Recording {
        chat_id: ChatId,
    },
    JoinRoom {
        chat_id: ChatId,
    },
    LeaveRoom {
        chat_id: ChatId,
    },
    InitiateCall {
        chat_id: ChatId,
        #[serde(default)]
        recipient_ids: Vec<UserId>,
        medium: CallMedium,
    },
    AcceptCall {
        call_id: CallId,
    },
    DeclineCall {
        call_id: CallId,
    },
    EndCall {
        call_id: CallId,
    },
    RelaySignal {
        call_id: CallId,
        target_user_id: UserId,
        payload: serde_json::Value,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::SendMessage(_) => "send-message",
            ClientEvent::MarkRead { .. } => "mark-read",
            ClientEvent::MarkDelivered { .. } => "mark-delivered",
            ClientEvent::EditMessage { .. } => "edit-message",
            ClientEvent::DeleteMessage { .. } => "delete-message",
            ClientEvent::React { .. } => "react",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::StopTyping { .. } => "stop-typing",
            ClientEvent::Recording { .. } => "recording",
            ClientEvent::JoinRoom { .. } => "join-room",
            ClientEvent::LeaveRoom { .. } => "leave-room",
            ClientEvent::InitiateCall { .. } => "initiate-call",
            ClientEvent::AcceptCall { .. } => "accept-call",
            ClientEvent::DeclineCall { .. } => "decline-call",
            ClientEvent::EndCall { .. } => "end-call",
            ClientEvent::RelaySignal { .. } => "relay-signal",
        }
    }
}

impl From<SendOptionsPayload> for SendOptions {
    fn from(payload: SendOptionsPayload) -> Self {
        Self {
            reply_to: payload.reply_to,
            forwarded_from: payload.forwarded_from,
            mentions: payload.mentions,
            scheduled_at: payload.scheduled_at,
            self_destruct_secs: payload.self_destruct_secs,
        }
    }
}

/// 处理一条上行事件，返回需要直接回给当前连接的事件（如确认）
pub(crate) async fn dispatch(
    core: &RealtimeCore,
    user_id: UserId,
    session_id: SessionId,
    event: ClientEvent,
) -> Result<Option<ServerEvent>, ApplicationError> {
    match event {
        ClientEvent::SendMessage(payload) => {
            let client_ref = payload.client_ref;
            let message = core
                .messages
                .send(SendMessageRequest {
                    chat_id: payload.chat_id,
                    sender_id: user_id,
                    message_type: payload.message_type,
                    content: payload.content,
                    attachment_ref: payload.attachment_ref,
                    options: payload.options.into(),
                })
                .await?;
            let message = message.view_for(user_id).unwrap_or(message);
            Ok(Some(ServerEvent::MessageSent {
                client_ref,
                message,
            }))
        }
        ClientEvent::MarkRead {
            chat_id,
            message_ids,
        } => {
            core.messages
                .mark_read(chat_id, &message_ids, user_id)
                .await?;
            Ok(None)
        }
        ClientEvent::MarkDelivered { message_ids } => {
            core.messages.mark_delivered(&message_ids, user_id).await?;
            Ok(None)
        }
        ClientEvent::EditMessage {
            message_id,
            content,
        } => {
            core.messages.edit(message_id, user_id, content).await?;
            Ok(None)
        }
        ClientEvent::DeleteMessage {
            message_id,
            for_everyone,
        } => {
            core.messages
                .delete(message_id, user_id, for_everyone)
                .await?;
            Ok(None)
        }
        ClientEvent::React { message_id, emoji } => {
            core.messages.react(message_id, user_id, emoji).await?;
            Ok(None)
        }
        ClientEvent::Typing { chat_id } => {
            core.typing
                .signal(chat_id, user_id, SignalKind::TypingStart)
                .await?;
            Ok(None)
        }
        ClientEvent::StopTyping { chat_id } => {
            core.typing
                .signal(chat_id, user_id, SignalKind::TypingStop)
                .await?;
            Ok(None)
        }
        ClientEvent::Recording { chat_id } => {
            core.typing
                .signal(chat_id, user_id, SignalKind::Recording)
                .await?;
            Ok(None)
        }
        ClientEvent::JoinRoom { chat_id } => {
            core.presence.join_room(session_id, chat_id).await?;
            Ok(None)
        }
        ClientEvent::LeaveRoom { chat_id } => {
            core.presence.leave_room(session_id, chat_id).await;
            Ok(None)
        }
        ClientEvent::InitiateCall {
            chat_id,
            recipient_ids,
            medium,
        } => {
            let call = core
                .calls
                .initiate(InitiateCallRequest {
                    caller_id: user_id,
                    chat_id,
                    recipient_ids,
                    medium,
                })
                .await?;
            Ok(Some(ServerEvent::CallInitiated { call }))
        }
        ClientEvent::AcceptCall { call_id } => {
            core.calls.accept(call_id, user_id).await?;
            Ok(None)
        }
        ClientEvent::DeclineCall { call_id } => {
            core.calls.decline(call_id, user_id).await?;
            Ok(None)
        }
        ClientEvent::EndCall { call_id } => {
            core.calls.end(call_id, user_id).await?;
            Ok(None)
        }
        ClientEvent::RelaySignal {
            call_id,
            target_user_id,
            payload,
        } => {
            // 目标不在线时服务层只记录日志，不回错误
            core.calls
                .relay_signal(call_id, user_id, target_user_id, payload)
                .await?;
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    #[test]
    fn send_message_fills_defaults() {
        let chat_id = Uuid::new_v4();
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "send-message",
            "data": { "chat_id": chat_id, "content": "hi" }
        }))
        .unwrap();

        match event {
            ClientEvent::SendMessage(payload) => {
                assert_eq!(payload.chat_id, ChatId::from(chat_id));
                assert_eq!(payload.message_type, MessageType::Text);
                assert!(payload.options.mentions.is_empty());
                assert!(payload.client_ref.is_none());
            }
            other => panic!("unexpected event {}", other.name()),
        }
    }

    #[test]
    fn relay_signal_keeps_opaque_payload() {
        let event: ClientEvent = serde_json::from_value(json!({
            "event": "relay-signal",
            "data": {
                "call_id": Uuid::new_v4(),
                "target_user_id": Uuid::new_v4(),
                "payload": { "sdp": "v=0", "candidates": [1, 2] }
            }
        }))
        .unwrap();

        assert_eq!(event.name(), "relay-signal");
        match event {
            ClientEvent::RelaySignal { payload, .. } => {
                assert_eq!(payload["candidates"][1], 2);
            }
            other => panic!("unexpected event {}", other.name()),
        }
    }

    #[test]
    fn unknown_event_is_rejected() {
        let parsed = serde_json::from_value::<ClientEvent>(json!({
            "event": "shout",
            "data": {}
        }));
        assert!(parsed.is_err());
    }
}
