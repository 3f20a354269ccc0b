use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use domain::{
    Chat, ChatId, ChatType, DomainError, Message, MessageContent, MessageId, MessageType,
    NewMessage, Reaction, RepositoryError, ServerEvent, Timestamp, Tombstone, UserId,
};
use uuid::Uuid;

use crate::{
    broadcaster::{Broadcaster, DeliveryReport, OfflineNotifier},
    clock::Clock,
    error::ApplicationError,
    repository::{ChatRepository, MessageRepository},
    sequencer::ChatSequencer,
};

/// 乐观锁冲突时的最大重试次数
const MAX_UPDATE_ATTEMPTS: usize = 5;
pub const DEFAULT_HISTORY_LIMIT: u32 = 50;
pub const MAX_HISTORY_LIMIT: u32 = 200;

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub reply_to: Option<MessageId>,
    pub forwarded_from: Option<MessageId>,
    pub mentions: Vec<UserId>,
    pub scheduled_at: Option<Timestamp>,
    pub self_destruct_secs: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct SendMessageRequest {
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub message_type: MessageType,
    pub content: String,
    pub attachment_ref: Option<String>,
    pub options: SendOptions,
}

impl SendMessageRequest {
    pub fn text(chat_id: ChatId, sender_id: UserId, content: impl Into<String>) -> Self {
        Self {
            chat_id,
            sender_id,
            message_type: MessageType::Text,
            content: content.into(),
            attachment_ref: None,
            options: SendOptions::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    /// 本次新记录已读的消息
    pub updated: Vec<MessageId>,
    pub unread_count: u32,
}

pub struct MessageServiceDependencies {
    pub chat_repository: Arc<dyn ChatRepository>,
    pub message_repository: Arc<dyn MessageRepository>,
    pub broadcaster: Arc<Broadcaster>,
    pub notifier: Arc<dyn OfflineNotifier>,
    pub sequencer: Arc<ChatSequencer>,
    pub clock: Arc<dyn Clock>,
    pub edit_window: chrono::Duration,
}

pub struct MessageService {
    deps: MessageServiceDependencies,
}

impl MessageService {
    pub fn new(deps: MessageServiceDependencies) -> Self {
        Self { deps }
    }

    /// 发送消息。持久化失败时不会有任何推送；推送在返回前完成
    pub async fn send(&self, request: SendMessageRequest) -> Result<Message, ApplicationError> {
        let chat = self.load_chat(request.chat_id).await?;
        chat.ensure_can_post(request.sender_id)?;

        let content = if request.message_type.carries_attachment() {
            MessageContent::caption(request.content)?
        } else {
            MessageContent::new(request.content)?
        };

        let options = request.options;
        if let Some(reply_to) = options.reply_to {
            let target = self.load_message(reply_to).await?;
            if target.chat_id != chat.id || !target.is_visible_to(request.sender_id) {
                return Err(DomainError::MessageNotFound.into());
            }
        }
        let mut seen = HashSet::new();
        let mentions: Vec<UserId> = options
            .mentions
            .into_iter()
            .filter(|user_id| chat.is_participant(*user_id) && seen.insert(*user_id))
            .collect();

        let now = self.deps.clock.now();
        let message = Message::new(
            NewMessage {
                id: MessageId::from(Uuid::new_v4()),
                chat_id: chat.id,
                sender_id: request.sender_id,
                message_type: request.message_type,
                content,
                attachment_ref: request.attachment_ref,
                reply_to: options.reply_to,
                forwarded_from: options.forwarded_from,
                mentions,
                scheduled_at: options.scheduled_at,
                self_destruct_secs: options.self_destruct_secs,
            },
            now,
        )?;

        let guard = self.deps.sequencer.lock(chat.id).await;
        let stored = self.deps.message_repository.create(message).await?;
        if stored.is_withheld() {
            tracing::info!(
                message_id = %stored.id,
                chat_id = %chat.id,
                scheduled_at = ?stored.scheduled_at,
                "定时消息已保存，等待发布"
            );
            return Ok(stored);
        }
        let (event, report) = self.push_new_message(&chat, &stored).await;
        drop(guard);

        self.notify_unreachable(&event, &report).await;
        tracing::info!(
            message_id = %stored.id,
            chat_id = %chat.id,
            sender_id = %stored.sender_id,
            queued = report.queued,
            unreachable = report.unreachable.len(),
            "消息已发送"
        );
        Ok(stored)
    }

    /// 发布到期的定时消息，走与即时发送相同的扇出路径。重复调用是空操作
    pub async fn promote_scheduled(
        &self,
        message_id: MessageId,
    ) -> Result<Option<Message>, ApplicationError> {
        let current = self.load_message(message_id).await?;
        let chat = self.load_chat(current.chat_id).await?;

        let guard = self.deps.sequencer.lock(chat.id).await;
        let now = self.deps.clock.now();
        let Some(message) = self.deps.message_repository.promote(message_id, now).await? else {
            return Ok(None);
        };
        let (event, report) = self.push_new_message(&chat, &message).await;
        drop(guard);

        self.notify_unreachable(&event, &report).await;
        tracing::info!(message_id = %message.id, chat_id = %chat.id, "定时消息已发布");
        Ok(Some(message))
    }

    pub async fn mark_delivered(
        &self,
        message_ids: &[MessageId],
        user_id: UserId,
    ) -> Result<Vec<MessageId>, ApplicationError> {
        let messages = self.load_all(message_ids).await?;
        let mut chats: BTreeMap<ChatId, Chat> = BTreeMap::new();
        for message in &messages {
            if !chats.contains_key(&message.chat_id) {
                let chat = self.load_chat(message.chat_id).await?;
                chat.ensure_participant(user_id)?;
                chats.insert(chat.id, chat);
            }
            if !message.is_visible_to(user_id) {
                return Err(DomainError::MessageNotFound.into());
            }
        }

        let now = self.deps.clock.now();
        let mut updated: BTreeMap<ChatId, Vec<MessageId>> = BTreeMap::new();
        for message in &messages {
            let (_, changed) = self
                .modify(message.id, |m| Ok(m.mark_delivered(user_id, now)))
                .await?;
            if changed {
                updated.entry(message.chat_id).or_default().push(message.id);
            }
        }

        let mut all = Vec::new();
        for (chat_id, ids) in updated {
            if let Some(chat) = chats.get(&chat_id) {
                let event = ServerEvent::MessagesDelivered {
                    chat_id,
                    user_id,
                    message_ids: ids.clone(),
                };
                self.deps
                    .broadcaster
                    .to_chat(chat, &event, Some(user_id))
                    .await;
            }
            all.extend(ids);
        }
        Ok(all)
    }

    /// 记录已读并按已读列表重新计算未读数，再向其他参与者广播回执
    pub async fn mark_read(
        &self,
        chat_id: ChatId,
        message_ids: &[MessageId],
        user_id: UserId,
    ) -> Result<ReadOutcome, ApplicationError> {
        let chat = self.load_chat(chat_id).await?;
        chat.ensure_participant(user_id)?;
        let messages = self.load_all(message_ids).await?;
        if messages
            .iter()
            .any(|m| m.chat_id != chat_id || !m.is_visible_to(user_id))
        {
            return Err(DomainError::MessageNotFound.into());
        }

        let now = self.deps.clock.now();
        let mut updated = Vec::new();
        for message in &messages {
            let (_, changed) = self
                .modify(message.id, |m| Ok(m.mark_read(user_id, now)))
                .await?;
            if changed {
                updated.push(message.id);
            }
        }

        let unread_count = self
            .deps
            .chat_repository
            .recompute_unread(chat_id, user_id)
            .await?;

        if !updated.is_empty() {
            let event = ServerEvent::MessagesRead {
                chat_id,
                user_id,
                message_ids: updated.clone(),
            };
            self.deps
                .broadcaster
                .to_chat(&chat, &event, Some(user_id))
                .await;
        }
        tracing::debug!(
            chat_id = %chat_id,
            user_id = %user_id,
            updated = updated.len(),
            unread_count,
            "已读回执已记录"
        );
        Ok(ReadOutcome {
            updated,
            unread_count,
        })
    }

    pub async fn edit(
        &self,
        message_id: MessageId,
        editor_id: UserId,
        new_content: String,
    ) -> Result<Message, ApplicationError> {
        let current = self.load_message(message_id).await?;
        let content = if current.message_type.carries_attachment() {
            MessageContent::caption(new_content)?
        } else {
            MessageContent::new(new_content)?
        };
        let chat = self.load_chat(current.chat_id).await?;

        let _guard = self.deps.sequencer.lock(chat.id).await;
        let now = self.deps.clock.now();
        let window = self.deps.edit_window;
        let (message, _) = self
            .modify(message_id, |m| {
                m.edit(editor_id, content.clone(), now, window)?;
                Ok(true)
            })
            .await?;

        if !message.is_withheld() {
            let event = ServerEvent::MessageEdited {
                chat_id: chat.id,
                message: public_view(&message),
            };
            self.deps.broadcaster.to_chat(&chat, &event, None).await;
        }
        tracing::info!(message_id = %message.id, editor_id = %editor_id, "消息已编辑");
        Ok(message)
    }

    /// `for_everyone` 为真时替换为墓碑并广播；否则只对请求者隐藏
    pub async fn delete(
        &self,
        message_id: MessageId,
        requester_id: UserId,
        for_everyone: bool,
    ) -> Result<(), ApplicationError> {
        let current = self.load_message(message_id).await?;
        let chat = self.load_chat(current.chat_id).await?;

        if !for_everyone {
            chat.ensure_participant(requester_id)?;
            if current.is_withheld() && current.sender_id != requester_id {
                return Err(DomainError::MessageNotFound.into());
            }
            self.modify(message_id, |m| Ok(m.hide_for(requester_id)))
                .await?;
            return Ok(());
        }

        let _guard = self.deps.sequencer.lock(chat.id).await;
        let now = self.deps.clock.now();
        let (message, changed) = self
            .modify(message_id, |m| m.delete_for_everyone(requester_id, now))
            .await?;
        if changed && !message.is_withheld() {
            self.broadcast_tombstone(&chat, message.id, Tombstone::Deleted)
                .await;
        }
        if changed {
            tracing::info!(message_id = %message.id, requester_id = %requester_id, "消息已为所有人删除");
        }
        Ok(())
    }

    /// 设置或撤回表情，返回新的表情集合
    pub async fn react(
        &self,
        message_id: MessageId,
        user_id: UserId,
        emoji: Option<String>,
    ) -> Result<Vec<Reaction>, ApplicationError> {
        let current = self.load_message(message_id).await?;
        let chat = self.load_chat(current.chat_id).await?;
        chat.ensure_participant(user_id)?;
        if !current.is_visible_to(user_id) {
            return Err(DomainError::MessageNotFound.into());
        }

        let now = self.deps.clock.now();
        let (message, _) = self
            .modify(message_id, |m| {
                m.set_reaction(user_id, emoji.clone(), now)?;
                Ok(true)
            })
            .await?;

        if !message.is_withheld() {
            let event = ServerEvent::MessageReaction {
                chat_id: chat.id,
                message_id,
                reactions: message.reactions.clone(),
            };
            self.deps.broadcaster.to_chat(&chat, &event, None).await;
        }
        Ok(message.reactions)
    }

    pub async fn star(
        &self,
        message_id: MessageId,
        user_id: UserId,
        starred: bool,
    ) -> Result<bool, ApplicationError> {
        let current = self.load_message(message_id).await?;
        let chat = self.load_chat(current.chat_id).await?;
        chat.ensure_participant(user_id)?;
        if !current.is_visible_to(user_id) {
            return Err(DomainError::MessageNotFound.into());
        }
        let (_, changed) = self
            .modify(message_id, |m| Ok(m.set_starred(user_id, starred)))
            .await?;
        Ok(changed)
    }

    /// 阅后即焚到期：替换为过期墓碑并广播，与为所有人删除走同一路径
    pub async fn expire(&self, message_id: MessageId) -> Result<bool, ApplicationError> {
        let current = self.load_message(message_id).await?;
        let chat = self.load_chat(current.chat_id).await?;

        let _guard = self.deps.sequencer.lock(chat.id).await;
        let now = self.deps.clock.now();
        let (message, changed) = self.modify(message_id, |m| Ok(m.expire(now))).await?;
        if changed {
            self.broadcast_tombstone(&chat, message.id, Tombstone::Expired)
                .await;
            tracing::info!(message_id = %message.id, chat_id = %chat.id, "阅后即焚消息已过期");
        }
        Ok(changed)
    }

    /// 按读者视角的历史记录：隐藏的和未发布的他人定时消息不返回，墓碑保留位置
    pub async fn history(
        &self,
        chat_id: ChatId,
        viewer: UserId,
        limit: Option<u32>,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, ApplicationError> {
        let chat = self.load_chat(chat_id).await?;
        if chat.chat_type != ChatType::Channel {
            chat.ensure_participant(viewer)?;
        }
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let page = self
            .deps
            .message_repository
            .list_chat(chat_id, limit, before)
            .await
            .map_err(|err| match err {
                RepositoryError::NotFound => ApplicationError::from(DomainError::MessageNotFound),
                other => other.into(),
            })?;
        Ok(page.iter().filter_map(|m| m.view_for(viewer)).collect())
    }

    pub async fn get(
        &self,
        message_id: MessageId,
        viewer: UserId,
    ) -> Result<Message, ApplicationError> {
        let message = self.load_message(message_id).await?;
        let chat = self.load_chat(message.chat_id).await?;
        if chat.chat_type != ChatType::Channel {
            chat.ensure_participant(viewer)?;
        }
        message
            .view_for(viewer)
            .ok_or_else(|| DomainError::MessageNotFound.into())
    }

    async fn push_new_message(
        &self,
        chat: &Chat,
        message: &Message,
    ) -> (ServerEvent, DeliveryReport) {
        let event = ServerEvent::NewMessage {
            chat_id: chat.id,
            message: public_view(message),
        };
        let report = self
            .deps
            .broadcaster
            .to_chat(chat, &event, Some(message.sender_id))
            .await;
        (event, report)
    }

    async fn notify_unreachable(&self, event: &ServerEvent, report: &DeliveryReport) {
        if !report.unreachable.is_empty() {
            self.deps
                .notifier
                .notify_offline(&report.unreachable, event)
                .await;
        }
    }

    async fn broadcast_tombstone(&self, chat: &Chat, message_id: MessageId, reason: Tombstone) {
        let event = ServerEvent::MessageDeleted {
            chat_id: chat.id,
            message_id,
            reason,
        };
        self.deps.broadcaster.to_chat(chat, &event, None).await;
    }

    /// 读取、修改、按版本写回；版本冲突时重新读取再试
    async fn modify<F>(
        &self,
        message_id: MessageId,
        mut apply: F,
    ) -> Result<(Message, bool), ApplicationError>
    where
        F: FnMut(&mut Message) -> Result<bool, DomainError> + Send,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let mut message = self.load_message(message_id).await?;
            if !apply(&mut message)? {
                return Ok((message, false));
            }
            match self.deps.message_repository.update(message).await {
                Ok(saved) => return Ok((saved, true)),
                Err(RepositoryError::Conflict) => {
                    tracing::debug!(message_id = %message_id, attempt, "消息版本冲突，重试");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(RepositoryError::Conflict.into())
    }

    async fn load_chat(&self, chat_id: ChatId) -> Result<Chat, ApplicationError> {
        self.deps
            .chat_repository
            .find_by_id(chat_id)
            .await?
            .ok_or_else(|| DomainError::ChatNotFound.into())
    }

    async fn load_message(&self, message_id: MessageId) -> Result<Message, ApplicationError> {
        self.deps
            .message_repository
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| DomainError::MessageNotFound.into())
    }

    /// 批量读取，任意一个不存在都视为 NotFound
    async fn load_all(&self, message_ids: &[MessageId]) -> Result<Vec<Message>, ApplicationError> {
        let unique: Vec<MessageId> = {
            let mut seen = HashSet::new();
            message_ids
                .iter()
                .copied()
                .filter(|id| seen.insert(*id))
                .collect()
        };
        if unique.is_empty() {
            return Ok(Vec::new());
        }
        let messages = self.deps.message_repository.find_many(&unique).await?;
        if messages.len() != unique.len() {
            return Err(DomainError::MessageNotFound.into());
        }
        Ok(messages)
    }
}

/// 广播用的视图：不暴露其他人的收藏标记
fn public_view(message: &Message) -> Message {
    let mut view = message.clone();
    view.starred_by.clear();
    view.hidden_for.clear();
    view
}
