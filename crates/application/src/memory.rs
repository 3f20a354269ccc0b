//! 进程内存储
//!
//! 未配置数据库时使用，也是服务层测试的默认存储。所有表共用一把锁，
//! 复合操作（写消息并更新会话、发布定时消息）因此天然原子。

use std::collections::HashMap;

use async_trait::async_trait;
use domain::{
    Call, CallId, CallStatus, Chat, ChatId, Message, MessageId, Participant,
    ParticipantCallStatus, RepositoryError, Timestamp, UserId,
};
use tokio::sync::RwLock;

use crate::repository::{CallRepository, ChatRepository, MessageRepository, PresenceRepository};

#[derive(Default)]
struct Tables {
    chats: HashMap<ChatId, Chat>,
    messages: HashMap<MessageId, Message>,
    calls: HashMap<CallId, Call>,
    last_seen: HashMap<UserId, Timestamp>,
    next_sequence: i64,
}

impl Tables {
    fn chat_mut(&mut self, id: ChatId) -> Result<&mut Chat, RepositoryError> {
        self.chats.get_mut(&id).ok_or(RepositoryError::NotFound)
    }

    /// 只统计加入会话之后发布的消息
    fn unread_for(&self, chat_id: ChatId, user_id: UserId) -> Result<u32, RepositoryError> {
        let joined_at = self
            .chats
            .get(&chat_id)
            .ok_or(RepositoryError::NotFound)?
            .participant(user_id)
            .map(|p| p.joined_at)
            .ok_or(RepositoryError::NotFound)?;
        let count = self
            .messages
            .values()
            .filter(|m| {
                m.chat_id == chat_id
                    && !m.withheld
                    && m.created_at >= joined_at
                    && m.sender_id != user_id
                    && !m.hidden_for.contains(&user_id)
                    && !m.is_read_by(user_id)
            })
            .count();
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn ordering_key(message: &Message) -> (Timestamp, i64) {
    (message.created_at, message.sequence)
}

#[async_trait]
impl ChatRepository for MemoryStore {
    async fn create(&self, chat: Chat) -> Result<Chat, RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables.chats.contains_key(&chat.id) {
            return Err(RepositoryError::Conflict);
        }
        tables.chats.insert(chat.id, chat.clone());
        Ok(chat)
    }

    async fn find_by_id(&self, id: ChatId) -> Result<Option<Chat>, RepositoryError> {
        Ok(self.tables.read().await.chats.get(&id).cloned())
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Chat>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut chats: Vec<Chat> = tables
            .chats
            .values()
            .filter(|chat| chat.is_participant(user_id))
            .cloned()
            .collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(chats)
    }

    async fn add_participant(
        &self,
        chat_id: ChatId,
        participant: Participant,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables.write().await;
        let chat = tables.chat_mut(chat_id)?;
        if chat.is_participant(participant.user_id) {
            return Err(RepositoryError::Conflict);
        }
        chat.updated_at = participant.joined_at;
        chat.participants.push(participant);
        Ok(())
    }

    async fn remove_participant(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        let mut tables = self.tables.write().await;
        let chat = tables.chat_mut(chat_id)?;
        let updated_at = chat.updated_at;
        Ok(chat.remove_participant(user_id, updated_at))
    }

    async fn recompute_unread(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<u32, RepositoryError> {
        let mut tables = self.tables.write().await;
        let unread = tables.unread_for(chat_id, user_id)?;
        let chat = tables.chat_mut(chat_id)?;
        if !chat.set_unread(user_id, unread) {
            return Err(RepositoryError::NotFound);
        }
        Ok(unread)
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn create(&self, mut message: Message) -> Result<Message, RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables.messages.contains_key(&message.id) {
            return Err(RepositoryError::Conflict);
        }
        if !message.withheld {
            tables
                .chat_mut(message.chat_id)?
                .record_message(message.id, message.sender_id, message.created_at);
        } else if !tables.chats.contains_key(&message.chat_id) {
            return Err(RepositoryError::NotFound);
        }
        tables.next_sequence += 1;
        message.sequence = tables.next_sequence;
        message.version = 1;
        tables.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        Ok(self.tables.read().await.messages.get(&id).cloned())
    }

    async fn find_many(&self, ids: &[MessageId]) -> Result<Vec<Message>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| tables.messages.get(id).cloned())
            .collect())
    }

    async fn update(&self, mut message: Message) -> Result<Message, RepositoryError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .messages
            .get_mut(&message.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.version != message.version {
            return Err(RepositoryError::Conflict);
        }
        message.version += 1;
        *stored = message.clone();
        Ok(message)
    }

    async fn promote(
        &self,
        id: MessageId,
        now: Timestamp,
    ) -> Result<Option<Message>, RepositoryError> {
        let mut tables = self.tables.write().await;
        let Some(message) = tables.messages.get_mut(&id) else {
            return Err(RepositoryError::NotFound);
        };
        if !message.promote(now) {
            return Ok(None);
        }
        message.version += 1;
        let promoted = message.clone();
        tables
            .chat_mut(promoted.chat_id)?
            .record_message(promoted.id, promoted.sender_id, now);
        Ok(Some(promoted))
    }

    async fn list_chat(
        &self,
        chat_id: ChatId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let tables = self.tables.read().await;
        let cursor = match before {
            Some(id) => Some(
                tables
                    .messages
                    .get(&id)
                    .map(ordering_key)
                    .ok_or(RepositoryError::NotFound)?,
            ),
            None => None,
        };
        let mut page: Vec<Message> = tables
            .messages
            .values()
            .filter(|m| m.chat_id == chat_id)
            .filter(|m| cursor.map_or(true, |cursor| ordering_key(m) < cursor))
            .cloned()
            .collect();
        page.sort_by_key(ordering_key);
        let skip = page.len().saturating_sub(limit as usize);
        Ok(page.split_off(skip))
    }

    async fn list_due_scheduled(
        &self,
        now: Timestamp,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut due: Vec<Message> = tables
            .messages
            .values()
            .filter(|m| {
                m.withheld && !m.is_tombstoned() && m.scheduled_at.is_some_and(|at| at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|m| (m.scheduled_at, m.sequence));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn list_due_self_destruct(
        &self,
        now: Timestamp,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let tables = self.tables.read().await;
        let mut due: Vec<Message> = tables
            .messages
            .values()
            .filter(|m| m.self_destruct_due(now))
            .cloned()
            .collect();
        due.sort_by_key(ordering_key);
        due.truncate(limit as usize);
        Ok(due)
    }
}

#[async_trait]
impl CallRepository for MemoryStore {
    async fn create(&self, mut call: Call) -> Result<Call, RepositoryError> {
        let mut tables = self.tables.write().await;
        if tables.calls.contains_key(&call.id) {
            return Err(RepositoryError::Conflict);
        }
        call.version = 1;
        tables.calls.insert(call.id, call.clone());
        Ok(call)
    }

    async fn find_by_id(&self, id: CallId) -> Result<Option<Call>, RepositoryError> {
        Ok(self.tables.read().await.calls.get(&id).cloned())
    }

    async fn update(&self, mut call: Call) -> Result<Call, RepositoryError> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .calls
            .get_mut(&call.id)
            .ok_or(RepositoryError::NotFound)?;
        if stored.version != call.version {
            return Err(RepositoryError::Conflict);
        }
        call.version += 1;
        *stored = call.clone();
        Ok(call)
    }

    async fn find_active_for_user(&self, user_id: UserId) -> Result<Vec<Call>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .calls
            .values()
            .filter(|call| !call.status.is_terminal() && call.status != CallStatus::Initiated)
            .filter(|call| {
                call.initiator == user_id
                    || call.participant(user_id).is_some_and(|p| {
                        matches!(
                            p.status,
                            ParticipantCallStatus::Ringing | ParticipantCallStatus::Accepted
                        )
                    })
            })
            .cloned()
            .collect())
    }

    async fn list_ringing_since(&self, cutoff: Timestamp) -> Result<Vec<Call>, RepositoryError> {
        let tables = self.tables.read().await;
        Ok(tables
            .calls
            .values()
            .filter(|call| call.status == CallStatus::Ringing && call.created_at <= cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PresenceRepository for MemoryStore {
    async fn record_last_seen(
        &self,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        self.tables.write().await.last_seen.insert(user_id, at);
        Ok(())
    }

    async fn last_seen(&self, user_id: UserId) -> Result<Option<Timestamp>, RepositoryError> {
        Ok(self.tables.read().await.last_seen.get(&user_id).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use domain::{ChatType, MessageContent, MessageType, NewMessage};
    use uuid::Uuid;

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    fn message(chat: ChatId, sender: UserId, now: Timestamp) -> Message {
        Message::new(
            NewMessage {
                id: MessageId::from(Uuid::new_v4()),
                chat_id: chat,
                sender_id: sender,
                message_type: MessageType::Text,
                content: MessageContent::new("hi").unwrap(),
                attachment_ref: None,
                reply_to: None,
                forwarded_from: None,
                mentions: Vec::new(),
                scheduled_at: None,
                self_destruct_secs: None,
            },
            now,
        )
        .unwrap()
    }

    async fn seeded_chat(store: &MemoryStore, a: UserId, b: UserId) -> Chat {
        let chat = Chat::new(
            ChatId::from(Uuid::new_v4()),
            ChatType::Direct,
            a,
            [b],
            Utc::now(),
        )
        .unwrap();
        ChatRepository::create(store, chat).await.unwrap()
    }

    #[tokio::test]
    async fn stale_version_is_rejected() {
        let store = MemoryStore::new();
        let (a, b) = (user(), user());
        let chat = seeded_chat(&store, a, b).await;
        let stored = MessageRepository::create(&store, message(chat.id, a, Utc::now()))
            .await
            .unwrap();

        let mut first = stored.clone();
        first.mark_delivered(b, Utc::now());
        MessageRepository::update(&store, first).await.unwrap();

        let mut stale = stored;
        stale.mark_read(b, Utc::now());
        assert_eq!(
            MessageRepository::update(&store, stale).await,
            Err(RepositoryError::Conflict)
        );
    }

    #[tokio::test]
    async fn history_pages_backwards_in_order() {
        let store = MemoryStore::new();
        let (a, b) = (user(), user());
        let chat = seeded_chat(&store, a, b).await;
        let now = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let stored =
                MessageRepository::create(&store, message(chat.id, a, now + Duration::seconds(i)))
                    .await
                    .unwrap();
            ids.push(stored.id);
        }

        let latest = store.list_chat(chat.id, 2, None).await.unwrap();
        assert_eq!(
            latest.iter().map(|m| m.id).collect::<Vec<_>>(),
            ids[3..].to_vec()
        );

        let older = store.list_chat(chat.id, 10, Some(ids[3])).await.unwrap();
        assert_eq!(
            older.iter().map(|m| m.id).collect::<Vec<_>>(),
            ids[..3].to_vec()
        );
    }

    #[tokio::test]
    async fn create_updates_pointer_and_counters() {
        let store = MemoryStore::new();
        let (a, b) = (user(), user());
        let chat = seeded_chat(&store, a, b).await;
        let stored = MessageRepository::create(&store, message(chat.id, a, Utc::now()))
            .await
            .unwrap();

        let chat = ChatRepository::find_by_id(&store, chat.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chat.last_message, Some(stored.id));
        assert_eq!(chat.unread_count(b), Some(1));
        assert_eq!(chat.unread_count(a), Some(0));
    }

    #[tokio::test]
    async fn recompute_counts_unread_messages() {
        let store = MemoryStore::new();
        let (a, b) = (user(), user());
        let chat = seeded_chat(&store, a, b).await;
        let first = MessageRepository::create(&store, message(chat.id, a, Utc::now()))
            .await
            .unwrap();
        MessageRepository::create(&store, message(chat.id, a, Utc::now()))
            .await
            .unwrap();

        let mut read = first.clone();
        read.mark_read(b, Utc::now());
        MessageRepository::update(&store, read).await.unwrap();

        assert_eq!(store.recompute_unread(chat.id, b).await.unwrap(), 1);
    }
}
