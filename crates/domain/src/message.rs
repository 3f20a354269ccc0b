use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ChatId, MessageContent, MessageId, Timestamp, UserId};

/// 为所有人删除后的占位内容
pub const DELETED_PLACEHOLDER: &str = "This message was deleted";
/// 阅后即焚到期后的占位内容
pub const EXPIRED_PLACEHOLDER: &str = "This message has expired";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Image,
    Video,
    Audio,
    File,
    Location,
    Contact,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Image => "image",
            MessageType::Video => "video",
            MessageType::Audio => "audio",
            MessageType::File => "file",
            MessageType::Location => "location",
            MessageType::Contact => "contact",
        }
    }

    pub fn carries_attachment(&self) -> bool {
        matches!(
            self,
            MessageType::Image | MessageType::Video | MessageType::Audio | MessageType::File
        )
    }
}

impl FromStr for MessageType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(MessageType::Text),
            "image" => Ok(MessageType::Image),
            "video" => Ok(MessageType::Video),
            "audio" => Ok(MessageType::Audio),
            "file" => Ok(MessageType::File),
            "location" => Ok(MessageType::Location),
            "contact" => Ok(MessageType::Contact),
            other => Err(DomainError::invalid_argument(
                "message_type",
                format!("unknown message type {other}"),
            )),
        }
    }
}

/// 送达 / 已读回执，每个用户至多一条
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub user_id: UserId,
    pub at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub user_id: UserId,
    pub emoji: String,
    pub reacted_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRevision {
    pub content: MessageContent,
    pub edited_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tombstone {
    Deleted,
    Expired,
}

impl Tombstone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tombstone::Deleted => "deleted",
            Tombstone::Expired => "expired",
        }
    }

    fn placeholder(&self) -> &'static str {
        match self {
            Tombstone::Deleted => DELETED_PLACEHOLDER,
            Tombstone::Expired => EXPIRED_PLACEHOLDER,
        }
    }
}

impl FromStr for Tombstone {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deleted" => Ok(Tombstone::Deleted),
            "expired" => Ok(Tombstone::Expired),
            other => Err(DomainError::invalid_argument(
                "tombstone",
                format!("unknown tombstone {other}"),
            )),
        }
    }
}

/// 阅后即焚设置；计时从第一位非发送者查看时开始，对所有人生效
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfDestruct {
    pub duration_secs: u32,
    pub first_viewed_at: Option<Timestamp>,
}

impl SelfDestruct {
    pub fn new(duration_secs: u32) -> Result<Self, DomainError> {
        if duration_secs == 0 {
            return Err(DomainError::invalid_argument(
                "self_destruct_seconds",
                "must be positive",
            ));
        }
        Ok(Self {
            duration_secs,
            first_viewed_at: None,
        })
    }

    pub fn expires_at(&self) -> Option<Timestamp> {
        self.first_viewed_at
            .map(|viewed| viewed + Duration::seconds(i64::from(self.duration_secs)))
    }
}

/// 创建消息所需的参数
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub message_type: MessageType,
    pub content: MessageContent,
    pub attachment_ref: Option<String>,
    pub reply_to: Option<MessageId>,
    pub forwarded_from: Option<MessageId>,
    pub mentions: Vec<UserId>,
    pub scheduled_at: Option<Timestamp>,
    pub self_destruct_secs: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    pub message_type: MessageType,
    pub content: MessageContent,
    pub attachment_ref: Option<String>,
    pub reply_to: Option<MessageId>,
    pub forwarded_from: Option<MessageId>,
    pub mentions: Vec<UserId>,
    pub created_at: Timestamp,
    /// 存储层分配的插入序号，创建时间相同时用于排序
    pub sequence: i64,
    pub delivered_to: Vec<Receipt>,
    pub read_by: Vec<Receipt>,
    pub reactions: Vec<Reaction>,
    pub starred_by: Vec<UserId>,
    pub edit_history: Vec<MessageRevision>,
    pub edited_at: Option<Timestamp>,
    pub tombstone: Option<Tombstone>,
    pub deleted_at: Option<Timestamp>,
    #[serde(default, skip_serializing)] // 仅对请求者本人生效，不下发
    pub hidden_for: Vec<UserId>,
    pub withheld: bool,
    pub scheduled_at: Option<Timestamp>,
    pub self_destruct: Option<SelfDestruct>,
    #[serde(skip)]
    pub version: i64,
}

impl Message {
    pub fn new(params: NewMessage, now: Timestamp) -> Result<Self, DomainError> {
        if params.attachment_ref.is_none() && params.message_type.carries_attachment() {
            return Err(DomainError::invalid_argument(
                "attachment_ref",
                "required for media messages",
            ));
        }
        let self_destruct = params.self_destruct_secs.map(SelfDestruct::new).transpose()?;
        let withheld = params.scheduled_at.is_some_and(|due| due > now);

        Ok(Self {
            id: params.id,
            chat_id: params.chat_id,
            sender_id: params.sender_id,
            message_type: params.message_type,
            content: params.content,
            attachment_ref: params.attachment_ref,
            reply_to: params.reply_to,
            forwarded_from: params.forwarded_from,
            mentions: params.mentions,
            created_at: now,
            sequence: 0,
            delivered_to: Vec::new(),
            read_by: Vec::new(),
            reactions: Vec::new(),
            starred_by: Vec::new(),
            edit_history: Vec::new(),
            edited_at: None,
            tombstone: None,
            deleted_at: None,
            hidden_for: Vec::new(),
            withheld,
            scheduled_at: params.scheduled_at,
            self_destruct,
            version: 0,
        })
    }

    pub fn is_withheld(&self) -> bool {
        self.withheld
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstone.is_some()
    }

    pub fn is_delivered_to(&self, user_id: UserId) -> bool {
        self.delivered_to.iter().any(|r| r.user_id == user_id)
    }

    pub fn is_read_by(&self, user_id: UserId) -> bool {
        self.read_by.iter().any(|r| r.user_id == user_id)
    }

    /// 幂等地记录送达；发送者本人不计入
    pub fn mark_delivered(&mut self, user_id: UserId, at: Timestamp) -> bool {
        if user_id == self.sender_id || self.is_delivered_to(user_id) {
            return false;
        }
        self.delivered_to.push(Receipt { user_id, at });
        true
    }

    /// 幂等地记录已读；已读隐含送达。首次被查看时启动阅后即焚计时
    pub fn mark_read(&mut self, user_id: UserId, at: Timestamp) -> bool {
        if user_id == self.sender_id || self.is_read_by(user_id) {
            return false;
        }
        self.mark_delivered(user_id, at);
        self.read_by.push(Receipt { user_id, at });
        if let Some(self_destruct) = self.self_destruct.as_mut() {
            if self_destruct.first_viewed_at.is_none() {
                self_destruct.first_viewed_at = Some(at);
            }
        }
        true
    }

    pub fn edit(
        &mut self,
        editor_id: UserId,
        new_content: MessageContent,
        now: Timestamp,
        window: Duration,
    ) -> Result<(), DomainError> {
        if self.is_tombstoned() {
            return Err(DomainError::MessageDeleted);
        }
        if editor_id != self.sender_id {
            return Err(DomainError::forbidden("edit this message"));
        }
        if now - self.created_at > window {
            return Err(DomainError::EditWindowExpired);
        }
        let previous = std::mem::replace(&mut self.content, new_content);
        self.edit_history.push(MessageRevision {
            content: previous,
            edited_at: now,
        });
        self.edited_at = Some(now);
        Ok(())
    }

    /// 为所有人删除。已经是墓碑时返回 `Ok(false)`
    pub fn delete_for_everyone(
        &mut self,
        requester_id: UserId,
        now: Timestamp,
    ) -> Result<bool, DomainError> {
        if requester_id != self.sender_id {
            return Err(DomainError::forbidden("delete this message for everyone"));
        }
        if self.is_tombstoned() {
            return Ok(false);
        }
        self.apply_tombstone(Tombstone::Deleted, now);
        Ok(true)
    }

    /// 仅对自己隐藏
    pub fn hide_for(&mut self, user_id: UserId) -> bool {
        if self.hidden_for.contains(&user_id) {
            return false;
        }
        self.hidden_for.push(user_id);
        true
    }

    /// 每个用户在一条消息上至多一个表情；`None` 表示撤回
    pub fn set_reaction(
        &mut self,
        user_id: UserId,
        emoji: Option<String>,
        now: Timestamp,
    ) -> Result<(), DomainError> {
        if self.is_tombstoned() {
            return Err(DomainError::MessageDeleted);
        }
        self.reactions.retain(|r| r.user_id != user_id);
        if let Some(emoji) = emoji {
            let emoji = emoji.trim().to_owned();
            if emoji.is_empty() {
                return Err(DomainError::invalid_argument("emoji", "cannot be empty"));
            }
            self.reactions.push(Reaction {
                user_id,
                emoji,
                reacted_at: now,
            });
        }
        Ok(())
    }

    pub fn set_starred(&mut self, user_id: UserId, starred: bool) -> bool {
        let present = self.starred_by.contains(&user_id);
        match (starred, present) {
            (true, false) => {
                self.starred_by.push(user_id);
                true
            }
            (false, true) => {
                self.starred_by.retain(|u| *u != user_id);
                true
            }
            _ => false,
        }
    }

    /// 定时消息到期：解除扣留并把创建时间改为实际发送时间
    ///
    /// 到期前已被删除的定时消息保持扣留，永不发布。
    pub fn promote(&mut self, now: Timestamp) -> bool {
        if !self.withheld || self.is_tombstoned() {
            return false;
        }
        self.withheld = false;
        self.created_at = now;
        true
    }

    pub fn self_destruct_due(&self, now: Timestamp) -> bool {
        if self.is_tombstoned() {
            return false;
        }
        self.self_destruct
            .as_ref()
            .and_then(SelfDestruct::expires_at)
            .is_some_and(|expires_at| now >= expires_at)
    }

    pub fn expire(&mut self, now: Timestamp) -> bool {
        if !self.self_destruct_due(now) {
            return false;
        }
        self.apply_tombstone(Tombstone::Expired, now);
        true
    }

    fn apply_tombstone(&mut self, kind: Tombstone, now: Timestamp) {
        self.content = MessageContent::raw(kind.placeholder());
        self.attachment_ref = None;
        self.edit_history.clear();
        self.reactions.clear();
        self.mentions.clear();
        self.tombstone = Some(kind);
        self.deleted_at = Some(now);
    }

    /// 定时消息在发送前只有发送者能看到
    pub fn is_visible_to(&self, viewer: UserId) -> bool {
        if self.hidden_for.contains(&viewer) {
            return false;
        }
        !self.withheld || self.sender_id == viewer
    }

    /// 面向某个读者的视图：隐藏他人的收藏标记
    pub fn view_for(&self, viewer: UserId) -> Option<Message> {
        if !self.is_visible_to(viewer) {
            return None;
        }
        let mut view = self.clone();
        view.hidden_for.clear();
        view.starred_by.retain(|u| *u == viewer);
        Some(view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    fn text_message(sender: UserId, now: Timestamp) -> Message {
        Message::new(
            NewMessage {
                id: MessageId::from(Uuid::new_v4()),
                chat_id: ChatId::from(Uuid::new_v4()),
                sender_id: sender,
                message_type: MessageType::Text,
                content: MessageContent::new("hello").unwrap(),
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

    #[test]
    fn read_is_idempotent_and_implies_delivery() {
        let (sender, reader) = (user(), user());
        let now = Utc::now();
        let mut message = text_message(sender, now);

        assert!(message.mark_read(reader, now));
        assert!(!message.mark_read(reader, now));
        assert_eq!(message.read_by.len(), 1);
        assert!(message.is_delivered_to(reader));
        assert!(!message.mark_delivered(reader, now));
    }

    #[test]
    fn sender_receipts_are_ignored() {
        let sender = user();
        let now = Utc::now();
        let mut message = text_message(sender, now);

        assert!(!message.mark_delivered(sender, now));
        assert!(!message.mark_read(sender, now));
        assert!(message.delivered_to.is_empty());
        assert!(message.read_by.is_empty());
    }

    #[test]
    fn edit_checks_sender_then_window() {
        let (sender, other) = (user(), user());
        let created = Utc::now();
        let mut message = text_message(sender, created);
        let window = Duration::hours(1);
        let new_content = MessageContent::new("edited").unwrap();

        assert!(matches!(
            message.edit(other, new_content.clone(), created, window),
            Err(DomainError::Forbidden { .. })
        ));
        assert_eq!(
            message.edit(sender, new_content.clone(), created + Duration::minutes(61), window),
            Err(DomainError::EditWindowExpired)
        );

        message
            .edit(sender, new_content, created + Duration::minutes(5), window)
            .unwrap();
        assert_eq!(message.content.as_str(), "edited");
        assert_eq!(message.edit_history.len(), 1);
        assert_eq!(message.edit_history[0].content.as_str(), "hello");
    }

    #[test]
    fn reaction_replaces_previous_one() {
        let (sender, reactor) = (user(), user());
        let now = Utc::now();
        let mut message = text_message(sender, now);

        message.set_reaction(reactor, Some("👍".into()), now).unwrap();
        message.set_reaction(reactor, Some("🎉".into()), now).unwrap();
        assert_eq!(message.reactions.len(), 1);
        assert_eq!(message.reactions[0].emoji, "🎉");

        message.set_reaction(reactor, None, now).unwrap();
        assert!(message.reactions.is_empty());
    }

    #[test]
    fn delete_for_everyone_tombstones_content() {
        let sender = user();
        let now = Utc::now();
        let mut message = text_message(sender, now);
        message
            .edit(sender, MessageContent::new("secret").unwrap(), now, Duration::hours(1))
            .unwrap();

        assert!(message.delete_for_everyone(user(), now).is_err());
        assert_eq!(message.delete_for_everyone(sender, now), Ok(true));
        assert_eq!(message.delete_for_everyone(sender, now), Ok(false));
        assert_eq!(message.content.as_str(), DELETED_PLACEHOLDER);
        assert!(message.edit_history.is_empty());
    }

    #[test]
    fn self_destruct_timer_starts_on_first_view() {
        let (sender, first, second) = (user(), user(), user());
        let now = Utc::now();
        let mut message = text_message(sender, now);
        message.self_destruct = Some(SelfDestruct::new(10).unwrap());

        assert!(!message.self_destruct_due(now + Duration::hours(1)));

        message.mark_read(first, now);
        message.mark_read(second, now + Duration::seconds(8));
        let viewed = message.self_destruct.as_ref().unwrap().first_viewed_at;
        assert_eq!(viewed, Some(now));

        assert!(!message.expire(now + Duration::seconds(9)));
        assert!(message.expire(now + Duration::seconds(11)));
        assert!(!message.expire(now + Duration::seconds(12)));
        assert_eq!(message.content.as_str(), EXPIRED_PLACEHOLDER);
        assert_eq!(message.tombstone, Some(Tombstone::Expired));
    }

    #[test]
    fn promote_only_once() {
        let sender = user();
        let now = Utc::now();
        let mut message = text_message(sender, now);
        message.withheld = true;

        let later = now + Duration::minutes(3);
        assert!(message.promote(later));
        assert!(!message.promote(later + Duration::minutes(1)));
        assert_eq!(message.created_at, later);
    }

    #[test]
    fn deleted_scheduled_message_is_never_promoted() {
        let sender = user();
        let now = Utc::now();
        let mut message = text_message(sender, now);
        message.withheld = true;

        assert_eq!(message.delete_for_everyone(sender, now), Ok(true));
        assert!(!message.promote(now + Duration::minutes(5)));
        assert!(message.is_withheld());
        assert_eq!(message.created_at, now);
    }

    #[test]
    fn withheld_message_only_visible_to_sender() {
        let (sender, other) = (user(), user());
        let mut message = text_message(sender, Utc::now());
        message.withheld = true;

        assert!(message.view_for(sender).is_some());
        assert!(message.view_for(other).is_none());
    }

    #[test]
    fn media_message_requires_attachment() {
        let result = Message::new(
            NewMessage {
                id: MessageId::from(Uuid::new_v4()),
                chat_id: ChatId::from(Uuid::new_v4()),
                sender_id: user(),
                message_type: MessageType::Image,
                content: MessageContent::caption("").unwrap(),
                attachment_ref: None,
                reply_to: None,
                forwarded_from: None,
                mentions: Vec::new(),
                scheduled_at: None,
                self_destruct_secs: None,
            },
            Utc::now(),
        );
        assert!(result.is_err());
    }
}
