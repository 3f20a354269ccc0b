use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{ChatId, MessageId, Timestamp, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatType {
    Direct,
    Group,
    Channel,
    Broadcast,
}

impl ChatType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatType::Direct => "direct",
            ChatType::Group => "group",
            ChatType::Channel => "channel",
            ChatType::Broadcast => "broadcast",
        }
    }
}

impl FromStr for ChatType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ChatType::Direct),
            "group" => Ok(ChatType::Group),
            "channel" => Ok(ChatType::Channel),
            "broadcast" => Ok(ChatType::Broadcast),
            other => Err(DomainError::invalid_argument(
                "chat_type",
                format!("unknown chat type {other}"),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Owner,
    Admin,
    Member,
}

impl ParticipantRole {
    pub fn is_admin(&self) -> bool {
        matches!(self, ParticipantRole::Owner | ParticipantRole::Admin)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Owner => "owner",
            ParticipantRole::Admin => "admin",
            ParticipantRole::Member => "member",
        }
    }
}

impl FromStr for ParticipantRole {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(ParticipantRole::Owner),
            "admin" => Ok(ParticipantRole::Admin),
            "member" => Ok(ParticipantRole::Member),
            other => Err(DomainError::invalid_argument(
                "role",
                format!("unknown role {other}"),
            )),
        }
    }
}

/// 参与者记录，未读计数与参与者一一对应
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub role: ParticipantRole,
    pub muted: bool,
    pub unread_count: u32,
    pub joined_at: Timestamp,
}

impl Participant {
    pub fn new(user_id: UserId, role: ParticipantRole, joined_at: Timestamp) -> Self {
        Self {
            user_id,
            role,
            muted: false,
            unread_count: 0,
            joined_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub chat_type: ChatType,
    pub participants: Vec<Participant>,
    /// 群聊开启后仅管理员可以发言
    pub admins_only: bool,
    pub last_message: Option<MessageId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Chat {
    /// 创建会话，`owner` 自动成为 Owner 角色。
    pub fn new(
        id: ChatId,
        chat_type: ChatType,
        owner: UserId,
        members: impl IntoIterator<Item = UserId>,
        created_at: Timestamp,
    ) -> Result<Self, DomainError> {
        let mut participants = vec![Participant::new(owner, ParticipantRole::Owner, created_at)];
        for user_id in members {
            if participants.iter().any(|p| p.user_id == user_id) {
                continue;
            }
            participants.push(Participant::new(user_id, ParticipantRole::Member, created_at));
        }

        if chat_type == ChatType::Direct && participants.len() != 2 {
            return Err(DomainError::invalid_argument(
                "participants",
                "a direct chat has exactly two participants",
            ));
        }

        Ok(Self {
            id,
            chat_type,
            participants,
            admins_only: false,
            last_message: None,
            created_at,
            updated_at: created_at,
        })
    }

    pub fn participant(&self, user_id: UserId) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn is_participant(&self, user_id: UserId) -> bool {
        self.participant(user_id).is_some()
    }

    pub fn participant_ids(&self) -> Vec<UserId> {
        self.participants.iter().map(|p| p.user_id).collect()
    }

    /// 除 `user_id` 之外的所有参与者
    pub fn others(&self, user_id: UserId) -> Vec<UserId> {
        self.participants
            .iter()
            .filter(|p| p.user_id != user_id)
            .map(|p| p.user_id)
            .collect()
    }

    pub fn ensure_participant(&self, user_id: UserId) -> Result<&Participant, DomainError> {
        self.participant(user_id).ok_or(DomainError::NotParticipant)
    }

    /// 发言权限检查：频道只有管理员，广播只有所有者，群聊按 `admins_only` 开关
    pub fn ensure_can_post(&self, user_id: UserId) -> Result<&Participant, DomainError> {
        let participant = self.ensure_participant(user_id)?;
        let allowed = match self.chat_type {
            ChatType::Direct => true,
            ChatType::Group => !self.admins_only || participant.role.is_admin(),
            ChatType::Channel => participant.role.is_admin(),
            ChatType::Broadcast => participant.role == ParticipantRole::Owner,
        };
        if !allowed {
            return Err(DomainError::permission_denied("post in this chat"));
        }
        Ok(participant)
    }

    pub fn add_participant(
        &mut self,
        user_id: UserId,
        role: ParticipantRole,
        at: Timestamp,
    ) -> Result<(), DomainError> {
        if self.chat_type == ChatType::Direct {
            return Err(DomainError::permission_denied("add members to a direct chat"));
        }
        if self.is_participant(user_id) {
            return Err(DomainError::invalid_argument(
                "user_id",
                "already a participant",
            ));
        }
        self.participants.push(Participant::new(user_id, role, at));
        self.updated_at = at;
        Ok(())
    }

    /// 移除参与者及其未读计数，返回是否真的移除了
    pub fn remove_participant(&mut self, user_id: UserId, at: Timestamp) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p.user_id != user_id);
        let removed = self.participants.len() != before;
        if removed {
            self.updated_at = at;
        }
        removed
    }

    /// 新消息进入会话：更新最后消息指针，除发送者外未读数加一
    pub fn record_message(&mut self, message_id: MessageId, sender_id: UserId, at: Timestamp) {
        self.last_message = Some(message_id);
        self.updated_at = at;
        for participant in self
            .participants
            .iter_mut()
            .filter(|p| p.user_id != sender_id)
        {
            participant.unread_count = participant.unread_count.saturating_add(1);
        }
    }

    pub fn unread_count(&self, user_id: UserId) -> Option<u32> {
        self.participant(user_id).map(|p| p.unread_count)
    }

    pub fn set_unread(&mut self, user_id: UserId, count: u32) -> bool {
        match self.participants.iter_mut().find(|p| p.user_id == user_id) {
            Some(participant) => {
                participant.unread_count = count;
                true
            }
            None => false,
        }
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

    #[test]
    fn direct_chat_requires_two_people() {
        let a = user();
        let now = Utc::now();
        assert!(Chat::new(ChatId::from(Uuid::new_v4()), ChatType::Direct, a, [], now).is_err());
        assert!(Chat::new(ChatId::from(Uuid::new_v4()), ChatType::Direct, a, [user()], now).is_ok());
    }

    #[test]
    fn record_message_skips_sender_counter() {
        let (a, b, c) = (user(), user(), user());
        let now = Utc::now();
        let mut chat =
            Chat::new(ChatId::from(Uuid::new_v4()), ChatType::Group, a, [b, c], now).unwrap();
        let message_id = MessageId::from(Uuid::new_v4());

        chat.record_message(message_id, a, now);

        assert_eq!(chat.last_message, Some(message_id));
        assert_eq!(chat.unread_count(a), Some(0));
        assert_eq!(chat.unread_count(b), Some(1));
        assert_eq!(chat.unread_count(c), Some(1));
    }

    #[test]
    fn channel_members_cannot_post() {
        let (owner, member) = (user(), user());
        let chat = Chat::new(
            ChatId::from(Uuid::new_v4()),
            ChatType::Channel,
            owner,
            [member],
            Utc::now(),
        )
        .unwrap();

        assert!(chat.ensure_can_post(owner).is_ok());
        assert!(matches!(
            chat.ensure_can_post(member),
            Err(DomainError::PermissionDenied { .. })
        ));
        assert_eq!(chat.ensure_can_post(user()), Err(DomainError::NotParticipant));
    }

    #[test]
    fn admins_only_group_blocks_members() {
        let (owner, member) = (user(), user());
        let mut chat = Chat::new(
            ChatId::from(Uuid::new_v4()),
            ChatType::Group,
            owner,
            [member],
            Utc::now(),
        )
        .unwrap();
        assert!(chat.ensure_can_post(member).is_ok());

        chat.admins_only = true;
        assert!(chat.ensure_can_post(member).is_err());
    }

    #[test]
    fn removing_participant_drops_its_counter() {
        let (owner, member) = (user(), user());
        let now = Utc::now();
        let mut chat =
            Chat::new(ChatId::from(Uuid::new_v4()), ChatType::Group, owner, [member], now).unwrap();

        assert!(chat.remove_participant(member, now));
        assert!(!chat.remove_participant(member, now));
        assert_eq!(chat.unread_count(member), None);
    }
}
