//! 数据库行与领域模型之间的转换

use std::str::FromStr;

use chrono::{DateTime, Utc};
use domain::{
    Call, CallId, CallParticipant, Chat, ChatId, DomainError, Message, MessageContent, MessageId,
    MessageRevision, Participant, Reaction, Receipt, RepositoryError, SelfDestruct, UserId,
};
use sqlx::{types::Json, FromRow};
use uuid::Uuid;

pub(crate) fn map_sqlx_err(err: sqlx::Error) -> RepositoryError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => RepositoryError::Conflict,
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => RepositoryError::NotFound,
        _ => RepositoryError::storage(err.to_string()),
    }
}

pub(crate) fn invalid_data(message: impl Into<String>) -> RepositoryError {
    RepositoryError::storage(message)
}

fn parse<T>(value: &str) -> Result<T, RepositoryError>
where
    T: FromStr<Err = DomainError>,
{
    value.parse().map_err(|err: DomainError| invalid_data(err.to_string()))
}

pub(crate) const MESSAGE_COLUMNS: &str = "id, chat_id, sender_id, message_type, content, \
     attachment_ref, reply_to, forwarded_from, mentions, created_at, sequence, delivered_to, \
     read_by, reactions, starred_by, edit_history, edited_at, tombstone, deleted_at, hidden_for, \
     withheld, scheduled_at, self_destruct_secs, first_viewed_at, version";

pub(crate) const CALL_COLUMNS: &str = "id, chat_id, initiator_id, medium, participants, status, \
     created_at, started_at, ended_at, duration_secs, version";

#[derive(Debug, FromRow)]
pub(crate) struct ChatRecord {
    pub id: Uuid,
    pub chat_type: String,
    pub admins_only: bool,
    pub last_message_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct ParticipantRecord {
    pub chat_id: Uuid,
    pub user_id: Uuid,
    pub role: String,
    pub muted: bool,
    pub unread_count: i32,
    pub joined_at: DateTime<Utc>,
}

impl ParticipantRecord {
    fn to_participant(&self) -> Result<Participant, RepositoryError> {
        Ok(Participant {
            user_id: UserId::from(self.user_id),
            role: parse(&self.role)?,
            muted: self.muted,
            unread_count: u32::try_from(self.unread_count).unwrap_or(0),
            joined_at: self.joined_at,
        })
    }
}

impl ChatRecord {
    /// 与参与者行合并为完整会话；`participants` 可以包含其他会话的行
    pub fn into_chat(self, participants: &[ParticipantRecord]) -> Result<Chat, RepositoryError> {
        let members = participants
            .iter()
            .filter(|p| p.chat_id == self.id)
            .map(ParticipantRecord::to_participant)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Chat {
            id: ChatId::from(self.id),
            chat_type: parse(&self.chat_type)?,
            participants: members,
            admins_only: self.admins_only,
            last_message: self.last_message_id.map(MessageId::from),
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct MessageRecord {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub sender_id: Uuid,
    pub message_type: String,
    pub content: String,
    pub attachment_ref: Option<String>,
    pub reply_to: Option<Uuid>,
    pub forwarded_from: Option<Uuid>,
    pub mentions: Json<Vec<UserId>>,
    pub created_at: DateTime<Utc>,
    pub sequence: i64,
    pub delivered_to: Json<Vec<Receipt>>,
    pub read_by: Json<Vec<Receipt>>,
    pub reactions: Json<Vec<Reaction>>,
    pub starred_by: Json<Vec<UserId>>,
    pub edit_history: Json<Vec<MessageRevision>>,
    pub edited_at: Option<DateTime<Utc>>,
    pub tombstone: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub hidden_for: Json<Vec<UserId>>,
    pub withheld: bool,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub self_destruct_secs: Option<i32>,
    pub first_viewed_at: Option<DateTime<Utc>>,
    pub version: i64,
}

impl TryFrom<MessageRecord> for Message {
    type Error = RepositoryError;

    fn try_from(value: MessageRecord) -> Result<Self, Self::Error> {
        // 附件说明和占位内容都可能不满足正文规则，这里只校验长度
        let content =
            MessageContent::caption(value.content).map_err(|err| invalid_data(err.to_string()))?;
        let self_destruct = value
            .self_destruct_secs
            .map(|secs| {
                u32::try_from(secs)
                    .map(|duration_secs| SelfDestruct {
                        duration_secs,
                        first_viewed_at: value.first_viewed_at,
                    })
                    .map_err(|_| invalid_data("negative self-destruct duration"))
            })
            .transpose()?;
        let tombstone = value.tombstone.as_deref().map(parse).transpose()?;

        Ok(Message {
            id: MessageId::from(value.id),
            chat_id: ChatId::from(value.chat_id),
            sender_id: UserId::from(value.sender_id),
            message_type: parse(&value.message_type)?,
            content,
            attachment_ref: value.attachment_ref,
            reply_to: value.reply_to.map(MessageId::from),
            forwarded_from: value.forwarded_from.map(MessageId::from),
            mentions: value.mentions.0,
            created_at: value.created_at,
            sequence: value.sequence,
            delivered_to: value.delivered_to.0,
            read_by: value.read_by.0,
            reactions: value.reactions.0,
            starred_by: value.starred_by.0,
            edit_history: value.edit_history.0,
            edited_at: value.edited_at,
            tombstone,
            deleted_at: value.deleted_at,
            hidden_for: value.hidden_for.0,
            withheld: value.withheld,
            scheduled_at: value.scheduled_at,
            self_destruct,
            version: value.version,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct CallRecord {
    pub id: Uuid,
    pub chat_id: Uuid,
    pub initiator_id: Uuid,
    pub medium: String,
    pub participants: Json<Vec<CallParticipant>>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub version: i64,
}

impl TryFrom<CallRecord> for Call {
    type Error = RepositoryError;

    fn try_from(value: CallRecord) -> Result<Self, Self::Error> {
        Ok(Call {
            id: CallId::from(value.id),
            chat_id: ChatId::from(value.chat_id),
            initiator: UserId::from(value.initiator_id),
            medium: parse(&value.medium)?,
            participants: value.participants.0,
            status: parse(&value.status)?,
            created_at: value.created_at,
            started_at: value.started_at,
            ended_at: value.ended_at,
            duration_secs: value.duration_secs,
            version: value.version,
        })
    }
}
