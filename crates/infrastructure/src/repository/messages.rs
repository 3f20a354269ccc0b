use std::collections::HashMap;

use application::MessageRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{ChatId, Message, MessageId, RepositoryError, Timestamp, UserId};
use sqlx::{types::Json, Postgres, Transaction};
use uuid::Uuid;

use super::records::{map_sqlx_err, MessageRecord, MESSAGE_COLUMNS};
use super::PgStorage;

fn self_destruct_secs(message: &Message) -> Option<i32> {
    message
        .self_destruct
        .as_ref()
        .map(|s| i32::try_from(s.duration_secs).unwrap_or(i32::MAX))
}

fn first_viewed_at(message: &Message) -> Option<Timestamp> {
    message
        .self_destruct
        .as_ref()
        .and_then(|s| s.first_viewed_at)
}

/// 锁住会话行，会话不存在时返回 `NotFound`
async fn lock_chat(tx: &mut Transaction<'_, Postgres>, chat_id: ChatId) -> Result<(), RepositoryError> {
    let locked: Option<Uuid> = sqlx::query_scalar("SELECT id FROM chats WHERE id = $1 FOR UPDATE")
        .bind(Uuid::from(chat_id))
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;
    locked.map(|_| ()).ok_or(RepositoryError::NotFound)
}

/// 新消息进入会话：更新最后消息指针，发送者以外的参与者未读数加一
async fn record_in_chat(
    tx: &mut Transaction<'_, Postgres>,
    chat_id: ChatId,
    message_id: MessageId,
    sender_id: UserId,
    at: Timestamp,
) -> Result<(), RepositoryError> {
    sqlx::query("UPDATE chats SET last_message_id = $2, updated_at = $3 WHERE id = $1")
        .bind(Uuid::from(chat_id))
        .bind(Uuid::from(message_id))
        .bind(at)
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_err)?;
    sqlx::query(
        "UPDATE chat_participants SET unread_count = unread_count + 1 \
         WHERE chat_id = $1 AND user_id <> $2",
    )
    .bind(Uuid::from(chat_id))
    .bind(Uuid::from(sender_id))
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_err)?;
    Ok(())
}

/// 按版本号写回可变列，版本不匹配时返回 `None`
async fn write_back<'e, E>(executor: E, message: &Message) -> Result<Option<MessageRecord>, RepositoryError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    let sql = format!(
        r#"
        UPDATE messages SET
            content = $3, attachment_ref = $4, mentions = $5, created_at = $6,
            delivered_to = $7, read_by = $8, reactions = $9, starred_by = $10,
            edit_history = $11, edited_at = $12, tombstone = $13, deleted_at = $14,
            hidden_for = $15, withheld = $16, first_viewed_at = $17,
            version = version + 1
        WHERE id = $1 AND version = $2
        RETURNING {MESSAGE_COLUMNS}
        "#
    );
    sqlx::query_as::<_, MessageRecord>(&sql)
        .bind(Uuid::from(message.id))
        .bind(message.version)
        .bind(message.content.as_str())
        .bind(message.attachment_ref.as_deref())
        .bind(Json(&message.mentions))
        .bind(message.created_at)
        .bind(Json(&message.delivered_to))
        .bind(Json(&message.read_by))
        .bind(Json(&message.reactions))
        .bind(Json(&message.starred_by))
        .bind(Json(&message.edit_history))
        .bind(message.edited_at)
        .bind(message.tombstone.map(|t| t.as_str()))
        .bind(message.deleted_at)
        .bind(Json(&message.hidden_for))
        .bind(message.withheld)
        .bind(first_viewed_at(message))
        .fetch_optional(executor)
        .await
        .map_err(map_sqlx_err)
}

fn into_messages(records: Vec<MessageRecord>) -> Result<Vec<Message>, RepositoryError> {
    records.into_iter().map(Message::try_from).collect()
}

#[async_trait]
impl MessageRepository for PgStorage {
    async fn create(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_err)?;
        lock_chat(&mut tx, message.chat_id).await?;

        let sql = format!(
            r#"
            INSERT INTO messages (
                id, chat_id, sender_id, message_type, content, attachment_ref, reply_to,
                forwarded_from, mentions, created_at, delivered_to, read_by, reactions,
                starred_by, edit_history, edited_at, tombstone, deleted_at, hidden_for,
                withheld, scheduled_at, self_destruct_secs, first_viewed_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, 1)
            RETURNING {MESSAGE_COLUMNS}
            "#
        );
        let record = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(Uuid::from(message.id))
            .bind(Uuid::from(message.chat_id))
            .bind(Uuid::from(message.sender_id))
            .bind(message.message_type.as_str())
            .bind(message.content.as_str())
            .bind(message.attachment_ref.as_deref())
            .bind(message.reply_to.map(Uuid::from))
            .bind(message.forwarded_from.map(Uuid::from))
            .bind(Json(&message.mentions))
            .bind(message.created_at)
            .bind(Json(&message.delivered_to))
            .bind(Json(&message.read_by))
            .bind(Json(&message.reactions))
            .bind(Json(&message.starred_by))
            .bind(Json(&message.edit_history))
            .bind(message.edited_at)
            .bind(message.tombstone.map(|t| t.as_str()))
            .bind(message.deleted_at)
            .bind(Json(&message.hidden_for))
            .bind(message.withheld)
            .bind(message.scheduled_at)
            .bind(self_destruct_secs(&message))
            .bind(first_viewed_at(&message))
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;

        if !message.withheld {
            record_in_chat(
                &mut tx,
                message.chat_id,
                message.id,
                message.sender_id,
                message.created_at,
            )
            .await?;
        }
        tx.commit().await.map_err(map_sqlx_err)?;
        Message::try_from(record)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1");
        let record = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        record.map(Message::try_from).transpose()
    }

    async fn find_many(&self, ids: &[MessageId]) -> Result<Vec<Message>, RepositoryError> {
        let raw: Vec<Uuid> = ids.iter().copied().map(Uuid::from).collect();
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ANY($1)");
        let records = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(raw)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        let mut found: HashMap<MessageId, Message> = into_messages(records)?
            .into_iter()
            .map(|m| (m.id, m))
            .collect();
        // 保持调用方给出的顺序
        Ok(ids.iter().filter_map(|id| found.remove(id)).collect())
    }

    async fn update(&self, message: Message) -> Result<Message, RepositoryError> {
        match write_back(self.pool(), &message).await? {
            Some(record) => Message::try_from(record),
            None if MessageRepository::find_by_id(self, message.id).await?.is_some() => {
                Err(RepositoryError::Conflict)
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn promote(
        &self,
        id: MessageId,
        now: Timestamp,
    ) -> Result<Option<Message>, RepositoryError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_err)?;
        let sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1 FOR UPDATE");
        let record = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_err)?
            .ok_or(RepositoryError::NotFound)?;

        let mut message = Message::try_from(record)?;
        if !message.promote(now) {
            return Ok(None);
        }
        lock_chat(&mut tx, message.chat_id).await?;
        let record = write_back(&mut *tx, &message)
            .await?
            .ok_or(RepositoryError::Conflict)?;
        record_in_chat(&mut tx, message.chat_id, message.id, message.sender_id, now).await?;
        tx.commit().await.map_err(map_sqlx_err)?;

        Message::try_from(record).map(Some)
    }

    async fn list_chat(
        &self,
        chat_id: ChatId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let records = match before {
            Some(before_id) => {
                let cursor: (DateTime<Utc>, i64) = sqlx::query_as(
                    "SELECT created_at, sequence FROM messages WHERE id = $1",
                )
                .bind(Uuid::from(before_id))
                .fetch_optional(self.pool())
                .await
                .map_err(map_sqlx_err)?
                .ok_or(RepositoryError::NotFound)?;

                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages \
                     WHERE chat_id = $1 AND (created_at, sequence) < ($2, $3) \
                     ORDER BY created_at DESC, sequence DESC LIMIT $4"
                );
                sqlx::query_as::<_, MessageRecord>(&sql)
                    .bind(Uuid::from(chat_id))
                    .bind(cursor.0)
                    .bind(cursor.1)
                    .bind(i64::from(limit))
                    .fetch_all(self.pool())
                    .await
            }
            None => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = $1 \
                     ORDER BY created_at DESC, sequence DESC LIMIT $2"
                );
                sqlx::query_as::<_, MessageRecord>(&sql)
                    .bind(Uuid::from(chat_id))
                    .bind(i64::from(limit))
                    .fetch_all(self.pool())
                    .await
            }
        }
        .map_err(map_sqlx_err)?;

        let mut page = into_messages(records)?;
        page.reverse();
        Ok(page)
    }

    async fn list_due_scheduled(
        &self,
        now: Timestamp,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE withheld AND tombstone IS NULL AND scheduled_at <= $1 \
             ORDER BY scheduled_at, sequence LIMIT $2"
        );
        let records = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        into_messages(records)
    }

    async fn list_due_self_destruct(
        &self,
        now: Timestamp,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages \
             WHERE self_destruct_secs IS NOT NULL AND tombstone IS NULL \
               AND first_viewed_at IS NOT NULL \
               AND first_viewed_at + make_interval(secs => self_destruct_secs) <= $1 \
             ORDER BY created_at, sequence LIMIT $2"
        );
        let records = sqlx::query_as::<_, MessageRecord>(&sql)
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        into_messages(records)
    }
}
