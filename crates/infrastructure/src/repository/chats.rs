use application::ChatRepository;
use async_trait::async_trait;
use domain::{Chat, ChatId, Participant, RepositoryError, UserId};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use super::records::{map_sqlx_err, ChatRecord, ParticipantRecord};
use super::PgStorage;

const CHAT_COLUMNS: &str = "id, chat_type, admins_only, last_message_id, created_at, updated_at";
const PARTICIPANT_COLUMNS: &str = "chat_id, user_id, role, muted, unread_count, joined_at";

async fn insert_participant(
    tx: &mut Transaction<'_, Postgres>,
    chat_id: ChatId,
    participant: &Participant,
) -> Result<(), RepositoryError> {
    sqlx::query(
        r#"
        INSERT INTO chat_participants (chat_id, user_id, role, muted, unread_count, joined_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(Uuid::from(chat_id))
    .bind(Uuid::from(participant.user_id))
    .bind(participant.role.as_str())
    .bind(participant.muted)
    .bind(i32::try_from(participant.unread_count).unwrap_or(i32::MAX))
    .bind(participant.joined_at)
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_err)?;
    Ok(())
}

impl PgStorage {
    async fn participants_of(
        &self,
        chat_ids: &[Uuid],
    ) -> Result<Vec<ParticipantRecord>, RepositoryError> {
        let sql = format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM chat_participants \
             WHERE chat_id = ANY($1) ORDER BY joined_at, user_id"
        );
        sqlx::query_as::<_, ParticipantRecord>(&sql)
            .bind(chat_ids)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)
    }

    pub(crate) async fn chat_exists(&self, chat_id: ChatId) -> Result<bool, RepositoryError> {
        let found: Option<Uuid> = sqlx::query_scalar("SELECT id FROM chats WHERE id = $1")
            .bind(Uuid::from(chat_id))
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        Ok(found.is_some())
    }
}

#[async_trait]
impl ChatRepository for PgStorage {
    async fn create(&self, chat: Chat) -> Result<Chat, RepositoryError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_err)?;
        sqlx::query(
            r#"
            INSERT INTO chats (id, chat_type, admins_only, last_message_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::from(chat.id))
        .bind(chat.chat_type.as_str())
        .bind(chat.admins_only)
        .bind(chat.last_message.map(Uuid::from))
        .bind(chat.created_at)
        .bind(chat.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        for participant in &chat.participants {
            insert_participant(&mut tx, chat.id, participant).await?;
        }
        tx.commit().await.map_err(map_sqlx_err)?;
        Ok(chat)
    }

    async fn find_by_id(&self, id: ChatId) -> Result<Option<Chat>, RepositoryError> {
        let sql = format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = $1");
        let record = sqlx::query_as::<_, ChatRecord>(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        match record {
            Some(record) => {
                let participants = self.participants_of(&[record.id]).await?;
                record.into_chat(&participants).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Chat>, RepositoryError> {
        let records = sqlx::query_as::<_, ChatRecord>(
            r#"
            SELECT c.id, c.chat_type, c.admins_only, c.last_message_id, c.created_at, c.updated_at
            FROM chats c
            JOIN chat_participants p ON p.chat_id = c.id
            WHERE p.user_id = $1
            ORDER BY c.updated_at DESC
            "#,
        )
        .bind(Uuid::from(user_id))
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        let ids: Vec<Uuid> = records.iter().map(|r| r.id).collect();
        let participants = self.participants_of(&ids).await?;
        records
            .into_iter()
            .map(|record| record.into_chat(&participants))
            .collect()
    }

    async fn add_participant(
        &self,
        chat_id: ChatId,
        participant: Participant,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_err)?;
        insert_participant(&mut tx, chat_id, &participant).await?;
        sqlx::query("UPDATE chats SET updated_at = $2 WHERE id = $1")
            .bind(Uuid::from(chat_id))
            .bind(participant.joined_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_err)?;
        tx.commit().await.map_err(map_sqlx_err)
    }

    async fn remove_participant(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM chat_participants WHERE chat_id = $1 AND user_id = $2")
            .bind(Uuid::from(chat_id))
            .bind(Uuid::from(user_id))
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.chat_exists(chat_id).await? {
            Ok(false)
        } else {
            Err(RepositoryError::NotFound)
        }
    }

    async fn recompute_unread(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<u32, RepositoryError> {
        // 与进程内存储同一口径：加入后发布、非本人发送、未对本人隐藏、本人未读
        let unread: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE chat_participants p
            SET unread_count = (
                SELECT COUNT(*)::int
                FROM messages m
                WHERE m.chat_id = p.chat_id
                  AND NOT m.withheld
                  AND m.created_at >= p.joined_at
                  AND m.sender_id <> p.user_id
                  AND NOT m.hidden_for @> jsonb_build_array(p.user_id::text)
                  AND NOT m.read_by @> jsonb_build_array(jsonb_build_object('user_id', p.user_id::text))
            )
            WHERE p.chat_id = $1 AND p.user_id = $2
            RETURNING p.unread_count
            "#,
        )
        .bind(Uuid::from(chat_id))
        .bind(Uuid::from(user_id))
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        unread
            .map(|count| u32::try_from(count).unwrap_or(0))
            .ok_or(RepositoryError::NotFound)
    }
}
