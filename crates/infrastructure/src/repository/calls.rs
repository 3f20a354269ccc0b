use application::CallRepository;
use async_trait::async_trait;
use domain::{Call, CallId, RepositoryError, Timestamp, UserId};
use sqlx::types::Json;
use uuid::Uuid;

use super::records::{map_sqlx_err, CallRecord, CALL_COLUMNS};
use super::PgStorage;

fn into_calls(records: Vec<CallRecord>) -> Result<Vec<Call>, RepositoryError> {
    records.into_iter().map(Call::try_from).collect()
}

#[async_trait]
impl CallRepository for PgStorage {
    async fn create(&self, call: Call) -> Result<Call, RepositoryError> {
        let sql = format!(
            r#"
            INSERT INTO calls (
                id, chat_id, initiator_id, medium, participants, status,
                created_at, started_at, ended_at, duration_secs, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1)
            RETURNING {CALL_COLUMNS}
            "#
        );
        let record = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(Uuid::from(call.id))
            .bind(Uuid::from(call.chat_id))
            .bind(Uuid::from(call.initiator))
            .bind(call.medium.as_str())
            .bind(Json(&call.participants))
            .bind(call.status.as_str())
            .bind(call.created_at)
            .bind(call.started_at)
            .bind(call.ended_at)
            .bind(call.duration_secs)
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        Call::try_from(record)
    }

    async fn find_by_id(&self, id: CallId) -> Result<Option<Call>, RepositoryError> {
        let sql = format!("SELECT {CALL_COLUMNS} FROM calls WHERE id = $1");
        let record = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        record.map(Call::try_from).transpose()
    }

    async fn update(&self, call: Call) -> Result<Call, RepositoryError> {
        let sql = format!(
            r#"
            UPDATE calls SET
                participants = $3, status = $4, started_at = $5, ended_at = $6,
                duration_secs = $7, version = version + 1
            WHERE id = $1 AND version = $2
            RETURNING {CALL_COLUMNS}
            "#
        );
        let record = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(Uuid::from(call.id))
            .bind(call.version)
            .bind(Json(&call.participants))
            .bind(call.status.as_str())
            .bind(call.started_at)
            .bind(call.ended_at)
            .bind(call.duration_secs)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        match record {
            Some(record) => Call::try_from(record),
            None if CallRepository::find_by_id(self, call.id).await?.is_some() => {
                Err(RepositoryError::Conflict)
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn find_active_for_user(&self, user_id: UserId) -> Result<Vec<Call>, RepositoryError> {
        let sql = format!(
            r#"
            SELECT {CALL_COLUMNS} FROM calls
            WHERE status IN ('ringing', 'ongoing')
              AND (
                initiator_id = $1
                OR EXISTS (
                    SELECT 1 FROM jsonb_array_elements(participants) p
                    WHERE p->>'user_id' = $1::text
                      AND p->>'status' IN ('ringing', 'accepted')
                )
              )
            "#
        );
        let records = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(Uuid::from(user_id))
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        into_calls(records)
    }

    async fn list_ringing_since(&self, cutoff: Timestamp) -> Result<Vec<Call>, RepositoryError> {
        let sql = format!(
            "SELECT {CALL_COLUMNS} FROM calls \
             WHERE status = 'ringing' AND created_at <= $1 ORDER BY created_at"
        );
        let records = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(cutoff)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)?;
        into_calls(records)
    }
}
