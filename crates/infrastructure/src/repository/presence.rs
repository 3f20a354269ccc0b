use application::PresenceRepository;
use async_trait::async_trait;
use domain::{RepositoryError, Timestamp, UserId};
use uuid::Uuid;

use super::records::map_sqlx_err;
use super::PgStorage;

#[async_trait]
impl PresenceRepository for PgStorage {
    async fn record_last_seen(
        &self,
        user_id: UserId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            r#"
            INSERT INTO user_presence (user_id, last_seen_at)
            VALUES ($1, $2)
            ON CONFLICT (user_id) DO UPDATE
            SET last_seen_at = GREATEST(user_presence.last_seen_at, EXCLUDED.last_seen_at)
            "#,
        )
        .bind(Uuid::from(user_id))
        .bind(at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;
        Ok(())
    }

    async fn last_seen(&self, user_id: UserId) -> Result<Option<Timestamp>, RepositoryError> {
        sqlx::query_scalar("SELECT last_seen_at FROM user_presence WHERE user_id = $1")
            .bind(Uuid::from(user_id))
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)
    }
}
