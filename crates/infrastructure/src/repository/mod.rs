//! PostgreSQL 存储
//!
//! `PgStorage` 实现应用层的全部仓储 trait。写消息、发布定时消息这类复合操作
//! 在同一事务内完成，并锁住会话行，保证会话指针与未读数和消息表一致。

mod calls;
mod chats;
mod messages;
mod presence;
mod records;

use sqlx::{postgres::PgPoolOptions, PgPool};

#[derive(Clone)]
pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub async fn create_pg_pool(
    database_url: &str,
    max_connections: u32,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
}
