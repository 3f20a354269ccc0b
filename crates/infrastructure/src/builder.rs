use std::sync::Arc;

use application::Repositories;
use config::DatabaseConfig;
use thiserror::Error;

use crate::{
    migrations::MIGRATOR,
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Clone)]
pub struct InfrastructureConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl InfrastructureConfig {
    /// 未配置数据库地址时返回 `None`，调用方改用进程内存储
    pub fn from_database(config: &DatabaseConfig) -> Option<Self> {
        config.url.as_ref().map(|url| Self {
            database_url: url.clone(),
            max_connections: config.max_connections,
        })
    }
}

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Clone)]
pub struct Infrastructure {
    pub storage: Arc<PgStorage>,
}

impl Infrastructure {
    /// 建立连接池并执行迁移
    pub async fn connect(config: InfrastructureConfig) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.database_url, config.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        tracing::info!(max_connections = config.max_connections, "数据库迁移完成");

        Ok(Self {
            storage: Arc::new(PgStorage::new(pool)),
        })
    }

    pub fn repositories(&self) -> Repositories {
        Repositories::shared(self.storage.clone())
    }
}
