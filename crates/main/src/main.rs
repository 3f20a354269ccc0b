//! 主应用程序入口
//!
//! 加载配置，选择存储，启动清扫任务和 Axum 服务。

use std::sync::Arc;

use application::{LoggingNotifier, RealtimeCore, Repositories, SystemClock};
use axum::http::HeaderValue;
use config::AppConfig;
use infrastructure::{Infrastructure, InfrastructureConfig};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = AppConfig::load()?;
    tracing::info!(config = %config.sanitize(), "配置已加载");

    let repositories = match InfrastructureConfig::from_database(&config.database) {
        Some(db) => Infrastructure::connect(db).await?.repositories(),
        None => {
            tracing::warn!("未配置数据库，使用进程内存储，重启后数据丢失");
            Repositories::in_memory()
        }
    };

    let core = RealtimeCore::new(
        repositories,
        &config.realtime,
        Arc::new(SystemClock),
        Arc::new(LoggingNotifier),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(core.sweeper.clone().run(shutdown_rx));

    let jwt_service = Arc::new(JwtService::new(config.jwt.clone()));
    let state = AppState::new(core, jwt_service, config.realtime.outbound_capacity);
    let app = router(state).layer(cors_layer(&config.server.cors_origins));

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!("实时服务启动在 http://{}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(err) = sweeper.await {
        tracing::warn!(error = %err, "清扫任务异常退出");
    }
    tracing::info!("服务已停止");
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
        return CorsLayer::new().allow_origin(Any).allow_headers(Any);
    }
    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "忽略无效的 CORS 来源");
                None
            }
        })
        .collect();
    CorsLayer::new().allow_origin(allowed).allow_headers(Any)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "无法监听退出信号");
        std::future::pending::<()>().await;
    }
    tracing::info!("收到退出信号，开始优雅关闭");
}
