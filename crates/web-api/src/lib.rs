//! Web API 层。
//!
//! 提供 Axum 路由：WebSocket 实时通道、会话管理与历史消息查询，
//! 请求委托给应用层的实时核心。

mod auth;
mod client_event;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{Claims, JwtService};
pub use client_event::ClientEvent;
pub use config::JwtConfig;
pub use error::ApiError;
pub use routes::router;
pub use state::AppState;
