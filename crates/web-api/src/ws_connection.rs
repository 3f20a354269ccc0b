use application::RealtimeCore;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::{ServerEvent, SessionId, UserId};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::client_event::{dispatch, ClientEvent};
use crate::error::ApiError;
use crate::state::AppState;

/// WebSocket 连接管理器
///
/// 封装单个连接的生命周期：
/// - 注册会话并持有有界出站队列的接收端
/// - 上行事件分发到实时核心
/// - 断开时注销会话
pub struct WebSocketConnection {
    socket: Option<WebSocket>,
    state: AppState,
    user_id: UserId,
    session_id: SessionId,
    outbound: Option<mpsc::Receiver<ServerEvent>>,
}

impl WebSocketConnection {
    pub async fn new(socket: WebSocket, state: AppState, user_id: UserId) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(state.outbound_capacity);
        let session_id = state.core.presence.register(user_id, outbound_tx).await;

        tracing::info!(user_id = %user_id, session_id = %session_id, "WebSocket 连接已建立");

        Self {
            socket: Some(socket),
            state,
            user_id,
            session_id,
            outbound: Some(outbound_rx),
        }
    }

    /// 运行连接主循环，直到任一方向结束
    pub async fn run(mut self) {
        let (Some(socket), Some(mut outbound)) = (self.socket.take(), self.outbound.take()) else {
            return;
        };
        let (mut sender, mut incoming) = socket.split();

        // 直接回复（确认、错误、pong）经由命令通道进入发送任务
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(32);

        let mut send_task = tokio::spawn(async move {
            loop {
                let frame = tokio::select! {
                    Some(cmd) = cmd_rx.recv() => match cmd {
                        WsCommand::SendEvent(event) => encode(&event),
                        WsCommand::SendPong(data) => Some(WsMessage::Pong(data.into())),
                    },
                    Some(event) = outbound.recv() => encode(&event),
                    else => break,
                };
                let Some(frame) = frame else {
                    continue;
                };
                if sender.send(frame).await.is_err() {
                    tracing::warn!("WebSocket 写入失败");
                    break;
                }
            }
            tracing::info!("WebSocket发送任务结束");
        });

        let core = self.state.core.clone();
        let (user_id, session_id) = (self.user_id, self.session_id);
        let mut recv_task = tokio::spawn(async move {
            while let Some(Ok(message)) = incoming.next().await {
                if Self::handle_incoming(&core, user_id, session_id, message, &cmd_tx)
                    .await
                    .is_err()
                {
                    break;
                }
            }
            tracing::info!("WebSocket接收任务结束");
        });

        tokio::select! {
            _ = &mut send_task => {
                recv_task.abort();
            }
            _ = &mut recv_task => {
                send_task.abort();
            }
        }

        self.state.core.presence.unregister(self.session_id).await;
        tracing::info!(
            user_id = %self.user_id,
            session_id = %self.session_id,
            "WebSocket连接已断开，会话已注销"
        );
    }

    /// 处理来自客户端的帧；返回 `Err` 表示应当结束连接
    async fn handle_incoming(
        core: &RealtimeCore,
        user_id: UserId,
        session_id: SessionId,
        message: WsMessage,
        cmd_tx: &mpsc::Sender<WsCommand>,
    ) -> Result<(), ()> {
        let reply = match message {
            WsMessage::Close(_) => {
                tracing::info!(user_id = %user_id, "WebSocket收到关闭消息");
                return Err(());
            }
            WsMessage::Ping(data) => {
                return cmd_tx
                    .send(WsCommand::SendPong(data.to_vec()))
                    .await
                    .map_err(|_| ());
            }
            WsMessage::Pong(_) => return Ok(()),
            WsMessage::Binary(_) => {
                Some(ApiError::bad_request("binary frames are not supported").into_event())
            }
            WsMessage::Text(text) => match serde_json::from_str::<ClientEvent>(text.as_str()) {
                Ok(event) => {
                    let name = event.name();
                    tracing::debug!(user_id = %user_id, event = name, "收到客户端事件");
                    match dispatch(core, user_id, session_id, event).await {
                        Ok(reply) => reply,
                        Err(err) => {
                            tracing::debug!(user_id = %user_id, event = name, error = %err, "事件处理失败");
                            Some(ApiError::from(err).into_event())
                        }
                    }
                }
                Err(err) => {
                    Some(ApiError::bad_request(format!("malformed event: {err}")).into_event())
                }
            },
        };

        match reply {
            Some(event) => cmd_tx
                .send(WsCommand::SendEvent(event))
                .await
                .map_err(|_| ()),
            None => Ok(()),
        }
    }
}

fn encode(event: &ServerEvent) -> Option<WsMessage> {
    match serde_json::to_string(event) {
        Ok(json) => Some(WsMessage::Text(json.into())),
        Err(err) => {
            tracing::warn!(error = %err, event = event.name(), "failed to serialize websocket payload");
            None
        }
    }
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendEvent(ServerEvent),
    SendPong(Vec<u8>),
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        tracing::debug!(
            user_id = %self.user_id,
            session_id = %self.session_id,
            "WebSocketConnection 被销毁"
        );
    }
}
