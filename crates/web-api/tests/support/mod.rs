use std::{net::SocketAddr, sync::Arc, time::Duration};

use application::{LoggingNotifier, RealtimeCore, Repositories, SystemClock};
use config::RealtimeConfig;
use domain::UserId;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as TungsteniteMessage, MaybeTlsStream, WebSocketStream,
};
use uuid::Uuid;
use web_api::{router, AppState, JwtConfig, JwtService};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct TestServer {
    pub addr: SocketAddr,
    pub jwt: Arc<JwtService>,
    _shutdown: oneshot::Sender<()>,
}

/// 启动一个使用进程内存储的服务
pub async fn spawn_server() -> TestServer {
    let config = RealtimeConfig::default();
    let core = RealtimeCore::new(
        Repositories::in_memory(),
        &config,
        Arc::new(SystemClock),
        Arc::new(LoggingNotifier),
    );
    let jwt = Arc::new(JwtService::new(JwtConfig {
        secret: "integration-test-secret-key-at-least-32-chars".to_string(),
        expiration_hours: 1,
    }));
    let state = AppState::new(core, jwt.clone(), config.outbound_capacity);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        axum::serve(listener, router(state).into_make_service())
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
            .ok();
    });

    // allow server to start
    sleep(Duration::from_millis(100)).await;

    TestServer {
        addr,
        jwt,
        _shutdown: shutdown_tx,
    }
}

pub fn user() -> UserId {
    UserId::from(Uuid::new_v4())
}

impl TestServer {
    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn token(&self, user_id: UserId) -> String {
        self.jwt.generate_token(user_id).expect("token")
    }

    pub async fn connect(&self, user_id: UserId) -> WsClient {
        let url = format!("ws://{}/api/v1/ws?token={}", self.addr, self.token(user_id));
        let (ws, _) = connect_async(url).await.expect("websocket connect");
        // 会话在升级完成后异步注册
        sleep(Duration::from_millis(100)).await;
        ws
    }

    /// 通过 HTTP 创建会话，返回会话 ID
    pub async fn create_chat(&self, creator: UserId, chat_type: &str, members: &[UserId]) -> String {
        let chat = reqwest::Client::new()
            .post(self.http("/api/v1/chats"))
            .bearer_auth(self.token(creator))
            .json(&serde_json::json!({
                "chat_type": chat_type,
                "member_ids": members,
            }))
            .send()
            .await
            .expect("create chat")
            .json::<Value>()
            .await
            .expect("chat json");
        chat["id"].as_str().expect("chat id").to_string()
    }
}

/// 读取下一个指定名称的事件，跳过其他事件
pub async fn next_event(ws: &mut WsClient, name: &str) -> Value {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let frame = timeout(remaining, ws.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
            .expect("stream closed")
            .expect("websocket error");
        if let TungsteniteMessage::Text(text) = frame {
            let event: Value = serde_json::from_str(text.as_str()).expect("event json");
            if event["event"] == name {
                return event["data"].clone();
            }
        }
    }
}

/// 断言一段时间内没有收到指定名称的事件
pub async fn assert_no_event(ws: &mut WsClient, name: &str) {
    let window = timeout(Duration::from_millis(300), async {
        while let Some(Ok(frame)) = ws.next().await {
            if let TungsteniteMessage::Text(text) = frame {
                let event: Value = serde_json::from_str(text.as_str()).expect("event json");
                if event["event"] == name {
                    return Some(event);
                }
            }
        }
        None
    })
    .await;
    if let Ok(Some(event)) = window {
        panic!("unexpected {name}: {event}");
    }
}
