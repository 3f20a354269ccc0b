//! 服务层测试共用的装配

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use config::RealtimeConfig;
use domain::{Chat, ChatId, ChatType, ServerEvent, SessionId, UserId};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    broadcaster::OfflineNotifier,
    clock::{Clock, ManualClock},
    memory::MemoryStore,
    repository::ChatRepository,
    runtime::{RealtimeCore, Repositories},
};

/// 记录离线通知，断言用
#[derive(Default)]
pub struct RecordingNotifier {
    pub calls: Mutex<Vec<(Vec<UserId>, &'static str)>>,
}

impl RecordingNotifier {
    pub fn notified(&self, event: &str) -> Vec<UserId> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, name)| *name == event)
            .flat_map(|(users, _)| users.clone())
            .collect()
    }
}

#[async_trait]
impl OfflineNotifier for RecordingNotifier {
    async fn notify_offline(&self, users: &[UserId], event: &ServerEvent) {
        self.calls
            .lock()
            .unwrap()
            .push((users.to_vec(), event.name()));
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub notifier: Arc<RecordingNotifier>,
    pub core: RealtimeCore,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(RealtimeConfig::default())
    }

    pub fn with_config(config: RealtimeConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let core = RealtimeCore::new(
            Repositories::shared(store.clone()),
            &config,
            clock.clone(),
            notifier.clone(),
        );
        Self {
            store,
            clock,
            notifier,
            core,
        }
    }

    pub async fn chat(&self, chat_type: ChatType, owner: UserId, members: &[UserId]) -> Chat {
        let chat = Chat::new(
            ChatId::from(Uuid::new_v4()),
            chat_type,
            owner,
            members.iter().copied(),
            self.clock.now(),
        )
        .unwrap();
        ChatRepository::create(self.store.as_ref(), chat)
            .await
            .unwrap()
    }

    pub async fn load_chat(&self, chat_id: ChatId) -> Chat {
        ChatRepository::find_by_id(self.store.as_ref(), chat_id)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn connect(&self, user_id: UserId) -> (SessionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let session_id = self.core.presence.register(user_id, tx).await;
        (session_id, rx)
    }
}

pub fn user() -> UserId {
    UserId::from(Uuid::new_v4())
}

/// 取出队列中当前所有事件
pub fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn named<'a>(events: &'a [ServerEvent], name: &str) -> Vec<&'a ServerEvent> {
    events.iter().filter(|e| e.name() == name).collect()
}
