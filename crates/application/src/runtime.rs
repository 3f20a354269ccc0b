//! 组装实时核心的各个组件
//!
//! 存储实现由调用方注入（PostgreSQL 或进程内存储），其余组件在这里按配置创建。

use std::sync::Arc;
use std::time::Duration;

use config::RealtimeConfig;

use crate::{
    broadcaster::{Broadcaster, OfflineNotifier},
    clock::Clock,
    memory::MemoryStore,
    presence::{memory::MemoryPresenceRegistry, PresenceRegistry},
    repository::{CallRepository, ChatRepository, MessageRepository, PresenceRepository},
    sequencer::ChatSequencer,
    services::{
        CallService, CallServiceDependencies, ChatService, ChatServiceDependencies,
        MessageService, MessageServiceDependencies, ParticipantCache, PresenceService,
        PresenceServiceDependencies, TypingService, TypingServiceDependencies,
    },
    sweeper::{Sweeper, SweeperDependencies},
};

#[derive(Clone)]
pub struct Repositories {
    pub chats: Arc<dyn ChatRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub calls: Arc<dyn CallRepository>,
    pub presence: Arc<dyn PresenceRepository>,
}

impl Repositories {
    /// 四个仓储共用同一个实现
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: ChatRepository + MessageRepository + CallRepository + PresenceRepository + 'static,
    {
        Self {
            chats: store.clone(),
            messages: store.clone(),
            calls: store.clone(),
            presence: store,
        }
    }

    pub fn in_memory() -> Self {
        Self::shared(Arc::new(MemoryStore::new()))
    }
}

#[derive(Clone)]
pub struct RealtimeCore {
    pub registry: Arc<dyn PresenceRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub presence: Arc<PresenceService>,
    pub typing: Arc<TypingService>,
    pub messages: Arc<MessageService>,
    pub calls: Arc<CallService>,
    pub chats: Arc<ChatService>,
    pub sweeper: Arc<Sweeper>,
}

impl RealtimeCore {
    pub fn new(
        repositories: Repositories,
        config: &RealtimeConfig,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn OfflineNotifier>,
    ) -> Self {
        let registry: Arc<dyn PresenceRegistry> = Arc::new(MemoryPresenceRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(registry.clone()));
        let participants = Arc::new(ParticipantCache::new(Duration::from_millis(
            config.typing_cache_ttl_ms,
        )));

        let presence = Arc::new(PresenceService::new(PresenceServiceDependencies {
            registry: registry.clone(),
            broadcaster: broadcaster.clone(),
            chat_repository: repositories.chats.clone(),
            presence_repository: repositories.presence.clone(),
            clock: clock.clone(),
            visibility: config.presence_visibility,
        }));

        let typing = Arc::new(TypingService::new(TypingServiceDependencies {
            chat_repository: repositories.chats.clone(),
            broadcaster: broadcaster.clone(),
            participants: participants.clone(),
        }));

        let messages = Arc::new(MessageService::new(MessageServiceDependencies {
            chat_repository: repositories.chats.clone(),
            message_repository: repositories.messages.clone(),
            broadcaster: broadcaster.clone(),
            notifier: notifier.clone(),
            sequencer: Arc::new(ChatSequencer::new()),
            clock: clock.clone(),
            edit_window: chrono::Duration::seconds(config.edit_window_secs as i64),
        }));

        let calls = Arc::new(CallService::new(CallServiceDependencies {
            chat_repository: repositories.chats.clone(),
            call_repository: repositories.calls.clone(),
            registry: registry.clone(),
            broadcaster: broadcaster.clone(),
            notifier,
            clock: clock.clone(),
        }));

        let chats = Arc::new(ChatService::new(ChatServiceDependencies {
            chat_repository: repositories.chats.clone(),
            registry: registry.clone(),
            participants,
            clock: clock.clone(),
        }));

        let sweeper = Arc::new(Sweeper::new(SweeperDependencies {
            message_repository: repositories.messages.clone(),
            call_repository: repositories.calls.clone(),
            messages: messages.clone(),
            calls: calls.clone(),
            clock,
            interval: Duration::from_secs(config.sweep_interval_secs),
            ring_timeout: chrono::Duration::seconds(config.ring_timeout_secs as i64),
        }));

        Self {
            registry,
            broadcaster,
            presence,
            typing,
            messages,
            calls,
            chats,
            sweeper,
        }
    }
}
