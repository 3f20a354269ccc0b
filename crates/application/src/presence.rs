//! 在线会话注册表
//!
//! 一个用户可以同时有多个连接（多设备），每个连接注册为一个会话。
//! 用户在至少有一个会话时视为在线。会话还可以订阅某个会话（聊天）的房间，
//! 用于接收该会话范围内的广播。

use async_trait::async_trait;
use domain::{ChatId, ServerEvent, SessionId, Timestamp, UserId};
use tokio::sync::mpsc;

/// 单个连接的出站句柄
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub joined_at: Timestamp,
    outbound: mpsc::Sender<ServerEvent>,
}

/// 单次投递结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// 出站队列已满，事件被丢弃
    Dropped,
    /// 连接已关闭
    Closed,
}

impl SessionHandle {
    pub fn new(
        session_id: SessionId,
        user_id: UserId,
        joined_at: Timestamp,
        outbound: mpsc::Sender<ServerEvent>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            joined_at,
            outbound,
        }
    }

    /// 非阻塞投递；慢连接不会拖慢发送方
    pub fn push(&self, event: ServerEvent) -> PushOutcome {
        match self.outbound.try_send(event) {
            Ok(()) => PushOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(event)) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    user_id = %self.user_id,
                    event = event.name(),
                    "出站队列已满，丢弃事件"
                );
                PushOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub session_id: SessionId,
    /// 该用户的第一个会话，即离线变为在线
    pub came_online: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unregistration {
    pub user_id: UserId,
    /// 该用户的最后一个会话，即在线变为离线
    pub went_offline: bool,
}

#[async_trait]
pub trait PresenceRegistry: Send + Sync {
    async fn register(&self, handle: SessionHandle) -> Registration;

    /// 幂等：未知会话返回 `None`
    async fn unregister(&self, session_id: SessionId) -> Option<Unregistration>;

    async fn session(&self, session_id: SessionId) -> Option<SessionHandle>;

    async fn sessions_for(&self, user_id: UserId) -> Vec<SessionHandle>;

    async fn is_online(&self, user_id: UserId) -> bool;

    async fn online_users(&self) -> Vec<UserId>;

    /// 返回是否新加入
    async fn join_room(&self, session_id: SessionId, chat_id: ChatId) -> bool;

    async fn leave_room(&self, session_id: SessionId, chat_id: ChatId) -> bool;

    async fn room_sessions(&self, chat_id: ChatId) -> Vec<SessionHandle>;

    /// 把用户的所有会话移出某个房间，返回移出的会话数
    async fn evict_from_room(&self, chat_id: ChatId, user_id: UserId) -> usize;
}

pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use tokio::sync::RwLock;

    #[derive(Default)]
    struct RegistryState {
        sessions: HashMap<SessionId, SessionHandle>,
        user_sessions: HashMap<UserId, HashSet<SessionId>>,
        room_sessions: HashMap<ChatId, HashSet<SessionId>>,
        session_rooms: HashMap<SessionId, HashSet<ChatId>>,
    }

    impl RegistryState {
        fn handles(&self, ids: Option<&HashSet<SessionId>>) -> Vec<SessionHandle> {
            ids.map(|ids| {
                ids.iter()
                    .filter_map(|id| self.sessions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
        }

        fn remove_from_room(&mut self, session_id: SessionId, chat_id: ChatId) -> bool {
            let removed = match self.room_sessions.get_mut(&chat_id) {
                Some(members) => {
                    let removed = members.remove(&session_id);
                    if members.is_empty() {
                        self.room_sessions.remove(&chat_id);
                    }
                    removed
                }
                None => false,
            };
            if let Some(rooms) = self.session_rooms.get_mut(&session_id) {
                rooms.remove(&chat_id);
                if rooms.is_empty() {
                    self.session_rooms.remove(&session_id);
                }
            }
            removed
        }
    }

    /// 单进程注册表，一把写锁保证同一用户的注册与注销串行化
    #[derive(Default)]
    pub struct MemoryPresenceRegistry {
        state: RwLock<RegistryState>,
    }

    impl MemoryPresenceRegistry {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl PresenceRegistry for MemoryPresenceRegistry {
        async fn register(&self, handle: SessionHandle) -> Registration {
            let mut state = self.state.write().await;
            let session_id = handle.session_id;
            let sessions = state.user_sessions.entry(handle.user_id).or_default();
            let came_online = sessions.is_empty();
            sessions.insert(session_id);
            state.sessions.insert(session_id, handle);

            Registration {
                session_id,
                came_online,
            }
        }

        async fn unregister(&self, session_id: SessionId) -> Option<Unregistration> {
            let mut state = self.state.write().await;
            let handle = state.sessions.remove(&session_id)?;

            let rooms = state.session_rooms.remove(&session_id).unwrap_or_default();
            for chat_id in rooms {
                state.remove_from_room(session_id, chat_id);
            }

            let went_offline = match state.user_sessions.get_mut(&handle.user_id) {
                Some(sessions) => {
                    sessions.remove(&session_id);
                    sessions.is_empty()
                }
                None => true,
            };
            if went_offline {
                state.user_sessions.remove(&handle.user_id);
            }

            Some(Unregistration {
                user_id: handle.user_id,
                went_offline,
            })
        }

        async fn session(&self, session_id: SessionId) -> Option<SessionHandle> {
            self.state.read().await.sessions.get(&session_id).cloned()
        }

        async fn sessions_for(&self, user_id: UserId) -> Vec<SessionHandle> {
            let state = self.state.read().await;
            state.handles(state.user_sessions.get(&user_id))
        }

        async fn is_online(&self, user_id: UserId) -> bool {
            self.state
                .read()
                .await
                .user_sessions
                .get(&user_id)
                .is_some_and(|sessions| !sessions.is_empty())
        }

        async fn online_users(&self) -> Vec<UserId> {
            self.state
                .read()
                .await
                .user_sessions
                .keys()
                .copied()
                .collect()
        }

        async fn join_room(&self, session_id: SessionId, chat_id: ChatId) -> bool {
            let mut state = self.state.write().await;
            if !state.sessions.contains_key(&session_id) {
                return false;
            }
            let joined = state
                .room_sessions
                .entry(chat_id)
                .or_default()
                .insert(session_id);
            state
                .session_rooms
                .entry(session_id)
                .or_default()
                .insert(chat_id);
            joined
        }

        async fn leave_room(&self, session_id: SessionId, chat_id: ChatId) -> bool {
            self.state
                .write()
                .await
                .remove_from_room(session_id, chat_id)
        }

        async fn room_sessions(&self, chat_id: ChatId) -> Vec<SessionHandle> {
            let state = self.state.read().await;
            state.handles(state.room_sessions.get(&chat_id))
        }

        async fn evict_from_room(&self, chat_id: ChatId, user_id: UserId) -> usize {
            let mut state = self.state.write().await;
            let sessions: Vec<SessionId> = state
                .user_sessions
                .get(&user_id)
                .map(|ids| ids.iter().copied().collect())
                .unwrap_or_default();
            sessions
                .into_iter()
                .filter(|session_id| state.remove_from_room(*session_id, chat_id))
                .count()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryPresenceRegistry;
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn handle(user_id: UserId) -> (SessionHandle, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(4);
        (
            SessionHandle::new(SessionId::generate(), user_id, Utc::now(), tx),
            rx,
        )
    }

    #[tokio::test]
    async fn online_until_last_session_leaves() {
        let registry = MemoryPresenceRegistry::new();
        let user = UserId::from(Uuid::new_v4());
        let (first, _rx1) = handle(user);
        let (second, _rx2) = handle(user);

        assert!(registry.register(first.clone()).await.came_online);
        assert!(!registry.register(second.clone()).await.came_online);
        assert_eq!(registry.sessions_for(user).await.len(), 2);

        let outcome = registry.unregister(first.session_id).await.unwrap();
        assert!(!outcome.went_offline);
        assert!(registry.is_online(user).await);

        let outcome = registry.unregister(second.session_id).await.unwrap();
        assert!(outcome.went_offline);
        assert!(!registry.is_online(user).await);
        assert!(registry.sessions_for(user).await.is_empty());
    }

    #[tokio::test]
    async fn unregister_is_idempotent() {
        let registry = MemoryPresenceRegistry::new();
        let (session, _rx) = handle(UserId::from(Uuid::new_v4()));
        registry.register(session.clone()).await;

        assert!(registry.unregister(session.session_id).await.is_some());
        assert!(registry.unregister(session.session_id).await.is_none());
    }

    #[tokio::test]
    async fn unregister_leaves_every_room() {
        let registry = MemoryPresenceRegistry::new();
        let (session, _rx) = handle(UserId::from(Uuid::new_v4()));
        let chat = ChatId::from(Uuid::new_v4());
        registry.register(session.clone()).await;

        assert!(registry.join_room(session.session_id, chat).await);
        assert!(!registry.join_room(session.session_id, chat).await);
        assert_eq!(registry.room_sessions(chat).await.len(), 1);

        registry.unregister(session.session_id).await;
        assert!(registry.room_sessions(chat).await.is_empty());
    }

    #[tokio::test]
    async fn evict_removes_all_sessions_of_user() {
        let registry = MemoryPresenceRegistry::new();
        let user = UserId::from(Uuid::new_v4());
        let chat = ChatId::from(Uuid::new_v4());
        let (a, _rx1) = handle(user);
        let (b, _rx2) = handle(user);
        registry.register(a.clone()).await;
        registry.register(b.clone()).await;
        registry.join_room(a.session_id, chat).await;
        registry.join_room(b.session_id, chat).await;

        assert_eq!(registry.evict_from_room(chat, user).await, 2);
        assert!(registry.room_sessions(chat).await.is_empty());
    }

    #[tokio::test]
    async fn full_queue_drops_event() {
        let (tx, _rx) = mpsc::channel(1);
        let session = SessionHandle::new(
            SessionId::generate(),
            UserId::from(Uuid::new_v4()),
            Utc::now(),
            tx,
        );
        let event = ServerEvent::Error {
            code: "X".into(),
            message: "x".into(),
        };

        assert_eq!(session.push(event.clone()), PushOutcome::Queued);
        assert_eq!(session.push(event), PushOutcome::Dropped);
    }
}
