use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use domain::{Chat, ServerEvent, SessionId, UserId};

use crate::presence::{PresenceRegistry, PushOutcome, SessionHandle};

/// 一次扇出的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// 成功入队的会话数
    pub queued: usize,
    /// 因队列已满被丢弃的会话数
    pub dropped: usize,
    /// 没有任何在线会话的目标用户
    pub unreachable: Vec<UserId>,
}

impl DeliveryReport {
    pub fn reached_anyone(&self) -> bool {
        self.queued > 0
    }
}

/// 离线通知出口（推送、邮件等）。实时层只负责告知哪些用户没有收到
#[async_trait]
pub trait OfflineNotifier: Send + Sync {
    async fn notify_offline(&self, users: &[UserId], event: &ServerEvent);
}

/// 默认实现：只记录日志
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl OfflineNotifier for LoggingNotifier {
    async fn notify_offline(&self, users: &[UserId], event: &ServerEvent) {
        for user_id in users {
            tracing::info!(user_id = %user_id, event = event.name(), "用户离线，转交离线通知");
        }
    }
}

/// 基于在线注册表的事件扇出
pub struct Broadcaster {
    registry: Arc<dyn PresenceRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<dyn PresenceRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<dyn PresenceRegistry> {
        &self.registry
    }

    pub async fn to_user(&self, user_id: UserId, event: &ServerEvent) -> DeliveryReport {
        self.to_users(&[user_id], event).await
    }

    /// 推送给每个用户的全部会话
    pub async fn to_users(&self, users: &[UserId], event: &ServerEvent) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let mut seen = HashSet::new();
        for user_id in users {
            if !seen.insert(*user_id) {
                continue;
            }
            let sessions = self.registry.sessions_for(*user_id).await;
            if sessions.is_empty() {
                report.unreachable.push(*user_id);
                continue;
            }
            Self::push_all(&sessions, event, &mut report);
        }
        report
    }

    /// 会话范围的广播：参与者的全部会话，加上订阅了该房间的其他会话。
    /// `exclude` 指定的用户不会收到
    pub async fn to_chat(
        &self,
        chat: &Chat,
        event: &ServerEvent,
        exclude: Option<UserId>,
    ) -> DeliveryReport {
        let recipients: Vec<UserId> = chat
            .participant_ids()
            .into_iter()
            .filter(|user_id| Some(*user_id) != exclude)
            .collect();
        let mut report = DeliveryReport::default();
        let mut reached: HashSet<SessionId> = HashSet::new();

        for user_id in recipients {
            let sessions = self.registry.sessions_for(user_id).await;
            if sessions.is_empty() {
                report.unreachable.push(user_id);
                continue;
            }
            reached.extend(sessions.iter().map(|s| s.session_id));
            Self::push_all(&sessions, event, &mut report);
        }

        let viewers: Vec<SessionHandle> = self
            .registry
            .room_sessions(chat.id)
            .await
            .into_iter()
            .filter(|s| Some(s.user_id) != exclude && !reached.contains(&s.session_id))
            .collect();
        Self::push_all(&viewers, event, &mut report);

        report
    }

    fn push_all(sessions: &[SessionHandle], event: &ServerEvent, report: &mut DeliveryReport) {
        for session in sessions {
            match session.push(event.clone()) {
                PushOutcome::Queued => report.queued += 1,
                PushOutcome::Dropped => report.dropped += 1,
                PushOutcome::Closed => {
                    tracing::debug!(session_id = %session.session_id, "连接已关闭，跳过");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::memory::MemoryPresenceRegistry;
    use chrono::Utc;
    use domain::{ChatId, ChatType};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    async fn connect(
        registry: &Arc<MemoryPresenceRegistry>,
        user_id: UserId,
    ) -> (SessionId, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let handle = SessionHandle::new(SessionId::generate(), user_id, Utc::now(), tx);
        let session_id = handle.session_id;
        registry.register(handle).await;
        (session_id, rx)
    }

    fn ping() -> ServerEvent {
        ServerEvent::Error {
            code: "PING".into(),
            message: "ping".into(),
        }
    }

    #[tokio::test]
    async fn reports_unreachable_users() {
        let registry = Arc::new(MemoryPresenceRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let online = UserId::from(Uuid::new_v4());
        let offline = UserId::from(Uuid::new_v4());
        let (_session, mut rx) = connect(&registry, online).await;

        let report = broadcaster.to_users(&[online, offline], &ping()).await;

        assert_eq!(report.queued, 1);
        assert_eq!(report.unreachable, vec![offline]);
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn chat_broadcast_reaches_every_device_once() {
        let registry = Arc::new(MemoryPresenceRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let (sender, member) = (UserId::from(Uuid::new_v4()), UserId::from(Uuid::new_v4()));
        let chat = Chat::new(
            ChatId::from(Uuid::new_v4()),
            ChatType::Group,
            sender,
            [member],
            Utc::now(),
        )
        .unwrap();
        let (phone, mut phone_rx) = connect(&registry, member).await;
        let (_laptop, mut laptop_rx) = connect(&registry, member).await;
        let (_own, mut own_rx) = connect(&registry, sender).await;
        registry.join_room(phone, chat.id).await;

        let report = broadcaster.to_chat(&chat, &ping(), Some(sender)).await;

        assert_eq!(report.queued, 2);
        assert!(phone_rx.try_recv().is_ok());
        assert!(phone_rx.try_recv().is_err());
        assert!(laptop_rx.try_recv().is_ok());
        assert!(own_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn room_viewers_receive_channel_broadcasts() {
        let registry = Arc::new(MemoryPresenceRegistry::new());
        let broadcaster = Broadcaster::new(registry.clone());
        let owner = UserId::from(Uuid::new_v4());
        let viewer = UserId::from(Uuid::new_v4());
        let chat = Chat::new(
            ChatId::from(Uuid::new_v4()),
            ChatType::Channel,
            owner,
            [],
            Utc::now(),
        )
        .unwrap();
        let (session, mut rx) = connect(&registry, viewer).await;
        registry.join_room(session, chat.id).await;

        let report = broadcaster.to_chat(&chat, &ping(), Some(owner)).await;

        assert_eq!(report.queued, 1);
        assert!(report.unreachable.is_empty());
        assert!(rx.try_recv().is_ok());
    }
}
