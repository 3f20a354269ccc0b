use std::collections::HashSet;
use std::sync::Arc;

use config::PresenceVisibility;
use domain::{ChatId, DomainError, ServerEvent, SessionId, Timestamp, UserId};
use tokio::sync::mpsc;

use crate::{
    broadcaster::Broadcaster,
    clock::Clock,
    error::ApplicationError,
    presence::{PresenceRegistry, SessionHandle},
    repository::{ChatRepository, PresenceRepository},
};

pub struct PresenceServiceDependencies {
    pub registry: Arc<dyn PresenceRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub chat_repository: Arc<dyn ChatRepository>,
    pub presence_repository: Arc<dyn PresenceRepository>,
    pub clock: Arc<dyn Clock>,
    pub visibility: PresenceVisibility,
}

pub struct PresenceService {
    deps: PresenceServiceDependencies,
}

impl PresenceService {
    pub fn new(deps: PresenceServiceDependencies) -> Self {
        Self { deps }
    }

    /// 注册一个连接。用户由离线变为在线时广播在线状态
    pub async fn register(
        &self,
        user_id: UserId,
        connection: mpsc::Sender<ServerEvent>,
    ) -> SessionId {
        let handle = SessionHandle::new(
            SessionId::generate(),
            user_id,
            self.deps.clock.now(),
            connection,
        );
        let registration = self.deps.registry.register(handle).await;
        tracing::info!(
            user_id = %user_id,
            session_id = %registration.session_id,
            came_online = registration.came_online,
            "会话已注册"
        );

        if registration.came_online {
            self.announce(user_id, true, None).await;
        }
        registration.session_id
    }

    /// 幂等注销。最后一个会话离开时记录最后在线时间并广播离线
    pub async fn unregister(&self, session_id: SessionId) {
        let Some(outcome) = self.deps.registry.unregister(session_id).await else {
            return;
        };
        tracing::info!(
            user_id = %outcome.user_id,
            session_id = %session_id,
            went_offline = outcome.went_offline,
            "会话已注销"
        );
        if !outcome.went_offline {
            return;
        }

        let now = self.deps.clock.now();
        if let Err(err) = self
            .deps
            .presence_repository
            .record_last_seen(outcome.user_id, now)
            .await
        {
            tracing::error!(user_id = %outcome.user_id, error = %err, "记录最后在线时间失败");
        }
        self.announce(outcome.user_id, false, Some(now)).await;
    }

    pub async fn sessions_for(&self, user_id: UserId) -> Vec<SessionHandle> {
        self.deps.registry.sessions_for(user_id).await
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        self.deps.registry.is_online(user_id).await
    }

    pub async fn last_seen(&self, user_id: UserId) -> Result<Option<Timestamp>, ApplicationError> {
        Ok(self.deps.presence_repository.last_seen(user_id).await?)
    }

    /// 订阅会话房间。频道对所有人开放，其他类型只允许参与者
    pub async fn join_room(
        &self,
        session_id: SessionId,
        chat_id: ChatId,
    ) -> Result<bool, ApplicationError> {
        let session = self
            .deps
            .registry
            .session(session_id)
            .await
            .ok_or(DomainError::NotParticipant)?;
        let chat = self
            .deps
            .chat_repository
            .find_by_id(chat_id)
            .await?
            .ok_or(DomainError::ChatNotFound)?;
        if chat.chat_type != domain::ChatType::Channel {
            chat.ensure_participant(session.user_id)?;
        }
        Ok(self.deps.registry.join_room(session_id, chat_id).await)
    }

    pub async fn leave_room(&self, session_id: SessionId, chat_id: ChatId) -> bool {
        self.deps.registry.leave_room(session_id, chat_id).await
    }

    async fn announce(&self, user_id: UserId, online: bool, last_seen_at: Option<Timestamp>) {
        let audience = match self.audience(user_id).await {
            Ok(audience) => audience,
            Err(err) => {
                tracing::warn!(user_id = %user_id, error = %err, "无法确定在线状态的接收者");
                return;
            }
        };
        if audience.is_empty() {
            return;
        }
        let event = ServerEvent::PresenceChanged {
            user_id,
            online,
            last_seen_at,
        };
        let report = self.deps.broadcaster.to_users(&audience, &event).await;
        tracing::debug!(
            user_id = %user_id,
            online,
            queued = report.queued,
            "在线状态已广播"
        );
    }

    async fn audience(&self, user_id: UserId) -> Result<Vec<UserId>, ApplicationError> {
        let audience: HashSet<UserId> = match self.deps.visibility {
            PresenceVisibility::Global => self
                .deps
                .registry
                .online_users()
                .await
                .into_iter()
                .collect(),
            PresenceVisibility::SharedChats => self
                .deps
                .chat_repository
                .list_for_user(user_id)
                .await?
                .iter()
                .flat_map(|chat| chat.participant_ids())
                .collect(),
        };
        Ok(audience.into_iter().filter(|u| *u != user_id).collect())
    }
}
