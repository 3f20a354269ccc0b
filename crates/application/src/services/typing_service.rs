use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use domain::{ChatId, DomainError, ServerEvent, SignalKind, UserId};
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::{broadcaster::Broadcaster, error::ApplicationError, repository::ChatRepository};

/// 会话参与者的短期缓存，输入状态这类高频信号不必每次查库
pub struct ParticipantCache {
    ttl: Duration,
    entries: RwLock<HashMap<ChatId, (Instant, Arc<Vec<UserId>>)>>,
}

impl ParticipantCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    async fn get(
        &self,
        chat_repository: &dyn ChatRepository,
        chat_id: ChatId,
    ) -> Result<Arc<Vec<UserId>>, ApplicationError> {
        if !self.ttl.is_zero() {
            if let Some((cached_at, participants)) = self.entries.read().await.get(&chat_id) {
                if cached_at.elapsed() < self.ttl {
                    return Ok(participants.clone());
                }
            }
        }

        let chat = chat_repository
            .find_by_id(chat_id)
            .await?
            .ok_or(DomainError::ChatNotFound)?;
        let participants = Arc::new(chat.participant_ids());
        if !self.ttl.is_zero() {
            let mut entries = self.entries.write().await;
            // 未命中时顺带清掉已过期的条目
            entries.retain(|_, (cached_at, _)| cached_at.elapsed() < self.ttl);
            entries.insert(chat_id, (Instant::now(), participants.clone()));
        }
        Ok(participants)
    }

    /// 成员变更后调用
    pub async fn invalidate(&self, chat_id: ChatId) {
        self.entries.write().await.remove(&chat_id);
    }

    #[cfg(test)]
    async fn cached(&self) -> usize {
        self.entries.read().await.len()
    }
}

pub struct TypingServiceDependencies {
    pub chat_repository: Arc<dyn ChatRepository>,
    pub broadcaster: Arc<Broadcaster>,
    pub participants: Arc<ParticipantCache>,
}

/// 输入中 / 录音中这类瞬时信号。不落库，不排队，离线即丢弃
pub struct TypingService {
    deps: TypingServiceDependencies,
}

impl TypingService {
    pub fn new(deps: TypingServiceDependencies) -> Self {
        Self { deps }
    }

    /// 转发给其他在线参与者，返回收到信号的会话数
    pub async fn signal(
        &self,
        chat_id: ChatId,
        user_id: UserId,
        kind: SignalKind,
    ) -> Result<usize, ApplicationError> {
        let participants = self
            .deps
            .participants
            .get(self.deps.chat_repository.as_ref(), chat_id)
            .await?;
        if !participants.contains(&user_id) {
            return Err(DomainError::NotParticipant.into());
        }

        let others: Vec<UserId> = participants
            .iter()
            .copied()
            .filter(|u| *u != user_id)
            .collect();
        let event = ServerEvent::Typing {
            chat_id,
            user_id,
            kind,
        };
        let report = self.deps.broadcaster.to_users(&others, &event).await;
        Ok(report.queued)
    }
}
