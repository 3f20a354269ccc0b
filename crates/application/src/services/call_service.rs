use std::sync::Arc;

use domain::{
    Call, CallFailure, CallId, CallMedium, ChatId, DomainError, ParticipantCallStatus,
    RepositoryError, ServerEvent, UserId,
};
use uuid::Uuid;

use crate::{
    broadcaster::{Broadcaster, OfflineNotifier},
    clock::Clock,
    error::ApplicationError,
    presence::PresenceRegistry,
    repository::{CallRepository, ChatRepository},
};

const MAX_UPDATE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct InitiateCallRequest {
    pub caller_id: UserId,
    pub chat_id: ChatId,
    /// 为空时呼叫会话中除主叫外的所有参与者
    pub recipient_ids: Vec<UserId>,
    pub medium: CallMedium,
}

/// 信令转发结果；目标不在线不是错误
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered,
    Unreachable,
}

pub struct CallServiceDependencies {
    pub chat_repository: Arc<dyn ChatRepository>,
    pub call_repository: Arc<dyn CallRepository>,
    pub registry: Arc<dyn PresenceRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    pub notifier: Arc<dyn OfflineNotifier>,
    pub clock: Arc<dyn Clock>,
}

/// 通话信令协调：状态迁移都经过 `Call` 的守卫，不满足源状态时返回 InvalidCallState
pub struct CallService {
    deps: CallServiceDependencies,
}

impl CallService {
    pub fn new(deps: CallServiceDependencies) -> Self {
        Self { deps }
    }

    pub async fn initiate(&self, request: InitiateCallRequest) -> Result<Call, ApplicationError> {
        let chat = self
            .deps
            .chat_repository
            .find_by_id(request.chat_id)
            .await?
            .ok_or(DomainError::ChatNotFound)?;
        chat.ensure_participant(request.caller_id)?;

        let recipients = if request.recipient_ids.is_empty() {
            chat.others(request.caller_id)
        } else {
            if let Some(outsider) = request
                .recipient_ids
                .iter()
                .find(|user_id| !chat.is_participant(**user_id))
            {
                return Err(DomainError::invalid_argument(
                    "recipient_ids",
                    format!("{outsider} is not a participant of this chat"),
                )
                .into());
            }
            request.recipient_ids
        };

        let now = self.deps.clock.now();
        let mut call = Call::new(
            CallId::from(Uuid::new_v4()),
            chat.id,
            request.caller_id,
            recipients,
            request.medium,
            now,
        )?;
        call.start_ringing()?;

        let recipient_ids: Vec<UserId> = call.participants.iter().map(|p| p.user_id).collect();
        for user_id in recipient_ids {
            let busy = !self
                .deps
                .call_repository
                .find_active_for_user(user_id)
                .await?
                .is_empty();
            if busy {
                call.mark_unavailable(user_id, ParticipantCallStatus::Busy, now)?;
            } else if !self.deps.registry.is_online(user_id).await {
                call.mark_unavailable(user_id, ParticipantCallStatus::Missed, now)?;
            }
        }
        call.settle_if_unanswered(now);

        let call = self.deps.call_repository.create(call).await?;

        let ringing: Vec<UserId> = call
            .participants
            .iter()
            .filter(|p| p.status == ParticipantCallStatus::Ringing)
            .map(|p| p.user_id)
            .collect();
        let missed: Vec<UserId> = call
            .participants
            .iter()
            .filter(|p| p.status == ParticipantCallStatus::Missed)
            .map(|p| p.user_id)
            .collect();

        let incoming = ServerEvent::IncomingCall { call: call.clone() };
        if !ringing.is_empty() {
            self.deps.broadcaster.to_users(&ringing, &incoming).await;
        }
        if !missed.is_empty() {
            self.deps.notifier.notify_offline(&missed, &incoming).await;
        }

        if call.status.is_terminal() {
            let reason = if call
                .participants
                .iter()
                .all(|p| p.status == ParticipantCallStatus::Busy)
            {
                CallFailure::RecipientBusy
            } else {
                CallFailure::RecipientUnreachable
            };
            self.notify_failure(&call, reason).await;
        }

        tracing::info!(
            call_id = %call.id,
            caller_id = %call.initiator,
            status = call.status.as_str(),
            ringing = ringing.len(),
            "通话已发起"
        );
        Ok(call)
    }

    pub async fn accept(&self, call_id: CallId, user_id: UserId) -> Result<Call, ApplicationError> {
        let now = self.deps.clock.now();
        let call = self.modify(call_id, |call| call.accept(user_id, now)).await?;

        // 主叫收到接听通知；被叫的其他设备据此停止振铃
        let event = ServerEvent::CallAccepted {
            call: call.clone(),
            user_id,
        };
        self.deps
            .broadcaster
            .to_users(&[call.initiator, user_id], &event)
            .await;
        tracing::info!(call_id = %call.id, user_id = %user_id, "通话已接听");
        Ok(call)
    }

    pub async fn decline(
        &self,
        call_id: CallId,
        user_id: UserId,
    ) -> Result<Call, ApplicationError> {
        let now = self.deps.clock.now();
        let call = self.modify(call_id, |call| call.decline(user_id, now)).await?;

        let event = ServerEvent::CallDeclined {
            call: call.clone(),
            user_id,
        };
        self.deps
            .broadcaster
            .to_users(&[call.initiator, user_id], &event)
            .await;
        tracing::info!(
            call_id = %call.id,
            user_id = %user_id,
            status = call.status.as_str(),
            "通话已拒接"
        );
        Ok(call)
    }

    pub async fn end(&self, call_id: CallId, user_id: UserId) -> Result<Call, ApplicationError> {
        let now = self.deps.clock.now();
        let call = self.modify(call_id, |call| call.end(user_id, now)).await?;

        let others: Vec<UserId> = call
            .member_ids()
            .into_iter()
            .filter(|member| *member != user_id)
            .collect();
        let event = ServerEvent::CallEnded {
            call: call.clone(),
            ended_by: Some(user_id),
        };
        self.deps.broadcaster.to_users(&others, &event).await;
        tracing::info!(
            call_id = %call.id,
            ended_by = %user_id,
            duration_secs = ?call.duration_secs,
            "通话已结束"
        );
        Ok(call)
    }

    /// 透传 WebRTC 信令，不解析内容，只按通话成员关系路由
    pub async fn relay_signal(
        &self,
        call_id: CallId,
        from_user_id: UserId,
        to_user_id: UserId,
        payload: serde_json::Value,
    ) -> Result<RelayOutcome, ApplicationError> {
        let call = self.load(call_id).await?;
        if !call.is_member(from_user_id) || !call.is_member(to_user_id) {
            return Err(DomainError::NotCallParticipant.into());
        }
        if call.status.is_terminal() {
            return Err(DomainError::invalid_call_state(call.status, "relay signal").into());
        }

        let event = ServerEvent::SignalRelay {
            call_id,
            from_user_id,
            payload,
        };
        let report = self.deps.broadcaster.to_user(to_user_id, &event).await;
        if report.reached_anyone() {
            Ok(RelayOutcome::Delivered)
        } else {
            tracing::debug!(call_id = %call_id, to_user_id = %to_user_id, "信令目标不在线");
            Ok(RelayOutcome::Unreachable)
        }
    }

    /// 振铃超时：呼叫进入 Missed，主叫收到 no-answer，被叫停止振铃。
    /// 已经离开振铃状态的呼叫返回 `false`
    pub async fn time_out(&self, call_id: CallId) -> Result<bool, ApplicationError> {
        let now = self.deps.clock.now();
        let call = match self.modify(call_id, |call| call.time_out(now)).await {
            Ok(call) => call,
            Err(ApplicationError::Domain(DomainError::InvalidCallState { .. })) => {
                return Ok(false)
            }
            Err(err) => return Err(err),
        };

        self.notify_failure(&call, CallFailure::NoAnswer).await;
        let recipients: Vec<UserId> = call.participants.iter().map(|p| p.user_id).collect();
        let event = ServerEvent::CallEnded {
            call: call.clone(),
            ended_by: None,
        };
        self.deps.broadcaster.to_users(&recipients, &event).await;
        tracing::info!(call_id = %call.id, "通话振铃超时");
        Ok(true)
    }

    async fn notify_failure(&self, call: &Call, reason: CallFailure) {
        let event = ServerEvent::CallFailed {
            call_id: call.id,
            reason,
        };
        self.deps.broadcaster.to_user(call.initiator, &event).await;
    }

    async fn load(&self, call_id: CallId) -> Result<Call, ApplicationError> {
        self.deps
            .call_repository
            .find_by_id(call_id)
            .await?
            .ok_or_else(|| DomainError::CallNotFound.into())
    }

    async fn modify<F>(&self, call_id: CallId, mut apply: F) -> Result<Call, ApplicationError>
    where
        F: FnMut(&mut Call) -> Result<(), DomainError> + Send,
    {
        for attempt in 1..=MAX_UPDATE_ATTEMPTS {
            let mut call = self.load(call_id).await?;
            apply(&mut call)?;
            match self.deps.call_repository.update(call).await {
                Ok(saved) => return Ok(saved),
                Err(RepositoryError::Conflict) => {
                    tracing::debug!(call_id = %call_id, attempt, "通话版本冲突，重试");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(RepositoryError::Conflict.into())
    }
}
