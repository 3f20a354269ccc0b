use std::sync::Arc;

use domain::{Chat, ChatId, ChatType, DomainError, Participant, ParticipantRole, UserId};
use uuid::Uuid;

use crate::{
    clock::Clock, error::ApplicationError, presence::PresenceRegistry,
    repository::ChatRepository, services::typing_service::ParticipantCache,
};

#[derive(Debug, Clone)]
pub struct CreateChatRequest {
    pub creator_id: UserId,
    pub chat_type: ChatType,
    pub member_ids: Vec<UserId>,
    pub admins_only: bool,
}

pub struct ChatServiceDependencies {
    pub chat_repository: Arc<dyn ChatRepository>,
    pub registry: Arc<dyn PresenceRegistry>,
    pub participants: Arc<ParticipantCache>,
    pub clock: Arc<dyn Clock>,
}

/// 会话与成员管理。成员变化会同步到房间订阅和参与者缓存
pub struct ChatService {
    deps: ChatServiceDependencies,
}

impl ChatService {
    pub fn new(deps: ChatServiceDependencies) -> Self {
        Self { deps }
    }

    pub async fn create_chat(&self, request: CreateChatRequest) -> Result<Chat, ApplicationError> {
        let now = self.deps.clock.now();
        let mut chat = Chat::new(
            ChatId::from(Uuid::new_v4()),
            request.chat_type,
            request.creator_id,
            request.member_ids,
            now,
        )?;
        chat.admins_only = request.admins_only && request.chat_type == ChatType::Group;

        let chat = self.deps.chat_repository.create(chat).await?;
        tracing::info!(
            chat_id = %chat.id,
            chat_type = chat.chat_type.as_str(),
            participants = chat.participants.len(),
            "会话已创建"
        );
        Ok(chat)
    }

    pub async fn get_chat(&self, chat_id: ChatId, viewer: UserId) -> Result<Chat, ApplicationError> {
        let chat = self.load(chat_id).await?;
        if chat.chat_type != ChatType::Channel {
            chat.ensure_participant(viewer)?;
        }
        Ok(chat)
    }

    pub async fn list_chats(&self, user_id: UserId) -> Result<Vec<Chat>, ApplicationError> {
        Ok(self.deps.chat_repository.list_for_user(user_id).await?)
    }

    /// 管理员添加成员
    pub async fn add_participant(
        &self,
        chat_id: ChatId,
        operator_id: UserId,
        user_id: UserId,
        role: ParticipantRole,
    ) -> Result<Chat, ApplicationError> {
        let mut chat = self.load(chat_id).await?;
        let operator = chat.ensure_participant(operator_id)?;
        if !operator.role.is_admin() {
            return Err(DomainError::permission_denied("add participants").into());
        }
        if role == ParticipantRole::Owner {
            return Err(DomainError::invalid_argument("role", "a chat has a single owner").into());
        }

        let now = self.deps.clock.now();
        chat.add_participant(user_id, role, now)?;
        self.deps
            .chat_repository
            .add_participant(chat_id, Participant::new(user_id, role, now))
            .await?;
        self.deps.participants.invalidate(chat_id).await;

        tracing::info!(chat_id = %chat_id, operator_id = %operator_id, user_id = %user_id, "成员已加入");
        Ok(chat)
    }

    /// 管理员移除成员；所有者不能被移除
    pub async fn remove_participant(
        &self,
        chat_id: ChatId,
        operator_id: UserId,
        user_id: UserId,
    ) -> Result<(), ApplicationError> {
        let chat = self.load(chat_id).await?;
        let operator = chat.ensure_participant(operator_id)?;
        if !operator.role.is_admin() {
            return Err(DomainError::permission_denied("remove participants").into());
        }
        let target = chat.ensure_participant(user_id)?;
        if target.role == ParticipantRole::Owner {
            return Err(DomainError::permission_denied("remove the chat owner").into());
        }
        if chat.chat_type == ChatType::Direct {
            return Err(DomainError::permission_denied("remove members of a direct chat").into());
        }

        self.detach(chat_id, user_id).await?;
        tracing::info!(chat_id = %chat_id, operator_id = %operator_id, user_id = %user_id, "成员已被移除");
        Ok(())
    }

    pub async fn leave(&self, chat_id: ChatId, user_id: UserId) -> Result<(), ApplicationError> {
        let chat = self.load(chat_id).await?;
        chat.ensure_participant(user_id)?;
        self.detach(chat_id, user_id).await?;
        tracing::info!(chat_id = %chat_id, user_id = %user_id, "成员已退出");
        Ok(())
    }

    async fn detach(&self, chat_id: ChatId, user_id: UserId) -> Result<(), ApplicationError> {
        self.deps
            .chat_repository
            .remove_participant(chat_id, user_id)
            .await?;
        self.deps.registry.evict_from_room(chat_id, user_id).await;
        self.deps.participants.invalidate(chat_id).await;
        Ok(())
    }

    async fn load(&self, chat_id: ChatId) -> Result<Chat, ApplicationError> {
        self.deps
            .chat_repository
            .find_by_id(chat_id)
            .await?
            .ok_or_else(|| DomainError::ChatNotFound.into())
    }
}
