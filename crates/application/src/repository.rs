use async_trait::async_trait;
use domain::{
    Call, CallId, Chat, ChatId, Message, MessageId, Participant, RepositoryError, Timestamp,
    UserId,
};

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatRepository: Send + Sync {
    async fn create(&self, chat: Chat) -> Result<Chat, RepositoryError>;
    async fn find_by_id(&self, id: ChatId) -> Result<Option<Chat>, RepositoryError>;
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Chat>, RepositoryError>;
    async fn add_participant(
        &self,
        chat_id: ChatId,
        participant: Participant,
    ) -> Result<(), RepositoryError>;
    /// 同时删除该参与者的未读计数
    async fn remove_participant(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<bool, RepositoryError>;
    /// 按已读列表重新计算未读数并写回，返回新值
    async fn recompute_unread(
        &self,
        chat_id: ChatId,
        user_id: UserId,
    ) -> Result<u32, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 原子写入：分配序号；非定时消息同时更新会话最后消息和其他参与者的未读数
    async fn create(&self, message: Message) -> Result<Message, RepositoryError>;

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;

    async fn find_many(&self, ids: &[MessageId]) -> Result<Vec<Message>, RepositoryError>;

    /// 乐观锁更新：`message.version` 与存储不一致时返回 `Conflict`
    async fn update(&self, message: Message) -> Result<Message, RepositoryError>;

    /// 原子地发布定时消息并更新会话指针。已经发布过返回 `None`
    async fn promote(
        &self,
        id: MessageId,
        now: Timestamp,
    ) -> Result<Option<Message>, RepositoryError>;

    /// 按 (created_at, sequence) 升序，`before` 之前最近的 `limit` 条
    async fn list_chat(
        &self,
        chat_id: ChatId,
        limit: u32,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError>;

    async fn list_due_scheduled(
        &self,
        now: Timestamp,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError>;

    async fn list_due_self_destruct(
        &self,
        now: Timestamp,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CallRepository: Send + Sync {
    async fn create(&self, call: Call) -> Result<Call, RepositoryError>;
    async fn find_by_id(&self, id: CallId) -> Result<Option<Call>, RepositoryError>;
    /// 乐观锁更新，同 `MessageRepository::update`
    async fn update(&self, call: Call) -> Result<Call, RepositoryError>;
    /// 用户作为主叫或已接听/振铃中的被叫参与的未结束通话
    async fn find_active_for_user(&self, user_id: UserId) -> Result<Vec<Call>, RepositoryError>;
    async fn list_ringing_since(&self, cutoff: Timestamp) -> Result<Vec<Call>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresenceRepository: Send + Sync {
    async fn record_last_seen(&self, user_id: UserId, at: Timestamp)
        -> Result<(), RepositoryError>;
    async fn last_seen(&self, user_id: UserId) -> Result<Option<Timestamp>, RepositoryError>;
}
