//! 实时通信核心的领域模型
//!
//! 包含会话、消息、通话实体及其状态约束，以及下发给连接的事件定义。

pub mod call;
pub mod chat;
pub mod errors;
pub mod events;
pub mod message;
pub mod value_objects;

// 重新导出常用类型
pub use call::{Call, CallMedium, CallParticipant, CallStatus, ParticipantCallStatus};
pub use chat::{Chat, ChatType, Participant, ParticipantRole};
pub use errors::{DomainError, DomainResult, RepositoryError};
pub use events::{CallFailure, ServerEvent, SignalKind};
pub use message::{
    Message, MessageRevision, MessageType, NewMessage, Reaction, Receipt, SelfDestruct, Tombstone,
    DELETED_PLACEHOLDER, EXPIRED_PLACEHOLDER,
};
pub use value_objects::{
    CallId, ChatId, MessageContent, MessageId, SessionId, Timestamp, UserId, MAX_CONTENT_CHARS,
};
