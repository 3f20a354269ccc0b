//! 领域模型错误定义
//!
//! 状态机守卫失败、权限违规、资源不存在都在这里表达；
//! 存储层故障单独使用 `RepositoryError`。

use thiserror::Error;

use crate::call::CallStatus;

/// 领域模型错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid argument {field}: {reason}")]
    InvalidArgument { field: String, reason: String },

    #[error("chat not found")]
    ChatNotFound,

    #[error("message not found")]
    MessageNotFound,

    #[error("call not found")]
    CallNotFound,

    /// 发送者不是会话的有效参与者
    #[error("user is not a participant of this chat")]
    NotParticipant,

    /// 角色不满足（例如频道里普通成员发言）
    #[error("permission denied: {action}")]
    PermissionDenied { action: String },

    /// 只有原发送者可以编辑或为所有人删除
    #[error("only the original sender may {action}")]
    Forbidden { action: String },

    #[error("edit window has expired")]
    EditWindowExpired,

    /// 已被删除或已过期的消息不可再修改
    #[error("message has been deleted")]
    MessageDeleted,

    #[error("call is {status:?}, cannot {action}")]
    InvalidCallState { status: CallStatus, action: String },

    #[error("user is not a participant of this call")]
    NotCallParticipant,
}

impl DomainError {
    pub fn invalid_argument(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn permission_denied(action: impl Into<String>) -> Self {
        Self::PermissionDenied {
            action: action.into(),
        }
    }

    pub fn forbidden(action: impl Into<String>) -> Self {
        Self::Forbidden {
            action: action.into(),
        }
    }

    pub fn invalid_call_state(status: CallStatus, action: impl Into<String>) -> Self {
        Self::InvalidCallState {
            status,
            action: action.into(),
        }
    }
}

/// 存储层错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("record not found")]
    NotFound,

    /// 乐观锁版本冲突，调用方可以重新读取后重试
    #[error("concurrent modification detected")]
    Conflict,

    #[error("storage failure: {message}")]
    Storage { message: String },
}

impl RepositoryError {
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}

/// 领域模型结果类型
pub type DomainResult<T> = Result<T, DomainError>;
