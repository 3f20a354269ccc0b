use domain::{DomainError, RepositoryError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

/// 对调用方可见的错误分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PermissionDenied,
    InvalidState,
    NotFound,
    InvalidInput,
    /// 存储暂时不可用，调用方可以重试
    TransientStoreFailure,
}

impl ApplicationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApplicationError::Domain(err) => match err {
                DomainError::InvalidArgument { .. } => ErrorKind::InvalidInput,
                DomainError::ChatNotFound
                | DomainError::MessageNotFound
                | DomainError::CallNotFound => ErrorKind::NotFound,
                DomainError::NotParticipant
                | DomainError::PermissionDenied { .. }
                | DomainError::Forbidden { .. }
                | DomainError::NotCallParticipant => ErrorKind::PermissionDenied,
                DomainError::EditWindowExpired
                | DomainError::MessageDeleted
                | DomainError::InvalidCallState { .. } => ErrorKind::InvalidState,
            },
            ApplicationError::Repository(err) => match err {
                RepositoryError::NotFound => ErrorKind::NotFound,
                RepositoryError::Conflict | RepositoryError::Storage { .. } => {
                    ErrorKind::TransientStoreFailure
                }
            },
        }
    }

    /// 下发给客户端的错误码
    pub fn code(&self) -> &'static str {
        match self {
            ApplicationError::Domain(err) => match err {
                DomainError::InvalidArgument { .. } => "INVALID_ARGUMENT",
                DomainError::ChatNotFound => "CHAT_NOT_FOUND",
                DomainError::MessageNotFound => "MESSAGE_NOT_FOUND",
                DomainError::CallNotFound => "CALL_NOT_FOUND",
                DomainError::NotParticipant => "NOT_PARTICIPANT",
                DomainError::PermissionDenied { .. } => "PERMISSION_DENIED",
                DomainError::Forbidden { .. } => "FORBIDDEN",
                DomainError::EditWindowExpired => "EDIT_WINDOW_EXPIRED",
                DomainError::MessageDeleted => "MESSAGE_DELETED",
                DomainError::InvalidCallState { .. } => "INVALID_CALL_STATE",
                DomainError::NotCallParticipant => "NOT_CALL_PARTICIPANT",
            },
            ApplicationError::Repository(RepositoryError::NotFound) => "NOT_FOUND",
            ApplicationError::Repository(_) => "STORE_UNAVAILABLE",
        }
    }
}
