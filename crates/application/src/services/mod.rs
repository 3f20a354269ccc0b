pub mod call_service;
pub mod chat_service;
pub mod message_service;
pub mod presence_service;
pub mod typing_service;

#[cfg(test)]
mod call_service_tests;
#[cfg(test)]
mod test_support;

pub use call_service::{CallService, CallServiceDependencies, InitiateCallRequest, RelayOutcome};
pub use chat_service::{ChatService, ChatServiceDependencies, CreateChatRequest};
pub use message_service::{
    MessageService, MessageServiceDependencies, ReadOutcome, SendMessageRequest, SendOptions,
};
pub use presence_service::{PresenceService, PresenceServiceDependencies};
pub use typing_service::{ParticipantCache, TypingService, TypingServiceDependencies};
