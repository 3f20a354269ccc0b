//! 应用层实现。
//!
//! 围绕领域模型的用例服务：在线注册、输入状态、消息扇出与回执、
//! 通话信令、定时清扫。存储通过仓储 trait 抽象，连接通过有界出站队列抽象。

pub mod broadcaster;
pub mod clock;
pub mod error;
pub mod memory;
pub mod presence;
pub mod repository;
pub mod runtime;
pub mod sequencer;
pub mod services;
pub mod sweeper;

pub use broadcaster::{Broadcaster, DeliveryReport, LoggingNotifier, OfflineNotifier};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ApplicationError, ErrorKind};
pub use memory::MemoryStore;
pub use presence::{PresenceRegistry, SessionHandle};
pub use repository::{CallRepository, ChatRepository, MessageRepository, PresenceRepository};
pub use runtime::{RealtimeCore, Repositories};
pub use sequencer::ChatSequencer;
pub use services::{
    CallService, ChatService, CreateChatRequest, InitiateCallRequest, MessageService,
    PresenceService, ReadOutcome, RelayOutcome, SendMessageRequest, SendOptions, TypingService,
};
pub use sweeper::{SweepReport, Sweeper};
