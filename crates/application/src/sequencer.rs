use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use domain::ChatId;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// 空闲锁条目超过该数量时清理一次
const PRUNE_THRESHOLD: usize = 1024;

/// 按会话串行化"写入并推送"。
///
/// 持有某个会话的锁期间完成持久化和入队，同一接收方看到的新消息顺序
/// 与写入顺序一致。不同会话之间互不阻塞。
#[derive(Default)]
pub struct ChatSequencer {
    locks: Mutex<HashMap<ChatId, Arc<AsyncMutex<()>>>>,
}

impl ChatSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, chat_id: ChatId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            if locks.len() > PRUNE_THRESHOLD {
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(chat_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
