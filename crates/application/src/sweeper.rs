//! 定时清扫
//!
//! 每个周期发布到期的定时消息、让到期的阅后即焚消息过期、结束振铃超时的呼叫。
//! 每一步都由存储中的状态标记守卫，周期中途失败后下个周期重跑是安全的。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::{
    clock::Clock,
    error::ApplicationError,
    repository::{CallRepository, MessageRepository},
    services::{CallService, MessageService},
};

/// 单个周期每类记录最多处理的条数
const SWEEP_BATCH: u32 = 500;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub promoted: usize,
    pub expired: usize,
    pub timed_out_calls: usize,
    pub failures: usize,
}

pub struct SweeperDependencies {
    pub message_repository: Arc<dyn MessageRepository>,
    pub call_repository: Arc<dyn CallRepository>,
    pub messages: Arc<MessageService>,
    pub calls: Arc<CallService>,
    pub clock: Arc<dyn Clock>,
    pub interval: Duration,
    pub ring_timeout: chrono::Duration,
}

pub struct Sweeper {
    deps: SweeperDependencies,
}

impl Sweeper {
    pub fn new(deps: SweeperDependencies) -> Self {
        Self { deps }
    }

    /// 按固定间隔运行，直到 `shutdown` 变为 true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.deps.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(interval = ?self.deps.interval, "清扫任务已启动");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(report) if report != SweepReport::default() => {
                            tracing::info!(
                                promoted = report.promoted,
                                expired = report.expired,
                                timed_out_calls = report.timed_out_calls,
                                failures = report.failures,
                                "清扫完成"
                            );
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::error!(error = %err, "清扫失败，下个周期重试");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("清扫任务已停止");
    }

    /// 单个周期。列出到期记录失败时整体返回错误；单条记录失败只计数
    pub async fn sweep_once(&self) -> Result<SweepReport, ApplicationError> {
        let now = self.deps.clock.now();
        let mut report = SweepReport::default();

        let due = self
            .deps
            .message_repository
            .list_due_scheduled(now, SWEEP_BATCH)
            .await?;
        for message in due {
            match self.deps.messages.promote_scheduled(message.id).await {
                Ok(Some(_)) => report.promoted += 1,
                Ok(None) => {}
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(message_id = %message.id, error = %err, "发布定时消息失败");
                }
            }
        }

        let expiring = self
            .deps
            .message_repository
            .list_due_self_destruct(now, SWEEP_BATCH)
            .await?;
        for message in expiring {
            match self.deps.messages.expire(message.id).await {
                Ok(true) => report.expired += 1,
                Ok(false) => {}
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(message_id = %message.id, error = %err, "阅后即焚过期失败");
                }
            }
        }

        let ringing = self
            .deps
            .call_repository
            .list_ringing_since(now - self.deps.ring_timeout)
            .await?;
        for call in ringing {
            match self.deps.calls.time_out(call.id).await {
                Ok(true) => report.timed_out_calls += 1,
                Ok(false) => {}
                Err(err) => {
                    report.failures += 1;
                    tracing::warn!(call_id = %call.id, error = %err, "振铃超时处理失败");
                }
            }
        }

        Ok(report)
    }
}
