//! 过期清理调度 - 编排层
//!
//! 按固定间隔删除过期的部分提交记录，与任何会话无关。

use std::future::Future;
use std::time::Duration;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info};

use crate::error::StoreResult;
use crate::models::CleanupReport;
use crate::services::ProgressivePersistence;

/// 过期清理调度器
pub struct CleanupScheduler {
    persistence: ProgressivePersistence,
    period: Duration,
}

impl CleanupScheduler {
    pub fn new(persistence: ProgressivePersistence, period: Duration) -> Self {
        Self {
            persistence,
            period: period.max(Duration::from_millis(1)),
        }
    }

    /// 执行一次清理
    pub async fn run_once(&self) -> StoreResult<CleanupReport> {
        self.persistence.cleanup_expired_sessions().await
    }

    /// 立即执行一次，之后按间隔执行，直到 `shutdown` 完成
    ///
    /// # 返回
    /// 执行清理的次数
    pub async fn run_until<F>(self, shutdown: F) -> usize
    where
        F: Future<Output = ()>,
    {
        info!("🧹 过期清理已启动，间隔 {:?}", self.period);
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        let mut runs = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    runs += 1;
                    if let Err(e) = self.run_once().await {
                        error!("❌ 过期清理失败: {}", e);
                    }
                }
            }
        }

        info!("🧹 过期清理已停止 (共执行 {} 次)", runs);
        runs
    }
}
