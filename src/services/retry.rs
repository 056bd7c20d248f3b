//! 重试策略 - 业务能力层
//!
//! 对任意外部调用做有界的指数退避重试。
//! 只负责"重试"，最终失败原样返回，兜底策略由调用方决定。

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ErrorClass;

/// 指数退避重试策略
///
/// 第 n 次失败后等待 `min(base * 2^(n-1), cap)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(8))
    }
}

impl RetryPolicy {
    /// # 参数
    /// - `max_attempts`: 总尝试次数（含第一次），最少为 1
    /// - `base_delay`: 第一次重试前的等待时间
    /// - `max_delay`: 单次等待上限
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.retry_max_attempts,
            config.retry_base_delay(),
            config.retry_max_delay(),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// 第 `attempt` 次失败后的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// 执行操作，可重试的错误在次数用尽前会退避重试
    ///
    /// # 参数
    /// - `label`: 日志中显示的操作名称
    /// - `classify`: 错误分类函数
    /// - `operation`: 每次调用返回一个新的 Future
    ///
    /// # 返回
    /// 成功结果，或最后一次失败的错误
    pub async fn run<T, E, F, Fut, C>(&self, label: &str, classify: C, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("{} 第 {} 次尝试成功", label, attempt);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    let retryable = classify(&e) == ErrorClass::Retryable;
                    if !retryable || attempt >= self.max_attempts {
                        warn!(
                            "{} 失败 (尝试 {}/{}, {}): {}",
                            label,
                            attempt,
                            self.max_attempts,
                            if retryable { "重试已用尽" } else { "不可重试" },
                            e
                        );
                        return Err(e);
                    }

                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} 失败 (尝试 {}/{}), {:?} 后重试: {}",
                        label, attempt, self.max_attempts, delay, e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
