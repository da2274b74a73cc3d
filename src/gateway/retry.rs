//! 发送重试
//!
//! 暂时性错误按指数退避重试, 永久性错误直接返回。
//! 退避等待可以被关闭信号打断。

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::bridge::BridgeResult;
use crate::config::GeneralConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 首次发送之外最多重试几次
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 0.0 ~ 1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from_config(&GeneralConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(general: &GeneralConfig) -> Self {
        RetryPolicy {
            max_retries: general.retry_max,
            initial_delay: Duration::from_millis(general.retry_initial_delay_ms),
            max_delay: Duration::from_millis(general.retry_max_delay_ms),
            multiplier: general.retry_multiplier.max(1.0),
            jitter: general.retry_jitter.clamp(0.0, 1.0),
        }
    }

    /// 第 `attempt` 次重试前的等待时间 (不含随机浮动), 从 0 开始
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let scale = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        base.mul_f64((1.0 + scale).max(0.0))
    }

    /// # 带重试地执行一次出站操作
    /// ### Arguments
    /// - `label` 日志中的操作描述
    /// - `shutdown` 关闭信号; 触发后不再等待下一次重试
    /// - `op` 每次尝试调用一次; 调用方传入的消息在多次尝试间保持不变
    pub async fn run<T, F, Fut>(&self, label: &str, shutdown: &CancellationToken, mut op: F) -> BridgeResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BridgeResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if !err.is_transient() {
                return Err(err);
            }
            if attempt >= self.max_retries {
                tracing::warn!("{} 重试 {} 次后仍然失败: {}", label, attempt, err);
                return Err(err);
            }
            let delay = self.delay(attempt);
            attempt += 1;
            tracing::debug!("{} 失败, {:?} 后第 {} 次重试: {}", label, delay, attempt, err);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.cancelled() => {
                    tracing::warn!("{} 正在关闭, 放弃重试: {}", label, err);
                    return Err(err);
                }
            }
        }
    }
}
