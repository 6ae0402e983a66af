// 重试执行器
//
// 按策略对任意操作做分类重试 + 指数退避：
// - 错误消息包含策略中的关键字（区分大小写）才重试
// - 致命错误（认证/参数/取消）直接返回
// - 服务端拒绝（OK 标志为假）与平台限流（含业务码 601）按瞬时错误处理
// - 退避等待可被取消令牌打断

use crate::error::{Result, UploadError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// B站常见的可重试错误关键字
fn default_retryable_errors() -> Vec<String> {
    [
        "timeout",
        "connection",
        "EOF",
        "reset",
        "temporary",
        "429",          // Too Many Requests
        "503",          // Service Unavailable
        "502",          // Bad Gateway
        "406",          // B站限流错误
        "上传视频过快", // B站限流提示
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// 重试策略
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    /// 首次重试前的等待时间（毫秒）
    pub initial_delay_ms: u64,
    /// 单次等待上限（毫秒）
    pub max_delay_ms: u64,
    /// 退避因子
    pub backoff_factor: f64,
    /// 可重试错误关键字
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_policy()
    }
}

impl RetryPolicy {
    /// 默认策略：3 次重试，2s 起步，最长 30s，翻倍退避
    pub fn default_policy() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 2_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            retryable_errors: default_retryable_errors(),
        }
    }

    /// 限流策略：5 次重试，15s 起步，最长 2 分钟，1.5 倍退避
    pub fn rate_limit() -> Self {
        Self {
            max_retries: 5,
            initial_delay_ms: 15_000,
            max_delay_ms: 120_000,
            backoff_factor: 1.5,
            retryable_errors: default_retryable_errors(),
        }
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// 判断错误是否值得重试
    pub fn is_retryable(&self, error: &UploadError) -> bool {
        if error.is_fatal() {
            return false;
        }
        if error.is_rejection() || error.is_throttled() {
            return true;
        }
        let msg = error.to_string();
        self.retryable_errors
            .iter()
            .any(|keyword| msg.contains(keyword.as_str()))
    }

    /// 计算下一次等待时间
    fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff_factor.max(1.0)).min(self.max_delay())
    }

    /// 连续失败时依次等待的时长序列
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        let mut delay = self.initial_delay().min(self.max_delay());
        let mut schedule = Vec::with_capacity(self.max_retries as usize);
        for _ in 0..self.max_retries {
            schedule.push(delay);
            delay = self.next_delay(delay);
        }
        schedule
    }
}

/// 带重试执行操作
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    with_retry_notify(policy, cancel, |_, _, _| {}, op).await
}

/// 带重试执行操作，每次进入退避等待前回调 `notify(attempt, delay, error)`
pub async fn with_retry_notify<T, F, Fut, N>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut notify: N,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    N: FnMut(u32, Duration, &UploadError),
{
    let mut delay = policy.initial_delay().min(policy.max_delay());
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if !policy.is_retryable(&error) {
            debug!("不可重试的错误，直接返回: {}", error);
            return Err(error);
        }

        if attempt >= policy.max_retries {
            warn!("已达最大重试次数 ({}): {}", policy.max_retries, error);
            return Err(error);
        }

        attempt += 1;
        warn!(
            "操作失败，等待 {:?} 后重试 ({}/{}): {}",
            delay, attempt, policy.max_retries, error
        );
        notify(attempt, delay, &error);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
        }

        delay = policy.next_delay(delay);
    }
}
