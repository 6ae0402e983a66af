// 令牌桶
//
// 持有 tokio Mutex 期间完成等待：Mutex 按到达顺序唤醒，
// 因此长时间等待后的放行顺序与请求顺序一致，重试洪峰无法插队。

use crate::error::{Result, UploadError};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
struct BucketState {
    /// 当前令牌数（可以为负，表示透支）
    tokens: f64,
    /// 上次补充时间
    last_refill: Instant,
}

/// 令牌桶限流器
#[derive(Debug)]
pub struct TokenBucket {
    /// 每秒补充的令牌数，<= 0 表示不限速
    rate_per_sec: f64,
    /// 桶容量（允许的突发数）
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// 按"每 interval 发放一个令牌"创建
    pub fn every(interval: Duration, burst: u32) -> Self {
        let rate = if interval.is_zero() {
            0.0
        } else {
            1.0 / interval.as_secs_f64()
        };
        Self::per_second(rate, burst.max(1) as f64)
    }

    /// 按每秒速率创建
    pub fn per_second(rate_per_sec: f64, burst: f64) -> Self {
        Self {
            rate_per_sec,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    /// 不限速的令牌桶
    pub fn unlimited() -> Self {
        Self::per_second(0.0, 1.0)
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate_per_sec <= 0.0
    }

    pub fn rate_per_sec(&self) -> f64 {
        self.rate_per_sec
    }

    /// 获取一个令牌
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        self.acquire_n(1.0, cancel).await
    }

    /// 获取 n 个令牌
    ///
    /// n 可以超过桶容量：先透支，再等待欠额补齐后放行
    pub async fn acquire_n(&self, n: f64, cancel: &CancellationToken) -> Result<()> {
        if self.is_unlimited() {
            return Ok(());
        }

        let mut state = tokio::select! {
            guard = self.state.lock() => guard,
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
        };

        self.refill(&mut state, Instant::now());
        state.tokens -= n;

        if state.tokens < 0.0 {
            let wait = Duration::from_secs_f64(-state.tokens / self.rate_per_sec);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.cancelled() => {
                    // 归还未使用的令牌
                    state.tokens += n;
                    return Err(UploadError::Cancelled);
                }
            }
            self.refill(&mut state, Instant::now());
        }

        Ok(())
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.last_refill = now;
    }
}
