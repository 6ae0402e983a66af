// B站 API 调用限流（全局防风控）
//
// 每类接口有独立的风控阈值，单一全局限流器要么饿死快路径、要么保护不住慢路径，
// 所以按接口类别各建一个令牌桶：
// - 预上传：1 次/秒
// - 分片上传：约 3 次/秒（间隔 350ms，突发 3）
// - 合并/投稿相关：5 次/分钟
// - 弹幕发送：22 秒 1 条
// - 其他接口：2 次/秒
//
// 整个进程共享一个 RateLimiterBank，通过 Arc 传给所有上传器。

pub mod bandwidth;
pub mod bucket;

pub use bandwidth::BandwidthLimiter;
pub use bucket::TokenBucket;

use crate::config::{LimitRule, RateLimitConfig};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// API 调用类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiClass {
    /// 预上传协商
    Negotiate,
    /// 分片传输
    ChunkTransfer,
    /// 合并分片 / 投稿相关
    Finalize,
    /// 弹幕发送
    Danmaku,
    /// 其他接口
    General,
}

impl ApiClass {
    pub const ALL: [ApiClass; 5] = [
        ApiClass::Negotiate,
        ApiClass::ChunkTransfer,
        ApiClass::Finalize,
        ApiClass::Danmaku,
        ApiClass::General,
    ];
}

/// 限流器组
#[derive(Debug)]
pub struct RateLimiterBank {
    negotiate: TokenBucket,
    chunk_transfer: TokenBucket,
    finalize: TokenBucket,
    danmaku: TokenBucket,
    general: TokenBucket,
}

impl RateLimiterBank {
    /// 按配置创建
    pub fn new(config: &RateLimitConfig) -> Self {
        fn bucket(rule: &LimitRule) -> TokenBucket {
            TokenBucket::every(rule.interval(), rule.burst)
        }

        Self {
            negotiate: bucket(&config.negotiate),
            chunk_transfer: bucket(&config.chunk_transfer),
            finalize: bucket(&config.finalize),
            danmaku: bucket(&config.danmaku),
            general: bucket(&config.general),
        }
    }

    /// 所有类别都不限速（测试与离线工具使用）
    pub fn unlimited() -> Self {
        Self {
            negotiate: TokenBucket::unlimited(),
            chunk_transfer: TokenBucket::unlimited(),
            finalize: TokenBucket::unlimited(),
            danmaku: TokenBucket::unlimited(),
            general: TokenBucket::unlimited(),
        }
    }

    fn bucket(&self, class: ApiClass) -> &TokenBucket {
        match class {
            ApiClass::Negotiate => &self.negotiate,
            ApiClass::ChunkTransfer => &self.chunk_transfer,
            ApiClass::Finalize => &self.finalize,
            ApiClass::Danmaku => &self.danmaku,
            ApiClass::General => &self.general,
        }
    }

    /// 阻塞直到该类别拿到一个令牌
    pub async fn acquire(&self, class: ApiClass, cancel: &CancellationToken) -> Result<()> {
        trace!("[限流] 等待令牌: {:?}", class);
        self.bucket(class).acquire(cancel).await
    }
}

impl Default for RateLimiterBank {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}
