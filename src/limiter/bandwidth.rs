// 全局上传带宽限制
//
// 以 MB/s 配置，0 表示不限速；突发量为 1 秒的数据量。
// 运行期可随时调整，正在等待的请求按旧速率完成。

use super::TokenBucket;
use crate::error::Result;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// 上传带宽限制器
#[derive(Debug, Default)]
pub struct BandwidthLimiter {
    bucket: RwLock<Option<Arc<TokenBucket>>>,
}

impl BandwidthLimiter {
    /// 创建限速器（speed_mbps <= 0 表示不限速）
    pub fn new(speed_mbps: f64) -> Self {
        let limiter = Self::default();
        limiter.set_limit_mbps(speed_mbps);
        limiter
    }

    /// 设置全局上传速率限制
    pub fn set_limit_mbps(&self, speed_mbps: f64) {
        let bucket = if speed_mbps <= 0.0 {
            info!("[限速] 关闭上传限速");
            None
        } else {
            let bytes_per_sec = speed_mbps * BYTES_PER_MB;
            info!("[限速] 上传限速: {:.2} MB/s", speed_mbps);
            Some(Arc::new(TokenBucket::per_second(bytes_per_sec, bytes_per_sec)))
        };
        *self.bucket.write() = bucket;
    }

    /// 当前限速（MB/s），未启用时返回 None
    pub fn limit_mbps(&self) -> Option<f64> {
        self.bucket
            .read()
            .as_ref()
            .map(|b| b.rate_per_sec() / BYTES_PER_MB)
    }

    /// 等待 n 字节的发送配额
    pub async fn acquire_bytes(&self, n: u64, cancel: &CancellationToken) -> Result<()> {
        let bucket = self.bucket.read().clone();
        match bucket {
            Some(bucket) => bucket.acquire_n(n as f64, cancel).await,
            None => Ok(()),
        }
    }
}
