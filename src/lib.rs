// Bilibili Upload Rust Library
// B站多线路上传引擎核心库

// B站上传接口模块
pub mod bili;

// 配置管理模块
pub mod config;

// 错误定义
pub mod error;

// 限流模块（令牌桶、带宽限制）
pub mod limiter;

// 日志模块
pub mod logging;

// 重试模块
pub mod retry;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use bili::{AccountCredentials, BiliClient, UploadLine, UPLOAD_LINES};
pub use config::AppConfig;
pub use error::{Result, UploadError};
pub use limiter::{ApiClass, BandwidthLimiter, RateLimiterBank, TokenBucket};
pub use retry::{with_retry, RetryPolicy};
pub use uploader::{
    BackendRegistry, JobTicket, ProgressRecord, ProgressState, ProgressTracker, QueueManager,
    UploadBackend, UploadEngine, UploadJob, UploadResult, UploadRuntime, UploadService,
};
