// 上传引擎模块
//
// - 三种上传方式（UPOS 分片 / 七牛 Kodo 块上传 / APP 小文件）共用一套限流 + 重试 + 进度
// - 每个账号一个串行队列，不同账号并发
// - 进度按任务ID记录，按批次查询

pub mod app;
pub mod backend;
pub mod chunk;
pub mod engine;
pub mod kodo;
pub mod manager;
pub mod progress;
pub mod queue;
pub mod service;
pub mod task;
pub mod upos;

pub use app::AppBackend;
pub use backend::{
    BackendProfile, BackendRegistry, FileHashTiming, NoopProgress, PreUploadSession,
    ProgressSink, ResolvedBackend, TransferReceipt, UploadBackend, UploadContext,
};
pub use chunk::{ChunkPlan, UploadChunk, MAX_CHUNKS_PER_FILE};
pub use engine::UploadEngine;
pub use kodo::KodoBackend;
pub use manager::QueueManager;
pub use progress::{ProgressRecord, ProgressState, ProgressTracker};
pub use queue::{AccountQueue, JobRunner, DEFAULT_QUEUE_CAPACITY};
pub use service::{select_line, UploadRuntime, UploadService};
pub use task::{JobTicket, UploadJob, UploadResult};
pub use upos::UposBackend;

#[cfg(test)]
pub(crate) mod test_support {
    use super::backend::{ProgressSink, UploadContext};
    use crate::bili::{AccountCredentials, BiliClient};
    use crate::config::RetrySettings;
    use crate::limiter::{BandwidthLimiter, RateLimiterBank};
    use crate::retry::RetryPolicy;
    use parking_lot::Mutex;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::NamedTempFile;
    use tokio_util::sync::CancellationToken;

    /// 记录进度回调
    #[derive(Default)]
    pub(crate) struct TestProgress {
        pub(crate) done: Mutex<Vec<u64>>,
        pub(crate) waits: Mutex<Vec<String>>,
    }

    impl ProgressSink for TestProgress {
        fn chunk_done(&self, done: u64, _total: u64) {
            self.done.lock().push(done);
        }

        fn retry_wait(&self, message: &str) {
            self.waits.lock().push(message.to_string());
        }
    }

    /// 毫秒级退避，3 次重试
    pub(crate) fn fast_retry() -> RetrySettings {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            backoff_factor: 2.0,
            ..RetryPolicy::default_policy()
        };
        RetrySettings {
            default: policy.clone(),
            rate_limit: policy,
        }
    }

    pub(crate) fn context(
        base: &str,
        line: &str,
        progress: Arc<dyn ProgressSink>,
    ) -> UploadContext {
        UploadContext {
            client: BiliClient::new(
                AccountCredentials::new(1, "", "SESSDATA=abc"),
                base,
                line,
                Duration::from_secs(10),
            )
            .unwrap(),
            limiter: Arc::new(RateLimiterBank::unlimited()),
            bandwidth: Arc::new(BandwidthLimiter::default()),
            retry: fast_retry(),
            cancel: CancellationToken::new(),
            progress,
        }
    }

    /// 写入 len 字节的临时文件，返回文件与内容
    pub(crate) fn write_temp_file(len: usize) -> (NamedTempFile, Vec<u8>) {
        let mut tmp = NamedTempFile::new().unwrap();
        let content: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        tmp.write_all(&content).unwrap();
        tmp.flush().unwrap();
        (tmp, content)
    }
}
