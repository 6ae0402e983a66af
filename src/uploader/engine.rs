// 上传引擎
//
// 驱动单个文件走完三阶段流程：
// 1. 打开文件，按上传方式生成分片计划（超过分片上限直接拒绝）
// 2. 预上传协商
// 3. 按需计算整文件 MD5，按序上传分片
// 4. 合并分片
// 全程向 ProgressTracker 汇报，结束时标记成功或失败

use super::backend::{FileHashTiming, ProgressSink, UploadBackend, UploadContext};
use super::chunk::{
    calculate_chunk_count, exceeds_chunk_limit, file_md5, ChunkPlan, MAX_CHUNKS_PER_FILE,
};
use super::progress::ProgressTracker;
use super::task::{UploadJob, UploadResult};
use crate::bili::BiliClient;
use crate::config::RetrySettings;
use crate::error::{Result, UploadError};
use crate::limiter::{BandwidthLimiter, RateLimiterBank};
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 把后端的进度回调转发到进度追踪器
struct JobProgress {
    tracker: Arc<ProgressTracker>,
    job_id: String,
    batch_id: String,
    page: u32,
}

impl ProgressSink for JobProgress {
    fn chunk_done(&self, done: u64, total: u64) {
        self.tracker
            .update_chunk_done(&self.job_id, &self.batch_id, self.page, done, total);
    }

    fn retry_wait(&self, message: &str) {
        self.tracker.mark_retry_wait(&self.job_id, message);
    }
}

/// 上传引擎（进程内共享限流器、带宽限制和进度追踪器）
pub struct UploadEngine {
    limiter: Arc<RateLimiterBank>,
    bandwidth: Arc<BandwidthLimiter>,
    retry: RetrySettings,
    tracker: Arc<ProgressTracker>,
    max_chunks_per_file: u64,
}

impl UploadEngine {
    pub fn new(
        limiter: Arc<RateLimiterBank>,
        bandwidth: Arc<BandwidthLimiter>,
        retry: RetrySettings,
        tracker: Arc<ProgressTracker>,
    ) -> Self {
        Self {
            limiter,
            bandwidth,
            retry,
            tracker,
            max_chunks_per_file: MAX_CHUNKS_PER_FILE,
        }
    }

    pub fn with_max_chunks(mut self, max_chunks_per_file: u64) -> Self {
        self.max_chunks_per_file = max_chunks_per_file;
        self
    }

    pub fn tracker(&self) -> &Arc<ProgressTracker> {
        &self.tracker
    }

    pub fn bandwidth(&self) -> &Arc<BandwidthLimiter> {
        &self.bandwidth
    }

    /// 上传单个文件
    pub async fn run(
        &self,
        backend: &dyn UploadBackend,
        client: BiliClient,
        job: &UploadJob,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        let result = self.run_phases(backend, client, job, cancel).await;

        match &result {
            Ok(res) => {
                info!(
                    "✓ 上传成功: job={}, file={}, biz_id={}, server_filename={}",
                    job.id,
                    job.file_path.display(),
                    res.asset_id,
                    res.server_filename
                );
                self.tracker.mark_success(&job.id);
            }
            Err(e) => {
                error!(
                    "✗ 上传失败: job={}, file={}, 错误: {}",
                    job.id,
                    job.file_path.display(),
                    e
                );
                // 预检失败时还没有进度记录，这里一并补上
                self.tracker
                    .record_failure(&job.id, &job.batch_id, job.page, &e.to_string());
            }
        }

        result
    }

    async fn run_phases(
        &self,
        backend: &dyn UploadBackend,
        client: BiliClient,
        job: &UploadJob,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        let profile = backend.profile();

        let mut file = File::open(&job.file_path).await?;
        let file_size = file.metadata().await?.len();
        if file_size == 0 {
            return Err(UploadError::Validation(format!(
                "文件为空: {}",
                job.file_path.display()
            )));
        }
        if job.file_size != 0 && job.file_size != file_size {
            warn!(
                "文件大小与任务声明不一致，以实际大小为准: declared={}, actual={}",
                job.file_size, file_size
            );
        }

        if exceeds_chunk_limit(file_size, profile.chunk_size, self.max_chunks_per_file) {
            return Err(UploadError::Validation(format!(
                "分片数 {} 超过上限 {}，需要先切分文件",
                calculate_chunk_count(file_size, profile.chunk_size),
                self.max_chunks_per_file
            )));
        }
        let plan = ChunkPlan::new(file_size, profile.chunk_size, profile.index_base);

        self.tracker
            .start(&job.id, &job.batch_id, job.page, plan.chunk_count());

        let ctx = UploadContext {
            client,
            limiter: Arc::clone(&self.limiter),
            bandwidth: Arc::clone(&self.bandwidth),
            retry: self.retry.clone(),
            cancel: cancel.clone(),
            progress: Arc::new(JobProgress {
                tracker: Arc::clone(&self.tracker),
                job_id: job.id.clone(),
                batch_id: job.batch_id.clone(),
                page: job.page,
            }),
        };

        let file_name = job.file_name();
        info!(
            "[{}] 开始上传: job={}, file={}, size={}, chunks={}",
            profile.name,
            job.id,
            file_name,
            file_size,
            plan.chunk_count()
        );

        let session = backend.negotiate(&ctx, &file_name, file_size).await?;

        let file_hash = match profile.file_hash {
            FileHashTiming::BeforeTransfer => Some(file_md5(&job.file_path).await?),
            _ => None,
        };

        let mut receipt = backend
            .transfer_chunks(&ctx, &session, &mut file, &plan)
            .await?;
        if receipt.file_md5.is_none() {
            receipt.file_md5 = file_hash;
        }

        backend.finalize(&ctx, &session, &receipt, file_size).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bili::AccountCredentials;
    use crate::uploader::progress::ProgressState;
    use crate::uploader::test_support::{fast_retry, write_temp_file};
    use crate::uploader::upos::UposBackend;
    use mockito::Matcher;
    use std::time::Duration;

    const MB: usize = 1024 * 1024;

    fn engine() -> UploadEngine {
        UploadEngine::new(
            Arc::new(RateLimiterBank::unlimited()),
            Arc::new(BandwidthLimiter::default()),
            fast_retry(),
            Arc::new(ProgressTracker::new()),
        )
    }

    fn client(base: &str) -> BiliClient {
        BiliClient::new(
            AccountCredentials::new(1, "", "SESSDATA=abc"),
            base,
            "cs_bda2",
            Duration::from_secs(10),
        )
        .unwrap()
    }

    fn job(path: &std::path::Path, size: u64) -> UploadJob {
        UploadJob::new(
            path,
            size,
            "upos",
            AccountCredentials::new(1, "", "SESSDATA=abc"),
            "batch-1",
        )
    }

    #[tokio::test]
    async fn test_twelve_mib_upos_upload() {
        let mut server = mockito::Server::new_async().await;
        let base = server.url();
        let size = 12 * MB;

        server
            .mock("GET", "/preupload")
            .match_query(Matcher::Any)
            .with_body(
                serde_json::json!({
                    "OK": 1,
                    "auth": "tok",
                    "endpoint": base,
                    "biz_id": 1001,
                    "upos_uri": "upos://ugcboss/n12.mp4",
                    "bilifilename": "n12",
                })
                .to_string(),
            )
            .create_async()
            .await;
        server
            .mock("POST", "/ugcboss/n12.mp4")
            .match_query(Matcher::Regex("uploads".into()))
            .with_body(r#"{"OK":1,"upload_id":"u1","key":"/n12.mp4"}"#)
            .create_async()
            .await;

        let mut parts = Vec::new();
        for (part, len) in [(1, 5 * MB), (2, 5 * MB), (3, 2 * MB)] {
            parts.push(
                server
                    .mock("PUT", "/ugcboss/n12.mp4")
                    .match_query(Matcher::AllOf(vec![
                        Matcher::UrlEncoded("partNumber".into(), part.to_string()),
                        Matcher::UrlEncoded("size".into(), len.to_string()),
                        Matcher::UrlEncoded("chunks".into(), "3".into()),
                    ]))
                    .with_body("ok")
                    .expect(1)
                    .create_async()
                    .await,
            );
        }
        let complete = server
            .mock("POST", "/ugcboss/n12.mp4")
            .match_query(Matcher::UrlEncoded("uploadId".into(), "u1".into()))
            .match_body(Matcher::Json(serde_json::json!({
                "parts": [
                    {"partNumber": 1, "eTag": "etag"},
                    {"partNumber": 2, "eTag": "etag"},
                    {"partNumber": 3, "eTag": "etag"}
                ]
            })))
            .with_body(r#"{"OK":1}"#)
            .expect(1)
            .create_async()
            .await;

        let (tmp, _) = write_temp_file(size);
        let engine = engine();
        let job = job(tmp.path(), size as u64);

        let result = engine
            .run(&UposBackend::new(), client(&base), &job, &CancellationToken::new())
            .await
            .unwrap();

        for part in parts {
            part.assert_async().await;
        }
        complete.assert_async().await;
        assert_eq!(result.asset_id, 1001);
        assert_eq!(result.server_filename, "n12");

        let record = engine.tracker().get(&job.id).unwrap();
        assert_eq!(record.state, ProgressState::Success);
        assert_eq!(record.percent, 100);
        assert_eq!(record.chunk_total, 3);
    }

    #[tokio::test]
    async fn test_negotiation_failure_marks_failed() {
        let mut server = mockito::Server::new_async().await;
        let pre = server
            .mock("GET", "/preupload")
            .match_query(Matcher::Any)
            .with_body(r#"{"OK":0}"#)
            .expect(4)
            .create_async()
            .await;

        let (tmp, _) = write_temp_file(1000);
        let engine = engine();
        let job = job(tmp.path(), 1000);

        let cancel = CancellationToken::new();
        let err = engine
            .run(&UposBackend::new(), client(&server.url()), &job, &cancel)
            .await
            .unwrap_err();

        pre.assert_async().await;
        assert!(matches!(err, UploadError::NegotiationFailed(_)));
        let record = engine.tracker().get(&job.id).unwrap();
        assert_eq!(record.state, ProgressState::Failed);
        assert!(record.message.unwrap().contains("预上传失败"));
    }

    #[tokio::test]
    async fn test_rejects_files_over_chunk_limit() {
        let (tmp, _) = write_temp_file(3 * MB);
        // 5MB 分片下 3MB 为 1 片，上限设为 0 触发拒绝
        let engine = engine().with_max_chunks(0);
        let job = job(tmp.path(), 0);

        let cancel = CancellationToken::new();
        let err = engine
            .run(&UposBackend::new(), client("http://127.0.0.1:9"), &job, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));

        // 未开始传输也要留下失败记录，批次查询可见
        let record = engine.tracker().get(&job.id).unwrap();
        assert_eq!(record.state, ProgressState::Failed);
        assert_eq!(record.chunk_total, 0);
        assert!(record.message.unwrap().contains("超过上限"));
        assert_eq!(engine.tracker().list_by_batch("batch-1").len(), 1);
    }

    #[tokio::test]
    async fn test_empty_file_is_rejected() {
        let (tmp, _) = write_temp_file(0);
        let engine = engine();
        let job = job(tmp.path(), 0);
        let cancel = CancellationToken::new();
        let err = engine
            .run(&UposBackend::new(), client("http://127.0.0.1:9"), &job, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::Validation(_)));
        assert_eq!(engine.tracker().get(&job.id).unwrap().state, ProgressState::Failed);
    }
}
