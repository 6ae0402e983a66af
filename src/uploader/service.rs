// 上传服务
//
// 队列工作者调用的入口：校验任务 -> 解析上传方式与线路 -> 构建客户端 -> 交给引擎执行。
// UploadRuntime 在进程启动时按配置一次性组装限流器、进度追踪器、引擎与队列管理器。

use super::backend::BackendRegistry;
use super::engine::UploadEngine;
use super::manager::QueueManager;
use super::progress::ProgressTracker;
use super::queue::JobRunner;
use super::task::{JobTicket, UploadJob, UploadResult};
use crate::bili::{find_line, BiliClient};
use crate::config::{AccountConfig, AppConfig, UploadConfig};
use crate::error::{Result, UploadError};
use crate::limiter::{BandwidthLimiter, RateLimiterBank};
use async_trait::async_trait;
use dashmap::DashSet;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 确定实际使用的线路
///
/// 选择器本身是线路名时直接使用；否则默认线路属于该上传方式时用默认线路；
/// 都不满足时以上传方式名作为线路名（kodo / app）
pub fn select_line(selected: Option<&str>, backend: &str, default_line: &str) -> String {
    if let Some(line) = selected {
        return line.to_string();
    }
    match find_line(default_line) {
        Some(line) if line.backend == backend => line.name.to_string(),
        _ => backend.to_string(),
    }
}

/// 执行中的任务ID登记，离开作用域自动移除
struct InFlightGuard<'a> {
    set: &'a DashSet<String>,
    job_id: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.job_id);
    }
}

pub struct UploadService {
    engine: UploadEngine,
    registry: BackendRegistry,
    config: UploadConfig,
    in_flight: DashSet<String>,
}

impl UploadService {
    pub fn new(engine: UploadEngine, registry: BackendRegistry, config: UploadConfig) -> Self {
        Self {
            engine,
            registry,
            config,
            in_flight: DashSet::new(),
        }
    }

    pub fn engine(&self) -> &UploadEngine {
        &self.engine
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    fn begin(&self, job_id: &str) -> Result<InFlightGuard<'_>> {
        if !self.in_flight.insert(job_id.to_string()) {
            return Err(UploadError::Validation(format!("任务 {} 正在执行", job_id)));
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            job_id: job_id.to_string(),
        })
    }

    /// 执行上传任务
    ///
    /// 除重复提交外，任何失败都会在进度追踪器里留下 Failed 记录
    pub async fn upload(
        &self,
        job: &UploadJob,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        let _guard = self.begin(&job.id)?;

        let result = self.upload_checked(job, cancel).await;
        if let Err(e) = &result {
            self.record_failure(job, e);
            if e.is_auth() {
                warn!("账号凭证失效，需要重新登录: uid={}", job.credentials.uid);
            }
        }
        result
    }

    fn record_failure(&self, job: &UploadJob, error: &UploadError) {
        self.engine
            .tracker()
            .record_failure(&job.id, &job.batch_id, job.page, &error.to_string());
    }

    async fn upload_checked(
        &self,
        job: &UploadJob,
        cancel: &CancellationToken,
    ) -> Result<UploadResult> {
        if !job.credentials.is_present() {
            return Err(UploadError::Auth(
                "缺少账号凭证（Cookie 或 access_key）".to_string(),
            ));
        }
        validate_file(&job.file_path).await?;

        let resolved = self.registry.resolve(&job.backend)?;
        let backend_name = resolved.backend.profile().name;
        let line = select_line(resolved.line, backend_name, &self.config.default_line);
        info!(
            "开始上传任务: job={}, backend={}, line={}, file={}",
            job.id,
            backend_name,
            line,
            job.file_path.display()
        );

        let client = BiliClient::new(
            job.credentials.clone(),
            &self.config.member_base_url,
            &line,
            self.config.request_timeout(),
        )?;

        self.engine
            .run(resolved.backend.as_ref(), client, job, cancel)
            .await
    }
}

#[async_trait]
impl JobRunner for UploadService {
    async fn run(&self, job: &UploadJob, cancel: &CancellationToken) -> Result<UploadResult> {
        self.upload(job, cancel).await
    }

    fn on_aborted(&self, job: &UploadJob, error: &UploadError) {
        self.record_failure(job, error);
    }
}

async fn validate_file(path: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(path).await.map_err(|e| {
        UploadError::Validation(format!("无法读取文件 {}: {}", path.display(), e))
    })?;
    if !meta.is_file() {
        return Err(UploadError::Validation(format!(
            "不是普通文件: {}",
            path.display()
        )));
    }
    if meta.len() == 0 {
        return Err(UploadError::Validation(format!(
            "文件为空: {}",
            path.display()
        )));
    }
    Ok(())
}

/// 进程级上传运行时
pub struct UploadRuntime {
    service: Arc<UploadService>,
    queues: QueueManager,
    default_line: String,
}

impl UploadRuntime {
    pub fn from_config(config: &AppConfig) -> Self {
        let upload = &config.upload;
        let limiter = Arc::new(RateLimiterBank::new(&config.rate_limit));
        let bandwidth = Arc::new(BandwidthLimiter::new(upload.speed_limit_mbps));
        let tracker = Arc::new(ProgressTracker::with_settings(
            upload.progress_expire(),
            upload.success_linger(),
        ));
        let engine = UploadEngine::new(limiter, bandwidth, config.retry.clone(), tracker)
            .with_max_chunks(upload.max_chunks_per_file);

        Self::with_service(
            Arc::new(UploadService::new(
                engine,
                BackendRegistry::with_defaults(),
                upload.clone(),
            )),
            upload,
        )
    }

    pub fn with_service(service: Arc<UploadService>, upload: &UploadConfig) -> Self {
        let queues = QueueManager::new(service.clone(), upload.queue_capacity);
        info!(
            "上传运行时已初始化: queue_capacity={}, default_line={}",
            upload.queue_capacity, upload.default_line
        );
        Self {
            service,
            queues,
            default_line: upload.default_line.clone(),
        }
    }

    /// 提交任务到账号队列
    pub fn enqueue(&self, account_id: &str, job: UploadJob) -> Result<JobTicket> {
        self.queues.enqueue(account_id, job)
    }

    /// 提交任务并绑定调用方的取消令牌，取消只影响该任务
    pub fn enqueue_with_cancel(
        &self,
        account_id: &str,
        job: UploadJob,
        cancel: CancellationToken,
    ) -> Result<JobTicket> {
        self.queues.enqueue_with_cancel(account_id, job, cancel)
    }

    /// 按账号配置构建任务并入队
    pub async fn submit_file(
        &self,
        account: &AccountConfig,
        file_path: impl AsRef<Path>,
        batch_id: &str,
        page: u32,
    ) -> Result<JobTicket> {
        let file_path = file_path.as_ref();
        let file_size = tokio::fs::metadata(file_path)
            .await
            .map(|m| m.len())
            .map_err(|e| {
                UploadError::Validation(format!("无法读取文件 {}: {}", file_path.display(), e))
            })?;
        let selector = account.line.as_deref().unwrap_or(&self.default_line);
        let job = UploadJob::new(
            file_path,
            file_size,
            selector,
            account.credentials(),
            batch_id,
        )
        .with_page(page);
        self.enqueue(&account.id, job)
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        self.service.engine().tracker()
    }

    pub fn bandwidth(&self) -> &Arc<BandwidthLimiter> {
        self.service.engine().bandwidth()
    }

    pub fn queues(&self) -> &QueueManager {
        &self.queues
    }

    pub async fn shutdown(&self) {
        self.queues.shutdown().await;
    }
}
