// 上传方式抽象
//
// 三种上传方式（UPOS 直传分片、Kodo 块拼接、APP 小文件流）共用三阶段流程：
// 1. negotiate: 预上传，拿到上传地址、令牌、biz_id
// 2. transfer_chunks: 按序上传所有分片，单个分片失败只重试该分片
// 3. finalize: 合并分片，返回 biz_id 和服务端文件名
//
// 分片大小、鉴权头、序号起点、是否需要整文件 MD5 都是 BackendProfile 中的配置，
// 新增上传方式只需实现 UploadBackend 并注册到 BackendRegistry。

use super::app::AppBackend;
use super::chunk::{chunk_md5, ChunkPlan, UploadChunk};
use super::kodo::KodoBackend;
use super::task::UploadResult;
use super::upos::UposBackend;
use crate::bili::{find_line, BiliClient, PreUploadResponse};
use crate::config::RetrySettings;
use crate::error::{Result, UploadError};
use crate::limiter::{ApiClass, BandwidthLimiter, RateLimiterBank};
use crate::retry::with_retry_notify;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 整文件 MD5 的计算时机
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileHashTiming {
    /// 不需要
    None,
    /// 上传分片前计算（APP）
    BeforeTransfer,
    /// 边传边算，合并时提交
    AtCompletion,
}

/// 上传方式参数
#[derive(Debug, Clone)]
pub struct BackendProfile {
    /// 上传方式名称（注册表键）
    pub name: &'static str,
    /// 标准分片大小
    pub chunk_size: u64,
    /// 首个分片的序号
    pub index_base: u64,
    /// 上传节点鉴权头，为空表示不需要
    pub auth_header: &'static str,
    /// 鉴权头的值前缀（Kodo 为 "UpToken "）
    pub auth_prefix: &'static str,
    /// 预上传参数 r
    pub preupload_r: &'static str,
    /// 预上传参数 profile
    pub preupload_profile: &'static str,
    pub version: &'static str,
    pub build: &'static str,
    /// 是否随分片提交分片 MD5（为真时 send_chunk 会收到该分片的 MD5）
    pub chunk_hash: bool,
    pub file_hash: FileHashTiming,
}

impl BackendProfile {
    /// 上传节点鉴权头的值
    pub fn auth_value(&self, token: &str) -> String {
        format!("{}{}", self.auth_prefix, token)
    }

    /// 预上传公共参数
    pub fn preupload_params(&self, file_name: &str, file_size: u64) -> Vec<(&'static str, String)> {
        vec![
            ("name", file_name.to_string()),
            ("size", file_size.to_string()),
            ("r", self.preupload_r.to_string()),
            ("profile", self.preupload_profile.to_string()),
            ("ssl", "0".to_string()),
            ("version", self.version.to_string()),
            ("build", self.build.to_string()),
        ]
    }
}

/// 预上传协商结果，仅在一个文件的上传过程中使用
#[derive(Debug, Clone, Default)]
pub struct PreUploadSession {
    /// 上传令牌
    pub auth: String,
    /// 选定的上传地址（已补全协议头）
    pub endpoint: String,
    /// 分片上传 ID（UPOS）
    pub upload_id: String,
    /// 上传路径（UPOS，由 upos_uri 得出）
    pub object_path: String,
    /// 对象 key（UPOS 线路初始化返回）
    pub object_key: String,
    /// 稿件关联 ID
    pub asset_id: i64,
    /// 服务端改写后的文件名
    pub server_filename: String,
    /// 本地文件名
    pub file_name: String,
}

/// 分片传输回执
#[derive(Debug, Clone, Default)]
pub struct TransferReceipt {
    pub chunk_count: u64,
    /// 每个分片的服务端标记（Kodo 的 ctx），按序号排列
    pub part_tags: Vec<String>,
    pub file_md5: Option<String>,
}

/// 上传进度回调
pub trait ProgressSink: Send + Sync {
    fn chunk_done(&self, done: u64, total: u64);
    fn retry_wait(&self, message: &str);
}

/// 不关心进度时使用
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn chunk_done(&self, _done: u64, _total: u64) {}
    fn retry_wait(&self, _message: &str) {}
}

/// 单个任务的上传上下文
pub struct UploadContext {
    pub client: BiliClient,
    pub limiter: Arc<RateLimiterBank>,
    pub bandwidth: Arc<BandwidthLimiter>,
    pub retry: RetrySettings,
    pub cancel: CancellationToken,
    pub progress: Arc<dyn ProgressSink>,
}

impl UploadContext {
    /// 限流 + 重试地执行一次接口调用
    ///
    /// 每次尝试前都从对应类别的令牌桶取令牌；默认策略用尽后若判定为平台限流，
    /// 标记 RetryWait 并改用限流策略再试一轮。
    pub async fn call<T, F, Fut>(&self, class: ApiClass, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempt = || {
            let fut = op();
            async move {
                self.limiter.acquire(class, &self.cancel).await?;
                fut.await
            }
        };
        let notify = |n: u32, delay: std::time::Duration, err: &UploadError| {
            self.progress
                .retry_wait(&format!("第 {} 次重试，等待 {:?}: {}", n, delay, err));
        };

        match with_retry_notify(&self.retry.default, &self.cancel, notify, &attempt).await {
            Err(e) if e.is_throttled() => {
                warn!("[{:?}] 检测到平台限流，改用限流重试策略: {}", class, e);
                self.progress.retry_wait(&format!("平台限流: {}", e));
                with_retry_notify(&self.retry.rate_limit, &self.cancel, notify, &attempt).await
            }
            other => other,
        }
    }
}

/// 预上传响应检查：OK 标志缺失或为假时返回 NegotiationFailed
pub fn ensure_preupload_ok(resp: PreUploadResponse) -> Result<PreUploadResponse> {
    if resp.is_ok() {
        Ok(resp)
    } else {
        Err(UploadError::NegotiationFailed(format!(
            "OK={}, code={}, message={}",
            resp.ok, resp.code, resp.message
        )))
    }
}

/// 取文件名主干：/ugcboss/n230101abc.mp4 -> n230101abc
pub fn file_stem(name: &str) -> &str {
    let name = name.rsplit('/').next().unwrap_or(name);
    match name.find('.') {
        Some(idx) if idx > 0 => &name[..idx],
        _ => name,
    }
}

/// 上传方式
#[async_trait]
pub trait UploadBackend: Send + Sync {
    fn profile(&self) -> &BackendProfile;

    /// 预上传协商
    async fn negotiate(
        &self,
        ctx: &UploadContext,
        file_name: &str,
        file_size: u64,
    ) -> Result<PreUploadSession>;

    /// 发送单个分片（一次尝试，不含限流与重试），返回服务端给出的分片标记
    ///
    /// checksum 仅在 profile.chunk_hash 为真时提供，重试时复用同一个值
    async fn send_chunk(
        &self,
        ctx: &UploadContext,
        session: &PreUploadSession,
        plan: &ChunkPlan,
        chunk: &UploadChunk,
        data: &[u8],
        checksum: Option<&str>,
    ) -> Result<String>;

    /// 按序上传全部分片
    async fn transfer_chunks(
        &self,
        ctx: &UploadContext,
        session: &PreUploadSession,
        file: &mut File,
        plan: &ChunkPlan,
    ) -> Result<TransferReceipt> {
        let profile = self.profile();
        let total = plan.chunk_count();
        let mut part_tags = Vec::with_capacity(total as usize);
        let mut hasher =
            (profile.file_hash == FileHashTiming::AtCompletion).then(md5::Context::new);

        info!(
            "[{}] 开始分片上传: total_chunks={}, chunk_size={}MB",
            profile.name,
            total,
            plan.chunk_size() / (1024 * 1024)
        );

        for chunk in plan.chunks() {
            if ctx.cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let data = chunk.read_data(file).await?;
            if let Some(hasher) = hasher.as_mut() {
                hasher.consume(&data);
            }

            let checksum = profile.chunk_hash.then(|| chunk_md5(&data));

            ctx.bandwidth.acquire_bytes(chunk.size(), &ctx.cancel).await?;

            let tag = ctx
                .call(ApiClass::ChunkTransfer, || {
                    self.send_chunk(ctx, session, plan, chunk, &data, checksum.as_deref())
                })
                .await
                .map_err(|e| {
                    warn!(
                        "[{}] ❌ 分片 {}/{} 上传失败: {}",
                        profile.name, chunk.seq, total, e
                    );
                    e
                })?;
            part_tags.push(tag);

            let done = chunk.index as u64 + 1;
            ctx.progress.chunk_done(done, total);
            info!(
                "[{}] 上传进度: {}/{} ({:.1}%)",
                profile.name,
                done,
                total,
                done as f64 * 100.0 / total as f64
            );
        }

        Ok(TransferReceipt {
            chunk_count: total,
            part_tags,
            file_md5: hasher.map(|h| format!("{:x}", h.compute())),
        })
    }

    /// 合并分片
    async fn finalize(
        &self,
        ctx: &UploadContext,
        session: &PreUploadSession,
        receipt: &TransferReceipt,
        file_size: u64,
    ) -> Result<UploadResult>;
}

/// 解析结果：上传方式 + 实际使用的线路名
pub struct ResolvedBackend {
    pub backend: Arc<dyn UploadBackend>,
    /// 选择器是线路名时为该线路，否则为 None
    pub line: Option<&'static str>,
}

/// 上传方式注册表
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<&'static str, Arc<dyn UploadBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册 upos / kodo / app
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(UposBackend::new()));
        registry.register(Arc::new(KodoBackend::new()));
        registry.register(Arc::new(AppBackend::new()));
        registry
    }

    pub fn register(&mut self, backend: Arc<dyn UploadBackend>) {
        self.backends.insert(backend.profile().name, backend);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn UploadBackend>> {
        self.backends.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.backends.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// 选择器可以是上传方式名，也可以是线路名；都不匹配时立即失败
    pub fn resolve(&self, selector: &str) -> Result<ResolvedBackend> {
        if let Some(backend) = self.get(selector) {
            return Ok(ResolvedBackend {
                backend,
                line: None,
            });
        }

        find_line(selector)
            .and_then(|line| {
                self.get(line.backend).map(|backend| ResolvedBackend {
                    backend,
                    line: Some(line.name),
                })
            })
            .ok_or_else(|| UploadError::UnknownBackend(selector.to_string()))
    }
}
