// 上传任务定义

use crate::bili::AccountCredentials;
use crate::error::{Result, UploadError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;
use uuid::Uuid;

/// 上传任务
///
/// 由调用方构造，入队后交给账号队列的工作者处理，结果送回后即丢弃
#[derive(Debug, Clone)]
pub struct UploadJob {
    /// 任务ID
    pub id: String,
    /// 本地文件路径
    pub file_path: PathBuf,
    /// 调用方声明的文件大小（以实际打开时读取的大小为准）
    pub file_size: u64,
    /// 上传方式或线路名（upos / kodo / app / cs_txa ...）
    pub backend: String,
    /// 账号凭证
    pub credentials: AccountCredentials,
    /// 所属批次（如一次录播的多个分P）
    pub batch_id: String,
    /// 分P序号，从 1 开始
    pub page: u32,
}

impl UploadJob {
    pub fn new(
        file_path: impl Into<PathBuf>,
        file_size: u64,
        backend: impl Into<String>,
        credentials: AccountCredentials,
        batch_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_path: file_path.into(),
            file_size,
            backend: backend.into(),
            credentials,
            batch_id: batch_id.into(),
            page: 1,
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    /// 文件名（不含路径）
    pub fn file_name(&self) -> String {
        file_name_of(&self.file_path)
    }
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// 上传结果，交给投稿流程使用
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    /// 稿件关联 ID（biz_id）
    pub asset_id: i64,
    /// 服务端分配的文件名
    pub server_filename: String,
}

/// 入队凭据：可等待最终结果，也可直接丢弃
#[derive(Debug)]
pub struct JobTicket {
    pub job_id: String,
    receiver: oneshot::Receiver<Result<UploadResult>>,
}

impl JobTicket {
    pub(crate) fn new(job_id: String, receiver: oneshot::Receiver<Result<UploadResult>>) -> Self {
        Self { job_id, receiver }
    }

    /// 等待上传结束
    ///
    /// 队列被关闭而任务未执行时返回 Cancelled
    pub async fn wait(self) -> Result<UploadResult> {
        self.receiver.await.unwrap_or(Err(UploadError::Cancelled))
    }
}
