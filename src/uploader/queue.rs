// 账号上传队列
//
// 同一账号的所有上传通过单个工作者串行执行（平台会惩罚同账号并发上传）：
// - 有界 FIFO，满时 enqueue 立即返回 QueueFull，不阻塞
// - 入队与"是否已有工作者"的判断在同一把锁内完成，工作者退出与入队竞争时不会丢任务
// - 队列清空后工作者退出，下一次入队重新启动
// - 单个任务失败只影响该任务，工作者继续处理下一个
// - 每个任务可带调用方的取消令牌，只取消该任务

use super::task::{JobTicket, UploadJob, UploadResult};
use crate::error::{Result, UploadError};
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 默认队列容量
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// 任务执行者（通常为 UploadService）
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &UploadJob, cancel: &CancellationToken) -> Result<UploadResult>;

    /// 任务在队列侧被终止（取消、panic）时调用，run 本身没有机会收尾
    fn on_aborted(&self, _job: &UploadJob, _error: &UploadError) {}
}

struct QueuedJob {
    job: UploadJob,
    reply: oneshot::Sender<Result<UploadResult>>,
    /// 调用方的取消令牌
    cancel: CancellationToken,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<QueuedJob>,
    /// 当前工作者，None 表示没有工作者在处理本队列
    worker: Option<JoinHandle<()>>,
}

/// 单个账号的上传队列
pub struct AccountQueue {
    account_id: String,
    capacity: usize,
    state: Mutex<QueueState>,
    runner: Arc<dyn JobRunner>,
    cancel: CancellationToken,
}

impl AccountQueue {
    pub fn new(
        account_id: impl Into<String>,
        capacity: usize,
        runner: Arc<dyn JobRunner>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            account_id: account_id.into(),
            capacity,
            state: Mutex::new(QueueState::default()),
            runner,
            cancel,
        })
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// 入队，必要时启动工作者
    pub fn enqueue(self: &Arc<Self>, job: UploadJob) -> Result<JobTicket> {
        self.enqueue_with_cancel(job, CancellationToken::new())
    }

    /// 入队并绑定调用方的取消令牌
    ///
    /// 令牌被取消时：任务还在排队则跳过，正在执行则中止；都以 Cancelled 结束，
    /// 不影响队列中的其他任务
    pub fn enqueue_with_cancel(
        self: &Arc<Self>,
        job: UploadJob,
        cancel: CancellationToken,
    ) -> Result<JobTicket> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        let (reply, receiver) = oneshot::channel();
        let job_id = job.id.clone();

        let mut state = self.state.lock();
        if state.pending.len() >= self.capacity {
            warn!(
                "[队列] 账号 {} 队列已满，拒绝任务 {}",
                self.account_id, job_id
            );
            return Err(UploadError::QueueFull {
                account_id: self.account_id.clone(),
                capacity: self.capacity,
            });
        }
        state.pending.push_back(QueuedJob { job, reply, cancel });
        debug!(
            "[队列] 账号 {} 入队: job={}, depth={}",
            self.account_id,
            job_id,
            state.pending.len()
        );

        if state.worker.is_none() {
            let queue = Arc::clone(self);
            state.worker = Some(tokio::spawn(async move { queue.drain().await }));
            debug!("[队列] 账号 {} 启动工作者", self.account_id);
        }
        drop(state);

        Ok(JobTicket::new(job_id, receiver))
    }

    /// 待处理任务数（不含正在执行的任务）
    pub fn depth(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// 是否有工作者正在处理本队列
    pub fn is_draining(&self) -> bool {
        self.state.lock().worker.is_some()
    }

    /// 关闭队列：取消正在执行的任务，剩余任务以 Cancelled 结束，并等待工作者退出
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let worker = self.state.lock().worker.take();
        if let Some(handle) = worker {
            if let Err(e) = handle.await {
                error!("[队列] 账号 {} 工作者异常退出: {}", self.account_id, e);
            }
        }
        // 工作者已退出，残留任务直接回复取消
        let rest: Vec<_> = self.state.lock().pending.drain(..).collect();
        for queued in rest {
            self.runner.on_aborted(&queued.job, &UploadError::Cancelled);
            let _ = queued.reply.send(Err(UploadError::Cancelled));
        }
        info!("[队列] 账号 {} 已关闭", self.account_id);
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state.lock();
                match state.pending.pop_front() {
                    Some(queued) => queued,
                    None => {
                        state.worker = None;
                        debug!("[队列] 账号 {} 队列已空，工作者退出", self.account_id);
                        return;
                    }
                }
            };
            self.process(next).await;
        }
    }

    async fn process(&self, queued: QueuedJob) {
        let QueuedJob {
            job,
            reply,
            cancel: job_cancel,
        } = queued;

        let result = if self.cancel.is_cancelled() || job_cancel.is_cancelled() {
            Err(UploadError::Cancelled)
        } else {
            info!(
                "[队列] 账号 {} 开始处理: job={}, file={}",
                self.account_id,
                job.id,
                job.file_path.display()
            );
            let run = AssertUnwindSafe(self.runner.run(&job, &self.cancel)).catch_unwind();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(UploadError::Cancelled),
                _ = job_cancel.cancelled() => Err(UploadError::Cancelled),
                outcome = run => outcome.unwrap_or_else(|_| {
                    Err(UploadError::Internal(format!("任务 {} 执行时发生 panic", job.id)))
                }),
            }
        };

        match &result {
            Ok(res) => info!(
                "[队列] 账号 {} 任务完成: job={}, biz_id={}",
                self.account_id, job.id, res.asset_id
            ),
            Err(UploadError::Cancelled) => {
                info!("[队列] 账号 {} 任务已取消: job={}", self.account_id, job.id)
            }
            Err(e) => error!(
                "[队列] 账号 {} 任务失败: job={}, 错误: {}",
                self.account_id, job.id, e
            ),
        }

        if let Err(e @ (UploadError::Cancelled | UploadError::Internal(_))) = &result {
            self.runner.on_aborted(&job, e);
        }

        // 调用方可能已丢弃凭据
        let _ = reply.send(result);
    }
}
