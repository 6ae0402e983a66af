// 队列管理器
//
// 按账号ID懒创建上传队列，不同账号的队列互不影响、并发执行

use super::queue::{AccountQueue, JobRunner};
use super::task::{JobTicket, UploadJob};
use crate::error::{Result, UploadError};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct QueueManager {
    queues: DashMap<String, Arc<AccountQueue>>,
    runner: Arc<dyn JobRunner>,
    capacity: usize,
    /// 根取消令牌，每个账号队列持有其子令牌
    cancel: CancellationToken,
}

impl QueueManager {
    pub fn new(runner: Arc<dyn JobRunner>, capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            runner,
            capacity,
            cancel: CancellationToken::new(),
        }
    }

    /// 提交上传任务到账号队列，队列满时立即返回 QueueFull
    pub fn enqueue(&self, account_id: &str, job: UploadJob) -> Result<JobTicket> {
        self.enqueue_with_cancel(account_id, job, CancellationToken::new())
    }

    /// 提交任务并绑定调用方的取消令牌
    pub fn enqueue_with_cancel(
        &self,
        account_id: &str,
        job: UploadJob,
        cancel: CancellationToken,
    ) -> Result<JobTicket> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        self.queue_for(account_id).enqueue_with_cancel(job, cancel)
    }

    fn queue_for(&self, account_id: &str) -> Arc<AccountQueue> {
        if let Some(queue) = self.queues.get(account_id) {
            return Arc::clone(queue.value());
        }
        let queue = self
            .queues
            .entry(account_id.to_string())
            .or_insert_with(|| {
                info!("[队列] 创建账号队列: {}", account_id);
                AccountQueue::new(
                    account_id,
                    self.capacity,
                    Arc::clone(&self.runner),
                    self.cancel.child_token(),
                )
            });
        Arc::clone(queue.value())
    }

    /// 账号待处理任务数，账号不存在时为 0
    pub fn queue_depth(&self, account_id: &str) -> usize {
        self.queues
            .get(account_id)
            .map(|q| q.depth())
            .unwrap_or(0)
    }

    pub fn all_queue_depths(&self) -> HashMap<String, usize> {
        self.queues
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().depth()))
            .collect()
    }

    /// 关闭单个账号的队列；关闭完成后再次入队会创建新队列
    ///
    /// 关闭期间队列仍留在表里，此时入队直接得到 Cancelled，
    /// 不会在旧任务还没停下时为同一账号启动第二个工作者
    pub async fn shutdown_account(&self, account_id: &str) {
        let queue = match self.queues.get(account_id) {
            Some(entry) => Arc::clone(entry.value()),
            None => return,
        };
        queue.shutdown().await;
        self.queues
            .remove_if(account_id, |_, current| Arc::ptr_eq(current, &queue));
    }

    /// 关闭全部队列
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let queues: Vec<_> = self
            .queues
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.queues.clear();
        for queue in queues {
            queue.shutdown().await;
        }
        info!("[队列] 所有账号队列已关闭");
    }
}
