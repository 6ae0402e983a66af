// 上传进度追踪
//
// 纯内存记录，按任务 ID 存储，可按批次查询：
// - 每次写操作顺带清理 10 分钟没有更新的记录
// - 上传成功后保留约 1 秒，让轮询方能看到 100% 再消失
// - 上传中的百分比单调不减

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// 记录无更新多久后过期
pub const DEFAULT_PROGRESS_EXPIRE: Duration = Duration::from_secs(10 * 60);

/// 成功后保留多久
pub const DEFAULT_SUCCESS_LINGER: Duration = Duration::from_secs(1);

/// 上传状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProgressState {
    Uploading,
    /// 等待重试（限流或网络错误）
    RetryWait,
    Success,
    Failed,
}

/// 单个任务的进度
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub job_id: String,
    pub batch_id: String,
    /// 分P序号
    pub page: u32,
    pub chunk_done: u64,
    pub chunk_total: u64,
    /// 0-100
    pub percent: u32,
    pub state: ProgressState,
    pub message: Option<String>,
    pub updated_at: DateTime<Local>,
    #[serde(skip)]
    touched: Instant,
}

impl ProgressRecord {
    fn new(job_id: &str, batch_id: &str, page: u32, chunk_total: u64) -> Self {
        Self {
            job_id: job_id.to_string(),
            batch_id: batch_id.to_string(),
            page,
            chunk_done: 0,
            chunk_total,
            percent: 0,
            state: ProgressState::Uploading,
            message: None,
            updated_at: Local::now(),
            touched: Instant::now(),
        }
    }

    /// 是否仍在上传（含等待重试）
    pub fn is_active(&self) -> bool {
        matches!(self.state, ProgressState::Uploading | ProgressState::RetryWait)
    }

    fn touch(&mut self) {
        self.updated_at = Local::now();
        self.touched = Instant::now();
    }
}

/// clamp(done, 0, total) * 100 / total，total 为 0 时为 0
pub fn compute_percent(done: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    (done.min(total) * 100 / total) as u32
}

/// 进度追踪器（进程内共享一个）
#[derive(Debug)]
pub struct ProgressTracker {
    records: RwLock<HashMap<String, ProgressRecord>>,
    expire: Duration,
    success_linger: Duration,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_PROGRESS_EXPIRE, DEFAULT_SUCCESS_LINGER)
    }

    pub fn with_settings(expire: Duration, success_linger: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            expire,
            success_linger,
        }
    }

    /// 开始上传（重复调用会重置进度）
    pub fn start(&self, job_id: &str, batch_id: &str, page: u32, chunk_total: u64) {
        let mut records = self.records.write();
        self.purge_expired(&mut records);
        records.insert(
            job_id.to_string(),
            ProgressRecord::new(job_id, batch_id, page, chunk_total),
        );
    }

    /// 更新已完成分片数
    ///
    /// 没有记录时创建；已结束的任务忽略；已完成数只增不减
    pub fn update_chunk_done(
        &self,
        job_id: &str,
        batch_id: &str,
        page: u32,
        chunk_done: u64,
        chunk_total: u64,
    ) {
        let mut records = self.records.write();
        self.purge_expired(&mut records);

        let record = records
            .entry(job_id.to_string())
            .or_insert_with(|| ProgressRecord::new(job_id, batch_id, page, chunk_total));
        if !record.is_active() {
            return;
        }

        record.chunk_total = chunk_total;
        record.chunk_done = record.chunk_done.max(chunk_done);
        record.percent = record.percent.max(compute_percent(record.chunk_done, chunk_total));
        record.state = ProgressState::Uploading;
        record.message = None;
        record.touch();
    }

    /// 标记等待重试
    pub fn mark_retry_wait(&self, job_id: &str, message: &str) {
        self.update_state(job_id, ProgressState::RetryWait, Some(message));
    }

    /// 标记失败
    pub fn mark_failed(&self, job_id: &str, message: &str) {
        self.update_state(job_id, ProgressState::Failed, Some(message));
    }

    /// 记录任务失败
    ///
    /// 与 mark_failed 不同，没有记录时（如预检失败、尚未开始就被取消）会新建一条 Failed 记录；
    /// 已成功的任务不受影响
    pub fn record_failure(&self, job_id: &str, batch_id: &str, page: u32, message: &str) {
        let mut records = self.records.write();
        self.purge_expired(&mut records);

        let record = records
            .entry(job_id.to_string())
            .or_insert_with(|| ProgressRecord::new(job_id, batch_id, page, 0));
        if record.state == ProgressState::Success {
            return;
        }
        record.state = ProgressState::Failed;
        record.message = Some(message.to_string());
        record.touch();
    }

    /// 标记成功，success_linger 后移除
    pub fn mark_success(self: &Arc<Self>, job_id: &str) {
        let touched = {
            let mut records = self.records.write();
            self.purge_expired(&mut records);
            let Some(record) = records.get_mut(job_id) else {
                return;
            };
            record.state = ProgressState::Success;
            record.chunk_done = record.chunk_total;
            record.percent = 100;
            record.message = None;
            record.touch();
            record.touched
        };

        // 没有运行时（同步调用方）时由后续写操作清理
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let tracker = Arc::clone(self);
            let job_id = job_id.to_string();
            let linger = self.success_linger;
            handle.spawn(async move {
                tokio::time::sleep(linger).await;
                tracker.remove_if_untouched(&job_id, touched);
            });
        }
    }

    pub fn get(&self, job_id: &str) -> Option<ProgressRecord> {
        self.records.read().get(job_id).cloned()
    }

    /// 按批次查询，按分P排序
    pub fn list_by_batch(&self, batch_id: &str) -> Vec<ProgressRecord> {
        let mut list: Vec<ProgressRecord> = self
            .records
            .read()
            .values()
            .filter(|r| r.batch_id == batch_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.page.cmp(&b.page).then_with(|| a.job_id.cmp(&b.job_id)));
        list
    }

    /// 全部记录
    pub fn snapshot_all(&self) -> Vec<ProgressRecord> {
        let mut list: Vec<ProgressRecord> = self.records.read().values().cloned().collect();
        list.sort_by(|a, b| {
            a.batch_id
                .cmp(&b.batch_id)
                .then_with(|| a.page.cmp(&b.page))
                .then_with(|| a.job_id.cmp(&b.job_id))
        });
        list
    }

    pub fn remove(&self, job_id: &str) -> Option<ProgressRecord> {
        self.records.write().remove(job_id)
    }

    fn update_state(&self, job_id: &str, state: ProgressState, message: Option<&str>) {
        let mut records = self.records.write();
        self.purge_expired(&mut records);
        if let Some(record) = records.get_mut(job_id) {
            if record.state == ProgressState::Success {
                return;
            }
            record.state = state;
            record.message = message.map(str::to_string);
            record.touch();
        }
    }

    fn remove_if_untouched(&self, job_id: &str, touched: Instant) {
        let mut records = self.records.write();
        let unchanged = records
            .get(job_id)
            .is_some_and(|r| r.state == ProgressState::Success && r.touched == touched);
        if unchanged {
            records.remove(job_id);
            debug!("进度记录已移除: {}", job_id);
        }
    }

    fn purge_expired(&self, records: &mut HashMap<String, ProgressRecord>) {
        let now = Instant::now();
        records.retain(|_, r| {
            let idle = now.saturating_duration_since(r.touched);
            if r.state == ProgressState::Success {
                idle < self.success_linger.max(Duration::from_millis(1)) * 2
            } else {
                idle <= self.expire
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_percent() {
        assert_eq!(compute_percent(0, 0), 0);
        assert_eq!(compute_percent(1, 3), 33);
        assert_eq!(compute_percent(3, 3), 100);
        assert_eq!(compute_percent(10, 3), 100);
    }

    #[test]
    fn test_lifecycle_and_monotonic_percent() {
        let tracker = ProgressTracker::new();
        tracker.start("job-1", "batch-1", 1, 4);
        assert_eq!(tracker.get("job-1").unwrap().percent, 0);

        tracker.update_chunk_done("job-1", "batch-1", 1, 2, 4);
        assert_eq!(tracker.get("job-1").unwrap().percent, 50);

        // 乱序的旧更新不会让进度回退
        tracker.update_chunk_done("job-1", "batch-1", 1, 1, 4);
        let record = tracker.get("job-1").unwrap();
        assert_eq!(record.chunk_done, 2);
        assert_eq!(record.percent, 50);

        tracker.mark_retry_wait("job-1", "平台限流");
        let record = tracker.get("job-1").unwrap();
        assert_eq!(record.state, ProgressState::RetryWait);
        assert_eq!(record.message.as_deref(), Some("平台限流"));
        assert!(record.is_active());

        tracker.update_chunk_done("job-1", "batch-1", 1, 3, 4);
        let record = tracker.get("job-1").unwrap();
        assert_eq!(record.state, ProgressState::Uploading);
        assert_eq!(record.percent, 75);

        tracker.mark_failed("job-1", "网络错误");
        let record = tracker.get("job-1").unwrap();
        assert_eq!(record.state, ProgressState::Failed);
        assert!(!record.is_active());

        // 失败后的进度更新被忽略
        tracker.update_chunk_done("job-1", "batch-1", 1, 4, 4);
        assert_eq!(tracker.get("job-1").unwrap().state, ProgressState::Failed);
    }

    #[test]
    fn test_record_failure_without_start() {
        let tracker = ProgressTracker::new();
        tracker.record_failure("job-x", "batch-x", 2, "未知的上传线路: ftp");

        let record = tracker.get("job-x").unwrap();
        assert_eq!(record.state, ProgressState::Failed);
        assert_eq!(record.page, 2);
        assert_eq!(record.message.as_deref(), Some("未知的上传线路: ftp"));
        assert_eq!(tracker.list_by_batch("batch-x").len(), 1);

        // 已有记录时只改状态，不重置进度
        tracker.start("job-y", "batch-x", 1, 4);
        tracker.update_chunk_done("job-y", "batch-x", 1, 2, 4);
        tracker.record_failure("job-y", "batch-x", 1, "上传已取消");
        let record = tracker.get("job-y").unwrap();
        assert_eq!(record.state, ProgressState::Failed);
        assert_eq!(record.chunk_done, 2);
        assert_eq!(record.percent, 50);
    }

    #[test]
    fn test_get_is_idempotent() {
        let tracker = ProgressTracker::new();
        tracker.start("job", "b", 1, 10);
        tracker.update_chunk_done("job", "b", 1, 3, 10);
        assert_eq!(tracker.get("job"), tracker.get("job"));
        assert!(tracker.get("missing").is_none());
    }

    #[test]
    fn test_update_creates_record() {
        let tracker = ProgressTracker::new();
        tracker.update_chunk_done("job", "b", 2, 1, 2);
        let record = tracker.get("job").unwrap();
        assert_eq!(record.page, 2);
        assert_eq!(record.percent, 50);
    }

    #[test]
    fn test_list_by_batch_sorted_by_page() {
        let tracker = ProgressTracker::new();
        tracker.start("p3", "batch", 3, 1);
        tracker.start("p1", "batch", 1, 1);
        tracker.start("other", "batch-2", 1, 1);
        tracker.start("p2", "batch", 2, 1);

        let pages: Vec<u32> = tracker.list_by_batch("batch").iter().map(|r| r.page).collect();
        assert_eq!(pages, vec![1, 2, 3]);
        assert_eq!(tracker.snapshot_all().len(), 4);
        assert!(tracker.list_by_batch("none").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_visible_then_removed() {
        let tracker = Arc::new(ProgressTracker::new());
        tracker.start("job", "b", 1, 3);
        tracker.mark_success("job");

        let record = tracker.get("job").unwrap();
        assert_eq!(record.state, ProgressState::Success);
        assert_eq!(record.percent, 100);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(tracker.get("job").is_some());

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(tracker.get("job").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_records_expire_on_mutation() {
        let tracker = ProgressTracker::new();
        tracker.start("old", "b", 1, 3);

        tokio::time::sleep(Duration::from_secs(9 * 60)).await;
        tracker.start("new", "b", 2, 3);
        assert!(tracker.get("old").is_some());

        tokio::time::sleep(Duration::from_secs(2 * 60)).await;
        tracker.mark_retry_wait("new", "等待");
        assert!(tracker.get("old").is_none());
        assert!(tracker.get("new").is_some());
    }

    #[test]
    fn test_serialized_shape() {
        let tracker = ProgressTracker::new();
        tracker.start("job", "b", 1, 2);
        let json = serde_json::to_value(tracker.get("job").unwrap()).unwrap();
        assert_eq!(json["jobId"], "job");
        assert_eq!(json["chunkTotal"], 2);
        assert_eq!(json["state"], "UPLOADING");
        assert!(json.get("touched").is_none());
    }
}
