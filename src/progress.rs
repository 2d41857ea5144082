//! 进度跟踪 - 任务/块双层计数
//!
//! 并发契约：落库只走存储层的单次原子自增，绝不允许
//! "读出整个 Job → 改字段 → 写回"——并发的块 worker 会互相覆盖丢失增量。
//! 内存中的计数器只用于同进程内的快照展示。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::AppResult;
use crate::models::job::JobId;
use crate::stores::{JobStore, ProgressDelta};

/// 进度百分比计算
///
/// 优先级是硬性约定：任务级计数器可用（`total_tasks > 0`）时必须优先，
/// 因为它比块级计数器粒度更细；否则退回块级；都不可用时为 0。
/// 历史任务 `total_tasks` 为空时按块级计算，不报错。
pub fn percentage(
    total_tasks: Option<u32>,
    completed_tasks: u32,
    total_chunks: u32,
    processed_chunks: u32,
) -> f64 {
    let raw = match total_tasks {
        Some(total) if total > 0 => completed_tasks as f64 / total as f64 * 100.0,
        _ if total_chunks > 0 => processed_chunks as f64 / total_chunks as f64 * 100.0,
        _ => 0.0,
    };
    raw.clamp(0.0, 100.0)
}

/// 单个任务运行期间的线程安全进度跟踪器
///
/// 由编排器按任务实例持有并注入，不使用跨任务的全局状态。
pub struct ProgressTracker {
    job_id: JobId,
    store: Arc<dyn JobStore>,
    total_tasks: u32,
    completed_tasks: AtomicU32,
    total_chunks: u32,
    processed_chunks: AtomicU32,
}

impl ProgressTracker {
    pub fn new(
        job_id: JobId,
        store: Arc<dyn JobStore>,
        total_tasks: u32,
        total_chunks: u32,
    ) -> Self {
        Self {
            job_id,
            store,
            total_tasks,
            completed_tasks: AtomicU32::new(0),
            total_chunks,
            processed_chunks: AtomicU32::new(0),
        }
    }

    /// 一个 (块, 题型) 子任务终结（成功或放弃都算），计数器加一并落库
    pub async fn complete_task(&self, questions_generated: u32) -> AppResult<()> {
        self.completed_tasks.fetch_add(1, Ordering::SeqCst);
        self.store
            .increment_progress(
                &self.job_id,
                ProgressDelta {
                    completed_tasks: 1,
                    processed_chunks: 0,
                    questions_generated,
                },
            )
            .await
    }

    /// 一个块的全部子任务终结
    pub async fn complete_chunk(&self) -> AppResult<()> {
        self.processed_chunks.fetch_add(1, Ordering::SeqCst);
        self.store
            .increment_progress(
                &self.job_id,
                ProgressDelta {
                    completed_tasks: 0,
                    processed_chunks: 1,
                    questions_generated: 0,
                },
            )
            .await
    }

    /// 进程内快照百分比
    pub fn snapshot_percentage(&self) -> f64 {
        percentage(
            Some(self.total_tasks),
            self.completed_tasks.load(Ordering::SeqCst),
            self.total_chunks,
            self.processed_chunks.load(Ordering::SeqCst),
        )
    }

    pub fn completed_tasks(&self) -> u32 {
        self.completed_tasks.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_counters_take_precedence() {
        // 任务级计数可用时必须优先于块级计数
        let p = percentage(Some(6), 2, 10, 5);
        assert!((p - 33.333333).abs() < 0.001);
    }

    #[test]
    fn test_chunk_fallback_when_no_tasks() {
        assert_eq!(percentage(Some(0), 0, 10, 5), 50.0);
        assert_eq!(percentage(None, 0, 10, 5), 50.0);
    }

    #[test]
    fn test_zero_everything_is_zero() {
        assert_eq!(percentage(None, 0, 0, 0), 0.0);
        assert_eq!(percentage(Some(0), 3, 0, 0), 0.0);
    }

    #[test]
    fn test_percentage_clamped() {
        // 计数异常时也不越界
        assert_eq!(percentage(Some(4), 8, 0, 0), 100.0);
    }

    #[tokio::test]
    async fn test_concurrent_completions_lose_no_updates() {
        use crate::models::job::GenerationJob;
        use crate::stores::memory::InMemoryJobStore;

        let store = Arc::new(InMemoryJobStore::new());
        let mut job = GenerationJob::new("u", "d");
        job.mark_processing(6, 6).unwrap();
        let job_id = job.id.clone();
        store.insert(job).await;

        let tracker = Arc::new(ProgressTracker::new(
            job_id.clone(),
            store.clone(),
            6,
            6,
        ));

        // 三个并发完成：无论完成顺序如何，计数最终恰好是 3
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move { tracker.complete_task(2).await })
            })
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }

        assert_eq!(tracker.completed_tasks(), 3);
        let stored = store.load(&job_id).await.unwrap().unwrap();
        assert_eq!(stored.completed_tasks, 3);
        assert_eq!(stored.total_questions_generated, 6);
        assert!((tracker.snapshot_percentage() - 50.0).abs() < f64::EPSILON);
    }
}
