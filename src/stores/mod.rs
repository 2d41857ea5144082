//! 外部协作方接口
//!
//! 本核心不拥有任何持久化技术，只依赖这些 trait。
//! 测试与演示二进制使用 `memory` 模块里的内存实现。

pub mod memory;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::models::generation::{DocumentChunk, QuizRequest};
use crate::models::job::{GenerationJob, JobId};
use crate::models::question::QuestionRecord;

/// 进度计数器的一次原子增量
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgressDelta {
    pub completed_tasks: u32,
    pub processed_chunks: u32,
    pub questions_generated: u32,
}

/// 任务存储
///
/// 写路径分两条，不可混用：
/// - 进度计数器（completed_tasks / processed_chunks / total_questions_generated）
///   只能通过 `increment_progress` 单次原子自增修改，不参与版本号；
/// - 其余字段（状态、计费状态、错误文本等）通过 `save`（乐观版本检查）
///   或 `update_job_exclusive`（行级独占，终结时使用）修改。
#[async_trait]
pub trait JobStore: Send + Sync {
    /// 按 id 加载
    async fn load(&self, job_id: &JobId) -> AppResult<Option<GenerationJob>>;

    /// 整实体保存；版本不匹配返回 `StorageError::VersionConflict`，
    /// 成功后就地递增 `job.version`
    async fn save(&self, job: &mut GenerationJob) -> AppResult<()>;

    /// 原子进度自增（并发 worker 的唯一计数器写路径）
    async fn increment_progress(&self, job_id: &JobId, delta: ProgressDelta) -> AppResult<()>;

    /// 在行级独占下修改任务并返回修改后的实体
    ///
    /// 终结（终态转换 + 一次性计费决议）必须走这里，
    /// 两个竞争的完成者不可能都执行提交/释放。
    async fn update_job_exclusive(
        &self,
        job_id: &JobId,
        mutator: Box<dyn for<'a> FnOnce(&'a mut GenerationJob) -> AppResult<()> + Send>,
    ) -> AppResult<GenerationJob>;

    /// 列出所有未进入终态的任务（清扫流程用）
    async fn list_unfinished(&self) -> AppResult<Vec<GenerationJob>>;
}

/// 文档来源：按文档 id 返回有序的块
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_chunks(&self, document_id: &str) -> AppResult<Vec<DocumentChunk>>;
}

/// 计费账本
///
/// commit / release 必须对同一幂等键可重复调用。
#[async_trait]
pub trait BillingLedger: Send + Sync {
    /// 预留（在编排器启动之前由外部调用）
    async fn reserve(&self, estimated_tokens: u64) -> AppResult<String>;

    /// 提交预留（消费）
    async fn commit(
        &self,
        reservation_id: &str,
        job_id: &JobId,
        idempotency_key: &str,
    ) -> AppResult<()>;

    /// 释放预留（退还），返回释放的 token 数
    async fn release(
        &self,
        reservation_id: &str,
        reason: &str,
        job_id: &JobId,
        idempotency_key: &str,
    ) -> AppResult<u64>;
}

/// 测验持久化：接收通过的题目记录，返回持久化后的测验 id
#[async_trait]
pub trait QuizPersistence: Send + Sync {
    async fn persist_quiz(
        &self,
        job: &GenerationJob,
        records: &[QuestionRecord],
        request: &QuizRequest,
    ) -> AppResult<String>;
}
