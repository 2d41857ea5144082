//! 生成任务（GenerationJob）实体
//!
//! 异步工作的基本单位。状态转换和计费状态转换都有硬性不变量：
//! - 终态一旦写入不可再变
//! - 计费状态只允许 None → Reserved → {Committed | Released}
//! - `completed_tasks` 不得超过 `total_tasks`
//!
//! 进度计数器的写入路径与版本号的写入路径是分开的：
//! 计数器走存储层的原子自增，版本号只保护整实体字段的保存。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, BillingError, JobError};

/// 任务标识
pub type JobId = String;

/// 任务生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// 获取标准名称
    pub fn name(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Processing => "PROCESSING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    /// 是否为终态
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

/// 计费预留状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingState {
    None,
    Reserved,
    Committed,
    Released,
}

impl BillingState {
    pub fn name(self) -> &'static str {
        match self {
            BillingState::None => "NONE",
            BillingState::Reserved => "RESERVED",
            BillingState::Committed => "COMMITTED",
            BillingState::Released => "RELEASED",
        }
    }
}

/// 生成任务实体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub id: JobId,
    pub user_id: String,
    pub document_id: String,
    pub status: JobStatus,

    // --- 进度字段 ---
    pub total_chunks: u32,
    pub processed_chunks: u32,
    /// 任务级计数器的分母；历史数据可能没有该字段
    pub total_tasks: Option<u32>,
    pub completed_tasks: u32,
    pub current_status_message: String,
    pub total_questions_generated: u32,

    // --- 计费字段 ---
    pub billing_reservation_id: Option<String>,
    pub billing_state: BillingState,
    pub billing_estimated_tokens: u64,
    pub reservation_expires_at: Option<DateTime<Utc>>,
    pub last_billing_error: Option<String>,

    // --- 结果字段 ---
    pub generated_quiz_id: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,

    /// 外部取消标记（协作式轮询，不强制中断进行中的调用）
    pub cancel_requested: bool,

    /// 乐观锁版本号，只保护整实体字段保存，不参与计数器自增
    pub version: u64,
}

impl GenerationJob {
    /// 创建新任务（PENDING，计费状态由预留流程在启动前设置）
    pub fn new(
        user_id: impl Into<String>,
        document_id: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            document_id: document_id.into(),
            status: JobStatus::Pending,
            total_chunks: 0,
            processed_chunks: 0,
            total_tasks: None,
            completed_tasks: 0,
            current_status_message: String::new(),
            total_questions_generated: 0,
            billing_reservation_id: None,
            billing_state: BillingState::None,
            billing_estimated_tokens: 0,
            reservation_expires_at: None,
            last_billing_error: None,
            generated_quiz_id: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            created_at: Utc::now(),
            cancel_requested: false,
            version: 0,
        }
    }

    // ========== 状态转换 ==========

    /// 状态转换（带终态保护）
    fn transition_status(&mut self, to: JobStatus) -> AppResult<()> {
        if self.status.is_terminal() {
            return Err(JobError::AlreadyTerminal {
                job_id: self.id.clone(),
                status: self.status.name().to_string(),
            }
            .into());
        }
        let valid = matches!(
            (self.status, to),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Processing, JobStatus::Cancelled)
        );
        if !valid {
            return Err(JobError::InvalidStatusTransition {
                job_id: self.id.clone(),
                from: self.status.name().to_string(),
                to: to.name().to_string(),
            }
            .into());
        }
        self.status = to;
        Ok(())
    }

    /// PENDING → PROCESSING，同时固定任务总数（只设置一次）
    pub fn mark_processing(&mut self, total_chunks: u32, total_tasks: u32) -> AppResult<()> {
        self.transition_status(JobStatus::Processing)?;
        self.total_chunks = total_chunks;
        self.total_tasks = Some(total_tasks);
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// 成功终态
    pub fn mark_completed(&mut self, quiz_id: impl Into<String>) -> AppResult<()> {
        self.transition_status(JobStatus::Completed)?;
        self.generated_quiz_id = Some(quiz_id.into());
        self.completed_at = Some(Utc::now());
        self.current_status_message = "生成完成".to_string();
        Ok(())
    }

    /// 失败终态
    pub fn mark_failed(&mut self, message: impl Into<String>) -> AppResult<()> {
        self.transition_status(JobStatus::Failed)?;
        self.error_message = Some(message.into());
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// 取消终态（保留已有进度，不清零也不置满）
    pub fn mark_cancelled(&mut self) -> AppResult<()> {
        self.transition_status(JobStatus::Cancelled)?;
        self.completed_at = Some(Utc::now());
        self.current_status_message = "已取消".to_string();
        Ok(())
    }

    // ========== 计费状态转换 ==========

    fn transition_billing(&mut self, to: BillingState) -> AppResult<()> {
        let valid = matches!(
            (self.billing_state, to),
            (BillingState::None, BillingState::Reserved)
                | (BillingState::Reserved, BillingState::Committed)
                | (BillingState::Reserved, BillingState::Released)
        );
        if !valid {
            return Err(BillingError::InvalidStateTransition {
                from: self.billing_state.name().to_string(),
                to: to.name().to_string(),
            }
            .into());
        }
        self.billing_state = to;
        Ok(())
    }

    pub fn billing_reserve(
        &mut self,
        reservation_id: impl Into<String>,
        estimated_tokens: u64,
        expires_at: DateTime<Utc>,
    ) -> AppResult<()> {
        self.transition_billing(BillingState::Reserved)?;
        self.billing_reservation_id = Some(reservation_id.into());
        self.billing_estimated_tokens = estimated_tokens;
        self.reservation_expires_at = Some(expires_at);
        Ok(())
    }

    pub fn billing_commit(&mut self) -> AppResult<()> {
        self.transition_billing(BillingState::Committed)
    }

    pub fn billing_release(&mut self) -> AppResult<()> {
        self.transition_billing(BillingState::Released)
    }

    // ========== 进度 ==========

    /// 进度百分比
    ///
    /// 优先级是硬性约定：任务级计数器可用时必须优先于块级计数器，
    /// 因为它的粒度更细。历史任务（`total_tasks` 为空）退回块级计算。
    pub fn progress_percentage(&self) -> f64 {
        crate::progress::percentage(
            self.total_tasks,
            self.completed_tasks,
            self.total_chunks,
            self.processed_chunks,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job() -> GenerationJob {
        GenerationJob::new("user-1", "doc-1")
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let mut job = new_job();
        assert_eq!(job.status, JobStatus::Pending);
        job.mark_processing(5, 10).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.total_tasks, Some(10));
        job.mark_completed("quiz-1").unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.generated_quiz_id.as_deref(), Some("quiz-1"));
    }

    #[test]
    fn test_terminal_status_is_frozen() {
        let mut job = new_job();
        job.mark_processing(1, 1).unwrap();
        job.mark_failed("boom").unwrap();
        // 终态后任何转换都被拒绝
        assert!(job.mark_completed("quiz-1").is_err());
        assert!(job.mark_cancelled().is_err());
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let mut job = new_job();
        assert!(job.mark_completed("quiz-1").is_err());
    }

    #[test]
    fn test_billing_transitions() {
        let mut job = new_job();
        assert_eq!(job.billing_state, BillingState::None);
        // 不能跳过 Reserved
        assert!(job.billing_commit().is_err());
        assert!(job.billing_release().is_err());

        job.billing_reserve("res-1", 1000, Utc::now()).unwrap();
        assert_eq!(job.billing_state, BillingState::Reserved);

        job.billing_commit().unwrap();
        assert_eq!(job.billing_state, BillingState::Committed);
        // Committed 之后不能再 Release，也不能回退
        assert!(job.billing_release().is_err());
        assert!(job
            .billing_reserve("res-2", 1, Utc::now())
            .is_err());
    }

    #[test]
    fn test_billing_release_after_reserve() {
        let mut job = new_job();
        job.billing_reserve("res-1", 1000, Utc::now()).unwrap();
        job.billing_release().unwrap();
        assert_eq!(job.billing_state, BillingState::Released);
        assert!(job.billing_commit().is_err());
    }

    #[test]
    fn test_cancel_preserves_progress() {
        let mut job = new_job();
        job.mark_processing(4, 8).unwrap();
        job.completed_tasks = 3;
        job.mark_cancelled().unwrap();
        assert_eq!(job.completed_tasks, 3);
        assert!((job.progress_percentage() - 37.5).abs() < 1e-9);
    }
}
