//! 子任务上下文

use crate::models::job::JobId;
use crate::models::question::{Difficulty, QuestionType};

/// 一个 (块, 题型) 子任务的上下文封装
///
/// 只携带标识和请求参数，不持有任何资源。
#[derive(Debug, Clone)]
pub struct TaskCtx {
    pub job_id: JobId,
    /// 块序号（从 0 开始）
    pub chunk_index: u32,
    /// 请求的题型
    pub question_type: QuestionType,
    /// 请求的题目数量
    pub count: u32,
    /// 请求的难度
    pub difficulty: Difficulty,
    /// 目标语言
    pub language: String,
}

impl TaskCtx {
    pub fn new(
        job_id: JobId,
        chunk_index: u32,
        question_type: QuestionType,
        count: u32,
        difficulty: Difficulty,
        language: impl Into<String>,
    ) -> Self {
        Self {
            job_id,
            chunk_index,
            question_type,
            count,
            difficulty,
            language: language.into(),
        }
    }
}
