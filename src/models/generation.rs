//! 生成请求 / 生成结果

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::models::question::{Difficulty, QuestionRecord, QuestionType};

/// 取消谓词：客户端在每次尝试之间调用，返回 true 则立即中止
pub type CancelCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// 文档块：生成并行化的基本单位（由外部切块流程产出）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    /// 块内容
    pub content: String,
    /// 块在文档中的序号（从 0 开始）
    pub chunk_index: u32,
    /// 章节元数据（可选）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

/// 整个任务级别的生成请求："每块生成 N 道 T 类型题，难度 D"
#[derive(Debug, Clone)]
pub struct QuizRequest {
    /// 每种题型在每个块上请求的数量；0 的条目不产生子任务
    pub counts_per_chunk: BTreeMap<QuestionType, u32>,
    pub difficulty: Difficulty,
    /// 目标语言（BCP-47 标签，如 "zh-CN"、"en"）
    pub language: String,
}

impl QuizRequest {
    /// 有效题型：请求数量大于 0 的题型（任务分母只数这些）
    pub fn active_types(&self) -> Vec<(QuestionType, u32)> {
        self.counts_per_chunk
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(t, c)| (*t, *c))
            .collect()
    }

    /// 每种题型在全部块上的请求总数
    pub fn total_requested(&self, question_type: QuestionType, chunk_count: u32) -> u32 {
        self.counts_per_chunk
            .get(&question_type)
            .copied()
            .unwrap_or(0)
            * chunk_count
    }
}

/// 单个 (块, 题型) 子任务的生成请求
#[derive(Clone)]
pub struct GenerationRequest {
    /// 块内容
    pub chunk_content: String,
    /// 请求的题型
    pub question_type: QuestionType,
    /// 请求的题目数量
    pub count: u32,
    /// 难度
    pub difficulty: Difficulty,
    /// 目标语言
    pub language: String,
    /// 取消谓词
    pub cancel_check: CancelCheck,
}

impl std::fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("question_type", &self.question_type)
            .field("count", &self.count)
            .field("difficulty", &self.difficulty)
            .field("language", &self.language)
            .field("chunk_content_len", &self.chunk_content.len())
            .finish()
    }
}

impl GenerationRequest {
    /// 构造一个不会被取消的请求（测试和重分配阶段使用）
    pub fn without_cancel(
        chunk_content: impl Into<String>,
        question_type: QuestionType,
        count: u32,
        difficulty: Difficulty,
        language: impl Into<String>,
    ) -> Self {
        Self {
            chunk_content: chunk_content.into(),
            question_type,
            count,
            difficulty,
            language: language.into(),
            cancel_check: Arc::new(|| false),
        }
    }
}

/// 生成结果
#[derive(Debug, Clone, Default)]
pub struct GenerationResult {
    /// 解析通过的题目记录
    pub questions: Vec<QuestionRecord>,
    /// 非致命警告（被丢弃的元素、类型不一致等）
    pub warnings: Vec<String>,
    /// 消耗的 token 数
    pub tokens_used: u64,
    /// 输出是否完全符合 schema（有元素被丢弃或类型不一致时为 false）
    pub schema_valid: bool,
}

impl GenerationResult {
    /// 空结果（取消时返回：零调用、零 token）
    pub fn cancelled() -> Self {
        Self {
            questions: Vec::new(),
            warnings: vec!["cancelled by user".to_string()],
            tokens_used: 0,
            schema_valid: true,
        }
    }

    /// 合并另一个结果（批量再生成时聚合 token 与警告）
    pub fn merge(&mut self, other: GenerationResult) {
        self.questions.extend(other.questions);
        self.warnings.extend(other.warnings);
        self.tokens_used += other.tokens_used;
        self.schema_valid = self.schema_valid && other.schema_valid;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_types_excludes_zero() {
        let mut counts = BTreeMap::new();
        counts.insert(QuestionType::MultipleChoice, 5);
        counts.insert(QuestionType::TrueFalse, 0);
        counts.insert(QuestionType::Open, 3);
        let request = QuizRequest {
            counts_per_chunk: counts,
            difficulty: Difficulty::Medium,
            language: "en".to_string(),
        };
        let active = request.active_types();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|(_, c)| *c > 0));
    }

    #[test]
    fn test_merge_aggregates() {
        let mut a = GenerationResult {
            questions: Vec::new(),
            warnings: vec!["w1".to_string()],
            tokens_used: 10,
            schema_valid: true,
        };
        let b = GenerationResult {
            questions: Vec::new(),
            warnings: vec!["w2".to_string()],
            tokens_used: 7,
            schema_valid: false,
        };
        a.merge(b);
        assert_eq!(a.tokens_used, 17);
        assert_eq!(a.warnings.len(), 2);
        assert!(!a.schema_valid);
    }
}
