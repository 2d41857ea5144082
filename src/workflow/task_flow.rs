//! 子任务处理流程 - 流程层
//!
//! 核心职责：定义一个 (块, 题型) 子任务的完整回退链。
//!
//! 回退顺序是确定的（全仓库只有这一个顺序）：
//! 1. 按请求的难度和题型生成
//! 2. 失败 → 降一档难度重试一次（保持请求的题型）
//! 3. 仍失败 → 换一个 schema 兼容的替代题型重试一次
//! 4. 仍失败 → 放弃
//!
//! 流程用带标签的结果枚举表达，每个子任务恰好产生一次终结转换，
//! 这使"计数器恰好加一"的不变量在结构上成立——
//! 编排层在拿到 `TaskOutcome` 后自增，无论内部重试了多少次。

use tracing::{debug, info, warn};

use crate::error::GenerationError;
use crate::models::generation::{CancelCheck, GenerationRequest, GenerationResult};
use crate::models::question::{Difficulty, QuestionRecord, QuestionType};
use crate::services::StructuredGenerationClient;
use crate::workflow::task_ctx::TaskCtx;

/// 使用的回退手段（日志与统计用）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackKind {
    /// 未使用回退
    None,
    /// 降档难度后成功
    EasierDifficulty,
    /// 替代题型后成功
    AlternativeType,
}

/// 子任务的终结结果（每个子任务恰好一个）
#[derive(Debug)]
pub enum TaskOutcome {
    /// 至少产出一道有效题目
    Success {
        questions: Vec<QuestionRecord>,
        warnings: Vec<String>,
        tokens_used: u64,
        fallback: FallbackKind,
    },
    /// 在某次尝试前观察到取消；未完成，不计入进度
    Cancelled { tokens_used: u64 },
    /// 回退链全部耗尽；已终结，计入进度
    GaveUp {
        last_error: String,
        warnings: Vec<String>,
        tokens_used: u64,
    },
}

/// 回退链中的一步
#[derive(Debug, Clone, Copy)]
struct AttemptStep {
    difficulty: Difficulty,
    question_type: QuestionType,
    fallback: FallbackKind,
}

/// 构造回退链（确定性顺序：难度降档优先于题型替换）
///
/// 难度已是最低档、或题型没有兼容替代时，对应步骤被跳过。
fn build_attempt_chain(difficulty: Difficulty, question_type: QuestionType) -> Vec<AttemptStep> {
    let mut chain = vec![AttemptStep {
        difficulty,
        question_type,
        fallback: FallbackKind::None,
    }];

    let easier = difficulty.easier();
    if easier != difficulty {
        chain.push(AttemptStep {
            difficulty: easier,
            question_type,
            fallback: FallbackKind::EasierDifficulty,
        });
    }

    if let Some(alternative) = question_type.fallback_alternative() {
        chain.push(AttemptStep {
            difficulty,
            question_type: alternative,
            fallback: FallbackKind::AlternativeType,
        });
    }

    chain
}

/// 子任务处理流程
///
/// - 编排回退链，决定何时降档、何时换题型、何时放弃
/// - 不持有任何资源，只依赖生成客户端
pub struct TaskFlow<'a> {
    client: &'a StructuredGenerationClient,
}

impl<'a> TaskFlow<'a> {
    pub fn new(client: &'a StructuredGenerationClient) -> Self {
        Self { client }
    }

    /// 运行一个子任务直到终结
    pub async fn run(
        &self,
        ctx: &TaskCtx,
        chunk_content: &str,
        cancel_check: CancelCheck,
    ) -> TaskOutcome {
        let chain = build_attempt_chain(ctx.difficulty, ctx.question_type);
        let mut tokens_used: u64 = 0;
        let mut warnings: Vec<String> = Vec::new();
        let mut last_error = String::new();

        for step in chain {
            // 子任务边界的取消检查（不只在开头查一次）
            if cancel_check() {
                info!(
                    "[任务 {}] 块 {} {} 在尝试前被取消",
                    ctx.job_id,
                    ctx.chunk_index,
                    ctx.question_type.name()
                );
                return TaskOutcome::Cancelled { tokens_used };
            }

            if step.fallback != FallbackKind::None {
                info!(
                    "[任务 {}] 块 {} {} 回退: {:?} (难度 {}，题型 {})",
                    ctx.job_id,
                    ctx.chunk_index,
                    ctx.question_type.name(),
                    step.fallback,
                    step.difficulty.name(),
                    step.question_type.name()
                );
            }

            let request = GenerationRequest {
                chunk_content: chunk_content.to_string(),
                question_type: step.question_type,
                count: ctx.count,
                difficulty: step.difficulty,
                language: ctx.language.clone(),
                cancel_check: cancel_check.clone(),
            };

            match self.client.generate(&request).await {
                Ok(result) if is_cancelled(&result) => {
                    tokens_used += result.tokens_used;
                    return TaskOutcome::Cancelled { tokens_used };
                }
                Ok(result) => {
                    tokens_used += result.tokens_used;
                    warnings.extend(result.warnings);
                    let mut questions = result.questions;
                    for q in &mut questions {
                        q.chunk_index = Some(ctx.chunk_index);
                    }
                    debug!(
                        "[任务 {}] 块 {} {} 生成 {} 道题 (累计 {} token)",
                        ctx.job_id,
                        ctx.chunk_index,
                        ctx.question_type.name(),
                        questions.len(),
                        tokens_used
                    );
                    return TaskOutcome::Success {
                        questions,
                        warnings,
                        tokens_used,
                        fallback: step.fallback,
                    };
                }
                Err(e) => {
                    // 单次尝试的失败被回退链本地吸收，只有链耗尽才向上冒泡
                    warn!(
                        "[任务 {}] 块 {} {} 尝试失败 ({:?}): {}",
                        ctx.job_id,
                        ctx.chunk_index,
                        ctx.question_type.name(),
                        step.fallback,
                        e
                    );
                    if let GenerationError::Truncated { .. } = e {
                        warnings.push(e.to_string());
                    }
                    last_error = e.to_string();
                }
            }
        }

        warn!(
            "[任务 {}] 块 {} {} 回退链耗尽，放弃",
            ctx.job_id,
            ctx.chunk_index,
            ctx.question_type.name()
        );
        TaskOutcome::GaveUp {
            last_error,
            warnings,
            tokens_used,
        }
    }
}

/// 客户端用"cancelled by user"警告的空结果表达取消
fn is_cancelled(result: &GenerationResult) -> bool {
    result.questions.is_empty()
        && result
            .warnings
            .iter()
            .any(|w| w.contains("cancelled by user"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_order_easier_then_alternative() {
        let chain = build_attempt_chain(Difficulty::Hard, QuestionType::MultipleChoice);
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].fallback, FallbackKind::None);
        assert_eq!(chain[0].difficulty, Difficulty::Hard);
        // 第一步回退：降档难度，题型不变
        assert_eq!(chain[1].fallback, FallbackKind::EasierDifficulty);
        assert_eq!(chain[1].difficulty, Difficulty::Medium);
        assert_eq!(chain[1].question_type, QuestionType::MultipleChoice);
        // 第二步回退：替代题型，难度回到请求值
        assert_eq!(chain[2].fallback, FallbackKind::AlternativeType);
        assert_eq!(chain[2].question_type, QuestionType::Open);
        assert_eq!(chain[2].difficulty, Difficulty::Hard);
    }

    #[test]
    fn test_chain_skips_easier_step_at_easy() {
        let chain = build_attempt_chain(Difficulty::Easy, QuestionType::Open);
        // EASY 没有更低档，降档步骤被跳过
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].fallback, FallbackKind::AlternativeType);
    }
}
