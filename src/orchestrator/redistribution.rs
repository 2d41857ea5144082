//! 缺额重分配 - 编排层
//!
//! ## 职责
//!
//! 主阶段结束后按题型对账全局产出：只有某个题型跨所有块的
//! 总产出低于请求总量时才触发补生成，全局缺口再分摊到产出
//! 不足的块上。某个块的富余可以抵消另一个块的缺口。
//!
//! ## 关键约束
//!
//! 重分配发生在全部子任务终结之后，**绝不触碰任务计数器**：
//! completedTasks / totalTasks 在主阶段结束时已经定格，
//! 补生成只影响最终题目集合，不影响进度语义。
//! 补生成失败同样只降级为警告，任务仍然可以完成。

use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::models::generation::{CancelCheck, DocumentChunk, QuizRequest};
use crate::models::question::{QuestionRecord, QuestionType};
use crate::services::StructuredGenerationClient;

/// 重分配结果
#[derive(Debug, Default)]
pub struct RedistributionReport {
    /// 补生成出来的题目（已带块索引）
    pub added: Vec<QuestionRecord>,
    /// 补生成过程中的非致命警告
    pub warnings: Vec<String>,
    /// 补生成消耗的 token
    pub tokens_used: u64,
}

/// 对账全局缺额并补生成
///
/// `accepted` 是主阶段产出的全部题目；只有题型的全局总产出
/// 低于请求总量时才补，缺口分摊到产出不足的块上。
pub async fn redistribute(
    client: &StructuredGenerationClient,
    chunks: &[DocumentChunk],
    request: &QuizRequest,
    accepted: &[QuestionRecord],
    cancel_check: CancelCheck,
) -> RedistributionReport {
    let mut report = RedistributionReport::default();

    let shortfalls = compute_shortfalls(chunks, request, accepted);
    if shortfalls.is_empty() {
        return report;
    }

    let total_missing: u32 = shortfalls
        .values()
        .flat_map(|m| m.iter().map(|(_, n)| *n))
        .sum();
    info!("♻️ 检测到缺额 {} 道，开始重分配", total_missing);

    for chunk in chunks {
        let Some(missing) = shortfalls.get(&chunk.chunk_index) else {
            continue;
        };
        if cancel_check() {
            report
                .warnings
                .push("redistribution stopped: cancelled by user".to_string());
            return report;
        }

        let result = client
            .regenerate_missing(
                &chunk.content,
                missing,
                request.difficulty,
                &request.language,
                cancel_check.clone(),
            )
            .await;

        report.tokens_used += result.tokens_used;
        for w in &result.warnings {
            warn!("♻️ 块 {} 补生成警告: {}", chunk.chunk_index, w);
        }
        report.warnings.extend(result.warnings);
        for mut record in result.questions {
            record.chunk_index = Some(chunk.chunk_index);
            report.added.push(record);
        }
    }

    report
}

/// 计算补生成计划，返回 块索引 → [(题型, 补生成数量)]
///
/// 缺额以题型的全局总量为准：总产出达标的题型即便块间分布
/// 不均也不补。全局缺口按块顺序分摊到产出低于单块请求量的块。
fn compute_shortfalls(
    chunks: &[DocumentChunk],
    request: &QuizRequest,
    accepted: &[QuestionRecord],
) -> BTreeMap<u32, Vec<(QuestionType, u32)>> {
    let chunk_count = chunks.len() as u32;

    // 已产出数量: 按 (块, 题型) 与按题型全局各记一份
    let mut produced: BTreeMap<(u32, QuestionType), u32> = BTreeMap::new();
    let mut produced_total: BTreeMap<QuestionType, u32> = BTreeMap::new();
    for record in accepted {
        if let Some(idx) = record.chunk_index {
            *produced.entry((idx, record.question_type)).or_insert(0) += 1;
        }
        *produced_total.entry(record.question_type).or_insert(0) += 1;
    }

    let mut shortfalls: BTreeMap<u32, Vec<(QuestionType, u32)>> = BTreeMap::new();
    for (question_type, per_chunk) in request.active_types() {
        let requested_total = per_chunk * chunk_count;
        let got_total = produced_total.get(&question_type).copied().unwrap_or(0);
        if got_total >= requested_total {
            continue;
        }

        let mut deficit = requested_total - got_total;
        for chunk in chunks {
            if deficit == 0 {
                break;
            }
            let got = produced
                .get(&(chunk.chunk_index, question_type))
                .copied()
                .unwrap_or(0);
            if got >= per_chunk {
                continue;
            }
            let take = (per_chunk - got).min(deficit);
            shortfalls
                .entry(chunk.chunk_index)
                .or_default()
                .push((question_type, take));
            deficit -= take;
        }
    }
    shortfalls
}
