//! 结构化生成客户端 - 业务能力层
//!
//! 职责：
//! - 把一个 (块, 题型) 生成请求变成一次受 schema 约束的模型调用
//! - 有界重试：限流错误退避后重试，其他瞬时错误立即重试，永久错误直接失败
//! - 每次尝试（包括第一次）之前检查取消谓词
//! - 解析并校验原始响应，产出类型化的题目记录
//!
//! 不出现 Job / 计数器 / 计费——那些是编排层的事。

use std::sync::Arc;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::GenerationError;
use crate::models::generation::{GenerationRequest, GenerationResult};
use crate::models::question::{Difficulty, QuestionType};
use crate::schema;
use crate::services::model_invoker::{ModelCallError, ModelCallRequest, ModelInvoker};
use crate::services::response_parser;
use crate::utils::truncate_text;

/// 结构化生成客户端
pub struct StructuredGenerationClient {
    invoker: Arc<dyn ModelInvoker>,
    config: Config,
}

impl StructuredGenerationClient {
    /// 创建新的生成客户端
    pub fn new(invoker: Arc<dyn ModelInvoker>, config: &Config) -> Self {
        Self {
            invoker,
            config: config.clone(),
        }
    }

    /// 执行一次生成调用
    ///
    /// # 返回
    /// 成功返回 `GenerationResult`；取消返回带 "cancelled by user" 警告的空结果；
    /// 重试耗尽或输入非法返回类型化错误。
    pub async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<GenerationResult, GenerationError> {
        validate_request(request)?;

        debug!(
            "📤 生成请求: {} 道 {}，片段预览: {}",
            request.count,
            request.question_type.name(),
            truncate_text(&request.chunk_content, 80)
        );

        let max_attempts = self.config.max_attempts.max(1);
        let max_output_tokens = self.config.output_token_ceiling(request.count);
        let call = self.build_call(request, max_output_tokens);

        let mut tokens_used: u64 = 0;
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            // 每次尝试前检查取消（包括第一次，取消时零调用、零 token）
            if (request.cancel_check)() {
                debug!("生成在第 {} 次尝试前被取消", attempt + 1);
                let mut result = GenerationResult::cancelled();
                result.tokens_used = tokens_used;
                return Ok(result);
            }

            match self.invoker.invoke(&call).await {
                Ok(response) => {
                    tokens_used += response.tokens_used;
                    match response_parser::parse_questions(
                        &response.content,
                        request.question_type,
                        request.difficulty,
                        max_output_tokens,
                    ) {
                        Ok(parsed) => {
                            let schema_valid = parsed.warnings.is_empty();
                            return Ok(GenerationResult {
                                questions: parsed.questions,
                                warnings: parsed.warnings,
                                tokens_used,
                                schema_valid,
                            });
                        }
                        // 截断有专门的可操作错误，不再重试
                        Err(e @ GenerationError::Truncated { .. }) => return Err(e),
                        // 其他解析失败计入重试预算，立即重试
                        Err(e) => {
                            warn!(
                                "第 {}/{} 次尝试解析失败: {}",
                                attempt + 1,
                                max_attempts,
                                e
                            );
                            last_error = e.to_string();
                        }
                    }
                }
                Err(ModelCallError::RateLimited(message)) => {
                    last_error = message;
                    // 最后一次尝试失败后直接返回，不再退避
                    if attempt + 1 < max_attempts {
                        let delay = backoff_delay_ms(
                            attempt,
                            self.config.backoff_base_ms,
                            self.config.backoff_max_ms,
                            self.config.backoff_jitter,
                        );
                        warn!(
                            "第 {}/{} 次尝试被限流，{}ms 后重试: {}",
                            attempt + 1,
                            max_attempts,
                            delay,
                            last_error
                        );
                        // 只阻塞当前子任务的 worker，不影响同任务的其他子任务
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
                Err(ModelCallError::Transient(message)) => {
                    warn!(
                        "第 {}/{} 次尝试瞬时失败，立即重试: {}",
                        attempt + 1,
                        max_attempts,
                        message
                    );
                    last_error = message;
                }
                Err(ModelCallError::Permanent(message)) => {
                    return Err(GenerationError::ModelCallFailed {
                        source: message.into(),
                    });
                }
            }
        }

        Err(GenerationError::RetriesExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// 批量再生成：针对一个块缺失的多个题型逐个补生成
    ///
    /// 聚合各子调用的 token 与警告；单个子调用失败记成警告，不中断整批。
    pub async fn regenerate_missing(
        &self,
        chunk_content: &str,
        missing: &[(QuestionType, u32)],
        difficulty: Difficulty,
        language: &str,
        cancel_check: crate::models::generation::CancelCheck,
    ) -> GenerationResult {
        let mut aggregate = GenerationResult {
            schema_valid: true,
            ..Default::default()
        };

        for (question_type, count) in missing {
            if cancel_check() {
                aggregate.warnings.push("cancelled by user".to_string());
                break;
            }
            let sub_request = GenerationRequest {
                chunk_content: chunk_content.to_string(),
                question_type: *question_type,
                count: *count,
                difficulty,
                language: language.to_string(),
                cancel_check: cancel_check.clone(),
            };
            match self.generate(&sub_request).await {
                Ok(result) => aggregate.merge(result),
                Err(e) => {
                    aggregate.warnings.push(format!(
                        "regeneration of {} failed: {}",
                        question_type.name(),
                        e
                    ));
                    aggregate.schema_valid = false;
                }
            }
        }

        aggregate
    }

    /// 构建模型调用请求
    fn build_call(&self, request: &GenerationRequest, max_output_tokens: u32) -> ModelCallRequest {
        ModelCallRequest {
            system_instruction: build_system_instruction(request),
            user_message: build_user_message(request),
            response_schema: schema::questions_payload_schema(request.question_type),
            schema_name: format!("quiz_{}", request.question_type.name().to_lowercase()),
            max_output_tokens,
        }
    }
}

/// 输入校验：非法请求直接失败，不进重试循环
fn validate_request(request: &GenerationRequest) -> Result<(), GenerationError> {
    if request.chunk_content.trim().is_empty() {
        return Err(GenerationError::InvalidInput {
            reason: "chunk content must not be empty".to_string(),
        });
    }
    if request.count == 0 {
        return Err(GenerationError::InvalidInput {
            reason: "question count must be greater than zero".to_string(),
        });
    }
    // 题型与难度由类型系统保证非空
    Ok(())
}

/// 系统指令：描述结构化输出契约，不内嵌 schema 正文
/// （schema 通过 response_format 下发）
fn build_system_instruction(request: &GenerationRequest) -> String {
    format!(
        "你是一个出题助手。请根据给定的文本片段生成测验题目。\
         输出必须是一个 JSON 对象，顶层包含 questions 数组；\
         每道题包含 questionText、type、difficulty、content 字段，\
         content 的结构由 API 下发的 schema 约束，不要输出 schema 之外的字段，\
         也不要输出 markdown 代码围栏。题目语言：{}。",
        request.language
    )
}

/// 用户消息：片段内容 + 出题要求
fn build_user_message(request: &GenerationRequest) -> String {
    format!(
        "请基于以下文本片段生成 {} 道 {} 类型的题目，难度 {}。\n\n\
         文本片段：\n{}",
        request.count,
        request.question_type.name(),
        request.difficulty.name(),
        request.chunk_content
    )
}

/// 计算第 `attempt` 次重试的退避延迟（毫秒）
///
/// `base * 2^attempt`，在 ±jitter 抖动带内随机化，封顶 `max_ms`。
/// 抖动避免多个 worker 同步重试形成风暴。
pub fn backoff_delay_ms(attempt: u32, base_ms: u64, max_ms: u64, jitter: f64) -> u64 {
    use rand::Rng;

    let exp = base_ms.saturating_mul(1u64 << attempt.min(32)) as f64;
    let jitter = jitter.clamp(0.0, 1.0);
    let low = exp * (1.0 - jitter);
    let high = exp * (1.0 + jitter);
    let delay = if high > low {
        rand::thread_rng().gen_range(low..=high)
    } else {
        exp
    };
    (delay as u64).min(max_ms)
}
