//! 模型调用边界 - 业务能力层
//!
//! 本模块只做一件事：把一次"受 schema 约束的模型调用"封装成可替换的 trait。
//! 上层（生成客户端）只依赖错误的三分类：限流 / 其他瞬时 / 永久。
//!
//! ## 技术栈
//! - 使用 `async-openai` crate 进行 API 调用
//! - 支持自定义 API 端点和模型
//! - 兼容 OpenAI API 的服务

use async_openai::{
    config::OpenAIConfig,
    types::chat::{
        ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
        ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs, ResponseFormat,
        ResponseFormatJsonSchema,
    },
    Client,
};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

use crate::config::Config;

/// 一次模型调用请求
#[derive(Debug, Clone)]
pub struct ModelCallRequest {
    /// 系统指令（描述结构化输出契约，不内嵌原始 schema 文本）
    pub system_instruction: String,
    /// 用户消息
    pub user_message: String,
    /// 输出约束 schema
    pub response_schema: Value,
    /// schema 名称（response_format 要求）
    pub schema_name: String,
    /// 输出 token 上限
    pub max_output_tokens: u32,
}

/// 一次模型调用响应
#[derive(Debug, Clone)]
pub struct ModelCallResponse {
    /// 原始响应文本
    pub content: String,
    /// 消耗的 token 总数
    pub tokens_used: u64,
}

/// 模型调用错误，按重试语义三分类
#[derive(Debug, Clone)]
pub enum ModelCallError {
    /// 限流：退避后重试
    RateLimited(String),
    /// 其他瞬时错误：立即重试
    Transient(String),
    /// 永久错误：不重试
    Permanent(String),
}

impl ModelCallError {
    pub fn message(&self) -> &str {
        match self {
            ModelCallError::RateLimited(m)
            | ModelCallError::Transient(m)
            | ModelCallError::Permanent(m) => m,
        }
    }
}

impl fmt::Display for ModelCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelCallError::RateLimited(m) => write!(f, "rate limited: {}", m),
            ModelCallError::Transient(m) => write!(f, "transient model error: {}", m),
            ModelCallError::Permanent(m) => write!(f, "permanent model error: {}", m),
        }
    }
}

impl std::error::Error for ModelCallError {}

// 限流条件的已知子串（错误码 / 短语 / 供应商专有的吞吐限制标记）
const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "too many requests",
    "quota exceeded",
    "resource exhausted",
    "throughput",
    "tpm limit",
    "rpm limit",
];

// 其他瞬时错误的已知子串
const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "connection",
    "temporarily unavailable",
    "service unavailable",
    "overloaded",
    "500",
    "502",
    "503",
    "504",
];

/// 根据错误文本分类模型错误
pub fn classify_model_error(message: &str) -> ModelCallError {
    let lower = message.to_lowercase();
    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        ModelCallError::RateLimited(message.to_string())
    } else if TRANSIENT_MARKERS.iter().any(|m| lower.contains(m)) {
        ModelCallError::Transient(message.to_string())
    } else {
        ModelCallError::Permanent(message.to_string())
    }
}

/// 模型调用边界
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, request: &ModelCallRequest) -> Result<ModelCallResponse, ModelCallError>;
}

/// 基于 async-openai 的模型调用实现
pub struct OpenAiInvoker {
    client: Client<OpenAIConfig>,
    model_name: String,
}

impl OpenAiInvoker {
    /// 创建新的调用器（兼容 OpenAI API 的服务）
    pub fn new(config: &Config) -> Self {
        let openai_config = OpenAIConfig::new()
            .with_api_key(&config.llm_api_key)
            .with_api_base(&config.llm_api_base_url);

        let client = Client::with_config(openai_config);

        Self {
            client,
            model_name: config.llm_model_name.clone(),
        }
    }
}

#[async_trait]
impl ModelInvoker for OpenAiInvoker {
    async fn invoke(&self, request: &ModelCallRequest) -> Result<ModelCallResponse, ModelCallError> {
        debug!("调用模型 API，模型: {}", self.model_name);
        debug!("用户消息长度: {} 字符", request.user_message.len());

        let system_msg = ChatCompletionRequestSystemMessageArgs::default()
            .content(request.system_instruction.as_str())
            .build()
            .map_err(|e| ModelCallError::Permanent(e.to_string()))?;

        let user_msg = ChatCompletionRequestUserMessageArgs::default()
            .content(request.user_message.as_str())
            .build()
            .map_err(|e| ModelCallError::Permanent(e.to_string()))?;

        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                name: request.schema_name.clone(),
                description: None,
                schema: Some(request.response_schema.clone()),
                strict: Some(true),
            },
        };

        let chat_request = CreateChatCompletionRequestArgs::default()
            .model(&self.model_name)
            .messages(vec![
                ChatCompletionRequestMessage::System(system_msg),
                ChatCompletionRequestMessage::User(user_msg),
            ])
            .temperature(0.3)
            .max_tokens(request.max_output_tokens)
            .response_format(response_format)
            .build()
            .map_err(|e| ModelCallError::Permanent(e.to_string()))?;

        let response = self
            .client
            .chat()
            .create(chat_request)
            .await
            .map_err(|e| {
                warn!("模型 API 调用失败: {}", e);
                classify_model_error(&e.to_string())
            })?;

        let tokens_used = response
            .usage
            .as_ref()
            .map(|u| u.total_tokens as u64)
            .unwrap_or(0);

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| ModelCallError::Transient("empty model response".to_string()))?;

        debug!("模型 API 调用成功，消耗 {} token", tokens_used);

        Ok(ModelCallResponse {
            content: content.trim().to_string(),
            tokens_used,
        })
    }
}
