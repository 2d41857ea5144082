use serde::Deserialize;
use std::path::Path;

use crate::error::{AppResult, ConfigError};

/// 程序配置文件
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// 单个任务内同时执行的 (块, 题型) 子任务数量
    pub max_concurrent_tasks: usize,
    /// 模型调用最大尝试次数（含首次）
    pub max_attempts: u32,
    /// 指数退避基础延迟（毫秒）
    pub backoff_base_ms: u64,
    /// 指数退避最大延迟（毫秒）
    pub backoff_max_ms: u64,
    /// 退避抖动系数（0.0 ~ 1.0）
    pub backoff_jitter: f64,
    /// 每道题预估的输出 token 数（用于推算输出上限）
    pub tokens_per_question: u32,
    /// 输出 token 上限的下限值
    pub min_output_tokens: u32,
    /// PENDING/PROCESSING 任务的过期时间（秒），超时由清扫流程强制失败
    pub stale_job_timeout_secs: i64,
    // --- LLM 配置 ---
    pub llm_api_key: String,
    pub llm_api_base_url: String,
    pub llm_model_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: 4,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            backoff_jitter: 0.2,
            tokens_per_question: 400,
            min_output_tokens: 1024,
            stale_job_timeout_secs: 3600,
            llm_api_key: String::new(),
            llm_api_base_url: "https://api.openai.com/v1".to_string(),
            llm_model_name: "gpt-4o-mini".to_string(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            max_concurrent_tasks: std::env::var("MAX_CONCURRENT_TASKS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.max_concurrent_tasks),
            max_attempts: std::env::var("GENERATION_MAX_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.max_attempts),
            backoff_base_ms: std::env::var("BACKOFF_BASE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.backoff_base_ms),
            backoff_max_ms: std::env::var("BACKOFF_MAX_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.backoff_max_ms),
            backoff_jitter: std::env::var("BACKOFF_JITTER").ok().and_then(|v| v.parse().ok()).unwrap_or(default.backoff_jitter),
            tokens_per_question: std::env::var("TOKENS_PER_QUESTION").ok().and_then(|v| v.parse().ok()).unwrap_or(default.tokens_per_question),
            min_output_tokens: std::env::var("MIN_OUTPUT_TOKENS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.min_output_tokens),
            stale_job_timeout_secs: std::env::var("STALE_JOB_TIMEOUT_SECS").ok().and_then(|v| v.parse().ok()).unwrap_or(default.stale_job_timeout_secs),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or(default.llm_api_key),
            llm_api_base_url: std::env::var("LLM_API_BASE_URL").unwrap_or(default.llm_api_base_url),
            llm_model_name: std::env::var("LLM_MODEL_NAME").unwrap_or(default.llm_model_name),
        }
    }

    /// 从 TOML 配置文件加载
    pub fn from_toml_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileLoadFailed {
            path: path.display().to_string(),
            source: Box::new(e),
        })?;
        let config = toml::from_str(&content).map_err(|e| ConfigError::FileLoadFailed {
            path: path.display().to_string(),
            source: Box::new(e),
        })?;
        Ok(config)
    }

    /// 根据请求的题目数量推算输出 token 上限，避免截断
    pub fn output_token_ceiling(&self, question_count: u32) -> u32 {
        (question_count * self.tokens_per_question).max(self.min_output_tokens)
    }
}
