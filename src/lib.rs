//! # Quiz Generation
//!
//! 一个基于结构化输出 LLM 的测验题生成引擎
//!
//! ## 架构设计
//!
//! 本系统采用严格的四层架构：
//!
//! ### ① 基础设施层（Stores / Models）
//! - `stores/` - 任务、文档、账本、测验的存储抽象与内存实现
//! - `models/` - 任务实体、题型与生成请求的领域模型
//! - `schema` - 按题型派发的 JSON Schema 注册表
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单次模型调用
//! - `ModelInvoker` - 模型调用能力（OpenAI 兼容端点）
//! - `StructuredGenerationClient` - 带重试 / 退避 / 取消的生成能力
//! - `response_parser` - 原始输出到题目记录的解析与校验
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个 (块, 题型) 子任务"的完整处理流程
//! - `TaskCtx` - 上下文封装（任务 id + 块索引 + 题型）
//! - `TaskFlow` - 流程编排（生成 → 降难度回退 → 换题型回退 → 终结）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/job_runner` - 任务运行器，管理生命周期、并发与计费
//! - `orchestrator/redistribution` - 主阶段后的缺额补生成
//!
//! ## 模块结构

pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod progress;
pub mod schema;
pub mod services;
pub mod stores;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::Config;
pub use error::{AppError, AppResult};
pub use models::generation::{DocumentChunk, GenerationRequest, GenerationResult, QuizRequest};
pub use models::job::{BillingState, GenerationJob, JobId, JobStatus};
pub use models::question::{Difficulty, QuestionRecord, QuestionType};
pub use orchestrator::JobRunner;
pub use progress::ProgressTracker;
pub use services::{ModelInvoker, OpenAiInvoker, StructuredGenerationClient};
pub use stores::{BillingLedger, DocumentSource, JobStore, QuizPersistence};
pub use workflow::{TaskCtx, TaskFlow, TaskOutcome};
