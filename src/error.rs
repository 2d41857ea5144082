use std::fmt;

/// 应用程序错误类型
#[derive(Debug)]
pub enum AppError {
    /// 任务（Job）生命周期错误
    Job(JobError),
    /// 结构化生成错误
    Generation(GenerationError),
    /// 计费相关错误
    Billing(BillingError),
    /// 存储层错误
    Storage(StorageError),
    /// 配置错误
    Config(ConfigError),
    /// 其他错误（用于包装第三方库错误）
    Other(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Job(e) => write!(f, "job error: {}", e),
            AppError::Generation(e) => write!(f, "generation error: {}", e),
            AppError::Billing(e) => write!(f, "billing error: {}", e),
            AppError::Storage(e) => write!(f, "storage error: {}", e),
            AppError::Config(e) => write!(f, "config error: {}", e),
            AppError::Other(msg) => write!(f, "error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Job(e) => Some(e),
            AppError::Generation(e) => Some(e),
            AppError::Billing(e) => Some(e),
            AppError::Storage(e) => Some(e),
            AppError::Config(e) => Some(e),
            AppError::Other(_) => None,
        }
    }
}

/// 任务生命周期错误
#[derive(Debug)]
pub enum JobError {
    /// 任务不存在
    NotFound { job_id: String },
    /// 非法的状态转换
    InvalidStatusTransition {
        job_id: String,
        from: String,
        to: String,
    },
    /// 任务已处于终态，不能再修改
    AlreadyTerminal { job_id: String, status: String },
    /// 进度计数器违反不变量
    CounterInvariantViolated {
        job_id: String,
        completed: u32,
        total: u32,
    },
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::NotFound { job_id } => write!(f, "job not found: {}", job_id),
            JobError::InvalidStatusTransition { job_id, from, to } => {
                write!(
                    f,
                    "invalid status transition for job {}: {} -> {}",
                    job_id, from, to
                )
            }
            JobError::AlreadyTerminal { job_id, status } => {
                write!(f, "job {} is already terminal ({})", job_id, status)
            }
            JobError::CounterInvariantViolated {
                job_id,
                completed,
                total,
            } => {
                write!(
                    f,
                    "job {}: completed_tasks {} would exceed total_tasks {}",
                    job_id, completed, total
                )
            }
        }
    }
}

impl std::error::Error for JobError {}

/// 结构化生成错误
///
/// 对应错误分类法：输入错误 / 重试耗尽 / 内容错误 / 截断错误。
/// 取消不是错误，由调用方通过空结果加警告表达。
#[derive(Debug)]
pub enum GenerationError {
    /// 请求参数非法（不重试，直接返回给调用方）
    InvalidInput { reason: String },
    /// 重试次数耗尽
    RetriesExhausted { attempts: u32, last_error: String },
    /// 响应解析彻底失败（内容错误）
    ParseFailure { reason: String },
    /// 按类型的结构校验失败
    ContentValidationFailed {
        question_type: String,
        reason: String,
    },
    /// 响应疑似被截断（可操作的专门错误，区别于普通解析失败）
    Truncated { max_output_tokens: u32 },
    /// 模型调用失败（不可重试的永久错误）
    ModelCallFailed {
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl fmt::Display for GenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationError::InvalidInput { reason } => {
                write!(f, "invalid generation request: {}", reason)
            }
            GenerationError::RetriesExhausted {
                attempts,
                last_error,
            } => {
                write!(
                    f,
                    "generation failed after {} attempts, last error: {}",
                    attempts, last_error
                )
            }
            GenerationError::ParseFailure { reason } => {
                write!(f, "failed to parse model response: {}", reason)
            }
            GenerationError::ContentValidationFailed {
                question_type,
                reason,
            } => {
                write!(f, "{} content invalid: {}", question_type, reason)
            }
            GenerationError::Truncated { max_output_tokens } => {
                write!(
                    f,
                    "model response appears truncated (max_output_tokens={}); \
                     reduce the requested question count or raise the output token ceiling",
                    max_output_tokens
                )
            }
            GenerationError::ModelCallFailed { source } => {
                write!(f, "model call failed: {}", source)
            }
        }
    }
}

impl std::error::Error for GenerationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GenerationError::ModelCallFailed { source } => {
                Some(source.as_ref() as &(dyn std::error::Error + 'static))
            }
            _ => None,
        }
    }
}

/// 计费相关错误
#[derive(Debug)]
pub enum BillingError {
    /// 非法的计费状态转换
    InvalidStateTransition { from: String, to: String },
    /// 预留不存在
    ReservationNotFound { reservation_id: String },
    /// 账本调用失败
    LedgerCallFailed {
        operation: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl fmt::Display for BillingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BillingError::InvalidStateTransition { from, to } => {
                write!(f, "invalid billing state transition: {} -> {}", from, to)
            }
            BillingError::ReservationNotFound { reservation_id } => {
                write!(f, "billing reservation not found: {}", reservation_id)
            }
            BillingError::LedgerCallFailed { operation, source } => {
                write!(f, "billing ledger {} failed: {}", operation, source)
            }
        }
    }
}

impl std::error::Error for BillingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BillingError::LedgerCallFailed { source, .. } => {
                Some(source.as_ref() as &(dyn std::error::Error + 'static))
            }
            _ => None,
        }
    }
}

/// 存储层错误
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// 乐观锁版本冲突（整实体保存时检测）
    #[error("version conflict saving job {job_id}: expected {expected}, found {found}")]
    VersionConflict {
        job_id: String,
        expected: u64,
        found: u64,
    },
    /// 记录不存在
    #[error("record not found: {id}")]
    NotFound { id: String },
    /// 底层存储失败
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// 配置错误
#[derive(Debug)]
pub enum ConfigError {
    /// 环境变量解析失败
    EnvVarParseFailed {
        var_name: String,
        value: String,
        expected_type: String,
    },
    /// 配置文件读取/解析失败
    FileLoadFailed {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EnvVarParseFailed {
                var_name,
                value,
                expected_type,
            } => {
                write!(
                    f,
                    "env var {} parse failed: '{}' is not a valid {}",
                    var_name, value, expected_type
                )
            }
            ConfigError::FileLoadFailed { path, source } => {
                write!(f, "config file {} load failed: {}", path, source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::FileLoadFailed { source, .. } => {
                Some(source.as_ref() as &(dyn std::error::Error + 'static))
            }
            _ => None,
        }
    }
}

// ========== 从常见错误类型转换 ==========
// 注意：不需要手动实现 From<AppError> for anyhow::Error，
// anyhow 已经为所有实现了 std::error::Error 的类型提供了自动实现

impl From<JobError> for AppError {
    fn from(err: JobError) -> Self {
        AppError::Job(err)
    }
}

impl From<GenerationError> for AppError {
    fn from(err: GenerationError) -> Self {
        AppError::Generation(err)
    }
}

impl From<BillingError> for AppError {
    fn from(err: BillingError) -> Self {
        AppError::Billing(err)
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        AppError::Storage(err)
    }
}

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Generation(GenerationError::ParseFailure {
            reason: err.to_string(),
        })
    }
}

// ========== 便捷构造函数 ==========

impl AppError {
    /// 创建任务不存在错误
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        AppError::Job(JobError::NotFound {
            job_id: job_id.into(),
        })
    }

    /// 创建非法请求错误
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        AppError::Generation(GenerationError::InvalidInput {
            reason: reason.into(),
        })
    }

    /// 创建解析失败错误
    pub fn parse_failure(reason: impl Into<String>) -> Self {
        AppError::Generation(GenerationError::ParseFailure {
            reason: reason.into(),
        })
    }

    /// 创建账本调用失败错误
    pub fn ledger_call_failed(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        AppError::Billing(BillingError::LedgerCallFailed {
            operation: operation.into(),
            source: Box::new(source),
        })
    }
}

// ========== Result 类型别名 ==========

/// 应用程序结果类型
pub type AppResult<T> = Result<T, AppError>;
