//! 编排层端到端测试（使用脚本化的模型调用桩，不访问真实 API）

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quiz_generation::config::Config;
use quiz_generation::models::generation::{DocumentChunk, QuizRequest};
use quiz_generation::models::job::{BillingState, GenerationJob, JobId, JobStatus};
use quiz_generation::models::question::{Difficulty, QuestionType};
use quiz_generation::orchestrator::JobRunner;
use quiz_generation::services::model_invoker::{
    ModelCallError, ModelCallRequest, ModelCallResponse, ModelInvoker,
};
use quiz_generation::services::StructuredGenerationClient;
use quiz_generation::stores::memory::{
    InMemoryBillingLedger, InMemoryDocumentSource, InMemoryJobStore, InMemoryQuizStore,
};
use quiz_generation::stores::{BillingLedger, JobStore};

// ========== 测试桩 ==========

type Script =
    dyn Fn(u64, &ModelCallRequest) -> Result<ModelCallResponse, ModelCallError> + Send + Sync;

/// 按调用序号执行脚本的模型桩
struct ScriptedInvoker {
    calls: AtomicU64,
    script: Box<Script>,
}

impl ScriptedInvoker {
    fn new(
        script: impl Fn(u64, &ModelCallRequest) -> Result<ModelCallResponse, ModelCallError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self {
            calls: AtomicU64::new(0),
            script: Box::new(script),
        }
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        request: &ModelCallRequest,
    ) -> Result<ModelCallResponse, ModelCallError> {
        let ordinal = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(ordinal, request)
    }
}

/// 第一次调用时在存储里打取消标记，然后等待 watcher 观察到再失败。
/// 用于验证"取消后不再发起新调用"。
struct CancelOnFirstCallInvoker {
    store: Arc<InMemoryJobStore>,
    job_id: JobId,
    calls: AtomicU64,
}

#[async_trait]
impl ModelInvoker for CancelOnFirstCallInvoker {
    async fn invoke(
        &self,
        _request: &ModelCallRequest,
    ) -> Result<ModelCallResponse, ModelCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _ = self.store.request_cancel(&self.job_id).await;
        // 留足 watcher 的轮询时间窗
        tokio::time::sleep(std::time::Duration::from_millis(700)).await;
        Err(ModelCallError::Permanent("stub failure".to_string()))
    }
}

/// 从请求反推题型，构造一份通过解析与校验的响应
fn valid_payload(request: &ModelCallRequest, count: u32) -> String {
    let type_name = request
        .schema_name
        .strip_prefix("quiz_")
        .unwrap_or("open");
    let question_type = QuestionType::parse(type_name).unwrap_or(QuestionType::Open);
    let difficulty = extract_difficulty(&request.user_message);

    let questions: Vec<_> = (0..count)
        .map(|i| {
            json!({
                "questionText": format!("第 {} 题", i + 1),
                "type": question_type.name(),
                "difficulty": difficulty,
                "content": content_for(question_type),
                "explanation": "解析"
            })
        })
        .collect();
    json!({ "questions": questions }).to_string()
}

fn content_for(question_type: QuestionType) -> serde_json::Value {
    match question_type {
        QuestionType::TrueFalse => json!({ "answer": true }),
        QuestionType::MultipleChoice => json!({
            "options": [
                { "text": "甲", "correct": true },
                { "text": "乙", "correct": false },
                { "text": "丙", "correct": false },
                { "text": "丁", "correct": false }
            ]
        }),
        QuestionType::Open => json!({ "answer": "标准答案" }),
        QuestionType::FillGap => json!({
            "text": "水在 {1} 度沸腾。",
            "gaps": [ { "id": 1, "answer": "100" } ]
        }),
        QuestionType::Ordering => json!({ "items": [ { "text": "一" }, { "text": "二" } ] }),
        QuestionType::Matching => json!({ "left": [], "right": [] }),
        QuestionType::Hotspot => json!({
            "imageUrl": "https://example.com/a.png",
            "regions": []
        }),
        QuestionType::Compliance => json!({ "statements": [] }),
    }
}

/// 用户消息里带有请求的数量，桩按数量生成
fn requested_count(user_message: &str) -> u32 {
    user_message
        .split("生成 ")
        .nth(1)
        .and_then(|rest| rest.split(" 道").next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(1)
}

fn extract_difficulty(user_message: &str) -> String {
    user_message
        .split("难度 ")
        .nth(1)
        .and_then(|rest| rest.split('。').next())
        .unwrap_or("MEDIUM")
        .to_string()
}

// ========== 组装辅助 ==========

struct Harness {
    job_store: Arc<InMemoryJobStore>,
    quiz_store: Arc<InMemoryQuizStore>,
    billing: Arc<InMemoryBillingLedger>,
    runner: JobRunner,
    job_id: JobId,
}

fn test_config() -> Config {
    Config {
        max_concurrent_tasks: 4,
        max_attempts: 2,
        backoff_base_ms: 1,
        backoff_max_ms: 5,
        ..Config::default()
    }
}

fn demo_chunks(n: u32) -> Vec<DocumentChunk> {
    (0..n)
        .map(|i| DocumentChunk {
            content: format!("第 {} 段内容", i + 1),
            chunk_index: i,
            chapter: None,
            section: None,
        })
        .collect()
}

fn request_of(pairs: &[(QuestionType, u32)]) -> QuizRequest {
    QuizRequest {
        counts_per_chunk: pairs.iter().copied().collect::<BTreeMap<_, _>>(),
        difficulty: Difficulty::Medium,
        language: "zh".to_string(),
    }
}

/// 组装运行器：n 个块的文档 + 带预留的任务 + 给定模型桩
async fn setup(invoker: Arc<dyn ModelInvoker>, chunk_count: u32) -> Harness {
    let config = test_config();
    let job_store = Arc::new(InMemoryJobStore::new());
    let document_source = Arc::new(InMemoryDocumentSource::new());
    let quiz_store = Arc::new(InMemoryQuizStore::new());
    let billing = Arc::new(InMemoryBillingLedger::new());

    document_source
        .insert_document("doc-1", demo_chunks(chunk_count))
        .await;

    let mut job = GenerationJob::new("user-1", "doc-1");
    let reservation_id = billing.reserve(4_000).await.unwrap();
    let expires_at = chrono::Utc::now() + chrono::Duration::minutes(30);
    job.billing_reserve(reservation_id, 4_000, expires_at).unwrap();
    let job_id = job.id.clone();
    job_store.insert(job).await;

    let client = Arc::new(StructuredGenerationClient::new(invoker, &config));
    let runner = JobRunner::new(
        job_store.clone(),
        document_source,
        quiz_store.clone(),
        billing.clone(),
        client,
        config,
    );

    Harness {
        job_store,
        quiz_store,
        billing,
        runner,
        job_id,
    }
}

// ========== 测试 ==========

#[tokio::test]
async fn test_happy_path_completes_and_commits() {
    let invoker = Arc::new(ScriptedInvoker::new(|_, request| {
        Ok(ModelCallResponse {
            content: valid_payload(request, requested_count(&request.user_message)),
            tokens_used: 100,
        })
    }));
    // 2 块 × 2 有效题型（数量为 0 的题型不计） = 4 个子任务
    let h = setup(invoker.clone(), 2).await;
    let request = request_of(&[
        (QuestionType::MultipleChoice, 3),
        (QuestionType::TrueFalse, 2),
        (QuestionType::Open, 0),
    ]);

    h.runner.run(&h.job_id, &request).await.unwrap();

    let job = h.job_store.load(&h.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.total_tasks, Some(4));
    assert_eq!(job.completed_tasks, 4);
    assert_eq!(job.processed_chunks, 2);
    assert_eq!(job.total_questions_generated, 2 * (3 + 2));
    assert!((job.progress_percentage() - 100.0).abs() < f64::EPSILON);
    assert_eq!(job.billing_state, BillingState::Committed);
    assert_eq!(h.billing.commit_calls(), 1);
    assert_eq!(h.billing.release_calls(), 0);

    let quiz_id = job.generated_quiz_id.unwrap();
    assert_eq!(h.quiz_store.question_count(&quiz_id).await, 10);
    // 每个 (块, 题型) 恰好一次调用
    assert_eq!(invoker.calls(), 4);
}

#[tokio::test]
async fn test_redistribution_fills_shortfall_without_touching_counters() {
    // 第一次调用少给一道题，补生成时给足
    let invoker = Arc::new(ScriptedInvoker::new(|ordinal, request| {
        let wanted = requested_count(&request.user_message);
        let count = if ordinal == 0 { wanted - 1 } else { wanted };
        Ok(ModelCallResponse {
            content: valid_payload(request, count),
            tokens_used: 100,
        })
    }));
    let h = setup(invoker.clone(), 1).await;
    let request = request_of(&[(QuestionType::MultipleChoice, 3)]);

    h.runner.run(&h.job_id, &request).await.unwrap();

    let job = h.job_store.load(&h.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    // 补生成不影响任务计数器：主阶段结束时即定格
    assert_eq!(job.total_tasks, Some(1));
    assert_eq!(job.completed_tasks, 1);
    assert_eq!(job.total_questions_generated, 2);
    // 但最终测验里是补齐后的 3 道题
    let quiz_id = job.generated_quiz_id.unwrap();
    assert_eq!(h.quiz_store.question_count(&quiz_id).await, 3);
    assert_eq!(invoker.calls(), 2);
}

#[tokio::test]
async fn test_cancel_before_start_means_zero_invocations() {
    let invoker = Arc::new(ScriptedInvoker::new(|_, _| {
        panic!("model must not be called for a pre-cancelled job")
    }));
    let h = setup(invoker.clone(), 2).await;
    h.job_store.request_cancel(&h.job_id).await.unwrap();

    let request = request_of(&[(QuestionType::TrueFalse, 2)]);
    h.runner.run(&h.job_id, &request).await.unwrap();

    let job = h.job_store.load(&h.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.completed_tasks, 0);
    assert_eq!(job.billing_state, BillingState::Released);
    assert_eq!(h.billing.release_calls(), 1);
    assert_eq!(invoker.calls(), 0);
}

#[tokio::test]
async fn test_cancel_mid_run_stops_new_invocations_and_releases() {
    let job_store = Arc::new(InMemoryJobStore::new());
    let document_source = Arc::new(InMemoryDocumentSource::new());
    let quiz_store = Arc::new(InMemoryQuizStore::new());
    let billing = Arc::new(InMemoryBillingLedger::new());

    document_source.insert_document("doc-1", demo_chunks(1)).await;
    let mut job = GenerationJob::new("user-1", "doc-1");
    let reservation_id = billing.reserve(1_000).await.unwrap();
    let expires_at = chrono::Utc::now() + chrono::Duration::minutes(30);
    job.billing_reserve(reservation_id, 1_000, expires_at).unwrap();
    let job_id = job.id.clone();
    job_store.insert(job).await;

    // 单并发：第一次调用触发取消，之后不得再有新调用
    let invoker = Arc::new(CancelOnFirstCallInvoker {
        store: job_store.clone(),
        job_id: job_id.clone(),
        calls: AtomicU64::new(0),
    });
    let mut config = test_config();
    config.max_concurrent_tasks = 1;
    let client = Arc::new(StructuredGenerationClient::new(invoker.clone(), &config));
    let runner = JobRunner::new(
        job_store.clone(),
        document_source,
        quiz_store,
        billing.clone(),
        client,
        config,
    );

    let request = request_of(&[(QuestionType::TrueFalse, 2)]);
    runner.run(&job_id, &request).await.unwrap();

    let job = job_store.load(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    // 取消保留已有进度：既不清零也不置满
    assert_eq!(job.completed_tasks, 0);
    assert_eq!(job.billing_state, BillingState::Released);
    assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_all_tasks_give_up_fails_job_and_releases() {
    let invoker = Arc::new(ScriptedInvoker::new(|_, _| {
        Err(ModelCallError::Permanent("invalid api key".to_string()))
    }));
    let h = setup(invoker, 2).await;
    let request = request_of(&[(QuestionType::Open, 2)]);

    h.runner.run(&h.job_id, &request).await.unwrap();

    let job = h.job_store.load(&h.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error_message.is_some());
    // 放弃也要计数：进度到达 100% 但任务失败
    assert_eq!(job.completed_tasks, 2);
    assert_eq!(job.total_questions_generated, 0);
    assert_eq!(job.billing_state, BillingState::Released);
    assert_eq!(h.billing.release_calls(), 1);
    assert_eq!(h.billing.commit_calls(), 0);
}

#[tokio::test]
async fn test_transient_errors_are_retried_to_success() {
    // 前两次瞬时失败（限流 + 超时），第三次成功；预算三次尝试
    let invoker = Arc::new(ScriptedInvoker::new(|ordinal, request| match ordinal {
        0 => Err(ModelCallError::RateLimited("429 too many requests".to_string())),
        1 => Err(ModelCallError::Transient("connection timeout".to_string())),
        _ => Ok(ModelCallResponse {
            content: valid_payload(request, requested_count(&request.user_message)),
            tokens_used: 80,
        }),
    }));

    let mut config = test_config();
    config.max_attempts = 3;
    let job_store = Arc::new(InMemoryJobStore::new());
    let document_source = Arc::new(InMemoryDocumentSource::new());
    let quiz_store = Arc::new(InMemoryQuizStore::new());
    let billing = Arc::new(InMemoryBillingLedger::new());
    document_source.insert_document("doc-1", demo_chunks(1)).await;

    let mut job = GenerationJob::new("user-1", "doc-1");
    let reservation_id = billing.reserve(1_000).await.unwrap();
    let expires_at = chrono::Utc::now() + chrono::Duration::minutes(30);
    job.billing_reserve(reservation_id, 1_000, expires_at).unwrap();
    let job_id = job.id.clone();
    job_store.insert(job).await;

    let client = Arc::new(StructuredGenerationClient::new(invoker.clone(), &config));
    let runner = JobRunner::new(
        job_store.clone(),
        document_source,
        quiz_store,
        billing,
        client,
        config,
    );

    let request = request_of(&[(QuestionType::TrueFalse, 2)]);
    runner.run(&job_id, &request).await.unwrap();

    let job = job_store.load(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(invoker.calls(), 3);
}

#[tokio::test]
async fn test_completed_job_is_never_released_by_late_worker() {
    let invoker = Arc::new(ScriptedInvoker::new(|_, request| {
        Ok(ModelCallResponse {
            content: valid_payload(request, requested_count(&request.user_message)),
            tokens_used: 50,
        })
    }));
    let h = setup(invoker, 1).await;
    let request = request_of(&[(QuestionType::Open, 1)]);

    h.runner.run(&h.job_id, &request).await.unwrap();
    // 迟到的 worker 再跑同一个任务：守卫转换失败，任务保持 COMPLETED
    let second = h.runner.run(&h.job_id, &request).await;
    assert!(second.is_err());

    let job = h.job_store.load(&h.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.billing_state, BillingState::Committed);
    assert_eq!(h.billing.commit_calls(), 1);
    assert_eq!(h.billing.release_calls(), 0);
}

#[tokio::test]
async fn test_expire_stale_jobs_fails_and_releases() {
    let invoker = Arc::new(ScriptedInvoker::new(|_, _| {
        Err(ModelCallError::Permanent("unused".to_string()))
    }));
    let h = setup(invoker, 1).await;

    // 把任务改造成两小时前创建、从未开始的样子
    h.job_store
        .update_job_exclusive(
            &h.job_id,
            Box::new(|job| {
                job.created_at = chrono::Utc::now() - chrono::Duration::hours(2);
                Ok(())
            }),
        )
        .await
        .unwrap();

    let expired = h.runner.expire_stale_jobs().await.unwrap();
    assert_eq!(expired, 1);

    let job = h.job_store.load(&h.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("timeout"));
    assert_eq!(job.billing_state, BillingState::Released);

    // 再扫一遍：终态任务不会被重复处理
    let expired_again = h.runner.expire_stale_jobs().await.unwrap();
    assert_eq!(expired_again, 0);
    assert_eq!(h.billing.release_calls(), 1);
}

#[tokio::test]
async fn test_run_unknown_job_is_an_error() {
    let invoker = Arc::new(ScriptedInvoker::new(|_, _| {
        Err(ModelCallError::Permanent("unused".to_string()))
    }));
    let h = setup(invoker, 1).await;
    let request = request_of(&[(QuestionType::Open, 1)]);

    let result = h.runner.run(&"missing-job".to_string(), &request).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_zero_active_types_fails_job() {
    let invoker = Arc::new(ScriptedInvoker::new(|_, _| {
        panic!("model must not be called when nothing is requested")
    }));
    let h = setup(invoker, 1).await;
    let request = request_of(&[(QuestionType::Open, 0)]);

    h.runner.run(&h.job_id, &request).await.unwrap();

    let job = h.job_store.load(&h.job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.billing_state, BillingState::Released);
}
