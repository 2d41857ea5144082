//! 生成任务运行器 - 编排层
//!
//! ## 职责
//!
//! 本模块是整个核心的入口，负责单个生成任务的全生命周期。
//!
//! ## 核心功能
//!
//! 1. **生命周期**：PENDING → PROCESSING → {COMPLETED | FAILED | CANCELLED}
//! 2. **任务分解**：totalTasks = 块数 × 有效题型数（数量为 0 的题型不计）
//! 3. **并发控制**：使用 Semaphore 限制同任务内的并发子任务数
//! 4. **精确计数**：每个 (块, 题型) 子任务恰好自增一次完成计数
//! 5. **重分配**：主阶段之后的补生成，不触碰任务计数器
//! 6. **终结**：行级独占下的终态转换 + 恰好一次的计费决议
//!
//! ## 设计特点
//!
//! - 同一任务不允许两个 worker 并发运行：PENDING→PROCESSING 的守卫转换
//!   让后来者直接失败
//! - 取消是协作式的：后台 watcher 轮询取消标记，子任务和重试边界都会观察到
//! - 释放预留失败只记录在 lastBillingError，不掩盖生成本身的失败

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::generation::{DocumentChunk, QuizRequest};
use crate::models::job::{BillingState, GenerationJob, JobId};
use crate::models::question::QuestionRecord;
use crate::orchestrator::redistribution;
use crate::progress::ProgressTracker;
use crate::services::StructuredGenerationClient;
use crate::stores::{BillingLedger, DocumentSource, JobStore, QuizPersistence};
use crate::workflow::{TaskCtx, TaskFlow, TaskOutcome};

/// 取消标记的轮询间隔
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// 任务运行统计
#[derive(Debug, Default)]
struct RunStats {
    succeeded: usize,
    gave_up: usize,
    cancelled: usize,
    questions: usize,
    tokens_used: u64,
}

/// 生成任务运行器
pub struct JobRunner {
    job_store: Arc<dyn JobStore>,
    document_source: Arc<dyn DocumentSource>,
    quiz_store: Arc<dyn QuizPersistence>,
    billing: Arc<dyn BillingLedger>,
    client: Arc<StructuredGenerationClient>,
    config: Config,
}

impl JobRunner {
    pub fn new(
        job_store: Arc<dyn JobStore>,
        document_source: Arc<dyn DocumentSource>,
        quiz_store: Arc<dyn QuizPersistence>,
        billing: Arc<dyn BillingLedger>,
        client: Arc<StructuredGenerationClient>,
        config: Config,
    ) -> Self {
        Self {
            job_store,
            document_source,
            quiz_store,
            billing,
            client,
            config,
        }
    }

    /// 运行一个生成任务直到终态
    ///
    /// 任务不存在是调用方错误，直接返回 Err 不重试；
    /// 其余一切不可恢复的失败都在内部转成 FAILED 终态（附计费释放），
    /// 调用方通过任务的状态 / 错误信息 / 计费状态观察结果。
    pub async fn run(&self, job_id: &JobId, request: &QuizRequest) -> AppResult<()> {
        let job = self
            .job_store
            .load(job_id)
            .await?
            .ok_or_else(|| AppError::job_not_found(job_id.clone()))?;

        log_job_start(job_id, &job);

        if job.cancel_requested {
            self.finalize_cancelled(job_id).await?;
            return Ok(());
        }

        match self.execute(job_id, &job.document_id, request).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // 被别的 worker 抢先接手（守卫转换失败）时不要碰任务，
                // 否则会把正在处理中的任务误置为 FAILED
                if is_claim_conflict(&e) {
                    warn!("[任务 {}] ⚠️ 任务已被接手，跳过: {}", job_id, e);
                    return Err(AppError::Other(e.to_string()));
                }
                error!("[任务 {}] ❌ 不可恢复的失败: {}", job_id, e);
                self.finalize_failed(job_id, &e.to_string()).await?;
                Ok(())
            }
        }
    }

    /// 主执行路径（任何 Err 都会由 run 转成 FAILED 终态）
    async fn execute(
        &self,
        job_id: &JobId,
        document_id: &str,
        request: &QuizRequest,
    ) -> Result<()> {
        // ========== 第 1 步：取块、分解任务、固定分母 ==========
        let chunks = self.document_source.fetch_chunks(document_id).await?;
        if chunks.is_empty() {
            anyhow::bail!("document has no chunks");
        }

        let active_types = request.active_types();
        if active_types.is_empty() {
            anyhow::bail!("no question types requested (all counts are zero)");
        }

        let chunk_count = chunks.len() as u32;
        let total_tasks = chunk_count * active_types.len() as u32;

        // PENDING→PROCESSING 是守卫转换：另一 worker 已接手时这里会失败
        self.job_store
            .update_job_exclusive(
                job_id,
                Box::new(move |job| {
                    job.mark_processing(chunk_count, total_tasks)?;
                    job.current_status_message = "开始生成".to_string();
                    Ok(())
                }),
            )
            .await?;

        log_tasks_dispatched(job_id, chunk_count, active_types.len(), total_tasks);

        // ========== 第 2 步：并发执行全部 (块, 题型) 子任务 ==========
        let cancelled = Arc::new(AtomicBool::new(false));
        let watcher = self.spawn_cancel_watcher(job_id.clone(), cancelled.clone());

        let tracker = Arc::new(ProgressTracker::new(
            job_id.clone(),
            self.job_store.clone(),
            total_tasks,
            chunk_count,
        ));

        let outcome = self
            .run_main_pass(job_id, request, &chunks, &active_types, &tracker, &cancelled)
            .await;
        watcher.abort();
        let (accepted, stats) = outcome?;

        // ========== 第 3 步：取消则冻结进度、释放预留 ==========
        if cancelled.load(Ordering::SeqCst) {
            info!(
                "[任务 {}] 🛑 已取消，进度冻结在 {} / {}",
                job_id,
                tracker.completed_tasks(),
                total_tasks
            );
            self.finalize_cancelled(job_id).await?;
            return Ok(());
        }

        log_main_pass_complete(job_id, &stats, total_tasks);

        // ========== 第 4 步：重分配（补差，不动计数器） ==========
        let report = redistribution::redistribute(
            &self.client,
            &chunks,
            request,
            &accepted,
            {
                let flag = cancelled.clone();
                Arc::new(move || flag.load(Ordering::SeqCst))
            },
        )
        .await;
        let mut all_records = accepted;
        if !report.added.is_empty() {
            info!(
                "[任务 {}] ♻️ 重分配补生成 {} 道题",
                job_id,
                report.added.len()
            );
        }
        all_records.extend(report.added);

        // ========== 第 5 步：持久化测验、提交预留、COMPLETED ==========
        if all_records.is_empty() {
            anyhow::bail!("generation produced no questions for any chunk");
        }

        let job = self
            .job_store
            .load(job_id)
            .await?
            .ok_or_else(|| AppError::job_not_found(job_id.clone()))?;
        let quiz_id = self
            .quiz_store
            .persist_quiz(&job, &all_records, request)
            .await?;

        self.finalize_completed(job_id, &quiz_id).await?;
        log_job_complete(job_id, &quiz_id, all_records.len());
        Ok(())
    }

    /// 主阶段：把 块 × 有效题型 全部跑到终结
    async fn run_main_pass(
        &self,
        job_id: &JobId,
        request: &QuizRequest,
        chunks: &[DocumentChunk],
        active_types: &[(crate::models::question::QuestionType, u32)],
        tracker: &Arc<ProgressTracker>,
        cancelled: &Arc<AtomicBool>,
    ) -> Result<(Vec<QuestionRecord>, RunStats)> {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_tasks.max(1)));

        // 每个块还剩多少个子任务未终结；归零时块计数加一
        let remaining_per_chunk: Arc<HashMap<u32, AtomicUsize>> = Arc::new(
            chunks
                .iter()
                .map(|c| (c.chunk_index, AtomicUsize::new(active_types.len())))
                .collect(),
        );

        let mut handles = Vec::new();
        for chunk in chunks {
            for (question_type, count) in active_types {
                let permit = semaphore.clone().acquire_owned().await?;
                let ctx = TaskCtx::new(
                    job_id.clone(),
                    chunk.chunk_index,
                    *question_type,
                    *count,
                    request.difficulty,
                    request.language.clone(),
                );
                let chunk_content = chunk.content.clone();
                let client = self.client.clone();
                let tracker = tracker.clone();
                let cancelled = cancelled.clone();
                let remaining = remaining_per_chunk.clone();

                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    let flag = cancelled.clone();
                    let cancel_check: crate::models::generation::CancelCheck =
                        Arc::new(move || flag.load(Ordering::SeqCst));

                    // 子任务边界的取消检查
                    if cancelled.load(Ordering::SeqCst) {
                        return (ctx, TaskOutcome::Cancelled { tokens_used: 0 });
                    }

                    let flow = TaskFlow::new(&client);
                    let outcome = flow.run(&ctx, &chunk_content, cancel_check).await;

                    // 终结即计数：成功和放弃都恰好加一，取消不计
                    // （流程层保证每个子任务只返回一次终结结果）
                    match &outcome {
                        TaskOutcome::Success { questions, .. } => {
                            if let Err(e) = tracker.complete_task(questions.len() as u32).await {
                                warn!("[任务 {}] 进度落库失败: {}", ctx.job_id, e);
                            }
                        }
                        TaskOutcome::GaveUp { .. } => {
                            if let Err(e) = tracker.complete_task(0).await {
                                warn!("[任务 {}] 进度落库失败: {}", ctx.job_id, e);
                            }
                        }
                        TaskOutcome::Cancelled { .. } => {}
                    }

                    // 块内全部子任务终结后，块计数加一
                    if !matches!(outcome, TaskOutcome::Cancelled { .. }) {
                        if let Some(counter) = remaining.get(&ctx.chunk_index) {
                            if counter.fetch_sub(1, Ordering::SeqCst) == 1 {
                                if let Err(e) = tracker.complete_chunk().await {
                                    warn!("[任务 {}] 块进度落库失败: {}", ctx.job_id, e);
                                }
                            }
                        }
                    }

                    (ctx, outcome)
                });
                handles.push(handle);
            }
        }

        // 容忍乱序完成：只聚合，不假定顺序
        let mut accepted: Vec<QuestionRecord> = Vec::new();
        let mut stats = RunStats::default();
        for joined in futures::future::join_all(handles).await {
            let (ctx, outcome) = joined?;
            match outcome {
                TaskOutcome::Success {
                    questions,
                    warnings,
                    tokens_used,
                    fallback,
                } => {
                    stats.succeeded += 1;
                    stats.questions += questions.len();
                    stats.tokens_used += tokens_used;
                    if fallback != crate::workflow::FallbackKind::None {
                        info!(
                            "[任务 {}] 块 {} {} 经回退 {:?} 成功",
                            ctx.job_id,
                            ctx.chunk_index,
                            ctx.question_type.name(),
                            fallback
                        );
                    }
                    for w in warnings {
                        warn!("[任务 {}] ⚠️ {}", ctx.job_id, w);
                    }
                    accepted.extend(questions);
                }
                TaskOutcome::GaveUp {
                    last_error,
                    tokens_used,
                    ..
                } => {
                    stats.gave_up += 1;
                    stats.tokens_used += tokens_used;
                    warn!(
                        "[任务 {}] 块 {} {} 放弃: {}",
                        ctx.job_id,
                        ctx.chunk_index,
                        ctx.question_type.name(),
                        last_error
                    );
                }
                TaskOutcome::Cancelled { tokens_used } => {
                    stats.cancelled += 1;
                    stats.tokens_used += tokens_used;
                }
            }
        }

        Ok((accepted, stats))
    }

    /// 后台轮询外部取消标记
    fn spawn_cancel_watcher(
        &self,
        job_id: JobId,
        flag: Arc<AtomicBool>,
    ) -> tokio::task::JoinHandle<()> {
        let store = self.job_store.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
                match store.load(&job_id).await {
                    Ok(Some(job)) if job.cancel_requested => {
                        flag.store(true, Ordering::SeqCst);
                        return;
                    }
                    Ok(Some(_)) => {}
                    _ => return,
                }
            }
        })
    }

    // ========== 终结：行级独占下的终态转换 + 一次性计费决议 ==========
    //
    // 先在独占更新里完成终态转换（已终态的任务转换会失败，
    // 竞争的完成者只有一个能通过），再做幂等的账本调用。

    async fn finalize_completed(&self, job_id: &JobId, quiz_id: &str) -> AppResult<()> {
        let quiz_id = quiz_id.to_string();
        let finalized = self
            .job_store
            .update_job_exclusive(
                job_id,
                Box::new(move |job| job.mark_completed(quiz_id)),
            )
            .await?;

        // 提交预留（按构造幂等）
        if finalized.billing_state == BillingState::Reserved {
            if let Some(reservation_id) = &finalized.billing_reservation_id {
                let key = format!("{}:commit", job_id);
                match self.billing.commit(reservation_id, job_id, &key).await {
                    Ok(()) => {
                        self.job_store
                            .update_job_exclusive(job_id, Box::new(|job| job.billing_commit()))
                            .await?;
                        info!("[任务 {}] 💰 预留已提交", job_id);
                    }
                    Err(e) => {
                        // 提交失败不撤销 COMPLETED，只记录
                        self.record_billing_error(job_id, &e.to_string()).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn finalize_failed(&self, job_id: &JobId, message: &str) -> AppResult<()> {
        let message = message.to_string();
        let finalized = self
            .job_store
            .update_job_exclusive(job_id, Box::new(move |job| job.mark_failed(message)))
            .await?;
        self.release_if_reserved(job_id, &finalized, "job failed")
            .await
    }

    async fn finalize_cancelled(&self, job_id: &JobId) -> AppResult<()> {
        let finalized = self
            .job_store
            .update_job_exclusive(job_id, Box::new(|job| job.mark_cancelled()))
            .await?;
        self.release_if_reserved(job_id, &finalized, "cancelled by user")
            .await
    }

    /// 仅当预留仍是 RESERVED 时释放；COMMITTED 的任务绝不调用 release。
    /// 幂等键由任务 id 派生，失败处理被重试也不会重复释放。
    async fn release_if_reserved(
        &self,
        job_id: &JobId,
        job: &GenerationJob,
        reason: &str,
    ) -> AppResult<()> {
        if job.billing_state != BillingState::Reserved {
            return Ok(());
        }
        let Some(reservation_id) = &job.billing_reservation_id else {
            return Ok(());
        };
        let key = format!("{}:release", job_id);
        match self
            .billing
            .release(reservation_id, reason, job_id, &key)
            .await
        {
            Ok(released) => {
                self.job_store
                    .update_job_exclusive(job_id, Box::new(|job| job.billing_release()))
                    .await?;
                info!("[任务 {}] 💰 预留已释放 ({} token)", job_id, released);
                Ok(())
            }
            Err(e) => {
                // 释放失败不掩盖任务本身的失败，只记录
                warn!("[任务 {}] ⚠️ 预留释放失败: {}", job_id, e);
                self.record_billing_error(job_id, &e.to_string()).await
            }
        }
    }

    async fn record_billing_error(&self, job_id: &JobId, message: &str) -> AppResult<()> {
        let message = message.to_string();
        self.job_store
            .update_job_exclusive(
                job_id,
                Box::new(move |job| {
                    job.last_billing_error = Some(message);
                    Ok(())
                }),
            )
            .await?;
        Ok(())
    }

    // ========== 清扫：卡死任务的强制终结 ==========

    /// 把超时仍未终结的 PENDING/PROCESSING 任务强制置为 FAILED，
    /// 并释放其预留。由外部调度周期性调用。
    pub async fn expire_stale_jobs(&self) -> AppResult<usize> {
        let timeout = ChronoDuration::seconds(self.config.stale_job_timeout_secs);
        let cutoff = Utc::now() - timeout;
        let mut expired = 0usize;

        for job in self.job_store.list_unfinished().await? {
            let reference = job.started_at.unwrap_or(job.created_at);
            if reference >= cutoff {
                continue;
            }
            warn!(
                "[任务 {}] ⏰ 超时未终结（状态 {}），强制失败",
                job.id,
                job.status.name()
            );
            self.finalize_failed(&job.id, "job exceeded processing timeout")
                .await?;
            expired += 1;
        }

        if expired > 0 {
            info!("🧹 清扫完成，强制终结 {} 个任务", expired);
        }
        Ok(expired)
    }
}

/// 状态机守卫冲突：另一个完成者已经转换过状态
///
/// 这类错误意味着任务已被别人接手或终结，当前 worker 应当退出而不是
/// 把任务改成 FAILED。
fn is_claim_conflict(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<AppError>(),
        Some(AppError::Job(
            crate::error::JobError::InvalidStatusTransition { .. }
                | crate::error::JobError::AlreadyTerminal { .. }
        ))
    )
}

// ========== 日志辅助函数 ==========

fn log_job_start(job_id: &JobId, job: &GenerationJob) {
    info!("{}", "=".repeat(60));
    info!("🚀 [任务 {}] 开始处理", job_id);
    info!("📄 文档: {}", job.document_id);
    info!("👤 用户: {}", job.user_id);
    info!(
        "💰 计费状态: {} (预估 {} token)",
        job.billing_state.name(),
        job.billing_estimated_tokens
    );
    info!("{}", "=".repeat(60));
}

fn log_tasks_dispatched(job_id: &JobId, chunks: u32, types: usize, total_tasks: u32) {
    info!(
        "[任务 {}] 📋 分解完成: {} 块 × {} 题型 = {} 个子任务",
        job_id, chunks, types, total_tasks
    );
}

fn log_main_pass_complete(job_id: &JobId, stats: &RunStats, total_tasks: u32) {
    info!("\n[任务 {}] {}", job_id, "─".repeat(40));
    info!(
        "[任务 {}] ✓ 主阶段完成: 成功 {}, 放弃 {}, 共 {} 个子任务",
        job_id, stats.succeeded, stats.gave_up, total_tasks
    );
    info!(
        "[任务 {}] 📊 产出 {} 道题, 消耗 {} token",
        job_id, stats.questions, stats.tokens_used
    );
}

fn log_job_complete(job_id: &JobId, quiz_id: &str, question_count: usize) {
    info!("{}", "=".repeat(60));
    info!(
        "✅ [任务 {}] 完成，测验 {} 共 {} 道题",
        job_id, quiz_id, question_count
    );
    info!("{}", "=".repeat(60));
}
