//! 内存版协作方实现
//!
//! 测试与演示二进制使用。`InMemoryJobStore` 的原子自增和行级独占
//! 都由同一把 Mutex 保证，与真实存储的语义一致。

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

use crate::error::{AppResult, JobError, StorageError};
use crate::models::generation::{DocumentChunk, QuizRequest};
use crate::models::job::{GenerationJob, JobId};
use crate::models::question::QuestionRecord;
use crate::stores::{BillingLedger, DocumentSource, JobStore, ProgressDelta, QuizPersistence};

/// 内存任务存储
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<JobId, GenerationJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接插入（测试布置数据用）
    pub async fn insert(&self, job: GenerationJob) {
        self.jobs.lock().await.insert(job.id.clone(), job);
    }

    /// 外部取消入口：设置协作式取消标记
    pub async fn request_cancel(&self, job_id: &JobId) -> AppResult<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StorageError::NotFound { id: job_id.clone() })?;
        job.cancel_requested = true;
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn load(&self, job_id: &JobId) -> AppResult<Option<GenerationJob>> {
        Ok(self.jobs.lock().await.get(job_id).cloned())
    }

    async fn save(&self, job: &mut GenerationJob) -> AppResult<()> {
        let mut jobs = self.jobs.lock().await;
        let stored = jobs
            .get(&job.id)
            .ok_or_else(|| StorageError::NotFound { id: job.id.clone() })?;
        if stored.version != job.version {
            return Err(StorageError::VersionConflict {
                job_id: job.id.clone(),
                expected: job.version,
                found: stored.version,
            }
            .into());
        }
        // 版本号只保护整实体字段；计数器以存储中的值为准，
        // 避免 save 覆盖并发的自增结果
        job.version += 1;
        job.completed_tasks = stored.completed_tasks;
        job.processed_chunks = stored.processed_chunks;
        job.total_questions_generated = stored.total_questions_generated;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn increment_progress(&self, job_id: &JobId, delta: ProgressDelta) -> AppResult<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StorageError::NotFound { id: job_id.clone() })?;

        let new_completed = job.completed_tasks + delta.completed_tasks;
        if let Some(total) = job.total_tasks {
            if new_completed > total {
                return Err(JobError::CounterInvariantViolated {
                    job_id: job_id.clone(),
                    completed: new_completed,
                    total,
                }
                .into());
            }
        }
        job.completed_tasks = new_completed;
        job.processed_chunks += delta.processed_chunks;
        job.total_questions_generated += delta.questions_generated;
        Ok(())
    }

    async fn update_job_exclusive(
        &self,
        job_id: &JobId,
        mutator: Box<dyn for<'a> FnOnce(&'a mut GenerationJob) -> AppResult<()> + Send>,
    ) -> AppResult<GenerationJob> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| StorageError::NotFound { id: job_id.clone() })?;
        mutator(job)?;
        job.version += 1;
        Ok(job.clone())
    }

    async fn list_unfinished(&self) -> AppResult<Vec<GenerationJob>> {
        Ok(self
            .jobs
            .lock()
            .await
            .values()
            .filter(|j| !j.status.is_terminal())
            .cloned()
            .collect())
    }
}

/// 内存文档来源
#[derive(Default)]
pub struct InMemoryDocumentSource {
    documents: Mutex<HashMap<String, Vec<DocumentChunk>>>,
}

impl InMemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_document(&self, document_id: impl Into<String>, chunks: Vec<DocumentChunk>) {
        self.documents.lock().await.insert(document_id.into(), chunks);
    }
}

#[async_trait]
impl DocumentSource for InMemoryDocumentSource {
    async fn fetch_chunks(&self, document_id: &str) -> AppResult<Vec<DocumentChunk>> {
        self.documents
            .lock()
            .await
            .get(document_id)
            .cloned()
            .ok_or_else(|| {
                StorageError::NotFound {
                    id: document_id.to_string(),
                }
                .into()
            })
    }
}

/// 预留条目
#[derive(Debug, Clone)]
struct Reservation {
    estimated_tokens: u64,
    committed: bool,
    released: bool,
}

/// 内存计费账本，按幂等键去重
#[derive(Default)]
pub struct InMemoryBillingLedger {
    reservations: Mutex<HashMap<String, Reservation>>,
    applied_keys: Mutex<HashSet<String>>,
    commit_calls: AtomicU64,
    release_calls: AtomicU64,
}

impl InMemoryBillingLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 实际生效的 commit 次数（幂等重放不计）
    pub fn commit_calls(&self) -> u64 {
        self.commit_calls.load(Ordering::SeqCst)
    }

    /// 实际生效的 release 次数（幂等重放不计）
    pub fn release_calls(&self) -> u64 {
        self.release_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BillingLedger for InMemoryBillingLedger {
    async fn reserve(&self, estimated_tokens: u64) -> AppResult<String> {
        let reservation_id = uuid::Uuid::new_v4().to_string();
        self.reservations.lock().await.insert(
            reservation_id.clone(),
            Reservation {
                estimated_tokens,
                committed: false,
                released: false,
            },
        );
        Ok(reservation_id)
    }

    async fn commit(
        &self,
        reservation_id: &str,
        _job_id: &JobId,
        idempotency_key: &str,
    ) -> AppResult<()> {
        // 同一幂等键重放直接成功
        if !self
            .applied_keys
            .lock()
            .await
            .insert(idempotency_key.to_string())
        {
            return Ok(());
        }
        let mut reservations = self.reservations.lock().await;
        let reservation = reservations.get_mut(reservation_id).ok_or_else(|| {
            crate::error::BillingError::ReservationNotFound {
                reservation_id: reservation_id.to_string(),
            }
        })?;
        reservation.committed = true;
        self.commit_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(
        &self,
        reservation_id: &str,
        _reason: &str,
        _job_id: &JobId,
        idempotency_key: &str,
    ) -> AppResult<u64> {
        if !self
            .applied_keys
            .lock()
            .await
            .insert(idempotency_key.to_string())
        {
            return Ok(0);
        }
        let mut reservations = self.reservations.lock().await;
        let reservation = reservations.get_mut(reservation_id).ok_or_else(|| {
            crate::error::BillingError::ReservationNotFound {
                reservation_id: reservation_id.to_string(),
            }
        })?;
        reservation.released = true;
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        Ok(reservation.estimated_tokens)
    }
}

/// 内存测验存储
#[derive(Default)]
pub struct InMemoryQuizStore {
    quizzes: Mutex<HashMap<String, Vec<QuestionRecord>>>,
}

impl InMemoryQuizStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn question_count(&self, quiz_id: &str) -> usize {
        self.quizzes
            .lock()
            .await
            .get(quiz_id)
            .map(|q| q.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl QuizPersistence for InMemoryQuizStore {
    async fn persist_quiz(
        &self,
        _job: &GenerationJob,
        records: &[QuestionRecord],
        _request: &QuizRequest,
    ) -> AppResult<String> {
        let quiz_id = uuid::Uuid::new_v4().to_string();
        self.quizzes
            .lock()
            .await
            .insert(quiz_id.clone(), records.to_vec());
        Ok(quiz_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_detects_version_conflict() {
        let store = InMemoryJobStore::new();
        let job = GenerationJob::new("u", "d");
        let id = job.id.clone();
        store.insert(job).await;

        let mut a = store.load(&id).await.unwrap().unwrap();
        let mut b = store.load(&id).await.unwrap().unwrap();
        a.current_status_message = "a".to_string();
        store.save(&mut a).await.unwrap();
        b.current_status_message = "b".to_string();
        let err = store.save(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("version conflict"));
    }

    #[tokio::test]
    async fn test_update_job_exclusive_applies_mutator_and_bumps_version() {
        let store = InMemoryJobStore::new();
        let job = GenerationJob::new("u", "d");
        let id = job.id.clone();
        let version_before = job.version;
        store.insert(job).await;

        let updated = store
            .update_job_exclusive(
                &id,
                Box::new(|job| {
                    job.current_status_message = "独占修改".to_string();
                    Ok(())
                }),
            )
            .await
            .unwrap();
        assert_eq!(updated.current_status_message, "独占修改");
        assert_eq!(updated.version, version_before + 1);

        // 闭包报错时不推进版本
        let err = store
            .update_job_exclusive(&id, Box::new(|_| Err(crate::error::AppError::invalid_input("拒绝"))))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("拒绝"));
        let reloaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(reloaded.version, version_before + 1);
    }

    #[tokio::test]
    async fn test_save_does_not_clobber_counters() {
        let store = InMemoryJobStore::new();
        let mut job = GenerationJob::new("u", "d");
        job.mark_processing(2, 4).unwrap();
        let id = job.id.clone();
        store.insert(job).await;

        // save 持有旧计数器快照的同时发生自增
        let mut snapshot = store.load(&id).await.unwrap().unwrap();
        store
            .increment_progress(
                &id,
                ProgressDelta {
                    completed_tasks: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        snapshot.current_status_message = "更新状态".to_string();
        store.save(&mut snapshot).await.unwrap();

        let reloaded = store.load(&id).await.unwrap().unwrap();
        assert_eq!(reloaded.completed_tasks, 2);
        assert_eq!(reloaded.current_status_message, "更新状态");
    }

    #[tokio::test]
    async fn test_increment_rejects_counter_overflow() {
        let store = InMemoryJobStore::new();
        let mut job = GenerationJob::new("u", "d");
        job.mark_processing(1, 1).unwrap();
        let id = job.id.clone();
        store.insert(job).await;

        store
            .increment_progress(
                &id,
                ProgressDelta {
                    completed_tasks: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let err = store
            .increment_progress(
                &id,
                ProgressDelta {
                    completed_tasks: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exceed"));
    }

    #[tokio::test]
    async fn test_ledger_idempotency() {
        let ledger = InMemoryBillingLedger::new();
        let reservation_id = ledger.reserve(1000).await.unwrap();
        let job_id = "job-1".to_string();

        let released = ledger
            .release(&reservation_id, "failed", &job_id, "job-1:release")
            .await
            .unwrap();
        assert_eq!(released, 1000);
        // 同一幂等键重放不再生效
        let replay = ledger
            .release(&reservation_id, "failed", &job_id, "job-1:release")
            .await
            .unwrap();
        assert_eq!(replay, 0);
        assert_eq!(ledger.release_calls(), 1);
    }
}
