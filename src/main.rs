use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use quiz_generation::config::Config;
use quiz_generation::models::generation::{DocumentChunk, QuizRequest};
use quiz_generation::models::job::GenerationJob;
use quiz_generation::models::question::{Difficulty, QuestionType};
use quiz_generation::orchestrator::JobRunner;
use quiz_generation::services::{OpenAiInvoker, StructuredGenerationClient};
use quiz_generation::stores::memory::{
    InMemoryBillingLedger, InMemoryDocumentSource, InMemoryJobStore, InMemoryQuizStore,
};
use quiz_generation::stores::{BillingLedger, JobStore};
use quiz_generation::utils::logging;

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    logging::init();

    // 加载配置
    let config = Config::from_env();
    logging::log_startup(config.max_concurrent_tasks);

    // 装配内存存储与模型客户端
    let job_store = Arc::new(InMemoryJobStore::new());
    let document_source = Arc::new(InMemoryDocumentSource::new());
    let quiz_store = Arc::new(InMemoryQuizStore::new());
    let billing = Arc::new(InMemoryBillingLedger::new());

    let invoker = Arc::new(OpenAiInvoker::new(&config));
    let client = Arc::new(StructuredGenerationClient::new(invoker, &config));

    // 演示文档：两个块
    let document_id = "demo-doc".to_string();
    document_source
        .insert_document(
            &document_id,
            vec![
                DocumentChunk {
                    content: "光合作用是植物将光能转化为化学能的过程。".to_string(),
                    chunk_index: 0,
                    chapter: Some("第一章".to_string()),
                    section: None,
                },
                DocumentChunk {
                    content: "细胞呼吸在线粒体中将葡萄糖氧化释放能量。".to_string(),
                    chunk_index: 1,
                    chapter: Some("第一章".to_string()),
                    section: None,
                },
            ],
        )
        .await;

    // 建任务 + 计费预留
    let mut counts = BTreeMap::new();
    counts.insert(QuestionType::MultipleChoice, 3u32);
    counts.insert(QuestionType::TrueFalse, 2u32);
    let request = QuizRequest {
        counts_per_chunk: counts,
        difficulty: Difficulty::Medium,
        language: "zh".to_string(),
    };

    let mut job = GenerationJob::new("user-demo", &document_id);
    let estimated = 2 * 5 * config.tokens_per_question as u64;
    let reservation_id = billing.reserve(estimated).await?;
    let expires_at = chrono::Utc::now() + chrono::Duration::minutes(30);
    job.billing_reserve(reservation_id, estimated, expires_at)?;
    let job_id = job.id.clone();
    job_store.insert(job).await;

    // 跑到终态
    let runner = JobRunner::new(
        job_store.clone(),
        document_source,
        quiz_store.clone(),
        billing,
        client,
        config,
    );
    runner.run(&job_id, &request).await?;

    if let Some(finished) = job_store.load(&job_id).await? {
        info!(
            "任务 {} 终态: {}，计费: {}，进度 {:.1}%",
            finished.id,
            finished.status.name(),
            finished.billing_state.name(),
            finished.progress_percentage()
        );
    }

    Ok(())
}
