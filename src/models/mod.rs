//! 领域模型

pub mod generation;
pub mod job;
pub mod question;

pub use generation::{CancelCheck, DocumentChunk, GenerationRequest, GenerationResult, QuizRequest};
pub use job::{BillingState, GenerationJob, JobId, JobStatus};
pub use question::{Difficulty, QuestionRecord, QuestionType};
