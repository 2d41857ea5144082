//! 编排层 - 任务生命周期与子任务调度

pub mod job_runner;
pub mod redistribution;

pub use job_runner::JobRunner;
pub use redistribution::{redistribute, RedistributionReport};
