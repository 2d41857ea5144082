//! 工具层 - 日志与通用辅助

pub mod logging;

pub use logging::truncate_text;
