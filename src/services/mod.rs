//! 业务能力层

pub mod generation_client;
pub mod model_invoker;
pub mod response_parser;

pub use generation_client::{backoff_delay_ms, StructuredGenerationClient};
pub use model_invoker::{
    classify_model_error, ModelCallError, ModelCallRequest, ModelCallResponse, ModelInvoker,
    OpenAiInvoker,
};
