//! Knowledge extraction: turns batches into candidate items via an LLM service.

pub mod anthropic;
pub mod prompt;
pub mod response;
pub mod runner;
pub mod service;

pub use anthropic::AnthropicService;
pub use prompt::{build_request, system_prompt};
pub use response::{normalize_tag, parse_reply};
pub use runner::{
    BatchOutcome, BatchProgress, BatchReport, ExtractionSummary, SilentBatchProgress,
    extract_all, extract_batch,
};
pub use service::{Completion, CompletionRequest, ExtractionService};
