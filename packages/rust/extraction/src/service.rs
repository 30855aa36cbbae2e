//! The extraction service seam.

use std::future::Future;

use chatkb_shared::Result;

/// One call to the extraction service: a fixed instruction plus the batch.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
}

/// Raw text reply plus token usage when the service reports it.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Something that can answer an extraction request.
///
/// Implementations classify failures: retryable ones as
/// `ChatKbError::ServiceTransient`, everything else as
/// `ServicePermanent` or `MalformedResponse`.
pub trait ExtractionService: Send + Sync + 'static {
    fn complete(
        &self,
        request: CompletionRequest,
    ) -> impl Future<Output = Result<Completion>> + Send;
}
