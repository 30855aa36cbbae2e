//! Bounded-concurrency extraction over all batches, with retry and cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, instrument, warn};

use chatkb_chat::Batch;
use chatkb_shared::{CandidateItem, ChatKbError, ExtractionSettings};

use crate::prompt::build_request;
use crate::response::parse_reply;
use crate::service::ExtractionService;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// What happened to one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    Extracted(Vec<CandidateItem>),
    Skipped { reason: String },
    Cancelled,
}

/// Outcome of one batch plus the work it took.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub index: usize,
    pub outcome: BatchOutcome,
    pub attempts: u32,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl BatchReport {
    fn new(index: usize) -> Self {
        Self {
            index,
            outcome: BatchOutcome::Cancelled,
            attempts: 0,
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    fn finish(mut self, outcome: BatchOutcome) -> Self {
        self.outcome = outcome;
        self
    }
}

/// All batch reports of a run, in batch order.
#[derive(Debug, Clone, Default)]
pub struct ExtractionSummary {
    pub reports: Vec<BatchReport>,
}

impl ExtractionSummary {
    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, BatchOutcome::Skipped { .. }))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|o| matches!(o, BatchOutcome::Cancelled))
    }

    pub fn extracted(&self) -> usize {
        self.count(|o| matches!(o, BatchOutcome::Extracted(_)))
    }

    pub fn tokens_in(&self) -> u64 {
        self.reports.iter().map(|r| r.tokens_in).sum()
    }

    pub fn tokens_out(&self) -> u64 {
        self.reports.iter().map(|r| r.tokens_out).sum()
    }

    /// Candidates from every extracted batch, in batch order.
    pub fn into_candidates(self) -> Vec<CandidateItem> {
        self.reports
            .into_iter()
            .flat_map(|r| match r.outcome {
                BatchOutcome::Extracted(items) => items,
                _ => Vec::new(),
            })
            .collect()
    }

    fn count(&self, pred: impl Fn(&BatchOutcome) -> bool) -> usize {
        self.reports.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// Receives a call as each batch's outcome is collected.
pub trait BatchProgress: Send + Sync {
    fn batch_done(&self, current: usize, total: usize, outcome: &BatchOutcome);
}

/// No-op batch progress.
pub struct SilentBatchProgress;

impl BatchProgress for SilentBatchProgress {
    fn batch_done(&self, _current: usize, _total: usize, _outcome: &BatchOutcome) {}
}

// ---------------------------------------------------------------------------
// Single batch
// ---------------------------------------------------------------------------

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Sleep for `delay`, returning `true` if cancellation fired first.
async fn sleep_or_cancel(delay: Duration, cancel: &watch::Receiver<bool>) -> bool {
    if is_cancelled(cancel) {
        return true;
    }
    let mut rx = cancel.clone();
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            changed = rx.changed() => {
                if changed.is_err() {
                    // Sender dropped: nobody can cancel any more.
                    (&mut sleep).await;
                    return false;
                }
                if is_cancelled(&rx) {
                    return true;
                }
            }
        }
    }
}

/// Run one batch through the service, retrying transient failures.
pub async fn extract_batch<S: ExtractionService>(
    service: &S,
    batch: &Batch,
    settings: &ExtractionSettings,
    cancel: &watch::Receiver<bool>,
) -> BatchReport {
    let mut report = BatchReport::new(batch.index());
    if is_cancelled(cancel) {
        return report.finish(BatchOutcome::Cancelled);
    }

    let request = build_request(batch);
    let max_attempts = settings.max_attempts.max(1);
    let mut last_error: Option<ChatKbError> = None;

    for attempt in 1..=max_attempts {
        if attempt > 1 {
            let delay = settings.backoff_for(attempt - 1);
            debug!(batch = batch.index(), attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
            if sleep_or_cancel(delay, cancel).await {
                return report.finish(BatchOutcome::Cancelled);
            }
        }

        report.attempts = attempt;
        match service.complete(request.clone()).await {
            Ok(completion) => {
                report.tokens_in += completion.tokens_in;
                report.tokens_out += completion.tokens_out;
                return match parse_reply(&completion.text) {
                    Ok(items) => {
                        debug!(batch = batch.index(), items = items.len(), "batch extracted");
                        report.finish(BatchOutcome::Extracted(items))
                    }
                    Err(e) => {
                        warn!(batch = batch.index(), error = %e, "skipping batch");
                        report.finish(BatchOutcome::Skipped { reason: e.to_string() })
                    }
                };
            }
            Err(e) if e.is_transient() => {
                debug!(batch = batch.index(), attempt, error = %e, "transient extraction failure");
                last_error = Some(e);
            }
            Err(e) => {
                warn!(batch = batch.index(), error = %e, "skipping batch");
                return report.finish(BatchOutcome::Skipped { reason: e.to_string() });
            }
        }
    }

    let reason = match last_error {
        Some(e) => format!("gave up after {max_attempts} attempts: {e}"),
        None => format!("gave up after {max_attempts} attempts"),
    };
    warn!(batch = batch.index(), %reason, "skipping batch");
    report.finish(BatchOutcome::Skipped { reason })
}

// ---------------------------------------------------------------------------
// All batches
// ---------------------------------------------------------------------------

/// Extract every batch with at most `settings.concurrency` requests in flight.
///
/// Reports come back in batch order regardless of completion order.
#[instrument(skip_all, fields(batches = batches.len(), concurrency = settings.concurrency))]
pub async fn extract_all<S: ExtractionService>(
    service: Arc<S>,
    batches: Vec<Batch>,
    settings: &ExtractionSettings,
    cancel: watch::Receiver<bool>,
    progress: &dyn BatchProgress,
) -> ExtractionSummary {
    let total = batches.len();
    let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));

    let mut handles = Vec::with_capacity(total);
    for batch in batches {
        let service = Arc::clone(&service);
        let sem = Arc::clone(&semaphore);
        let settings = settings.clone();
        let cancel = cancel.clone();
        let index = batch.index();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = sem.acquire().await else {
                return BatchReport::new(batch.index());
            };
            extract_batch(service.as_ref(), &batch, &settings, &cancel).await
        });
        handles.push((index, handle));
    }

    let mut reports = Vec::with_capacity(total);
    for (done, (index, handle)) in handles.into_iter().enumerate() {
        let report = match handle.await {
            Ok(report) => report,
            Err(e) => {
                warn!(batch = index, error = %e, "extraction task failed");
                BatchReport::new(index).finish(BatchOutcome::Skipped {
                    reason: format!("task failed: {e}"),
                })
            }
        };
        progress.batch_done(done + 1, total, &report.outcome);
        reports.push(report);
    }

    let summary = ExtractionSummary { reports };
    info!(
        extracted = summary.extracted(),
        skipped = summary.skipped(),
        cancelled = summary.cancelled(),
        tokens_in = summary.tokens_in(),
        tokens_out = summary.tokens_out(),
        "extraction finished"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chatkb_chat::{Anonymizer, filter_messages, make_batches, parse_export};
    use chatkb_shared::{
        AppConfig, BatchSettings, Category, DateOrder, FilterSettings, Result,
    };

    use crate::service::{Completion, CompletionRequest};

    /// Replies from a script, in call order; the last entry repeats.
    struct ScriptedService {
        script: Mutex<VecDeque<Result<String>>>,
        calls: AtomicUsize,
    }

    impl ScriptedService {
        fn new(script: Vec<Result<String>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    fn clone_result(r: &Result<String>) -> Result<String> {
        match r {
            Ok(s) => Ok(s.clone()),
            Err(ChatKbError::ServiceTransient(m)) => Err(ChatKbError::ServiceTransient(m.clone())),
            Err(e) => Err(ChatKbError::ServicePermanent(e.to_string())),
        }
    }

    impl ExtractionService for ScriptedService {
        async fn complete(&self, _request: CompletionRequest) -> Result<Completion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front().unwrap()
                } else {
                    clone_result(script.front().unwrap())
                }
            };
            next.map(|text| Completion {
                text,
                tokens_in: 10,
                tokens_out: 2,
            })
        }
    }

    fn fast_settings() -> ExtractionSettings {
        let mut app = AppConfig::default();
        app.extraction.backoff_base_ms = 1;
        app.extraction.backoff_max_ms = 5;
        app.extraction.max_attempts = 3;
        app.extraction.concurrency = 2;
        ExtractionSettings::try_from(&app).unwrap()
    }

    fn batches(count: usize) -> Vec<Batch> {
        let text: String = (0..count)
            .map(|i| format!("[1/15/24, 9:{i:02} AM] Ana: recommendation number {i} for the swim class at the Y\n"))
            .collect();
        let raw = parse_export(&text, "group", DateOrder::Mdy);
        let roster: Vec<String> = raw.iter().map(|m| m.sender.clone()).collect();
        let anon = Anonymizer::with_roster(roster.iter().map(String::as_str));
        let kept = anon.anonymize_all(filter_messages(raw, &FilterSettings::default()));
        make_batches(
            kept,
            &BatchSettings {
                max_messages: 1,
                max_chars: 1_000,
            },
        )
    }

    const ONE_ITEM: &str = r#"[{"category":"Baby Classes & Activities","title":"Swim class at the Y","content":"Good swim class","tags":["swim"]}]"#;

    fn no_cancel() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[tokio::test]
    async fn transient_failure_then_success() {
        let service = ScriptedService::new(vec![
            Err(ChatKbError::ServiceTransient("HTTP 429".into())),
            Ok(ONE_ITEM.to_string()),
        ]);
        let batch = &batches(1)[0];
        let (_tx, rx) = no_cancel();

        let report = extract_batch(&service, batch, &fast_settings(), &rx).await;
        assert_eq!(report.attempts, 2);
        assert_eq!(service.calls(), 2);
        match report.outcome {
            BatchOutcome::Extracted(items) => {
                assert_eq!(items.len(), 1);
                assert_eq!(items[0].category, Category::ClassesActivities);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(report.tokens_in, 10);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let service = ScriptedService::new(vec![Err(ChatKbError::ServicePermanent("HTTP 400".into()))]);
        let batch = &batches(1)[0];
        let (_tx, rx) = no_cancel();

        let report = extract_batch(&service, batch, &fast_settings(), &rx).await;
        assert_eq!(service.calls(), 1);
        assert!(matches!(report.outcome, BatchOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let service = ScriptedService::new(vec![Err(ChatKbError::ServiceTransient("HTTP 503".into()))]);
        let batch = &batches(1)[0];
        let (_tx, rx) = no_cancel();

        let report = extract_batch(&service, batch, &fast_settings(), &rx).await;
        assert_eq!(service.calls(), 3);
        match report.outcome {
            BatchOutcome::Skipped { reason } => assert!(reason.contains("3 attempts")),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_reply_skips_batch() {
        let service = ScriptedService::new(vec![Ok("not json at all".into())]);
        let batch = &batches(1)[0];
        let (_tx, rx) = no_cancel();

        let report = extract_batch(&service, batch, &fast_settings(), &rx).await;
        assert_eq!(service.calls(), 1);
        assert!(matches!(report.outcome, BatchOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn extract_all_keeps_batch_order_and_continues_past_failures() {
        let service = Arc::new(ScriptedService::new(vec![
            Ok(ONE_ITEM.to_string()),
            Err(ChatKbError::ServicePermanent("HTTP 400".into())),
            Ok(ONE_ITEM.to_string()),
        ]));
        let (_tx, rx) = no_cancel();
        let mut settings = fast_settings();
        settings.concurrency = 1;

        let summary = extract_all(service, batches(3), &settings, rx, &SilentBatchProgress).await;
        let indexes: Vec<usize> = summary.reports.iter().map(|r| r.index).collect();
        assert_eq!(indexes, [0, 1, 2]);
        assert_eq!(summary.skipped(), 1);
        assert_eq!(summary.extracted(), 2);
        assert_eq!(summary.into_candidates().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_before_start_makes_no_calls() {
        let service = Arc::new(ScriptedService::new(vec![Ok(ONE_ITEM.to_string())]));
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();

        let summary =
            extract_all(Arc::clone(&service), batches(4), &fast_settings(), rx, &SilentBatchProgress)
                .await;
        assert_eq!(summary.cancelled(), 4);
        assert_eq!(service.calls(), 0);
        assert!(summary.into_candidates().is_empty());
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let service = ScriptedService::new(vec![Err(ChatKbError::ServiceTransient("HTTP 529".into()))]);
        let batch = &batches(1)[0];
        let (tx, rx) = watch::channel(false);
        let mut settings = fast_settings();
        settings.backoff_base = Duration::from_secs(60);
        settings.backoff_max = Duration::from_secs(60);

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
            tx
        });

        let report = extract_batch(&service, batch, &settings, &rx).await;
        assert_eq!(report.outcome, BatchOutcome::Cancelled);
        assert_eq!(service.calls(), 1);
        drop(canceller.await.unwrap());
    }

    /// Holds each request open briefly and records the most seen at once.
    #[derive(Default)]
    struct SlowService {
        current: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ExtractionService for SlowService {
        async fn complete(&self, _request: CompletionRequest) -> Result<Completion> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Ok(Completion {
                text: "[]".into(),
                tokens_in: 1,
                tokens_out: 1,
            })
        }
    }

    #[tokio::test]
    async fn in_flight_requests_are_bounded() {
        let service = Arc::new(SlowService::default());
        let (_tx, rx) = no_cancel();
        let mut settings = fast_settings();
        settings.concurrency = 3;

        let summary =
            extract_all(Arc::clone(&service), batches(12), &settings, rx, &SilentBatchProgress).await;
        let peak = service.peak.load(Ordering::SeqCst);
        assert!(peak > 0 && peak <= 3, "peak in-flight was {peak}");
        assert_eq!(summary.extracted(), 12);
    }

    struct CountingProgress(AtomicUsize);

    impl BatchProgress for CountingProgress {
        fn batch_done(&self, current: usize, total: usize, _outcome: &BatchOutcome) {
            assert!(current <= total);
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn progress_sees_every_batch() {
        let service = Arc::new(ScriptedService::new(vec![Ok("[]".into())]));
        let (_tx, rx) = no_cancel();
        let progress = CountingProgress(AtomicUsize::new(0));

        let summary = extract_all(service, batches(5), &fast_settings(), rx, &progress).await;
        assert_eq!(progress.0.load(Ordering::SeqCst), 5);
        assert_eq!(summary.extracted(), 5);
        assert_eq!(summary.tokens_in(), 50);
        assert_eq!(summary.tokens_out(), 10);
    }
}
