//! End-to-end `run` pipeline: exports → parse → filter → anonymize → batch →
//! extract → dedup → publish.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use chatkb_chat::{Anonymizer, Batch, filter_messages, make_batches, parse_exports};
use chatkb_extraction::{BatchOutcome, BatchProgress, ExtractionService, extract_all};
use chatkb_shared::{
    AppConfig, BatchSettings, Category, ChatKbError, DateOrder, DedupSettings,
    ExtractionSettings, FilterSettings, KnowledgeBase, Result,
};

use crate::dedup::deduplicate;
use crate::publish::publish;

/// Settings for one pipeline run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub date_order: DateOrder,
    pub filter: FilterSettings,
    pub batching: BatchSettings,
    pub extraction: ExtractionSettings,
    pub dedup: DedupSettings,
    /// Where the knowledge file is published.
    pub output: PathBuf,
}

impl TryFrom<&AppConfig> for RunConfig {
    type Error = ChatKbError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            date_order: config.parsing.date_order,
            filter: FilterSettings::from(config),
            batching: BatchSettings::from(config),
            extraction: ExtractionSettings::try_from(config)?,
            dedup: DedupSettings::from(config),
            output: PathBuf::from(&config.output.path),
        })
    }
}

/// Result of a completed run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub files: usize,
    pub messages_parsed: usize,
    /// Messages that survived filtering and anonymization.
    pub messages_kept: usize,
    pub batches: usize,
    pub batches_skipped: usize,
    pub batches_cancelled: usize,
    pub candidates: usize,
    pub items: usize,
    /// Item count per populated category, in display order.
    pub per_category: Vec<(Category, usize)>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub output: PathBuf,
    /// False when every attempted batch failed and the previous file was kept.
    pub published: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

/// Counts from a dry run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preview {
    pub files: usize,
    pub messages_parsed: usize,
    pub messages_kept: usize,
    pub batches: usize,
    /// Rendered size of the largest batch, in chars.
    pub largest_batch: usize,
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called as each batch's outcome is collected.
    fn batch_done(&self, current: usize, total: usize, detail: &str);
    /// Called when the pipeline completes.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn batch_done(&self, _current: usize, _total: usize, _detail: &str) {}
    fn done(&self, _report: &RunReport) {}
}

/// Forwards extraction progress to a [`ProgressReporter`].
struct BatchProgressAdapter<'a>(&'a dyn ProgressReporter);

impl BatchProgress for BatchProgressAdapter<'_> {
    fn batch_done(&self, current: usize, total: usize, outcome: &BatchOutcome) {
        let detail = match outcome {
            BatchOutcome::Extracted(items) => format!("{} items", items.len()),
            BatchOutcome::Skipped { .. } => "skipped".to_string(),
            BatchOutcome::Cancelled => "cancelled".to_string(),
        };
        self.0.batch_done(current, total, &detail);
    }
}

// ---------------------------------------------------------------------------
// Shared front half
// ---------------------------------------------------------------------------

struct Prepared {
    messages_parsed: usize,
    messages_kept: usize,
    batches: Vec<Batch>,
}

fn prepare(config: &RunConfig, inputs: &[PathBuf], progress: &dyn ProgressReporter) -> Result<Prepared> {
    if inputs.is_empty() {
        return Err(ChatKbError::config("no chat export files given"));
    }

    progress.phase("Parsing exports");
    let raw = parse_exports(inputs, config.date_order)?;
    let messages_parsed = raw.len();

    // Everyone who posted, including senders whose messages are all noise.
    let roster: BTreeSet<String> = raw.iter().map(|m| m.sender.clone()).collect();

    progress.phase("Filtering noise");
    let filtered = filter_messages(raw, &config.filter);

    progress.phase("Anonymizing");
    let anonymizer = Anonymizer::with_roster(roster.iter().map(String::as_str));
    let anonymized = anonymizer.anonymize_all(filtered);
    let messages_kept = anonymized.len();

    let batches = make_batches(anonymized, &config.batching);

    info!(
        files = inputs.len(),
        messages_parsed,
        messages_kept,
        senders = roster.len(),
        batches = batches.len(),
        "exports prepared"
    );

    Ok(Prepared {
        messages_parsed,
        messages_kept,
        batches,
    })
}

/// Parse, filter, anonymize and batch without calling the service.
#[instrument(skip_all, fields(files = inputs.len()))]
pub fn preview(config: &RunConfig, inputs: &[PathBuf]) -> Result<Preview> {
    let prepared = prepare(config, inputs, &SilentProgress)?;
    Ok(Preview {
        files: inputs.len(),
        messages_parsed: prepared.messages_parsed,
        messages_kept: prepared.messages_kept,
        batches: prepared.batches.len(),
        largest_batch: prepared.batches.iter().map(Batch::size).max().unwrap_or(0),
    })
}

/// Run the full pipeline and publish the knowledge file.
///
/// Skipped batches do not fail the run. When `cancel` fires, batches that
/// have not started are dropped and whatever completed is still published.
/// If batches were skipped and none succeeded, the existing output is left
/// in place rather than replaced with an empty file.
#[instrument(skip_all, fields(files = inputs.len(), output = %config.output.display()))]
pub async fn run<S: ExtractionService>(
    config: &RunConfig,
    inputs: &[PathBuf],
    service: Arc<S>,
    cancel: watch::Receiver<bool>,
    progress: &dyn ProgressReporter,
) -> Result<RunReport> {
    let start = Instant::now();
    let run_id = Uuid::now_v7();
    info!(%run_id, "starting run");

    let prepared = prepare(config, inputs, progress)?;
    let batch_count = prepared.batches.len();

    progress.phase("Extracting knowledge");
    let summary = extract_all(
        service,
        prepared.batches,
        &config.extraction,
        cancel.clone(),
        &BatchProgressAdapter(progress),
    )
    .await;

    let batches_extracted = summary.extracted();
    let batches_skipped = summary.skipped();
    let batches_cancelled = summary.cancelled();
    let tokens_in = summary.tokens_in();
    let tokens_out = summary.tokens_out();
    let candidates = summary.into_candidates();
    let candidate_count = candidates.len();

    progress.phase("Deduplicating");
    let items = deduplicate(candidates, &config.dedup);

    let kb = KnowledgeBase::new(items, Utc::now());
    let per_category: Vec<(Category, usize)> = kb
        .categories()
        .iter()
        .map(|c| (*c, kb.count_in(*c)))
        .collect();

    let published = batches_extracted > 0 || batches_skipped == 0;
    if published {
        progress.phase("Publishing");
        publish(&config.output, &kb)?;
    } else {
        warn!(
            skipped = batches_skipped,
            output = %config.output.display(),
            "no batch was extracted, keeping the existing output"
        );
    }

    let report = RunReport {
        run_id,
        files: inputs.len(),
        messages_parsed: prepared.messages_parsed,
        messages_kept: prepared.messages_kept,
        batches: batch_count,
        batches_skipped,
        batches_cancelled,
        candidates: candidate_count,
        items: kb.total(),
        per_category,
        tokens_in,
        tokens_out,
        output: config.output.clone(),
        published,
        cancelled: batches_cancelled > 0 || *cancel.borrow(),
        elapsed: start.elapsed(),
    };

    info!(
        %run_id,
        items = report.items,
        candidates = report.candidates,
        skipped = report.batches_skipped,
        published = report.published,
        cancelled = report.cancelled,
        elapsed_ms = report.elapsed.as_millis() as u64,
        "run complete"
    );

    progress.done(&report);
    Ok(report)
}
