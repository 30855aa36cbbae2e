//! Core pipeline orchestration for chatkb.
//!
//! This crate ties together chat parsing, extraction, deduplication and
//! publishing into the end-to-end `run` workflow.

pub mod dedup;
pub mod pipeline;
pub mod publish;

pub use dedup::{deduplicate, item_id, similarity};
pub use pipeline::{Preview, ProgressReporter, RunConfig, RunReport, SilentProgress, preview, run};
pub use publish::{load_published, publish};
