//! Chat export handling: parsing, noise filtering, anonymization, batching.
//!
//! The stages run in that order and each consumes the previous stage's
//! output type:
//! [`RawMessage`] → [`FilteredMessage`] → [`AnonymizedMessage`] → [`Batch`].

pub mod anonymizer;
pub mod batcher;
pub mod filter;
pub mod parser;

pub use anonymizer::{AnonymizedMessage, Anonymizer};
pub use batcher::{BULLET, BULLET_OVERHEAD, Batch, make_batches};
pub use filter::{FilteredMessage, NoiseKind, Verdict, classify, filter_messages};
pub use parser::{ExportParser, RawMessage, combine, parse_export, parse_exports, source_name};
