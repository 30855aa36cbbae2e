//! Shared types, error model, and configuration for chatkb.
//!
//! This crate is the foundation depended on by all other chatkb crates.
//! It provides:
//! - [`ChatKbError`], the unified error type
//! - Domain types ([`Category`], [`CandidateItem`], [`KnowledgeItem`], [`KnowledgeBase`])
//! - Configuration ([`AppConfig`], runtime settings, config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BatchSettings, BatchingConfig, DateOrder, DedupConfig, DedupSettings,
    ExtractionConfig, ExtractionSettings, FilterConfig, FilterSettings, OutputConfig,
    ParsingConfig, config_dir, config_file_path, init_config, init_config_at, load_config,
    load_config_from, resolve_api_key,
};
pub use error::{ChatKbError, Result};
pub use types::{CandidateItem, Category, KnowledgeBase, KnowledgeItem};
