//! Application configuration for chatkb.
//!
//! User config lives at `~/.chatkb/chatkb.toml`.
//! CLI flags override config file values, which override defaults.
//! Only the CLI reads the environment; every pipeline stage receives one of
//! the runtime settings structs below.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ChatKbError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "chatkb.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".chatkb";

/// Smallest batch budget that still fits a meaningful message.
const MIN_BATCH_CHARS: usize = 200;

// ---------------------------------------------------------------------------
// Config structs (matching chatkb.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Extraction service settings.
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Export parsing settings.
    #[serde(default)]
    pub parsing: ParsingConfig,

    /// Noise filter thresholds.
    #[serde(default)]
    pub filter: FilterConfig,

    /// Batch sizing.
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Deduplication settings.
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Publish target.
    #[serde(default)]
    pub output: OutputConfig,
}

/// `[extraction]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used for extraction.
    #[serde(default = "default_model")]
    pub model: String,

    /// Service base URL (without the `/v1/messages` path).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Maximum tokens the model may produce per batch.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-request HTTP timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Total attempts per batch, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay; doubles on each retry.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound for a single backoff delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Maximum in-flight extraction requests.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            model: default_model(),
            base_url: default_base_url(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            concurrency: default_concurrency(),
        }
    }
}

fn default_api_key_env() -> String {
    "ANTHROPIC_API_KEY".into()
}
fn default_model() -> String {
    "claude-haiku-4-5-20251001".into()
}
fn default_base_url() -> String {
    "https://api.anthropic.com".into()
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_attempts() -> u32 {
    4
}
fn default_backoff_base_ms() -> u64 {
    1_000
}
fn default_backoff_max_ms() -> u64 {
    30_000
}
fn default_concurrency() -> u32 {
    4
}

/// Order of the day and month fields in export timestamps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateOrder {
    /// `M/D/YY` (US exports).
    #[default]
    Mdy,
    /// `D/M/YY`.
    Dmy,
}

/// `[parsing]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsingConfig {
    #[serde(default)]
    pub date_order: DateOrder,
}

/// `[filter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Messages shorter than this (in chars) are dropped.
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,

    /// Coordination phrases only count as logistics below this length.
    #[serde(default = "default_logistics_max_chars")]
    pub logistics_max_chars: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_chars: default_min_chars(),
            logistics_max_chars: default_logistics_max_chars(),
        }
    }
}

fn default_min_chars() -> usize {
    20
}
fn default_logistics_max_chars() -> usize {
    80
}

/// `[batching]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Maximum messages per batch.
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,

    /// Maximum rendered characters per batch.
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_messages: default_max_messages(),
            max_chars: default_max_chars(),
        }
    }
}

fn default_max_messages() -> usize {
    50
}
fn default_max_chars() -> usize {
    12_000
}

/// `[dedup]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Minimum similarity (0.0–1.0) for two same-category items to merge.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_similarity_threshold() -> f64 {
    0.6
}

/// `[output]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Where the knowledge file is published.
    #[serde(default = "default_output_path")]
    pub path: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_output_path(),
        }
    }
}

fn default_output_path() -> String {
    "web/public/knowledge.json".into()
}

impl AppConfig {
    /// Reject values that would make a stage misbehave.
    pub fn validate(&self) -> Result<()> {
        let ex = &self.extraction;
        if ex.concurrency == 0 {
            return Err(ChatKbError::config("extraction.concurrency must be at least 1"));
        }
        if ex.max_attempts == 0 {
            return Err(ChatKbError::config("extraction.max_attempts must be at least 1"));
        }
        if ex.model.trim().is_empty() {
            return Err(ChatKbError::config("extraction.model must not be empty"));
        }
        parse_base_url(&ex.base_url)?;

        if self.batching.max_messages == 0 {
            return Err(ChatKbError::config("batching.max_messages must be at least 1"));
        }
        if self.batching.max_chars < MIN_BATCH_CHARS {
            return Err(ChatKbError::config(format!(
                "batching.max_chars must be at least {MIN_BATCH_CHARS}"
            )));
        }

        let t = self.dedup.similarity_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(ChatKbError::config(format!(
                "dedup.similarity_threshold must be in (0, 1], got {t}"
            )));
        }
        Ok(())
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw)
        .map_err(|e| ChatKbError::config(format!("invalid extraction.base_url '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ChatKbError::config(format!(
            "extraction.base_url must be http(s), got '{other}'"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Runtime settings (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime extraction settings. The API key is passed separately.
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub model: String,
    pub base_url: Url,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub concurrency: usize,
}

impl TryFrom<&AppConfig> for ExtractionSettings {
    type Error = ChatKbError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        let ex = &config.extraction;
        Ok(Self {
            model: ex.model.clone(),
            base_url: parse_base_url(&ex.base_url)?,
            max_tokens: ex.max_tokens,
            timeout: Duration::from_secs(ex.timeout_secs),
            max_attempts: ex.max_attempts.max(1),
            backoff_base: Duration::from_millis(ex.backoff_base_ms),
            backoff_max: Duration::from_millis(ex.backoff_max_ms),
            concurrency: ex.concurrency.max(1) as usize,
        })
    }
}

impl ExtractionSettings {
    /// Delay before retry number `attempt` (1-based): base × 2^(attempt-1), capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(1u32 << shift);
        delay.min(self.backoff_max)
    }
}

/// Runtime noise filter thresholds.
#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub min_chars: usize,
    pub logistics_max_chars: usize,
}

impl From<&AppConfig> for FilterSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            min_chars: config.filter.min_chars,
            logistics_max_chars: config.filter.logistics_max_chars,
        }
    }
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Runtime batch limits.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub max_messages: usize,
    pub max_chars: usize,
}

impl From<&AppConfig> for BatchSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_messages: config.batching.max_messages.max(1),
            max_chars: config.batching.max_chars.max(MIN_BATCH_CHARS),
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

/// Runtime deduplication settings.
#[derive(Debug, Clone)]
pub struct DedupSettings {
    pub similarity_threshold: f64,
}

impl From<&AppConfig> for DedupSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            similarity_threshold: config.dedup.similarity_threshold,
        }
    }
}

impl Default for DedupSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.chatkb/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| ChatKbError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.chatkb/chatkb.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ChatKbError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ChatKbError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let path = config_file_path()?;
    init_config_at(&path)?;
    Ok(path)
}

/// Write a default config file at `path`, creating parent directories.
pub fn init_config_at(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| ChatKbError::io(dir, e))?;
    }

    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ChatKbError::config(e.to_string()))?;

    std::fs::write(path, content).map_err(|e| ChatKbError::io(path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(())
}

/// Read the extraction API key from the env var named in the config.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.extraction.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().to_string()),
        _ => Err(ChatKbError::config(format!(
            "extraction API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("similarity_threshold"));
        assert!(toml_str.contains("ANTHROPIC_API_KEY"));
        assert!(toml_str.contains("date_order = \"mdy\""));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let toml_str = r#"
[batching]
max_messages = 20

[parsing]
date_order = "dmy"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.batching.max_messages, 20);
        assert_eq!(config.batching.max_chars, 12_000);
        assert_eq!(config.parsing.date_order, DateOrder::Dmy);
        assert_eq!(config.extraction.concurrency, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.extraction.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.dedup.similarity_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.extraction.base_url = "ftp://example.com".into();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.batching.max_chars = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn extraction_settings_from_app_config() {
        let app = AppConfig::default();
        let settings = ExtractionSettings::try_from(&app).expect("settings");
        assert_eq!(settings.concurrency, 4);
        assert_eq!(settings.max_attempts, 4);
        assert_eq!(settings.base_url.as_str(), "https://api.anthropic.com/");
        assert_eq!(settings.timeout, Duration::from_secs(60));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut settings = ExtractionSettings::try_from(&AppConfig::default()).expect("settings");
        settings.backoff_base = Duration::from_millis(100);
        settings.backoff_max = Duration::from_millis(350);
        assert_eq!(settings.backoff_for(1), Duration::from_millis(100));
        assert_eq!(settings.backoff_for(2), Duration::from_millis(200));
        assert_eq!(settings.backoff_for(3), Duration::from_millis(350));
        assert_eq!(settings.backoff_for(30), Duration::from_millis(350));
    }

    #[test]
    fn api_key_resolution() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.extraction.api_key_env = "CHATKB_TEST_NONEXISTENT_KEY_12345".into();
        let result = resolve_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }

    #[test]
    fn init_config_at_writes_loadable_defaults() {
        let dir = std::env::temp_dir().join(format!("chatkb-config-test-{}", uuid::Uuid::now_v7()));
        let path = dir.join("nested").join("chatkb.toml");
        init_config_at(&path).expect("init config");

        let loaded = load_config_from(&path).expect("load config");
        assert_eq!(loaded.batching.max_messages, 50);
        assert_eq!(loaded.output.path, "web/public/knowledge.json");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
