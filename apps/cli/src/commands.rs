//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::watch;
use tracing::{info, warn};

use chatkb_core::{ProgressReporter, RunConfig, RunReport, load_published, preview};
use chatkb_extraction::AnthropicService;
use chatkb_shared::{
    AppConfig, config_file_path, init_config, init_config_at, load_config, load_config_from,
    resolve_api_key,
};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// chatkb: turn group chat exports into a searchable knowledge base.
#[derive(Parser)]
#[command(
    name = "chatkb",
    version,
    about = "Extract a deduplicated, anonymized knowledge base from WhatsApp chat exports.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Config file to use instead of ~/.chatkb/chatkb.toml.
    #[arg(long, global = true, env = "CHATKB_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Process chat exports and publish the knowledge file.
    Run(RunArgs),

    /// Validate a published knowledge file.
    Check {
        /// Path to the knowledge JSON file.
        path: PathBuf,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Arguments for `chatkb run`. Flags override config file values.
#[derive(clap::Args)]
pub(crate) struct RunArgs {
    /// Exported chat .txt files.
    #[arg(required = true)]
    pub files: Vec<PathBuf>,

    /// Where to write the knowledge file.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Maximum messages per batch.
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Maximum rendered chars per batch.
    #[arg(long)]
    pub max_chars: Option<usize>,

    /// Concurrent extraction requests.
    #[arg(long)]
    pub concurrency: Option<u32>,

    /// Dedup similarity threshold in (0, 1].
    #[arg(long)]
    pub threshold: Option<f64>,

    /// Extraction model ID.
    #[arg(long)]
    pub model: Option<String>,

    /// Parse, filter and batch only; no API calls, nothing written.
    #[arg(long)]
    pub dry_run: bool,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "chatkb=info",
        1 => "chatkb=debug",
        _ => "chatkb=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run(args) => cmd_run(config_path, args).await,
        Command::Check { path } => cmd_check(&path),
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
        },
    }
}

fn load(config_path: Option<&Path>) -> Result<AppConfig> {
    let config = match config_path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

impl RunArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(output) = &self.output {
            config.output.path = output.display().to_string();
        }
        if let Some(n) = self.batch_size {
            config.batching.max_messages = n;
        }
        if let Some(n) = self.max_chars {
            config.batching.max_chars = n;
        }
        if let Some(n) = self.concurrency {
            config.extraction.concurrency = n;
        }
        if let Some(t) = self.threshold {
            config.dedup.similarity_threshold = t;
        }
        if let Some(model) = &self.model {
            config.extraction.model = model.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: Option<&Path>, args: RunArgs) -> Result<()> {
    let mut config = load(config_path)?;
    args.apply(&mut config);
    let run_config = RunConfig::try_from(&config)?;

    for file in &args.files {
        if !file.is_file() {
            return Err(eyre!("chat export '{}' not found", file.display()));
        }
    }

    if args.dry_run {
        let counts = preview(&run_config, &args.files)?;
        println!();
        println!("  Dry run (nothing sent, nothing written)");
        println!("  Files:     {}", counts.files);
        println!("  Messages:  {} parsed, {} kept", counts.messages_parsed, counts.messages_kept);
        println!("  Batches:   {} (largest {} chars)", counts.batches, counts.largest_batch);
        println!();
        return Ok(());
    }

    let api_key = resolve_api_key(&config)?;
    let service = Arc::new(AnthropicService::new(&run_config.extraction, api_key)?);

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight batches");
            let _ = cancel_tx.send(true);
        }
    });

    info!(
        files = args.files.len(),
        model = %run_config.extraction.model,
        output = %run_config.output.display(),
        "processing chat exports"
    );

    let reporter = CliProgress::new();
    let report =
        chatkb_core::run(&run_config, &args.files, service, cancel_rx, &reporter).await?;

    print_report(&report);
    Ok(())
}

fn print_report(report: &RunReport) {
    println!();
    if !report.published {
        println!("  Nothing published: every attempted batch failed.");
        println!("  Kept:      {}", report.output.display());
    } else if report.cancelled {
        println!("  Interrupted: published what finished before Ctrl-C.");
    } else {
        println!("  Knowledge base published!");
    }
    println!("  Run:       {}", report.run_id);
    println!("  Messages:  {} parsed, {} kept", report.messages_parsed, report.messages_kept);
    println!("  Items:     {} (from {} candidates)", report.items, report.candidates);
    for (category, count) in &report.per_category {
        println!("    {count:>4}  {category}");
    }
    println!(
        "  Batches:   {} ({} skipped, {} cancelled)",
        report.batches, report.batches_skipped, report.batches_cancelled
    );
    if report.tokens_in + report.tokens_out > 0 {
        println!("  Tokens:    {} in, {} out", report.tokens_in, report.tokens_out);
    }
    println!("  Output:    {}", report.output.display());
    println!("  Time:      {:.1}s", report.elapsed.as_secs_f64());
    println!();
}

fn cmd_check(path: &Path) -> Result<()> {
    let kb = load_published(path)?;
    println!("  {} is valid", path.display());
    println!("  Updated:   {}", kb.updated_at().to_rfc3339());
    println!("  Items:     {}", kb.total());
    for category in kb.categories() {
        println!("    {:>4}  {category}", kb.count_in(*category));
    }
    Ok(())
}

fn cmd_config_init(config_path: Option<&Path>) -> Result<()> {
    let path = match config_path {
        Some(path) => {
            init_config_at(path)?;
            path.to_path_buf()
        }
        None => init_config()?,
    };
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    let source = match config_path {
        Some(path) => path.to_path_buf(),
        None => config_file_path()?,
    };
    println!("# {}", source.display());
    println!("{}", toml::to_string_pretty(&config)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .expect("valid spinner template")
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn batch_done(&self, current: usize, total: usize, detail: &str) {
        self.spinner
            .set_message(format!("Extracting [{current}/{total}] {detail}"));
    }

    fn done(&self, _report: &RunReport) {
        self.spinner.finish_and_clear();
    }
}
