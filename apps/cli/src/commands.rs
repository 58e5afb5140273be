//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use xaio_core::driver::{DriverOptions, PipelineDriver, RunContext, RunProgress, RunSummary};
use xaio_core::input::AiInput;
use xaio_core::llm::OpenAiClient;
use xaio_core::retry::RetryPolicy;
use xaio_core::stage::{Stage, StageOutcome};
use xaio_core::stages::{StageServices, build_stages, requires_model};
use xaio_shared::{
    AppConfig, StageFields, StageRecord, StageStatus, WorkItem, init_config, load_config,
    load_config_from,
};
use xaio_storage::{FieldUpdate, QueueDb, QueueStore};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// xaio: staged, resumable processing of harvested documents.
#[derive(Parser)]
#[command(
    name = "xaio",
    version,
    about = "Run the staged document pipeline over the ready rows of the queue.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.xaio/xaio.toml).
    #[arg(long, env = "XAIO_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

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
    /// Process ready items: run every stage that is missing or stale.
    Run {
        /// Items attempted in this run (overrides pipeline.max_per_run).
        #[arg(long)]
        max_per_run: Option<usize>,

        /// Restrict to these stages (comma-separated), in configured order.
        #[arg(long, value_delimiter = ',')]
        stages: Vec<String>,

        /// Rerun stages even when their artifacts are fresh.
        #[arg(long)]
        force: bool,
    },

    /// Inspect or edit the queue.
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Queue subcommands.
#[derive(Subcommand)]
pub(crate) enum QueueAction {
    /// Append ready rows for the given input envelopes.
    Add {
        /// Input envelopes (`<id>.ai_input.json`).
        #[arg(required = true)]
        inputs: Vec<PathBuf>,

        /// Source URL (defaults to the envelope's canonical URL).
        #[arg(long)]
        url: Option<String>,
    },
    /// Print per-row stage statuses.
    Show,
    /// Blank a stage's status fields on one row, e.g. a stuck RUNNING.
    Reset {
        #[arg(long)]
        row: i64,

        #[arg(long)]
        stage: String,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
    /// Load and validate the configuration.
    Validate,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "xaio=info",
        1 => "xaio=debug",
        _ => "xaio=trace",
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
                .with_current_span(true)
                .with_span_list(true)
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
        Command::Run {
            max_per_run,
            stages,
            force,
        } => cmd_run(config_path, max_per_run, &stages, force).await,
        Command::Queue { action } => match action {
            QueueAction::Add { inputs, url } => {
                cmd_queue_add(config_path, &inputs, url.as_deref()).await
            }
            QueueAction::Show => cmd_queue_show(config_path).await,
            QueueAction::Reset { row, stage } => cmd_queue_reset(config_path, row, &stage).await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(config_path),
            ConfigAction::Show => cmd_config_show(config_path),
            ConfigAction::Validate => cmd_config_validate(config_path),
        },
    }
}

fn load(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(p) => load_config_from(p)?,
        None => load_config()?,
    })
}

/// The configured stage list, optionally narrowed to `filter`.
fn select_stages(config: &AppConfig, filter: &[String]) -> Result<Vec<String>> {
    if let Some(unknown) = filter.iter().find(|f| !config.pipeline.stages.contains(f)) {
        return Err(eyre!(
            "stage '{unknown}' is not in pipeline.stages ({})",
            config.pipeline.stages.join(", ")
        ));
    }
    Ok(config
        .pipeline
        .stages
        .iter()
        .filter(|s| filter.is_empty() || filter.contains(s))
        .cloned()
        .collect())
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(
    config_path: Option<&Path>,
    max_per_run: Option<usize>,
    filter: &[String],
    force: bool,
) -> Result<()> {
    let config = load(config_path)?;
    let names = select_stages(&config, filter)?;
    if max_per_run == Some(0) {
        return Err(eyre!("--max-per-run must be at least 1"));
    }

    // Everything that can fail at startup happens before the first item.
    let mut services = StageServices::default();
    if names.iter().any(|s| requires_model(s)) {
        services.model = Some(Arc::new(OpenAiClient::from_config(&config.model)?));
    }
    let stages = build_stages(&config, &names, &services)?;
    let queue = QueueDb::open(&config.queue.db_path).await?;

    let mut options = DriverOptions::from_config(&config.pipeline);
    options.force = force;
    if let Some(cap) = max_per_run {
        options.max_per_run = cap;
    }

    let ctx = RunContext::new();
    info!(
        run_id = %ctx.run_id,
        stages = %names.join(","),
        cap = options.max_per_run,
        force,
        "starting run"
    );

    let stage_refs: Vec<&dyn Stage> = stages.iter().map(|s| s.as_ref()).collect();
    let driver = PipelineDriver::new(
        &queue,
        &config.queue,
        stage_refs,
        RetryPolicy::from(&config.retry.status),
        options,
    );
    let reporter = CliProgress::new();
    let summary = driver.run(&ctx, &reporter).await?;

    print_summary(&ctx, &summary);
    Ok(())
}

fn print_summary(ctx: &RunContext, summary: &RunSummary) {
    println!();
    println!("  Run {}", ctx.run_id);
    println!("  Rows:        {}", summary.total_rows);
    println!("  Ready:       {}", summary.seen);
    println!("  Attempted:   {}", summary.attempted);
    println!("  Satisfied:   {}", summary.satisfied);
    println!("  Deferred:    {}", summary.deferred);
    println!("  Failed:      {}", summary.failed);
    println!("  No input:    {}", summary.missing_input);
    println!("  Stage runs:  {}", summary.stage_runs);
    println!("  Stage skips: {}", summary.stage_skips);
    println!("  Time:        {:.1}s", summary.elapsed.as_secs_f64());
    println!();
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
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl RunProgress for CliProgress {
    fn run_started(&self, ready: usize, cap: usize) {
        self.spinner
            .set_message(format!("{ready} ready rows, processing up to {cap}"));
    }

    fn item_started(&self, item: &WorkItem, attempted: usize) {
        self.spinner
            .set_message(format!("[{attempted}] {} (row {})", item.id, item.row));
    }

    fn stage_finished(&self, item: &WorkItem, stage: &str, outcome: &StageOutcome) {
        let word = match outcome {
            StageOutcome::Skipped => "fresh",
            StageOutcome::Done { .. } => "done",
            StageOutcome::Failed { .. } => "failed",
            StageOutcome::Deferred => "deferred",
        };
        self.spinner.set_message(format!("{} {stage}: {word}", item.id));
    }

    fn run_finished(&self, _summary: &RunSummary) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// queue
// ---------------------------------------------------------------------------

async fn cmd_queue_add(config_path: Option<&Path>, inputs: &[PathBuf], url: Option<&str>) -> Result<()> {
    let config = load(config_path)?;
    let queue = QueueDb::open(&config.queue.db_path).await?;

    for input in inputs {
        let path = std::fs::canonicalize(input)
            .map_err(|e| eyre!("cannot read input '{}': {e}", input.display()))?;
        let loaded = AiInput::load(&path)?;
        let row_url = url
            .map(str::to_string)
            .or_else(|| loaded.canonical_url().map(str::to_string))
            .unwrap_or_default();

        let row = queue
            .append_row(&[
                FieldUpdate::new(&config.queue.url_field, &row_url),
                FieldUpdate::new(&config.queue.input_field, path.display().to_string()),
                FieldUpdate::new(&config.queue.ready_field, &config.queue.ready_value),
            ])
            .await?;
        println!("  row {row}: {}", path.display());
    }
    Ok(())
}

fn short_status(record: &StageRecord) -> &'static str {
    match record.status {
        StageStatus::Unstarted => "-",
        StageStatus::Running => "running",
        StageStatus::Done => "done",
        StageStatus::Failed => "FAILED",
    }
}

async fn cmd_queue_show(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    let queue = QueueDb::open_readonly(&config.queue.db_path).await?;
    let snapshot = queue.snapshot().await?;
    let fields: Vec<StageFields> = config
        .pipeline
        .stages
        .iter()
        .map(|s| StageFields::for_stage(s))
        .collect();

    let mut header = format!("{:>5}  {:<10}", "row", "ready");
    for stage in &config.pipeline.stages {
        header.push_str(&format!(" {stage:<9}"));
    }
    header.push_str("  url");
    println!("{header}");

    for row in &snapshot.rows {
        let mut line = format!("{:>5}  {:<10}", row.row, row.get(&config.queue.ready_field));
        for f in &fields {
            let record = StageRecord::from_fields(f, &row.fields);
            line.push_str(&format!(" {:<9}", short_status(&record)));
        }
        line.push_str(&format!("  {}", row.get(&config.queue.url_field)));
        println!("{line}");
    }
    println!("\n  {} rows", snapshot.len());
    Ok(())
}

async fn cmd_queue_reset(config_path: Option<&Path>, row: i64, stage: &str) -> Result<()> {
    let config = load(config_path)?;
    if config.dependencies_of(stage).is_none() {
        return Err(eyre!("unknown stage '{stage}'"));
    }
    let queue = QueueDb::open(&config.queue.db_path).await?;
    let f = StageFields::for_stage(stage);
    queue
        .clear_fields(
            row,
            &[f.status.as_str(), f.path.as_str(), f.error.as_str(), f.updated_at.as_str()],
        )
        .await?;
    info!(row, stage, "reset stage fields");
    println!("  row {row}: {stage} reset");
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init(config_path: Option<&Path>) -> Result<()> {
    let path = init_config(config_path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

fn cmd_config_validate(config_path: Option<&Path>) -> Result<()> {
    let config = load(config_path)?;
    println!("Configuration is valid.");
    for stage in &config.pipeline.stages {
        let deps = config.dependencies_of(stage).unwrap_or_default();
        if deps.is_empty() {
            println!("  {stage}");
        } else {
            println!("  {stage} <- {}", deps.join(", "));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_filter_keeps_configured_order() {
        let config = AppConfig::default();
        let picked = select_stages(&config, &["buffers".into(), "meta".into()]).expect("select");
        assert_eq!(picked, vec!["meta", "buffers"]);
        assert_eq!(select_stages(&config, &[]).expect("all"), config.pipeline.stages);
    }

    #[test]
    fn stage_filter_rejects_unknown_names() {
        let err = select_stages(&AppConfig::default(), &["summary".into()]).expect_err("unknown");
        assert!(err.to_string().contains("summary"));
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from(["xaio", "run", "--stages", "meta,claims", "--force", "--max-per-run", "3"])
            .expect("parse");
        let Command::Run { max_per_run, stages, force } = cli.command else {
            panic!("expected run");
        };
        assert_eq!(max_per_run, Some(3));
        assert_eq!(stages, vec!["meta", "claims"]);
        assert!(force);
    }
}
