//! retriage - automatic re-triage of finished sandbox analyses
//!
//! A CLI tool that inspects finished analysis results and queues follow-up
//! tasks: a breakpoint rerun, a family-specific package, or one dumper job
//! per detection.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (config, API client, missing input, etc.)
//!   2 - One or more results could not be read or written back

mod analysis;
mod cli;
mod config;
mod models;
mod options;
mod orchestrator;
mod report;
mod scanner;

use anyhow::{Context, Result};
use chrono::Utc;
use cli::{Args, OutputFormat};
use config::{Config, CONFIG_FILE_NAME};
use futures::stream::{self, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use orchestrator::{
    Decision, DryRunSubmitter, HttpSubmitter, Orchestrator, OrchestratorConfig, Outcome,
    TaskSubmitter,
};
use report::{BatchReport, LoadFailure, ReportMetadata};
use scanner::ScanConfig;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    // Config comes first: the file may turn on verbose logging.
    let (mut config, source) = match load_config(&args) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    };
    config.merge_with_args(&args);

    init_logging(config.general.log_level(args.quiet))?;

    info!("retriage v{}", env!("CARGO_PKG_VERSION"));
    source.log();
    debug!("Arguments: {:?}", args);

    match run(args, config).await {
        Ok(exit_code) => {
            std::process::exit(exit_code);
        }
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .retriage.toml.
fn handle_init_config() -> Result<()> {
    let path = Path::new(CONFIG_FILE_NAME);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            CONFIG_FILE_NAME
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", CONFIG_FILE_NAME))?;

    println!("✅ Created {} with default settings.", CONFIG_FILE_NAME);
    println!("   Edit it to set the task API, distributed routing, and skip lists.");
    Ok(())
}

/// Initialize logging at `level`.
///
/// Logs go to stderr so the summary on stdout stays machine readable.
fn init_logging(level: tracing::Level) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Process every requested result. Returns the exit code.
async fn run(args: Args, config: Config) -> Result<i32> {
    let start_time = Instant::now();

    let paths = scanner::collect_paths(
        &args.results,
        args.analyses_dir.as_deref(),
        &ScanConfig::from(&config.scanner),
    )?;
    if paths.is_empty() {
        warn!("No analysis results found");
        return Ok(0);
    }
    info!("Processing {} results", paths.len());

    let batch = BatchOptions {
        concurrency: config.general.concurrency.max(1),
        // A dry run never touches the stored results.
        write_back: args.in_place && !args.dry_run,
        progress: if args.quiet {
            None
        } else {
            Some(progress_bar(paths.len()))
        },
    };

    let orchestrator_config = OrchestratorConfig::from(&config.resubmit);
    let (outcomes, failures) = if args.dry_run {
        let orchestrator = Orchestrator::new(orchestrator_config, DryRunSubmitter);
        run_batch(&orchestrator, &paths, &batch).await
    } else {
        let submitter = HttpSubmitter::new(&config.api)?;
        let orchestrator = Orchestrator::new(orchestrator_config, submitter);
        run_batch(&orchestrator, &paths, &batch).await
    };

    if let Some(ref pb) = batch.progress {
        pb.finish_and_clear();
    }

    let metadata = ReportMetadata {
        generated_at: Utc::now(),
        api_url: config.api.url.clone(),
        dry_run: args.dry_run,
        duration_seconds: start_time.elapsed().as_secs_f64(),
    };
    let report = BatchReport::new(metadata, outcomes, failures);

    let output = match args.format {
        OutputFormat::Json => report::generate_json_report(&report)?,
        OutputFormat::Markdown => report::generate_markdown_report(&report),
    };

    match args.output {
        Some(ref path) => {
            std::fs::write(path, &output)
                .with_context(|| format!("Failed to write summary to {}", path.display()))?;
            info!("Summary saved to {}", path.display());
        }
        None => println!("{}", output),
    }

    let summary = &report.summary;
    info!(
        "{} results: {} rejected, {} breakpoint reruns, {} selected, {} fallback, {} children",
        summary.processed,
        summary.rejected,
        summary.breakpoints,
        summary.selected,
        summary.fallback,
        summary.children
    );

    if summary.failed > 0 {
        warn!("{} results could not be processed", summary.failed);
        return Ok(2);
    }

    Ok(0)
}

/// Settings shared by every result in a batch.
struct BatchOptions {
    concurrency: usize,
    write_back: bool,
    progress: Option<ProgressBar>,
}

fn progress_bar(len: usize) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
        .map(|style| style.progress_chars("#>-"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb
}

/// Process `paths` with at most `batch.concurrency` results in flight.
async fn run_batch<S: TaskSubmitter>(
    orchestrator: &Orchestrator<S>,
    paths: &[PathBuf],
    batch: &BatchOptions,
) -> (Vec<Outcome>, Vec<LoadFailure>) {
    let progress = batch.progress.as_ref();
    let write_back = batch.write_back;

    let results: Vec<Result<Outcome, LoadFailure>> = stream::iter(paths)
        .map(|path| async move {
            let result = process_one(orchestrator, path, write_back).await;
            if let Some(pb) = progress {
                pb.inc(1);
            }
            result.map_err(|e| {
                warn!("Skipping {}: {:#}", path.display(), e);
                LoadFailure {
                    path: path.clone(),
                    error: format!("{:#}", e),
                }
            })
        })
        .buffer_unordered(batch.concurrency)
        .collect()
        .await;

    let mut outcomes = Vec::new();
    let mut failures = Vec::new();
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(failure) => failures.push(failure),
        }
    }

    (outcomes, failures)
}

async fn process_one<S: TaskSubmitter>(
    orchestrator: &Orchestrator<S>,
    path: &Path,
    write_back: bool,
) -> Result<Outcome> {
    let mut result = scanner::load_result(path)?;
    let outcome = orchestrator.process(&mut result).await;

    if write_back && !matches!(outcome.decision, Decision::Rejected { .. }) {
        scanner::save_children(path, result.children.as_deref().unwrap_or_default())?;
        debug!("Recorded {} children in {}", outcome.children.len(), path.display());
    }

    Ok(outcome)
}

/// Where the configuration came from. Logged once logging is up.
enum ConfigSource {
    File(PathBuf),
    Default,
    Builtin,
    Unreadable(String),
}

impl ConfigSource {
    fn log(&self) {
        match self {
            ConfigSource::File(path) => info!("Loaded config from: {}", path.display()),
            ConfigSource::Default => info!("Loaded default config from {}", CONFIG_FILE_NAME),
            ConfigSource::Builtin => debug!("No config file found, using defaults"),
            ConfigSource::Unreadable(e) => warn!("Failed to load config: {}", e),
        }
    }
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<(Config, ConfigSource)> {
    if let Some(ref config_path) = args.config {
        let config = Config::load(config_path)?;
        return Ok((config, ConfigSource::File(config_path.clone())));
    }

    Ok(match Config::load_default() {
        Ok(Some(config)) => (config, ConfigSource::Default),
        Ok(None) => (Config::default(), ConfigSource::Builtin),
        Err(e) => (Config::default(), ConfigSource::Unreadable(format!("{:#}", e))),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use tempfile::TempDir;

    fn fixtures_dir() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("fixtures/analyses")
    }

    fn dry_run_orchestrator() -> Orchestrator<DryRunSubmitter> {
        let config = OrchestratorConfig::from(&Config::default().resubmit);
        Orchestrator::new(config, DryRunSubmitter)
    }

    fn batch(write_back: bool) -> BatchOptions {
        BatchOptions {
            concurrency: 2,
            write_back,
            progress: None,
        }
    }

    #[tokio::test]
    async fn test_fixture_batch_decisions() {
        let paths = scanner::collect_paths(&[], Some(&fixtures_dir()), &ScanConfig::default())
                .unwrap();
        assert_eq!(paths.len(), 3);

        let (outcomes, failures) =
            run_batch(&dry_run_orchestrator(), &paths, &batch(false)).await;
        assert!(failures.is_empty());

        let report = BatchReport::new(
            ReportMetadata {
                generated_at: Utc::now(),
                api_url: String::new(),
                dry_run: true,
                duration_seconds: 0.0,
            },
            outcomes,
            failures,
        );
        let outcomes = &report.outcomes;

        assert_eq!(
            outcomes[0].decision,
            Decision::Breakpoints {
                slots: vec![(0, 4198400)]
            }
        );
        assert_eq!(
            outcomes[1].decision,
            Decision::Selected {
                package: "TrickBot_doc".to_string()
            }
        );
        assert!(matches!(outcomes[2].decision, Decision::Rejected { .. }));

        // Dry runs never hand out task ids.
        assert_eq!(report.summary.submitted, 2);
        assert_eq!(report.summary.children, 0);
    }

    #[tokio::test]
    async fn test_write_back_only_adds_children() {
        let temp_dir = TempDir::new().unwrap();
        let reports = temp_dir.path().join("101/reports");
        std::fs::create_dir_all(&reports).unwrap();
        let path = reports.join("report.json");
        let fixture = fixtures_dir().join("101/reports/report.json");
        std::fs::copy(&fixture, &path).unwrap();

        let (outcomes, failures) =
            run_batch(&dry_run_orchestrator(), &[path.clone()], &batch(true)).await;
        assert_eq!(outcomes.len(), 1);
        assert!(failures.is_empty());

        let read = |p: &Path| -> serde_json::Value {
            serde_json::from_str(&std::fs::read_to_string(p).unwrap()).unwrap()
        };
        let mut written = read(&path);
        assert_eq!(written["children"], serde_json::json!([]));
        assert_eq!(written["info"]["machine"]["label"], "win10-x64-3");

        written.as_object_mut().unwrap().remove("children");
        assert_eq!(written, read(&fixture));
    }

    #[tokio::test]
    async fn test_rejected_result_is_not_rewritten() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("report.json");
        let original = std::fs::read_to_string(fixtures_dir().join("103/reports/report.json")).unwrap();
        std::fs::write(&path, &original).unwrap();

        run_batch(&dry_run_orchestrator(), &[path.clone()], &batch(true)).await;

        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn test_config_file_sets_log_level() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("retriage.toml");
        std::fs::write(&path, "[general]\nverbose = true\n").unwrap();

        let args = Args::try_parse_from(["retriage", "r.json", "-c", path.to_str().unwrap()])
            .unwrap();
        let (mut config, source) = load_config(&args).unwrap();
        config.merge_with_args(&args);

        assert!(matches!(source, ConfigSource::File(_)));
        assert_eq!(config.general.log_level(args.quiet), tracing::Level::DEBUG);

        let args = Args::try_parse_from(["retriage", "r.json", "-q", "-c", path.to_str().unwrap()])
            .unwrap();
        assert_eq!(config.general.log_level(args.quiet), tracing::Level::ERROR);
    }

    #[tokio::test]
    async fn test_unreadable_result_is_a_failure() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("report.json");
        std::fs::write(&path, "[1, 2").unwrap();

        let (outcomes, failures) =
            run_batch(&dry_run_orchestrator(), &[path.clone()], &batch(false)).await;
        assert!(outcomes.is_empty());
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, path);
    }
}
