//! Pipeline - cached, resumable build pipelines for serverless functions
//!
//! The `pipeline` command runs a stage graph (lock, build, package, deploy,
//! test) defined in `pipeline.toml`, reusing cached artifacts for stages whose
//! inputs have not changed.
//!
//! ## Commands
//!
//! - `run`: execute a target and everything it depends on
//! - `plan`: show the resolved order with fingerprints and cache status
//! - `list`: list stages in declaration order
//! - `history`: show run records
//! - `cache`: inspect or clear the artifact cache

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};

use pipeline_core::cache::{ArtifactCache, CacheError};
use pipeline_core::engine::{exit_code, Engine, EngineError, EngineSettings, RunOptions};
use pipeline_core::{
    backends, definition, ConfigError, DefinitionError, PipelineConfig, PipelineReport,
    RunnerKind, StageGraph,
};
use pipeline_state::fakes::MemoryRunLog;
use pipeline_state::{RecordFilter, RunLog, RunRecord, StorageError};

#[derive(Parser)]
#[command(name = "pipeline")]
#[command(author = "Stevedores Org")]
#[command(version = pipeline_core::VERSION)]
#[command(about = "Cached, resumable build pipeline for serverless functions", long_about = None)]
struct Cli {
    /// Pipeline definition (TOML, YAML or JSON)
    #[arg(short, long, global = true, env = "PIPELINE_FILE", default_value = "pipeline.toml")]
    file: PathBuf,

    /// State directory for the cache and run log
    #[arg(long, global = true, env = "PIPELINE_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON: log lines on stderr, results on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a target stage and its dependencies
    Run {
        /// Stage to run
        target: String,

        /// Ignore cached artifacts (results are still cached)
        #[arg(long)]
        no_cache: bool,

        /// Show what would run without running anything
        #[arg(long)]
        dry_run: bool,

        /// Maximum stages running at once
        #[arg(short, long)]
        workers: Option<usize>,

        /// Isolation backend: process or container
        #[arg(long)]
        runner: Option<RunnerKind>,
    },

    /// Show the resolved order with fingerprints and cache status
    Plan {
        /// Stage to plan
        target: String,
    },

    /// List stages in declaration order
    List,

    /// Show run records, oldest first
    History {
        /// Only records of this stage
        #[arg(long)]
        stage: Option<String>,

        /// Only records of this run
        #[arg(long)]
        run: Option<String>,

        /// Maximum number of records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Inspect or clear the artifact cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Show entry count and size
    Stats,
    /// Remove every cached artifact
    Clear,
}

/// Resolved settings shared by every command.
struct Session {
    file: PathBuf,
    config: PipelineConfig,
    json: bool,
}

impl Session {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = PipelineConfig::from_env()?;
        if let Some(dir) = &cli.state_dir {
            config.state_dir = dir.clone();
        }
        Ok(Self {
            file: cli.file.clone(),
            config,
            json: cli.json,
        })
    }

    fn load_graph(&self) -> Result<StageGraph> {
        let graph = definition::load(&self.file)?;
        info!(file = %self.file.display(), stages = graph.len(), "loaded pipeline definition");
        Ok(graph)
    }

    /// Cache for commands that only read. Nothing is created on disk when
    /// there is no cache yet.
    fn read_only_cache(&self) -> Result<Arc<ArtifactCache>> {
        if self.config.cache_dir().exists() {
            Ok(backends::open_cache(&self.config)?)
        } else {
            Ok(Arc::new(ArtifactCache::in_memory(self.config.cache_limits())))
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    pipeline_core::init_tracing(cli.json, level);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> Result<i32> {
    let session = Session::new(&cli)?;

    match cli.command {
        Commands::Run {
            target,
            no_cache,
            dry_run,
            workers,
            runner,
        } => {
            let mut session = session;
            if let Some(kind) = runner {
                session.config.runner = kind;
            }
            if let Some(n) = workers {
                session.config.workers = n;
                session.config.validate()?;
            }
            let options = RunOptions {
                no_cache,
                dry_run,
                workers,
            };
            cmd_run(&session, &target, &options).await
        }
        Commands::Plan { target } => cmd_plan(&session, &target).await,
        Commands::List => cmd_list(&session),
        Commands::History { stage, run, limit } => {
            let filter = RecordFilter {
                stage_id: stage,
                run_id: run,
                limit: Some(limit),
            };
            cmd_history(&session, &filter).await
        }
        Commands::Cache { action } => match action {
            CacheAction::Stats => cmd_cache_stats(&session).await,
            CacheAction::Clear => cmd_cache_clear(&session).await,
        },
    }
}

/// Map an error that escaped a command to the process exit status.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(e) = err.downcast_ref::<EngineError>() {
        return e.exit_code();
    }
    if let Some(e) = err.downcast_ref::<DefinitionError>() {
        return match e {
            DefinitionError::UnknownStage { .. } => exit_code::UNKNOWN_STAGE,
            _ => exit_code::DEFINITION,
        };
    }
    if err.downcast_ref::<CacheError>().is_some() {
        return exit_code::CACHE;
    }
    if err.downcast_ref::<ConfigError>().is_some() || err.downcast_ref::<StorageError>().is_some() {
        return exit_code::CONFIG;
    }
    1
}

async fn cmd_run(session: &Session, target: &str, options: &RunOptions) -> Result<i32> {
    let graph = session.load_graph()?;
    let config = &session.config;

    let (cache, run_log): (Arc<ArtifactCache>, Arc<dyn RunLog>) = if options.dry_run {
        (session.read_only_cache()?, Arc::new(MemoryRunLog::new()))
    } else {
        let cache = backends::open_cache(config)?;
        let run_log = backends::open_run_log(config)
            .await
            .context("failed to open run log")?;
        (cache, run_log)
    };
    let runner = backends::build_runner(config);
    info!(runner = %config.runner, state_dir = %config.state_dir.display(), "starting pipeline");

    let engine = Engine::new(
        graph,
        cache,
        runner,
        run_log,
        EngineSettings::from_config(config),
    );

    let token = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling pipeline");
            token.cancel("interrupted");
        }
    });

    let report = engine.run(target, options).await?;
    if session.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", render_report(&report));
    }
    Ok(report.exit_code())
}

/// Human-readable run summary: one line per stage, then the full output of
/// the stage that halted the pipeline.
fn render_report(report: &PipelineReport) -> String {
    let mut out = String::new();
    for stage in &report.stages {
        out.push_str(&stage.summary_line());
        out.push('\n');
    }

    if let Some(failed) = report.failure() {
        if !failed.output.is_empty() {
            out.push_str(&format!("\n--- output of {} ---\n", failed.stage));
            out.push_str(&failed.output);
            if !failed.output.ends_with('\n') {
                out.push('\n');
            }
            out.push_str("---\n");
        }
    }

    let secs = report.duration_ms as f64 / 1000.0;
    if report.dry_run {
        let hits = report.stages.iter().filter(|s| s.would_hit == Some(true)).count();
        out.push_str(&format!(
            "\ndry run: {} would run, {} cached\n",
            report.stages.len() - hits,
            hits
        ));
    } else if let Some(reason) = &report.cancelled {
        out.push_str(&format!("\npipeline cancelled ({reason}) after {secs:.1}s\n"));
    } else if let Some(stage) = &report.first_failure {
        out.push_str(&format!(
            "\npipeline failed at {stage} after {secs:.1}s: {} done, {} aborted, {} not attempted\n",
            report.done().count(),
            report.aborted().count(),
            report.not_attempted().count()
        ));
    } else {
        out.push_str(&format!(
            "\npipeline succeeded in {secs:.1}s: {} stages, {} cached\n",
            report.stages.len(),
            report.cache_hits()
        ));
    }
    out
}

#[derive(Serialize)]
struct PlanRow<'a> {
    stage: &'a str,
    fingerprint: &'a str,
    cached: bool,
}

async fn cmd_plan(session: &Session, target: &str) -> Result<i32> {
    let graph = session.load_graph()?;
    let config = &session.config;
    let engine = Engine::new(
        graph,
        session.read_only_cache()?,
        backends::build_runner(config),
        Arc::new(MemoryRunLog::new()),
        EngineSettings::from_config(config),
    );

    let plan = engine.plan(target, false).await?;
    if session.json {
        let rows: Vec<PlanRow<'_>> = plan
            .iter()
            .map(|p| PlanRow {
                stage: &p.stage.id,
                fingerprint: p.fingerprint.as_str(),
                cached: p.cached,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        for (i, p) in plan.iter().enumerate() {
            let status = if p.cached { "cached" } else { "run" };
            println!("{:>3}. {:<16} {}  {}", i + 1, p.stage.id, p.fingerprint.short(), status);
        }
    }
    Ok(exit_code::SUCCESS)
}

#[derive(Serialize)]
struct StageRow<'a> {
    id: &'a str,
    depends_on: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<&'a str>,
}

fn cmd_list(session: &Session) -> Result<i32> {
    let graph = session.load_graph()?;
    let rows: Vec<StageRow<'_>> = graph
        .stages()
        .iter()
        .map(|s| StageRow {
            id: &s.id,
            depends_on: &s.depends_on,
            description: s.description.as_deref(),
        })
        .collect();

    if session.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(exit_code::SUCCESS);
    }
    if let Some(name) = graph.name() {
        println!("{name}");
    }
    for row in rows {
        let mut line = format!("{:<16}", row.id);
        if !row.depends_on.is_empty() {
            line.push_str(&format!(" <- {}", row.depends_on.join(", ")));
        }
        if let Some(desc) = row.description {
            line.push_str(&format!("  # {desc}"));
        }
        println!("{}", line.trim_end());
    }
    Ok(exit_code::SUCCESS)
}

fn format_record(record: &RunRecord) -> String {
    let outcome = record.outcome.map_or("running", |o| o.as_str());
    let exit = record
        .exit_code
        .map_or_else(|| "-".to_string(), |c| c.to_string());
    let duration = record
        .duration_ms()
        .map_or_else(|| "-".to_string(), |ms| format!("{ms}ms"));
    let run: String = record.run_id.chars().take(8).collect();
    let fp: String = record.fingerprint.chars().take(12).collect();
    format!(
        "{}  {}  {:<16} #{} {:<18} exit={:<4} {:>8}  {}",
        record.started_at.format("%Y-%m-%d %H:%M:%S"),
        run,
        record.stage_id,
        record.attempt,
        outcome,
        exit,
        duration,
        fp
    )
}

async fn cmd_history(session: &Session, filter: &RecordFilter) -> Result<i32> {
    let run_log = backends::open_run_log(&session.config)
        .await
        .context("failed to open run log")?;
    let records = run_log.list(filter).await?;

    if session.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
    } else if records.is_empty() {
        println!("No run records found.");
    } else {
        for record in &records {
            println!("{}", format_record(record));
        }
    }
    Ok(exit_code::SUCCESS)
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

async fn cmd_cache_stats(session: &Session) -> Result<i32> {
    let cache = session.read_only_cache()?;
    let stats = cache.stats().await;
    if session.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(exit_code::SUCCESS);
    }

    let limits = cache.limits();
    println!("Cache:   {}", session.config.cache_dir().display());
    println!("Entries: {}", stats.entries);
    println!("Size:    {}", human_bytes(stats.bytes));
    if let Some(max) = limits.max_entries {
        println!("Max entries: {max}");
    }
    if let Some(max) = limits.max_bytes {
        println!("Max size:    {}", human_bytes(max));
    }
    Ok(exit_code::SUCCESS)
}

async fn cmd_cache_clear(session: &Session) -> Result<i32> {
    if !session.config.cache_dir().exists() {
        println!("Cache is empty.");
        return Ok(exit_code::SUCCESS);
    }
    let cache = backends::open_cache(&session.config)?;
    let removed = cache.clear().await?;
    println!("Removed {removed} cached artifact(s).");
    Ok(exit_code::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::engine::{FailureKind, StageReport, StageState};
    use tempfile::TempDir;

    const DEFINITION: &str = r#"
name = "hello-function"

[[stage]]
id = "lock"
command = "cp requirements.in {{out_dir}}/requirements.txt"
inputs = ["requirements.in"]
outputs = ["requirements.txt"]

[[stage]]
id = "build"
depends_on = ["lock"]
command = "cat {{upstream.lock}}/requirements.txt"
"#;

    fn session_in(dir: &TempDir) -> Session {
        std::fs::write(dir.path().join("pipeline.toml"), DEFINITION).unwrap();
        std::fs::write(dir.path().join("requirements.in"), "boto3\n").unwrap();
        Session {
            file: dir.path().join("pipeline.toml"),
            config: PipelineConfig {
                state_dir: dir.path().join(".pipeline"),
                workers: 2,
                ..PipelineConfig::default()
            },
            json: false,
        }
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "pipeline", "--file", "ci.yaml", "run", "deploy", "--no-cache", "--workers", "3",
            "--runner", "container",
        ])
        .unwrap();
        assert_eq!(cli.file, PathBuf::from("ci.yaml"));
        match cli.command {
            Commands::Run {
                target,
                no_cache,
                dry_run,
                workers,
                runner,
            } => {
                assert_eq!(target, "deploy");
                assert!(no_cache);
                assert!(!dry_run);
                assert_eq!(workers, Some(3));
                assert_eq!(runner, Some(RunnerKind::Container));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_runner() {
        assert!(Cli::try_parse_from(["pipeline", "run", "deploy", "--runner", "lambda"]).is_err());
    }

    #[test]
    fn test_exit_codes_follow_error_kind() {
        let unknown = anyhow::Error::from(EngineError::UnknownStage { id: "x".into() });
        assert_eq!(exit_code_for(&unknown), 1);

        let definition = anyhow::Error::from(DefinitionError::Empty).context("loading pipeline.toml");
        assert_eq!(exit_code_for(&definition), 2);

        let storage = anyhow::Error::from(StorageError::Backend("down".into()));
        assert_eq!(exit_code_for(&storage), 5);

        assert_eq!(exit_code_for(&anyhow::anyhow!("other")), 1);
    }

    #[test]
    fn test_render_report_prints_failing_output() {
        let report = PipelineReport {
            run_id: "r1".into(),
            target: "build".into(),
            definition_digest: String::new(),
            dry_run: false,
            stages: vec![
                StageReport {
                    state: StageState::Done,
                    cache_hit: true,
                    ..StageReport::pending("lock")
                },
                StageReport {
                    state: StageState::Aborted,
                    exit_code: Some(2),
                    output: "ModuleNotFoundError: boto3".into(),
                    failure: Some(FailureKind::Exit { code: 2 }),
                    ..StageReport::pending("build")
                },
                StageReport::pending("package"),
            ],
            first_failure: Some("build".into()),
            cancelled: None,
            duration_ms: 1500,
        };

        let text = render_report(&report);
        assert!(text.contains("--- output of build ---\nModuleNotFoundError: boto3\n"));
        assert!(text.contains("not attempted"));
        assert!(text.contains("pipeline failed at build after 1.5s: 1 done, 1 aborted, 1 not attempted"));
    }

    #[test]
    fn test_human_bytes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(2048), "2.0 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[tokio::test]
    async fn test_run_then_rerun_hits_cache() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);

        let code = cmd_run(&session, "build", &RunOptions::default()).await.unwrap();
        assert_eq!(code, 0);

        let run_log = backends::open_run_log(&session.config).await.unwrap();
        let records = run_log.list(&RecordFilter::default()).await.unwrap();
        assert_eq!(records.len(), 2);

        let code = cmd_run(&session, "build", &RunOptions::default()).await.unwrap();
        assert_eq!(code, 0);
        let records = run_log.list(&RecordFilter::default()).await.unwrap();
        assert_eq!(records.len(), 2);

        let cache = backends::open_cache(&session.config).unwrap();
        assert_eq!(cache.stats().await.entries, 2);
        assert_eq!(cmd_cache_clear(&session).await.unwrap(), 0);
        let cache = backends::open_cache(&session.config).unwrap();
        assert_eq!(cache.stats().await.entries, 0);
    }

    #[tokio::test]
    async fn test_dry_run_writes_no_state() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        let options = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };

        assert_eq!(cmd_run(&session, "build", &options).await.unwrap(), 0);
        assert_eq!(cmd_plan(&session, "build").await.unwrap(), 0);
        assert!(!session.config.state_dir.exists());
    }

    #[tokio::test]
    async fn test_unknown_target_maps_to_exit_1() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        let err = cmd_run(&session, "publish", &RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(exit_code_for(&err), 1);
    }

    #[test]
    fn test_list_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let session = session_in(&dir);
        assert_eq!(cmd_list(&session).unwrap(), 0);

        let missing = Session {
            file: dir.path().join("nope.toml"),
            config: PipelineConfig::default(),
            json: false,
        };
        let err = cmd_list(&missing).unwrap_err();
        assert_eq!(exit_code_for(&err), 2);
    }
}
