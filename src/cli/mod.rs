//! CLI command definitions and handlers

use crate::changes::ChangeTracker;
use crate::config::Config;
use crate::engine::state::{EngineError, Mode};
use crate::engine::{Engine, RunResult};
use crate::environment::EnvironmentContext;
use crate::llm::OpenAiClient;
use crate::memory::MemoryCategory;
use crate::worker::WorkerRegistry;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

/// OpsPilot - natural-language operations assistant
///
/// Turns requests like "restart nginx" or "disk is full" into safety-gated
/// actions against this host. Anything risky suspends and waits for
/// `opspilot resume --approve`.
#[derive(Parser, Debug)]
#[command(name = "opspilot")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one request through the engine
    Run(RunArgs),

    /// Resume a session that is waiting for approval
    Resume(ResumeArgs),

    /// Roll back a recorded file change by id
    Rollback(RollbackArgs),

    /// List recent change records
    Changes(ChangesArgs),

    /// Manage cross-session memory
    Memory(MemoryArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// The request, in plain language
    pub message: String,

    /// Session id (one pending approval per session)
    #[arg(short, long, default_value = "default")]
    pub session: String,

    /// Interactive-terminal risk cap instead of the stricter CLI cap
    #[arg(long)]
    pub tui: bool,

    /// Force dry-run for every action this turn
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Parser, Debug)]
pub struct ResumeArgs {
    /// Session id to resume
    pub session: String,

    /// Approve the pending instruction
    #[arg(long, conflicts_with = "deny")]
    pub approve: bool,

    /// Reject the pending instruction
    #[arg(long)]
    pub deny: bool,
}

#[derive(Parser, Debug)]
pub struct RollbackArgs {
    /// Change id reported by the original operation
    pub change_id: String,
}

#[derive(Parser, Debug)]
pub struct ChangesArgs {
    /// Number of records to show
    #[arg(short, long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Parser, Debug)]
pub struct MemoryArgs {
    #[command(subcommand)]
    pub command: MemoryCommand,
}

#[derive(Subcommand, Debug)]
pub enum MemoryCommand {
    /// Store a fact for future sessions
    Remember {
        key: String,
        value: String,
    },
    /// List stored entries
    List,
    /// Remove an entry
    Forget {
        key: String,
    },
}

/// Stable exit codes: 0 success, 1 validation/safety reject, 2 LLM
/// transport failure, 130 cancelled.
pub async fn execute(cli: Cli) -> Result<i32> {
    let config = Config::load().await.unwrap_or_default();

    match cli.command {
        Command::Run(args) => run_turn(config, args).await,
        Command::Resume(args) => resume_turn(config, args).await,
        Command::Rollback(args) => {
            let tracker = ChangeTracker::with_retention(
                config.paths().changes_dir(),
                config.changes.retention_days,
            );
            match tracker.rollback(&args.change_id).await {
                Ok(message) => {
                    println!("{message}");
                    Ok(0)
                }
                Err(err) => {
                    eprintln!("rollback failed: {err:#}");
                    Ok(1)
                }
            }
        }
        Command::Changes(args) => {
            let tracker = ChangeTracker::with_retention(
                config.paths().changes_dir(),
                config.changes.retention_days,
            );
            for record in tracker.list(args.limit).await? {
                let target = record.target_path.as_deref().unwrap_or("-");
                let rolled = if record.rolled_back { " (rolled back)" } else { "" };
                println!(
                    "{}  {:?}  {}  {}{rolled}",
                    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    record.kind,
                    record.change_id,
                    target
                );
            }
            Ok(0)
        }
        Command::Memory(args) => {
            let paths = config.paths();
            let memory = crate::memory::MemoryStore::new(
                paths.memory_file(),
                config.memory.capacity,
                config.memory.save_debounce_ms,
            );
            match args.command {
                MemoryCommand::Remember { key, value } => {
                    memory.store(&key, &value, MemoryCategory::Fact).await?;
                    memory.flush().await?;
                    println!("remembered {key}");
                }
                MemoryCommand::List => {
                    for entry in memory.list().await {
                        println!("[{:?}] {}: {} (hits: {})", entry.category, entry.key, entry.value, entry.hit_count);
                    }
                }
                MemoryCommand::Forget { key } => {
                    if memory.forget(&key).await {
                        memory.flush().await?;
                        println!("forgot {key}");
                    } else {
                        println!("no such key: {key}");
                    }
                }
            }
            Ok(0)
        }
    }
}

async fn build_engine(config: Config) -> Result<Engine> {
    let env = EnvironmentContext::detect().await;
    let workers = WorkerRegistry::with_defaults(&config.paths());
    let llm = Arc::new(OpenAiClient::new(config.llm.clone())?);
    Engine::new(config, workers, llm, env)
}

async fn run_turn(mut config: Config, args: RunArgs) -> Result<i32> {
    if args.dry_run {
        config.safety.dry_run_by_default = true;
    }
    let mode = if args.tui { Mode::Tui } else { Mode::Cli };

    let engine = build_engine(config).await?;
    let result = engine.run(&args.session, &args.message, mode).await?;
    report(result, &args.session)
}

async fn resume_turn(config: Config, args: ResumeArgs) -> Result<i32> {
    if !args.approve && !args.deny {
        anyhow::bail!("pass --approve or --deny");
    }
    let engine = build_engine(config).await?;
    let result = engine.resume(&args.session, args.approve).await?;
    report(result, &args.session)
}

fn report(result: RunResult, session: &str) -> Result<i32> {
    match result {
        RunResult::Done { final_message, error } => {
            println!("{final_message}");
            Ok(match error {
                None => 0,
                Some(EngineError::LlmTransport { .. }) => 2,
                Some(EngineError::Cancelled) => 130,
                Some(_) => 1,
            })
        }
        RunResult::Pending { risk, preview } => {
            println!(
                "Approval required [risk: {risk}]: {} (args: {})",
                preview.qualified_action(),
                serde_json::Value::Object(preview.args.clone())
            );
            println!("Run `opspilot resume {session} --approve` to continue or `--deny` to cancel.");
            Ok(0)
        }
    }
}
