//! Ralphy CLI entrypoint.

use clap::Parser;
use ralphy::adapters::engine::CliEngine;
use ralphy::adapters::EngineConfig;
use ralphy::cli::commands::{Cli, Commands, GcArgs, QueueArgs, QueueBackendArg, RunArgs, StatusArgs};
use ralphy::cli::output::{create_table, output, output_error, OutputFormat};
use ralphy::core::cleanup::{install_signal_handler, CleanupRegistry};
use ralphy::core::command::CommandRunner;
use ralphy::core::error::{CoreError, Result};
use ralphy::core::locks::LockManager;
use ralphy::core::retry::CircuitBreaker;
use ralphy::orchestrator::Orchestrator;
use ralphy::queue::file::FileQueue;
use ralphy::queue::memory::MemoryQueue;
use ralphy::queue::TaskQueue;
use ralphy::source::TaskSource;
use ralphy::storage::hash_store::HashStore;
use ralphy::storage::state::TaskStateManager;
use std::process;
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let cli = Cli::parse();
    let format = cli.format;

    let result = match cli.command {
        Commands::Version => {
            println!("ralphy {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Run(args) => handle_run(&args, format),
        Commands::Status(args) => handle_status(&args, format),
        Commands::Queue(args) => handle_queue(&args, format),
        Commands::Gc(args) => handle_gc(&args, format),
    };

    match result {
        Ok(()) => {}
        Err(err) => {
            output_error(&err, format);
            process::exit(1);
        }
    }
}

fn build_queue(args: &RunArgs) -> Result<Box<dyn TaskQueue>> {
    match args.queue {
        QueueBackendArg::Memory => Ok(Box::new(MemoryQueue::new())),
        QueueBackendArg::File => {
            let path = args.dir.join(".ralphy").join("queue.json");
            Ok(Box::new(FileQueue::open(path)?))
        }
        #[cfg(feature = "redis-queue")]
        QueueBackendArg::Redis => {
            let name = args
                .dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "default".to_string());
            Ok(Box::new(ralphy::queue::redis::RedisQueue::open(
                &args.redis_url,
                &name,
            )?))
        }
    }
}

fn handle_run(args: &RunArgs, format: OutputFormat) -> Result<()> {
    let registry = Arc::new(CleanupRegistry::new());
    install_signal_handler(Arc::clone(&registry))
        .map_err(|e| CoreError::unknown(format!("failed to install signal handler: {e}")))?;

    let source = TaskSource::open(&args.source)?;
    let runner = Arc::new(CommandRunner::new(registry));

    let mut config = EngineConfig::new(&args.engine, &args.engine)
        .with_timeout(Duration::from_secs(args.timeout));
    for arg in &args.engine_args {
        config = config.with_arg(arg);
    }
    if let Some(ref model) = args.model {
        config = config.with_model(model);
    }
    let engine = CliEngine::new(config, runner);

    let queue = build_queue(args)?;
    let orchestrator = Orchestrator::new(
        &args.dir,
        &source,
        queue,
        Arc::new(CircuitBreaker::new()),
    )?;

    let tasks = orchestrator.prepare(&source)?;
    if format == OutputFormat::Table {
        println!("{} task(s) loaded from {}", tasks.len(), args.source.display());
    }

    let summary = orchestrator.run_all(&engine, &source);
    orchestrator.queue().close()?;
    let summary = summary?;

    match format {
        OutputFormat::Table => {
            let mut table = create_table(&["completed", "failed", "skipped", "tokens in", "tokens out"]);
            table.add_row(vec![
                summary.completed.to_string(),
                summary.failed.to_string(),
                summary.skipped.to_string(),
                summary.input_tokens.to_string(),
                summary.output_tokens.to_string(),
            ]);
            println!("{table}");
        }
        _ => output(&serde_json::json!({
            "completed": summary.completed,
            "failed": summary.failed,
            "skipped": summary.skipped,
            "inputTokens": summary.input_tokens,
            "outputTokens": summary.output_tokens,
        }), format),
    }

    if summary.failed > 0 {
        process::exit(1);
    }
    Ok(())
}

fn handle_status(args: &StatusArgs, format: OutputFormat) -> Result<()> {
    let source = TaskSource::open(&args.source)?;
    let state = TaskStateManager::new(
        &args.dir,
        source.source_type(),
        source.path().to_string_lossy(),
    );
    state.load()?;
    let entries = state.entries();

    match format {
        OutputFormat::Table => {
            let mut table = create_table(&["id", "title", "state", "attempts", "last error"]);
            for entry in &entries {
                table.add_row(vec![
                    entry.id.clone(),
                    entry.title.clone(),
                    entry.state.to_string(),
                    entry.attempt_count.to_string(),
                    entry
                        .error_history
                        .last()
                        .cloned()
                        .unwrap_or_default(),
                ]);
            }
            println!("{table}");
        }
        _ => output(&entries, format),
    }
    Ok(())
}

fn handle_queue(args: &QueueArgs, format: OutputFormat) -> Result<()> {
    let path = args.dir.join(".ralphy").join("queue.json");
    let queue = FileQueue::open(path)?;
    let stats = queue.stats()?;
    queue.close()?;

    match format {
        OutputFormat::Table => {
            let mut table = create_table(&["pending", "running", "completed", "failed", "skipped"]);
            table.add_row(vec![
                stats.pending.to_string(),
                stats.running.to_string(),
                stats.completed.to_string(),
                stats.failed.to_string(),
                stats.skipped.to_string(),
            ]);
            println!("{table}");
        }
        _ => output(&stats, format),
    }
    Ok(())
}

fn handle_gc(args: &GcArgs, format: OutputFormat) -> Result<()> {
    let max_age = Duration::from_secs(args.max_age_hours * 60 * 60);
    let removed_caches = HashStore::gc(&args.dir, max_age)?;
    let evicted_locks = LockManager::new().cleanup_stale(&args.dir)?;

    output(
        &serde_json::json!({
            "removedCaches": removed_caches,
            "evictedLocks": evicted_locks,
        }),
        format,
    );
    Ok(())
}
