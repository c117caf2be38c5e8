//! doc-spawner
//!
//! Runs a pool of documentation agents against a SQLite task queue. Agents
//! spawn child tasks as they go; when the queue drains, one finalization
//! task builds the index.

use anyhow::{Context, Result, bail};
use clap::Parser;
use doc_spawner::capability::CommandCapability;
use doc_spawner::cli::query::{ListArgs, ShowArgs, StatusArgs};
use doc_spawner::cli::start::StartArgs;
use doc_spawner::cli::{Cli, Command};
use doc_spawner::config::{Config, ConfigLoader};
use doc_spawner::controller::{QueueController, RunEnd, StartOptions};
use doc_spawner::db::Database;
use doc_spawner::format::{
    OutputFormat, format_status_text, format_task_text, format_tasks_text, to_json,
};
use doc_spawner::logging::{LogSink, init_logging};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LogSink::parse(&cli.log), cli.verbose)?;

    let mut loader = match &cli.config {
        Some(path) => ConfigLoader::load_file(Path::new(path))?,
        None => ConfigLoader::load()?,
    };
    if let Some(path) = loader.config_path() {
        debug!("Using config {}", path.display());
    }

    let config = loader.config_mut();
    if let Some(db_path) = &cli.database {
        config.store.db_path = db_path.into();
    }
    if let Command::Start(args) = &cli.command {
        if let Some(workers) = args.workers {
            config.queue.num_workers = workers;
        }
        if let Some(max_depth) = args.max_depth {
            config.queue.max_depth = max_depth;
        }
    }

    let config = loader.into_config();
    config.validate()?;
    config.ensure_db_dir()?;

    let db = Database::open(&config.store.db_path).with_context(|| {
        format!(
            "failed to open task store {}",
            config.store.db_path.display()
        )
    })?;
    let controller = QueueController::new(db, config);

    match cli.command {
        Command::Start(args) => run_start(&controller, args).await?,
        Command::Status(args) => run_status(&controller, args)?,
        Command::List(args) => run_list(&controller, args)?,
        Command::Show(args) => run_show(&controller, args)?,
        Command::Cancel { task_id } => run_cancel(&controller, task_id)?,
        Command::Reset { yes } => {
            if !yes {
                bail!("reset deletes every task; pass --yes to confirm");
            }
            let deleted = controller.reset()?;
            println!("Deleted {} tasks.", deleted);
        }
    }

    Ok(())
}

async fn run_start(controller: &QueueController, args: StartArgs) -> Result<()> {
    let config: &Config = controller.config();
    if config.capability.command.is_empty() {
        bail!("capability.command is not configured; set it in config.yaml");
    }

    let seeds = args.seeds()?;
    if seeds.is_empty() && !args.resume {
        bail!("nothing to run: pass --prompt and --output, --seed-file, or --resume");
    }

    let capability = Arc::new(CommandCapability::from_config(&config.capability));
    let report = controller.start(
        seeds,
        StartOptions {
            resume: args.resume,
        },
        capability,
    )?;

    if report.resumed {
        println!("Resuming existing queue.");
    } else if report.seeded.is_empty() {
        controller.stop().await?;
        bail!("store is empty and no seeds were given");
    } else {
        println!("Seeded {} root tasks.", report.seeded.len());
    }

    tokio::select! {
        end = controller.wait_drained() => {
            if end? == RunEnd::Drained {
                info!("Queue drained");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; waiting for running tasks to finish");
        }
    }

    controller
        .stop()
        .await
        .context("run aborted after repeated task store errors")?;

    print!("{}", format_status_text(&controller.status()?));
    Ok(())
}

fn run_status(controller: &QueueController, args: StatusArgs) -> Result<()> {
    let status = controller.status()?;
    match args.format {
        OutputFormat::Text => print!("{}", format_status_text(&status)),
        OutputFormat::Json => println!("{}", to_json(&status)?),
    }
    Ok(())
}

fn run_list(controller: &QueueController, args: ListArgs) -> Result<()> {
    let tasks = controller.list_tasks(&args.filter())?;
    match args.format {
        OutputFormat::Text => print!("{}", format_tasks_text(&tasks)),
        OutputFormat::Json => println!("{}", to_json(&tasks)?),
    }
    Ok(())
}

fn run_show(controller: &QueueController, args: ShowArgs) -> Result<()> {
    let task = controller.get_task(&args.task_id)?;
    match args.format {
        OutputFormat::Text => print!("{}", format_task_text(&task)),
        OutputFormat::Json => println!("{}", to_json(&task)?),
    }
    Ok(())
}

fn run_cancel(controller: &QueueController, task_id: Option<String>) -> Result<()> {
    match task_id {
        Some(id) => {
            let task = controller.cancel(&id)?;
            println!("Cancelled {}.", task.id);
        }
        None => {
            let cancelled = controller.cancel_all_pending()?;
            println!("Cancelled {} pending tasks.", cancelled);
        }
    }
    Ok(())
}
