//! # ClubSync: scheduled club data collection
//!
//! Usage:
//!   clubsync init-config                          # Write ~/.clubsync/config.toml
//!   clubsync entity add team-usa                  # Resolve and register a club
//!   clubsync task add nightly --days 2,3 --start-hour 20 --end-hour 23 \
//!       --timezone EST --targets team-usa          # Create a collection task
//!   clubsync task run <id>                        # Run now, print the execution record
//!   clubsync serve                                # Trigger loop + job queue until Ctrl-C

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use clubsync_core::clock::SystemClock;
use clubsync_core::config::ClubSyncConfig;
use clubsync_core::task::{
    CollectionSettings, EntityId, ExecutionRecord, ScheduleWindow, Task, TaskId,
};
use clubsync_scheduler::{SchedulerDb, SchedulerService};
use clubsync_source::HttpDataSource;

#[derive(Parser)]
#[command(name = "clubsync", version, about = "📅 ClubSync: scheduled club data collection")]
struct Cli {
    /// Config file (default: ~/.clubsync/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Override the database path from the config
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the trigger loop and job workers until interrupted
    Serve,
    /// Manage collection tasks
    Task {
        #[command(subcommand)]
        action: TaskCommand,
    },
    /// Manage target entities (clubs)
    Entity {
        #[command(subcommand)]
        action: EntityCommand,
    },
    /// Write a default config file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Create a task
    Add {
        name: String,
        /// Days of week, 0 = Sunday (e.g. 2,3)
        #[arg(long, value_delimiter = ',', required = true)]
        days: Vec<u32>,
        #[arg(long)]
        start_hour: u32,
        #[arg(long)]
        end_hour: u32,
        #[arg(long, default_value = "UTC")]
        timezone: String,
        /// Entity ids, processed in this order
        #[arg(long, value_delimiter = ',')]
        targets: Vec<String>,
        #[arg(long, default_value = "chesscom")]
        platform: String,
        #[arg(long = "type", default_value = "members")]
        task_type: String,
        #[arg(long, default_value = "cli")]
        owner: String,
        #[arg(long, default_value_t = 60)]
        frequency_minutes: u32,
        #[arg(long, default_value_t = 3)]
        retry_attempts: u32,
        #[arg(long, default_value_t = 5)]
        retry_delay_minutes: u32,
        #[arg(long, default_value = "")]
        description: String,
        /// Create the task stopped
        #[arg(long)]
        stopped: bool,
    },
    /// List tasks
    List,
    /// Show one task as JSON
    Show { id: String },
    /// Activate a task
    Start { id: String },
    /// Deactivate a task and clear its next run
    Stop { id: String },
    /// Run a task now and print the result
    Run { id: String },
    /// Show execution history, newest first
    History {
        id: String,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Replace a task's schedule window
    Reschedule {
        id: String,
        #[arg(long, value_delimiter = ',', required = true)]
        days: Vec<u32>,
        #[arg(long)]
        start_hour: u32,
        #[arg(long)]
        end_hour: u32,
        #[arg(long, default_value = "UTC")]
        timezone: String,
    },
    /// Replace a task's target entities
    Targets {
        id: String,
        #[arg(value_delimiter = ',', required = true)]
        targets: Vec<String>,
    },
    /// Delete a task and its history
    Delete { id: String },
}

#[derive(Subcommand)]
enum EntityCommand {
    /// Look up a club on the platform and register it
    Add {
        name: String,
        #[arg(long, default_value = "chesscom")]
        platform: String,
    },
    /// List registered entities
    List,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

fn load_config(cli: &Cli) -> Result<ClubSyncConfig> {
    let mut config = match &cli.config {
        Some(path) => ClubSyncConfig::load_from(&expand_path(path))?,
        None => ClubSyncConfig::load()?,
    };
    if let Some(db_path) = &cli.db_path {
        config.storage.db_path = db_path.clone();
    }
    Ok(config)
}

fn parse_id(id: &str) -> Result<TaskId> {
    Ok(id.parse::<TaskId>()?)
}

fn print_record(record: &ExecutionRecord) {
    let error = record.error().map(|e| format!("  ({e})")).unwrap_or_default();
    println!(
        "{}  {:<7}  {} items / {} entities  {}ms{}",
        record.timestamp.format("%Y-%m-%d %H:%M:%S"),
        record.status().as_str(),
        record.items_collected,
        record.entities_processed,
        record.duration_ms,
        error
    );
}

fn print_task(task: &Task) {
    let next = task
        .next_run
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| "-".into());
    println!(
        "{}  {:<20}  {}  {}/{}  {} targets  next: {}",
        task.id,
        task.name,
        if task.active { "▶️" } else { "⏸️" },
        task.settings.platform,
        task.settings.task_type,
        task.targets.len(),
        next
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Directive targets are prefixes, so this also covers the clubsync_* crates.
    let filter = if cli.verbose { "clubsync=debug" } else { "clubsync=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    if let Command::InitConfig { force } = &cli.command {
        let path = cli
            .config
            .as_deref()
            .map(expand_path)
            .unwrap_or_else(ClubSyncConfig::default_path);
        if path.exists() && !force {
            println!("⚠️  Config already exists at {} (use --force to overwrite)", path.display());
            return Ok(());
        }
        ClubSyncConfig::with_default_sources().save_to(&path)?;
        println!("✅ Wrote default config to {}", path.display());
        return Ok(());
    }

    let config = load_config(&cli)?;
    let db_path = config.storage.resolved_db_path();
    let db = Arc::new(
        SchedulerDb::open(&db_path).with_context(|| format!("opening {}", db_path.display()))?,
    );
    let source = Arc::new(HttpDataSource::from_config(&config));
    let service = SchedulerService::new(
        &config,
        db.clone(),
        db.clone(),
        source.clone(),
        db.clone(),
        Arc::new(SystemClock),
    );

    match cli.command {
        Command::Serve => serve(&config, &service, &source).await?,
        Command::Task { action } => task_command(&service, action).await?,
        Command::Entity { action } => match action {
            EntityCommand::Add { name, platform } => {
                let entity = service.register_entity(&name, &platform).await?;
                println!("✅ Registered '{}' as {}", entity.name, entity.id);
            }
            EntityCommand::List => {
                for entity in service.list_entities().await? {
                    println!("{:<24}  {:<10}  {}", entity.id, entity.platform, entity.name);
                }
            }
        },
        Command::InitConfig { .. } => {}
    }

    Ok(())
}

async fn serve(
    config: &ClubSyncConfig,
    service: &SchedulerService,
    source: &HttpDataSource,
) -> Result<()> {
    println!("📅 ClubSync scheduler");
    println!("   Database:  {}", config.storage.resolved_db_path().display());
    println!("   Platforms: {}", source.platforms().join(", "));
    println!("   Workers:   {}", config.queue.workers);
    println!("   Cache TTL: {}s", config.cache.ttl_secs);

    service.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("👋 Shutting down");
    service.shutdown();

    let status = service.status().await;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn task_command(service: &SchedulerService, action: TaskCommand) -> Result<()> {
    match action {
        TaskCommand::Add {
            name,
            days,
            start_hour,
            end_hour,
            timezone,
            targets,
            platform,
            task_type,
            owner,
            frequency_minutes,
            retry_attempts,
            retry_delay_minutes,
            description,
            stopped,
        } => {
            let mut settings = CollectionSettings::new(&platform, &task_type);
            settings.frequency_minutes = frequency_minutes;
            settings.retry_attempts = retry_attempts;
            settings.retry_delay_minutes = retry_delay_minutes;
            let mut task = Task::new(
                &name,
                &owner,
                ScheduleWindow::new(start_hour, end_hour, &days, &timezone),
                settings,
            )
            .with_targets(targets)
            .with_description(&description);
            task.active = !stopped;

            let task = service.create_task(task).await?;
            println!("✅ Task created");
            print_task(&task);
        }
        TaskCommand::List => {
            for task in service.list_tasks().await? {
                print_task(&task);
            }
        }
        TaskCommand::Show { id } => {
            let task = service.get_task(&parse_id(&id)?).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommand::Start { id } => print_task(&service.start_task(&parse_id(&id)?).await?),
        TaskCommand::Stop { id } => print_task(&service.stop_task(&parse_id(&id)?).await?),
        TaskCommand::Run { id } => {
            let record = service.run_now(&parse_id(&id)?).await?;
            print_record(&record);
        }
        TaskCommand::History { id, limit } => {
            for record in service.history(&parse_id(&id)?, limit).await? {
                print_record(&record);
            }
        }
        TaskCommand::Reschedule {
            id,
            days,
            start_hour,
            end_hour,
            timezone,
        } => {
            let window = ScheduleWindow::new(start_hour, end_hour, &days, &timezone);
            print_task(&service.update_schedule(&parse_id(&id)?, window).await?);
        }
        TaskCommand::Targets { id, targets } => {
            let targets = targets.into_iter().map(EntityId::new).collect();
            print_task(&service.update_targets(&parse_id(&id)?, targets).await?);
        }
        TaskCommand::Delete { id } => {
            service.delete_task(&parse_id(&id)?).await?;
            println!("🗑️ Task {id} deleted");
        }
    }
    Ok(())
}
