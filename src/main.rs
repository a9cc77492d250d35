use anyhow::Result;
use async_trait::async_trait;
use attache::agent::{AgentExecutor, LocalAgent};
use attache::config::Config;
use attache::router::ExecutionRouter;
use attache::scheduler::{ScheduleExecutor, ScheduleRegistry};
use attache::storage::{Schedule, SqliteStorage, Storage};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

/// Attaché - a personal assistant orchestrator.
#[derive(Parser, Debug)]
#[command(name = "attache")]
#[command(version)]
#[command(about = "Resilient scheduling and execution routing for a personal assistant.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the orchestrator: channel listener, scheduler, silence timers
    Daemon,
    /// Show configuration and scheduler health
    Status,
    /// Manage cron schedules
    Schedule {
        #[command(subcommand)]
        schedule_command: ScheduleCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ScheduleCommands {
    /// List schedules for a user
    List {
        #[arg(long)]
        user: String,
    },
    /// Add a schedule (5-field crontab expression)
    Add {
        #[arg(long)]
        user: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        cron: String,
        #[arg(long)]
        prompt: String,
    },
    /// Replace an existing schedule's name, cron, and prompt
    Update {
        #[arg(long)]
        user: String,
        #[arg(long)]
        id: i64,
        #[arg(long)]
        name: String,
        #[arg(long)]
        cron: String,
        #[arg(long)]
        prompt: String,
    },
    /// Remove a schedule by id
    Remove {
        #[arg(long)]
        id: i64,
    },
}

/// Schedule CRUD from the CLI persists only; jobs are picked up by the
/// daemon on its next reload (SIGUSR1 or restart).
struct InertExecutor;

#[async_trait]
impl ScheduleExecutor for InertExecutor {
    async fn run_scheduled(&self, _schedule: &Schedule) -> Result<()> {
        Ok(())
    }
}

fn open_registry(config: &Config) -> Result<ScheduleRegistry> {
    let storage: Arc<dyn Storage> = Arc::new(SqliteStorage::new(
        config.workspace_dir.join("attache.db"),
    ));
    ScheduleRegistry::new(
        storage,
        Arc::new(InertExecutor),
        &config.scheduler.timezone,
        config.scheduler.max_schedules,
        config.workspace_dir.join("scheduler-health.json"),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    let config = Config::load_or_init()?;

    match cli.command {
        Commands::Daemon => attache::daemon::run(config).await,

        Commands::Status => {
            println!("📎 Attaché Status");
            println!();
            println!("Version:    {}", env!("CARGO_PKG_VERSION"));
            println!("Workspace:  {}", config.workspace_dir.display());
            println!("Config:     {}", config.config_path.display());
            println!();
            println!(
                "🤖 Model:     {}",
                config.default_model.as_deref().unwrap_or("(engine default)")
            );
            println!(
                "⏰ Scheduler: {} (tz {}, silence {}min)",
                if config.scheduler.enabled { "enabled" } else { "disabled" },
                config.scheduler.timezone,
                config.scheduler.silence_timeout_secs / 60
            );
            println!(
                "🔀 Routing:   {}% canary → {}",
                config.routing.canary_percent,
                config
                    .routing
                    .runner_endpoint
                    .as_deref()
                    .filter(|e| !e.is_empty())
                    .unwrap_or("(local only)")
            );
            let marker = config.workspace_dir.join("scheduler-health.json");
            match std::fs::read_to_string(&marker) {
                Ok(contents) => println!("💓 Scheduler health: {}", contents.trim()),
                Err(_) => println!("💓 Scheduler health: no marker yet"),
            }
            // Engine sanity: report whether the configured CLI resolves.
            let agent: Arc<dyn AgentExecutor> = Arc::new(LocalAgent::new(&config.agent));
            let router = ExecutionRouter::from_config(&config.routing, agent.clone());
            println!(
                "⚙️  Engine:    {} (remote runner {})",
                agent.name(),
                if router.has_remote() { "configured" } else { "absent" }
            );
            Ok(())
        }

        Commands::Schedule { schedule_command } => {
            let registry = open_registry(&config)?;
            let result = match schedule_command {
                ScheduleCommands::List { user } => {
                    let schedules = registry.list(&user).await?;
                    if schedules.is_empty() {
                        println!("No schedules for {user}.");
                    }
                    for s in schedules {
                        println!(
                            "#{} {} `{}` {}{}",
                            s.id,
                            s.name,
                            s.cron,
                            s.prompt,
                            if s.is_active { "" } else { " (inactive)" }
                        );
                    }
                    Ok(())
                }
                ScheduleCommands::Add {
                    user,
                    name,
                    cron,
                    prompt,
                } => {
                    let id = registry.add(&user, &name, &cron, &prompt).await?;
                    println!("✅ Schedule #{id} added.");
                    Ok(())
                }
                ScheduleCommands::Update {
                    user,
                    id,
                    name,
                    cron,
                    prompt,
                } => {
                    registry.update(&user, id, &name, &cron, &prompt).await?;
                    println!("✅ Schedule #{id} updated.");
                    Ok(())
                }
                ScheduleCommands::Remove { id } => {
                    registry.remove(id).await?;
                    println!("🗑 Schedule #{id} removed.");
                    Ok(())
                }
            };
            registry.shutdown();
            result
        }
    }
}
