use crate::agent::{AgentExecutor, ExecOptions, LocalAgent};
use crate::channels::{Channel, TelegramChannel};
use crate::config::Config;
use crate::health;
use crate::pipeline::{CommandRouter, MessagePipeline};
use crate::router::ExecutionRouter;
use crate::scheduler::{
    ReflectionEngine, ReflectionTrigger, Reflector, ScheduleExecutor, ScheduleRegistry,
    SilenceTimers,
};
use crate::storage::{Role, Schedule, SqliteStorage, Storage};
use crate::sync::TurnSyncBridge;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Executes a fired schedule: routes the stored prompt like a normal turn,
/// persists the exchange, and delivers the result to the schedule's owner.
struct ScheduledPromptRunner {
    storage: Arc<dyn Storage>,
    router: Arc<ExecutionRouter>,
    channel: Arc<dyn Channel>,
    default_model: Option<String>,
}

#[async_trait]
impl ScheduleExecutor for ScheduledPromptRunner {
    async fn run_scheduled(&self, schedule: &Schedule) -> Result<()> {
        let user_id = &schedule.user_id;
        // Unique per firing so canary bucketing spreads schedule traffic too.
        let message_id = format!("schedule-{}-{}", schedule.id, Utc::now().timestamp_millis());
        let options = ExecOptions {
            model: self.default_model.clone(),
            ..ExecOptions::default()
        };

        match self
            .router
            .route(user_id, &message_id, &schedule.prompt, &options)
            .await
        {
            Ok(result) => {
                let reply = format!("🕐 [Schedule: {}]\n\n{}", schedule.name, result.output);
                self.storage
                    .add_message(user_id, Role::Model, &reply, None)
                    .await?;
                self.channel.send(&reply, user_id).await?;
                health::mark_component_ok("scheduler");
                Ok(())
            }
            Err(e) => {
                health::record_runtime_issue(
                    "scheduler",
                    format!("schedule #{} ({}): {e}", schedule.id, schedule.name),
                );
                let _ = self
                    .channel
                    .send(
                        &format!("❌ Scheduled task '{}' failed: {e}", schedule.name),
                        user_id,
                    )
                    .await;
                Err(e.into())
            }
        }
    }
}

async fn startup_activity_check(
    storage: &dyn Storage,
    channel: &dyn Channel,
    reflector: &dyn Reflector,
    silence: &SilenceTimers,
    user: &str,
    timeout: Duration,
) {
    match storage.get_last_message_time(user).await {
        Ok(None) => {
            let _ = channel
                .send("👋 Attaché is up. Send me anything to get started.", user)
                .await;
            silence.reset(user);
        }
        Ok(Some(last)) => {
            let elapsed = (Utc::now() - last).to_std().unwrap_or_default();
            if elapsed >= timeout {
                info!(user, "Silence window already elapsed at startup; reflecting now");
                if let Err(e) = reflector
                    .reflect(user, ReflectionTrigger::Silence, None)
                    .await
                {
                    warn!(user, "Startup reflection failed: {e}");
                }
                silence.reset(user);
            } else {
                silence.reset_after(user, timeout - elapsed);
            }
        }
        Err(e) => {
            warn!(user, "Startup activity check failed: {e}");
            silence.reset(user);
        }
    }
}

pub async fn run(config: Config) -> Result<()> {
    let workspace = config.workspace_dir.clone();
    std::fs::create_dir_all(&workspace).context("Failed to create workspace directory")?;

    let storage: Arc<dyn Storage> =
        Arc::new(SqliteStorage::new(workspace.join("attache.db")));
    let agent: Arc<dyn AgentExecutor> = Arc::new(LocalAgent::new(&config.agent));
    let router = Arc::new(ExecutionRouter::from_config(&config.routing, agent.clone()));

    let bot_token = config
        .telegram
        .bot_token
        .clone()
        .context("telegram.bot_token is not configured (set TELEGRAM_BOT_TOKEN)")?;
    let channel: Arc<dyn Channel> = Arc::new(TelegramChannel::new(
        bot_token,
        config.telegram.allowed_users.clone(),
    ));

    let reflection = Arc::new(ReflectionEngine::new(
        storage.clone(),
        agent.clone(),
        channel.clone(),
        config.scheduler.reflection_lookback_hours,
    ));
    let silence = Arc::new(SilenceTimers::new(
        reflection.clone() as Arc<dyn Reflector>,
        Duration::from_secs(config.scheduler.silence_timeout_secs),
    ));

    let schedule_runner = Arc::new(ScheduledPromptRunner {
        storage: storage.clone(),
        router: router.clone(),
        channel: channel.clone(),
        default_model: config.default_model.clone(),
    });
    let registry = Arc::new(ScheduleRegistry::new(
        storage.clone(),
        schedule_runner,
        &config.scheduler.timezone,
        config.scheduler.max_schedules,
        workspace.join("scheduler-health.json"),
    )?);
    if config.scheduler.enabled {
        let jobs = registry.init().await?;
        info!("Scheduler started with {jobs} active job(s)");
        health::mark_component_ok("scheduler");
    } else {
        info!("Scheduler disabled by config");
    }

    let commands = Arc::new(CommandRouter::new(
        storage.clone(),
        registry.clone(),
        reflection.clone() as Arc<dyn Reflector>,
        channel.clone(),
    ));

    let sync = Arc::new(TurnSyncBridge::new(&config.sync, &workspace));
    sync.spawn_queue_poller(&config.sync);

    // The default user gets a silence timer from boot, not just from their
    // first message: greet on an empty history, reflect immediately when the
    // silence window already lapsed, otherwise arm for the remainder.
    if config.scheduler.enabled {
        if let Some(user) = config.default_user.as_deref() {
            startup_activity_check(
                storage.as_ref(),
                channel.as_ref(),
                reflection.as_ref(),
                &silence,
                user,
                Duration::from_secs(config.scheduler.silence_timeout_secs),
            )
            .await;
        }
    }

    // Periodic status snapshot for `attache status` and external monitors.
    let status_writer = {
        let status_path = workspace.join("status.json");
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let snapshot = health::snapshot_json();
                if let Err(e) = tokio::fs::write(&status_path, snapshot.to_string()).await {
                    tracing::debug!("Failed to write status file: {e}");
                }
            }
        })
    };

    let pipeline = Arc::new(MessagePipeline::new(
        config.pipeline.clone(),
        workspace,
        config.default_model.clone(),
        storage,
        silence.clone(),
        commands,
        router,
        channel.clone(),
        sync,
    ));

    let (tx, mut rx) = mpsc::channel(100);
    let listener = {
        let channel = channel.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.listen(tx).await {
                error!("Channel listener exited: {e:#}");
            }
        })
    };
    health::mark_component_ok("daemon");
    info!("Attaché daemon running, press Ctrl+C to stop");

    let mut reload = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
        .context("Failed to install SIGUSR1 handler")?;

    loop {
        tokio::select! {
            maybe_msg = rx.recv() => {
                let Some(msg) = maybe_msg else {
                    warn!("Inbound channel closed, shutting down");
                    break;
                };
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    pipeline.handle_message(&msg).await;
                });
            }
            _ = reload.recv() => {
                info!("SIGUSR1 received, reloading schedules");
                match registry.reload_all().await {
                    Ok(count) => info!("Reloaded {count} schedule(s)"),
                    Err(e) => {
                        error!("Schedule reload failed: {e:#}");
                        health::record_runtime_issue("scheduler", format!("{e:#}"));
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    listener.abort();
    status_writer.abort();
    registry.shutdown();
    silence.shutdown();
    info!("Daemon stopped");
    Ok(())
}
