//! End-to-end flows through the public crate API: command-driven schedule
//! management, circuit-breaker fallback under a flapping remote runner, and
//! turn persistence across the pipeline boundary.

use anyhow::Result;
use async_trait::async_trait;
use attache::agent::{AgentExecutor, ExecOptions, RemoteCallError};
use attache::channels::{Channel, ChannelMessage};
use attache::config::{PipelineConfig, RoutingConfig};
use attache::pipeline::{CommandRouter, MessagePipeline};
use attache::router::{ExecutionRouter, RemoteExec};
use attache::scheduler::{
    ReflectionTrigger, Reflector, ScheduleExecutor, ScheduleRegistry, SilenceTimers,
};
use attache::storage::{Role, Schedule, SqliteStorage, Storage};
use attache::sync::TurnSyncBridge;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

struct EchoAgent {
    calls: AtomicUsize,
}

#[async_trait]
impl AgentExecutor for EchoAgent {
    fn name(&self) -> &str {
        "echo"
    }

    async fn execute(&self, input: &str, _options: &ExecOptions) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(format!("echo: {input}"))
    }

    async fn summarize(&self, text: &str) -> Result<String> {
        Ok(text.chars().take(40).collect())
    }
}

struct FlakyRemote {
    calls: AtomicUsize,
}

#[async_trait]
impl RemoteExec for FlakyRemote {
    async fn run_chat(
        &self,
        _input: &str,
        _options: &ExecOptions,
    ) -> Result<String, RemoteCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RemoteCallError::Transient("runner unreachable".into()))
    }

    async fn run_summarize(&self, _text: &str) -> Result<String, RemoteCallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(RemoteCallError::Transient("runner unreachable".into()))
    }
}

#[derive(Default)]
struct CapturingChannel {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Channel for CapturingChannel {
    fn name(&self) -> &str {
        "capturing"
    }

    async fn send(&self, message: &str, _recipient: &str) -> Result<()> {
        self.sent.lock().unwrap().push(message.to_string());
        Ok(())
    }

    async fn send_placeholder(&self, text: &str, _recipient: &str) -> Result<String> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok("7".into())
    }

    async fn edit_message(&self, _id: &str, text: &str, _recipient: &str) -> Result<()> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn send_file(&self, _path: &Path, _c: Option<&str>, _r: &str) -> Result<()> {
        Ok(())
    }

    async fn listen(&self, _tx: tokio::sync::mpsc::Sender<ChannelMessage>) -> Result<()> {
        Ok(())
    }
}

struct NoopSchedules;

#[async_trait]
impl ScheduleExecutor for NoopSchedules {
    async fn run_scheduled(&self, _schedule: &Schedule) -> Result<()> {
        Ok(())
    }
}

struct NoopReflector;

#[async_trait]
impl Reflector for NoopReflector {
    async fn reflect(
        &self,
        _user_id: &str,
        _trigger: ReflectionTrigger,
        _edit_target: Option<&str>,
    ) -> Result<()> {
        Ok(())
    }
}

fn message(content: &str, id: &str) -> ChannelMessage {
    ChannelMessage {
        id: id.into(),
        sender: "owner".into(),
        content: content.into(),
        channel: "test".into(),
        timestamp: 0,
    }
}

struct World {
    pipeline: MessagePipeline,
    channel: Arc<CapturingChannel>,
    agent: Arc<EchoAgent>,
    storage: Arc<SqliteStorage>,
    registry: Arc<ScheduleRegistry>,
    _tmp: TempDir,
}

fn build_world(routing: RoutingConfig, remote: Option<Arc<dyn RemoteExec>>) -> World {
    let tmp = TempDir::new().unwrap();
    let workspace = tmp.path().to_path_buf();
    let storage = Arc::new(SqliteStorage::new(workspace.join("attache.db")));
    let channel = Arc::new(CapturingChannel::default());
    let agent = Arc::new(EchoAgent {
        calls: AtomicUsize::new(0),
    });

    let registry = Arc::new(
        ScheduleRegistry::new(
            storage.clone() as Arc<dyn Storage>,
            Arc::new(NoopSchedules),
            "UTC",
            8,
            workspace.join("scheduler-health.json"),
        )
        .unwrap(),
    );
    let commands = Arc::new(CommandRouter::new(
        storage.clone() as Arc<dyn Storage>,
        registry.clone(),
        Arc::new(NoopReflector),
        channel.clone() as Arc<dyn Channel>,
    ));
    let silence = Arc::new(SilenceTimers::new(
        Arc::new(NoopReflector),
        Duration::from_secs(3600),
    ));
    let router = Arc::new(ExecutionRouter::new(
        routing,
        agent.clone() as Arc<dyn AgentExecutor>,
        remote,
    ));
    let sync = Arc::new(TurnSyncBridge::new(
        &attache::config::SyncConfig {
            mode: attache::config::SyncMode::Off,
            ..attache::config::SyncConfig::default()
        },
        &workspace,
    ));

    let pipeline = MessagePipeline::new(
        PipelineConfig::default(),
        workspace,
        None,
        storage.clone() as Arc<dyn Storage>,
        silence,
        commands,
        router,
        channel.clone() as Arc<dyn Channel>,
        sync,
    );

    World {
        pipeline,
        channel,
        agent,
        storage,
        registry,
        _tmp: tmp,
    }
}

#[tokio::test]
async fn conversation_turn_round_trips_through_the_pipeline() {
    let w = build_world(RoutingConfig::default(), None);

    w.pipeline.handle_message(&message("hello there", "1")).await;

    // The agent sees the assembled prompt (system preamble + history), so the
    // delivered reply is the echo of that prompt ending in the user's words.
    let sent = w.channel.sent.lock().unwrap();
    assert!(sent
        .iter()
        .any(|m| m.starts_with("echo:") && m.contains("hello there")));
    drop(sent);

    let history = w.storage.get_extended_history("owner", 24).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert_eq!(history[0].content, "hello there");
    assert_eq!(history[1].role, Role::Model);

    w.registry.shutdown();
}

#[tokio::test]
async fn schedules_added_in_chat_survive_for_the_next_reload() {
    let w = build_world(RoutingConfig::default(), None);

    w.pipeline
        .handle_message(&message(
            "/add_schedule standup | 30 8 * * 1-5 | Prep my standup notes",
            "2",
        ))
        .await;

    // Persisted, visible to a fresh registry over the same database.
    let schedules = w.storage.get_user_schedules("owner").await.unwrap();
    assert_eq!(schedules.len(), 1);
    assert_eq!(schedules[0].cron, "30 8 * * 1-5");
    assert!(schedules[0].is_active);

    // The engine was never involved.
    assert_eq!(w.agent.calls.load(Ordering::SeqCst), 0);

    let reloaded = w.registry.reload_all().await.unwrap();
    assert_eq!(reloaded, 1);

    w.registry.shutdown();
}

#[tokio::test]
async fn flapping_remote_degrades_to_local_without_user_visible_failures() {
    let remote = Arc::new(FlakyRemote {
        calls: AtomicUsize::new(0),
    });
    let routing = RoutingConfig {
        canary_percent: 100,
        failure_threshold: 2,
        cooldown_ms: 60_000,
        fallback_to_local: true,
        ..RoutingConfig::default()
    };
    let w = build_world(routing, Some(remote.clone() as Arc<dyn RemoteExec>));

    for i in 0..5 {
        w.pipeline
            .handle_message(&message("ping", &format!("msg-{i}")))
            .await;
    }

    // The circuit opened after two failures; later turns skip the remote.
    assert_eq!(remote.calls.load(Ordering::SeqCst), 2);
    // Every turn still produced a local answer.
    assert_eq!(w.agent.calls.load(Ordering::SeqCst), 5);
    let sent = w.channel.sent.lock().unwrap();
    assert_eq!(sent.iter().filter(|m| m.starts_with("echo:")).count(), 5);
    drop(sent);

    w.registry.shutdown();
}
