pub mod commands;
pub mod directives;
pub mod passthrough;

pub use commands::CommandRouter;
pub use directives::{extract_directives, resolve_outbound_path, FileDirective};
pub use passthrough::PassthroughList;

use crate::agent::ExecOptions;
use crate::channels::{Channel, ChannelMessage};
use crate::config::PipelineConfig;
use crate::health;
use crate::router::ExecutionRouter;
use crate::scheduler::SilenceTimers;
use crate::storage::{Role, Storage};
use crate::sync::{ConversationTurn, TurnSyncBridge};
use crate::util::truncate_chars;
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const THINKING_MESSAGES: &[&str] = &[
    "🤔 Thinking...",
    "🧠 Working through it...",
    "🔍 Gathering context...",
    "⚡ Processing...",
    "💭 Drafting a reply...",
];
const THINKING_ROTATE_SECS: u64 = 3;
const HISTORY_WINDOW: usize = 15;
const HISTORY_FULL_TEXT: usize = 5;

const APOLOGY: &str = "😔 Sorry, something went wrong while handling that. Please try again.";

/// Summarize before persisting when content is long, contains a fenced code
/// block, or spans many lines.
pub fn needs_summary(content: &str, config: &PipelineConfig) -> bool {
    content.chars().count() > config.summary_char_threshold
        || content.contains("```")
        || content.matches('\n').count() >= config.summary_newline_threshold
}

/// Per-message orchestration: silence-timer reset, command interception,
/// passthrough classification, routed execution with placeholder UX,
/// summarized persistence, directive post-processing, and turn mirroring.
pub struct MessagePipeline {
    config: PipelineConfig,
    workspace_dir: PathBuf,
    default_model: Option<String>,
    storage: Arc<dyn Storage>,
    silence: Arc<SilenceTimers>,
    commands: Arc<CommandRouter>,
    passthrough: PassthroughList,
    router: Arc<ExecutionRouter>,
    channel: Arc<dyn Channel>,
    sync: Arc<TurnSyncBridge>,
}

impl MessagePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PipelineConfig,
        workspace_dir: PathBuf,
        default_model: Option<String>,
        storage: Arc<dyn Storage>,
        silence: Arc<SilenceTimers>,
        commands: Arc<CommandRouter>,
        router: Arc<ExecutionRouter>,
        channel: Arc<dyn Channel>,
        sync: Arc<TurnSyncBridge>,
    ) -> Self {
        let passthrough = PassthroughList::new(config.passthrough_file.clone());
        Self {
            config,
            workspace_dir,
            default_model,
            storage,
            silence,
            commands,
            passthrough,
            router,
            channel,
            sync,
        }
    }

    pub async fn handle_message(&self, msg: &ChannelMessage) {
        let user_id = msg.sender.clone();
        tracing::info!(channel = %msg.channel, user_id = %user_id, "Inbound message");

        self.silence.reset(&user_id);

        match self.commands.handle(&user_id, &msg.content).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(user_id = %user_id, "Command handling failed: {e}");
                health::record_runtime_issue("commands", &e);
                let _ = self.channel.send(APOLOGY, &user_id).await;
                return;
            }
        }

        let is_passthrough = self.passthrough.is_passthrough(&msg.content);

        // Placeholder failures are non-fatal; continue without one.
        let placeholder_id = match self
            .channel
            .send_placeholder(THINKING_MESSAGES[0], &user_id)
            .await
        {
            Ok(id) if !id.is_empty() => Some(id),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!(user_id = %user_id, "Failed to send placeholder: {e}");
                None
            }
        };
        let rotation = placeholder_id
            .as_ref()
            .map(|id| self.spawn_rotation(id.clone(), user_id.clone()));

        let outcome = self.run_exchange(msg, is_passthrough).await;

        if let Some(handle) = rotation {
            handle.abort();
        }

        match outcome {
            Ok((display, file_directives)) => {
                self.deliver(&display, placeholder_id.as_deref(), &user_id)
                    .await;
                self.deliver_files(&file_directives, &user_id).await;
                health::mark_component_ok("pipeline");
            }
            Err(e) => {
                tracing::error!(user_id = %user_id, "Message handling failed: {e:#}");
                health::record_runtime_issue("pipeline", format!("{e:#}"));
                health::mark_component_error("pipeline", &e);
                self.deliver(APOLOGY, placeholder_id.as_deref(), &user_id)
                    .await;
            }
        }
    }

    fn spawn_rotation(&self, message_id: String, user_id: String) -> tokio::task::JoinHandle<()> {
        let channel = Arc::clone(&self.channel);
        tokio::spawn(async move {
            let mut index = 0usize;
            let mut interval =
                tokio::time::interval(Duration::from_secs(THINKING_ROTATE_SECS));
            interval.tick().await; // first tick is immediate
            loop {
                interval.tick().await;
                index = (index + 1) % THINKING_MESSAGES.len();
                if let Err(e) = channel
                    .edit_message(&message_id, THINKING_MESSAGES[index], &user_id)
                    .await
                {
                    tracing::debug!("Failed to rotate placeholder: {e}");
                }
            }
        })
    }

    async fn maybe_summarize(
        &self,
        user_id: &str,
        message_id: &str,
        content: &str,
    ) -> Option<String> {
        if !needs_summary(content, &self.config) {
            return None;
        }
        match self.router.summarize(user_id, message_id, content).await {
            Ok(summary) => Some(summary),
            Err(e) => {
                tracing::warn!("Summarization failed, falling back to truncation: {e}");
                Some(truncate_chars(content, self.config.summary_char_threshold))
            }
        }
    }

    async fn build_prompt(&self, user_id: &str, content: &str) -> String {
        let mut context = String::new();
        if let Ok(recent) = self.storage.recent_messages(user_id, HISTORY_WINDOW, 0).await {
            for (i, msg) in recent.iter().enumerate() {
                // Newest-first: the most recent few keep their full text,
                // older entries fall back to their stored summary.
                let text = if i < HISTORY_FULL_TEXT {
                    msg.content.as_str()
                } else {
                    msg.summary.as_deref().unwrap_or(&msg.content)
                };
                context.insert_str(0, &format!("{}: {text}\n", msg.role.as_str()));
            }
        }

        format!(
            "System: You are a personal assistant with access to local tools. \
             Use them when the user asks you to look something up or act on files.\n\n\
             Recent conversation:\n{context}\nUser: {content}"
        )
    }

    async fn run_exchange(
        &self,
        msg: &ChannelMessage,
        is_passthrough: bool,
    ) -> Result<(String, Vec<FileDirective>)> {
        let user_id = &msg.sender;

        let user_summary = self.maybe_summarize(user_id, &msg.id, &msg.content).await;
        self.storage
            .add_message(user_id, Role::User, &msg.content, user_summary.as_deref())
            .await?;

        let options = ExecOptions {
            model: self.default_model.clone(),
            is_passthrough_command: is_passthrough,
            force_new_session: self.commands.take_force_new_session(user_id),
        };
        let prompt = if is_passthrough {
            msg.content.trim().to_string()
        } else {
            self.build_prompt(user_id, &msg.content).await
        };

        let routed = self
            .router
            .route(user_id, &msg.id, &prompt, &options)
            .await?;
        tracing::debug!(user_id = %user_id, path = ?routed.path, "Turn executed");

        let (display, file_directives) = extract_directives(&routed.output);

        let model_summary = self.maybe_summarize(user_id, &msg.id, &display).await;
        self.storage
            .add_message(user_id, Role::Model, &display, model_summary.as_deref())
            .await?;

        self.sync.enqueue(ConversationTurn {
            user_id: user_id.clone(),
            user_message: msg.content.clone(),
            model_message: display.clone(),
            platform: msg.channel.clone(),
            is_passthrough_command: is_passthrough,
            force_new_session: options.force_new_session,
        });

        Ok((display, file_directives))
    }

    async fn deliver(&self, text: &str, placeholder_id: Option<&str>, user_id: &str) {
        if let Some(id) = placeholder_id {
            if self.channel.edit_message(id, text, user_id).await.is_ok() {
                return;
            }
            tracing::debug!(user_id, "Placeholder edit failed; sending fresh message");
        }
        if let Err(e) = self.channel.send(text, user_id).await {
            tracing::warn!(user_id, "Failed to deliver response: {e}");
        }
    }

    async fn deliver_files(&self, file_directives: &[FileDirective], user_id: &str) {
        let temp_dir = self.workspace_dir.join(&self.config.file_send_subdir);
        for directive in file_directives {
            match resolve_outbound_path(
                &directive.path,
                &self.workspace_dir,
                &temp_dir,
                self.config.file_size_cap_bytes,
            ) {
                Ok(path) => {
                    if let Err(e) = self
                        .channel
                        .send_file(&path, directive.caption.as_deref(), user_id)
                        .await
                    {
                        tracing::warn!(user_id, "File delivery failed: {e}");
                        let _ = self
                            .channel
                            .send(&format!("⚠️ Could not send {}: {e}", directive.path), user_id)
                            .await;
                    }
                }
                Err(warning) => {
                    let _ = self.channel.send(&warning, user_id).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentExecutor;
    use crate::config::RoutingConfig;
    use crate::scheduler::{
        ReflectionEngine, ReflectionTrigger, Reflector, ScheduleExecutor, ScheduleRegistry,
    };
    use crate::storage::Schedule;
    use crate::storage::SqliteStorage;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FixedAgent {
        response: String,
        fail: bool,
    }

    #[async_trait]
    impl AgentExecutor for FixedAgent {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn execute(&self, _input: &str, _options: &ExecOptions) -> Result<String> {
            if self.fail {
                anyhow::bail!("engine exploded");
            }
            Ok(self.response.clone())
        }

        async fn summarize(&self, text: &str) -> Result<String> {
            Ok(format!("summary of {} chars", text.len()))
        }
    }

    #[derive(Default)]
    struct RecordingChannel {
        sent: Mutex<Vec<String>>,
        edited: Mutex<Vec<(String, String)>>,
        files: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl Channel for RecordingChannel {
        fn name(&self) -> &str {
            "recording"
        }

        async fn send(&self, message: &str, _recipient: &str) -> Result<()> {
            self.sent.lock().unwrap().push(message.to_string());
            Ok(())
        }

        async fn send_placeholder(&self, text: &str, _recipient: &str) -> Result<String> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok("42".into())
        }

        async fn edit_message(&self, id: &str, text: &str, _recipient: &str) -> Result<()> {
            self.edited
                .lock()
                .unwrap()
                .push((id.to_string(), text.to_string()));
            Ok(())
        }

        async fn send_file(
            &self,
            path: &Path,
            _caption: Option<&str>,
            _recipient: &str,
        ) -> Result<()> {
            self.files.lock().unwrap().push(path.to_path_buf());
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

    struct Harness {
        pipeline: MessagePipeline,
        channel: Arc<RecordingChannel>,
        storage: Arc<SqliteStorage>,
        registry: Arc<ScheduleRegistry>,
        _tmp: TempDir,
    }

    async fn harness(response: &str, fail: bool) -> Harness {
        let tmp = TempDir::new().unwrap();
        let workspace = tmp.path().to_path_buf();
        let storage = Arc::new(SqliteStorage::new(workspace.join("attache.db")));
        let channel = Arc::new(RecordingChannel::default());
        let agent: Arc<dyn AgentExecutor> = Arc::new(FixedAgent {
            response: response.to_string(),
            fail,
        });

        let reflection = Arc::new(ReflectionEngine::new(
            storage.clone() as Arc<dyn Storage>,
            agent.clone(),
            channel.clone() as Arc<dyn Channel>,
            24,
        ));
        let registry = Arc::new(
            ScheduleRegistry::new(
                storage.clone() as Arc<dyn Storage>,
                Arc::new(NoopSchedules),
                "UTC",
                64,
                workspace.join("scheduler-health.json"),
            )
            .unwrap(),
        );
        let commands = Arc::new(CommandRouter::new(
            storage.clone() as Arc<dyn Storage>,
            registry.clone(),
            reflection,
            channel.clone() as Arc<dyn Channel>,
        ));
        let silence = Arc::new(SilenceTimers::new(
            Arc::new(NoopReflector),
            Duration::from_secs(3600),
        ));
        let router = Arc::new(ExecutionRouter::new(
            RoutingConfig::default(),
            agent.clone(),
            None,
        ));
        let sync = Arc::new(TurnSyncBridge::new(
            &crate::config::SyncConfig {
                mode: crate::config::SyncMode::Off,
                ..crate::config::SyncConfig::default()
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

        Harness {
            pipeline,
            channel,
            storage,
            registry,
            _tmp: tmp,
        }
    }

    fn inbound(content: &str) -> ChannelMessage {
        ChannelMessage {
            id: "1001".into(),
            sender: "alice".into(),
            content: content.into(),
            channel: "telegram".into(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn exchange_replaces_placeholder_and_persists_both_sides() {
        let h = harness("Here you go.", false).await;

        h.pipeline.handle_message(&inbound("what's up?")).await;

        let edits = h.channel.edited.lock().unwrap();
        assert_eq!(edits.last().unwrap().1, "Here you go.");
        drop(edits);

        let history = h.storage.get_extended_history("alice", 24).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].content, "Here you go.");

        h.registry.shutdown();
    }

    #[tokio::test]
    async fn long_input_is_summarized_before_persisting() {
        let h = harness("ok", false).await;
        let long_input = "x".repeat(500);

        h.pipeline.handle_message(&inbound(&long_input)).await;

        let history = h.storage.get_extended_history("alice", 24).await.unwrap();
        assert!(history[0].summary.as_deref().unwrap().contains("chars"));

        h.registry.shutdown();
    }

    #[tokio::test]
    async fn short_input_is_not_summarized() {
        let h = harness("ok", false).await;

        h.pipeline.handle_message(&inbound("hi")).await;

        let history = h.storage.get_extended_history("alice", 24).await.unwrap();
        assert!(history[0].summary.is_none());

        h.registry.shutdown();
    }

    #[tokio::test]
    async fn file_directives_are_extracted_and_delivered() {
        let h = harness("Report ready. [[SEND_FILE: temp/report.txt | Your report]]", false).await;
        let temp_dir = h.pipeline.workspace_dir.join("temp");
        std::fs::create_dir_all(&temp_dir).unwrap();
        std::fs::write(temp_dir.join("report.txt"), "data").unwrap();

        h.pipeline.handle_message(&inbound("make a report")).await;

        let edits = h.channel.edited.lock().unwrap();
        assert_eq!(edits.last().unwrap().1, "Report ready.");
        drop(edits);
        let files = h.channel.files.lock().unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("report.txt"));

        h.registry.shutdown();
    }

    #[tokio::test]
    async fn rejected_file_directive_warns_inline() {
        let h = harness("Done. [[SEND_FILE: /etc/passwd]]", false).await;

        h.pipeline.handle_message(&inbound("send me the file")).await;

        let sent = h.channel.sent.lock().unwrap();
        assert!(sent
            .iter()
            .any(|m| m.contains("outside the project directory")));
        let files = h.channel.files.lock().unwrap();
        assert!(files.is_empty());

        h.registry.shutdown();
    }

    #[tokio::test]
    async fn engine_failure_delivers_apology() {
        let h = harness("unused", true).await;

        h.pipeline.handle_message(&inbound("hello")).await;

        let edits = h.channel.edited.lock().unwrap();
        assert_eq!(edits.last().unwrap().1, APOLOGY);

        h.registry.shutdown();
    }

    #[tokio::test]
    async fn commands_short_circuit_the_pipeline() {
        let h = harness("should not run", false).await;

        h.pipeline.handle_message(&inbound("/reset")).await;

        // Command reply only; no placeholder was sent.
        let sent = h.channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("cleared"));
        drop(sent);

        let history = h.storage.get_extended_history("alice", 24).await.unwrap();
        assert!(history.is_empty());

        h.registry.shutdown();
    }

    #[test]
    fn summary_trigger_conditions() {
        let config = PipelineConfig::default();
        assert!(needs_summary(&"y".repeat(201), &config));
        assert!(needs_summary("```rust\nfn main() {}\n```", &config));
        assert!(needs_summary(&"line\n".repeat(7), &config));
        assert!(!needs_summary("short and plain", &config));
    }
}
