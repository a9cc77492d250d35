use crate::config::{SyncConfig, SyncMode};
use crate::util::collapse_whitespace;
use chrono::Utc;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One completed exchange, mirrored to the external memory service.
#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub user_id: String,
    pub user_message: String,
    pub model_message: String,
    pub platform: String,
    pub is_passthrough_command: bool,
    pub force_new_session: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuedTurn {
    user_id: Option<String>,
    user_message: Option<String>,
    model_message: Option<String>,
    platform: Option<String>,
    #[serde(default)]
    is_passthrough_command: bool,
    #[serde(default)]
    force_new_session: bool,
}

/// Best-effort mirroring of conversation turns to an external memory CLI.
/// Turns are deduplicated by normalized content hash within a TTL window and
/// processed by a single worker in submission order, so scratch files never
/// collide. Everything here is fire-and-forget; a failed sync is logged and
/// dropped.
pub struct TurnSyncBridge {
    enabled: bool,
    tx: Option<mpsc::UnboundedSender<ConversationTurn>>,
    dedup: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

struct SyncWorker {
    cli_path: PathBuf,
    sync_home: PathBuf,
    temp_dir: PathBuf,
    timeout: Duration,
}

impl TurnSyncBridge {
    pub fn new(config: &SyncConfig, workspace_dir: &Path) -> Self {
        let disabled = Self {
            enabled: false,
            tx: None,
            dedup: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(config.dedup_ttl_secs),
        };

        if config.mode == SyncMode::Off {
            tracing::info!("Turn sync disabled by config");
            return disabled;
        }

        let sync_home = config
            .sync_home
            .clone()
            .unwrap_or_else(|| workspace_dir.join("memory"));
        let cli_path = config
            .cli_path
            .clone()
            .unwrap_or_else(|| sync_home.join("cli"));

        if !cli_path.exists() {
            if config.mode == SyncMode::On {
                tracing::warn!(
                    "Turn sync CLI not found at {} (mode=on, will keep trying)",
                    cli_path.display()
                );
            } else {
                tracing::info!(
                    "Turn sync CLI not found at {} (mode=auto, disabled)",
                    cli_path.display()
                );
                return disabled;
            }
        }

        let temp_dir = workspace_dir.join("temp").join("turn-sync");
        if let Err(e) = std::fs::create_dir_all(&temp_dir) {
            tracing::warn!("Failed to prepare turn sync temp dir, disabling: {e}");
            return disabled;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<ConversationTurn>();
        let worker = SyncWorker {
            cli_path,
            sync_home,
            temp_dir,
            timeout: Duration::from_secs(config.timeout_secs),
        };

        // Single consumer keeps jobs strictly FIFO.
        tokio::spawn(async move {
            while let Some(turn) = rx.recv().await {
                if let Err(e) = worker.sync_one(&turn).await {
                    tracing::warn!(user_id = %turn.user_id, "Turn sync failed: {e}");
                }
            }
        });

        tracing::info!("Turn sync enabled");
        Self {
            enabled: true,
            tx: Some(tx),
            dedup: Mutex::new(HashMap::new()),
            ttl: Duration::from_secs(config.dedup_ttl_secs),
        }
    }

    fn turn_hash(turn: &ConversationTurn) -> String {
        let normalized = format!(
            "{}\n---\n{}",
            collapse_whitespace(&turn.user_message),
            collapse_whitespace(&turn.model_message)
        );
        hex::encode(Sha256::digest(normalized.as_bytes()))
    }

    fn is_duplicate(&self, turn: &ConversationTurn) -> bool {
        let now = Instant::now();
        let hash = Self::turn_hash(turn);
        let mut seen = self
            .dedup
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        seen.retain(|_, ts| now.duration_since(*ts) <= self.ttl);
        if seen.contains_key(&hash) {
            return true;
        }
        seen.insert(hash, now);
        false
    }

    /// Accepts a turn for mirroring. Returns false when the turn was dropped
    /// (bridge disabled, empty text, or a duplicate within the TTL window).
    pub fn enqueue(&self, turn: ConversationTurn) -> bool {
        if !self.enabled {
            return false;
        }
        if turn.user_message.trim().is_empty() || turn.model_message.trim().is_empty() {
            return false;
        }
        if self.is_duplicate(&turn) {
            tracing::debug!(user_id = %turn.user_id, "Duplicate turn dropped");
            return false;
        }

        match &self.tx {
            Some(tx) => tx.send(turn).is_ok(),
            None => false,
        }
    }

    /// Drains an append-only JSONL queue file written by an external
    /// producer. The file is renamed before reading so the producer can keep
    /// appending without racing us; malformed lines are skipped.
    pub fn drain_queue_file(&self, queue_file: &Path) -> usize {
        if !self.enabled {
            return 0;
        }

        let Ok(meta) = std::fs::metadata(queue_file) else {
            return 0;
        };
        if meta.len() == 0 {
            return 0;
        }

        let processing = queue_file.with_extension(format!(
            "jsonl.{}.processing",
            Utc::now().timestamp_millis()
        ));
        if let Err(e) = std::fs::rename(queue_file, &processing) {
            tracing::warn!("Failed to claim sync queue file: {e}");
            return 0;
        }
        let raw = std::fs::read_to_string(&processing).unwrap_or_default();
        let _ = std::fs::remove_file(&processing);

        let mut imported = 0;
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match serde_json::from_str::<QueuedTurn>(line) {
                Ok(parsed) => {
                    let user_message = parsed.user_message.unwrap_or_default();
                    let model_message = parsed.model_message.unwrap_or_default();
                    if user_message.is_empty() || model_message.is_empty() {
                        continue;
                    }
                    let turn = ConversationTurn {
                        user_id: parsed.user_id.unwrap_or_else(|| "queue".to_string()),
                        user_message,
                        model_message,
                        platform: parsed.platform.unwrap_or_else(|| "queue".to_string()),
                        is_passthrough_command: parsed.is_passthrough_command,
                        force_new_session: parsed.force_new_session,
                    };
                    if self.enqueue(turn) {
                        imported += 1;
                    }
                }
                Err(e) => {
                    tracing::warn!("Invalid sync queue line skipped: {e}");
                }
            }
        }

        if imported > 0 {
            tracing::info!("Sync queue imported {imported} turns");
        }
        imported
    }

    /// Starts the periodic queue-file poller when one is configured.
    pub fn spawn_queue_poller(self: &std::sync::Arc<Self>, config: &SyncConfig) {
        let Some(queue_file) = config.queue_file.clone() else {
            return;
        };
        if !self.enabled {
            return;
        }
        let bridge = std::sync::Arc::clone(self);
        let poll = Duration::from_secs(config.queue_poll_secs.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            loop {
                interval.tick().await;
                bridge.drain_queue_file(&queue_file);
            }
        });
    }
}

impl SyncWorker {
    fn build_payload(turn: &ConversationTurn, session_id: &str) -> serde_json::Value {
        let now = Utc::now().to_rfc3339();
        let metadata = serde_json::json!({
            "source": "attache",
            "user_id": turn.user_id,
            "platform": turn.platform,
            "is_passthrough_command": turn.is_passthrough_command,
            "force_new_session": turn.force_new_session,
        });
        serde_json::json!({
            "id": session_id,
            "timestamp": now,
            "project": "attache",
            "summary": format!(
                "user={} platform={} passthrough={}",
                turn.user_id, turn.platform, turn.is_passthrough_command
            ),
            "events": [
                {
                    "id": Uuid::new_v4().to_string(),
                    "timestamp": now,
                    "type": "UserMessage",
                    "content": { "role": "user", "text": turn.user_message },
                    "metadata": metadata.clone(),
                },
                {
                    "id": Uuid::new_v4().to_string(),
                    "timestamp": now,
                    "type": "ModelMessage",
                    "content": { "role": "model", "text": turn.model_message },
                    "metadata": metadata,
                }
            ],
        })
    }

    async fn run_command(&self, program: &str, args: &[String]) -> anyhow::Result<()> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(program)
                .args(args)
                .current_dir(&self.sync_home)
                .env("MEMORY_HOME", &self.sync_home)
                // Reap the CLI if the timeout drops the future mid-flight.
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("sync timeout after {}s", self.timeout.as_secs()))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            anyhow::bail!(
                "exit={}: {}",
                output.status,
                if stderr.trim().is_empty() {
                    stdout.trim()
                } else {
                    stderr.trim()
                }
            );
        }
        Ok(())
    }

    async fn sync_one(&self, turn: &ConversationTurn) -> anyhow::Result<()> {
        let session_id = format!(
            "attache_{}_{}",
            Utc::now().timestamp_millis(),
            &Uuid::new_v4().to_string()[..8]
        );
        let payload = Self::build_payload(turn, &session_id);
        let payload_path = self.temp_dir.join(format!("{session_id}.json"));
        tokio::fs::write(&payload_path, payload.to_string()).await?;

        let payload_arg = payload_path.to_string_lossy().into_owned();
        let primary = self
            .run_command(
                &self.cli_path.to_string_lossy(),
                &["sync".to_string(), payload_arg.clone()],
            )
            .await;

        let result = match primary {
            Ok(()) => Ok(()),
            Err(primary_err) => {
                // Documented fallback when the CLI shim is absent: drive the
                // service's entry point through its bundled runner.
                let runner = self.sync_home.join("node_modules/tsx/dist/cli.mjs");
                if runner.exists() {
                    self.run_command(
                        "node",
                        &[
                            runner.to_string_lossy().into_owned(),
                            "src/cli.ts".to_string(),
                            "sync".to_string(),
                            payload_arg,
                        ],
                    )
                    .await
                    .map_err(|fallback_err| {
                        anyhow::anyhow!("cli shim failed: {primary_err}; fallback failed: {fallback_err}")
                    })
                } else {
                    Err(anyhow::anyhow!("cli shim failed: {primary_err}"))
                }
            }
        };

        // Scratch file goes away whether or not the sync worked.
        let _ = tokio::fs::remove_file(&payload_path).await;

        if result.is_ok() {
            tracing::info!("Synced session {session_id}");
        }
        result
    }
}
