use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

// ── Top-level config ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Workspace directory - computed from home, not serialized
    #[serde(skip)]
    pub workspace_dir: PathBuf,
    /// Path to config.toml - computed from home, not serialized
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Default user the orchestrator serves (silence timers, startup checks).
    pub default_user: Option<String>,
    /// Model passed through to the execution engines.
    pub default_model: Option<String>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub telegram: TelegramConfig,

    #[serde(default)]
    pub agent: AgentConfig,
}

// ── Scheduler ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Enable the schedule registry and silence timers.
    #[serde(default = "default_scheduler_enabled")]
    pub enabled: bool,
    /// IANA timezone applied to every cron schedule.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Inactivity window before a reflection fires, in seconds.
    #[serde(default = "default_silence_timeout_secs")]
    pub silence_timeout_secs: u64,
    /// Conversation lookback for reflections, in hours.
    #[serde(default = "default_reflection_lookback_hours")]
    pub reflection_lookback_hours: i64,
    /// Maximum number of persisted schedules.
    #[serde(default = "default_max_schedules")]
    pub max_schedules: usize,
}

fn default_scheduler_enabled() -> bool {
    true
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_silence_timeout_secs() -> u64 {
    30 * 60
}

fn default_reflection_lookback_hours() -> i64 {
    24
}

fn default_max_schedules() -> usize {
    64
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: default_scheduler_enabled(),
            timezone: default_timezone(),
            silence_timeout_secs: default_silence_timeout_secs(),
            reflection_lookback_hours: default_reflection_lookback_hours(),
            max_schedules: default_max_schedules(),
        }
    }
}

// ── Execution routing / circuit breaker ──────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Remote runner base URL (e.g. `http://127.0.0.1:8787`). Empty = local only.
    #[serde(default)]
    pub runner_endpoint: Option<String>,
    /// Shared secret sent as `X-Runner-Token`.
    #[serde(default)]
    pub runner_token: Option<String>,
    /// Percentage of chat traffic routed to the runner, `[0,100]`.
    #[serde(default)]
    pub canary_percent: u8,
    /// Users eligible for canary routing. Empty = everyone.
    #[serde(default)]
    pub canary_users: Vec<String>,
    /// Consecutive remote failures before the circuit opens.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open circuit rejects remote attempts, in milliseconds.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    /// Hard deadline for one remote call, in seconds.
    #[serde(default = "default_remote_timeout_secs")]
    pub remote_timeout_secs: u64,
    /// Retry the task locally after a remote failure or open circuit.
    #[serde(default = "default_true")]
    pub fallback_to_local: bool,
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    60_000
}

fn default_remote_timeout_secs() -> u64 {
    300
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            runner_endpoint: None,
            runner_token: None,
            canary_percent: 0,
            canary_users: Vec::new(),
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
            remote_timeout_secs: default_remote_timeout_secs(),
            fallback_to_local: default_true(),
        }
    }
}

// ── Message pipeline ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Summarize stored content longer than this many characters.
    #[serde(default = "default_summary_char_threshold")]
    pub summary_char_threshold: usize,
    /// Summarize stored content with at least this many newlines.
    #[serde(default = "default_summary_newline_threshold")]
    pub summary_newline_threshold: usize,
    /// Whitelist file for passthrough commands, one leading token per line.
    #[serde(default)]
    pub passthrough_file: Option<PathBuf>,
    /// Subdirectory of the workspace that outbound files may come from.
    #[serde(default = "default_file_subdir")]
    pub file_send_subdir: String,
    /// Refuse to deliver files larger than this many bytes.
    #[serde(default = "default_file_size_cap")]
    pub file_size_cap_bytes: u64,
}

fn default_summary_char_threshold() -> usize {
    200
}

fn default_summary_newline_threshold() -> usize {
    6
}

fn default_file_subdir() -> String {
    "temp".to_string()
}

fn default_file_size_cap() -> u64 {
    25 * 1024 * 1024
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            summary_char_threshold: default_summary_char_threshold(),
            summary_newline_threshold: default_summary_newline_threshold(),
            passthrough_file: None,
            file_send_subdir: default_file_subdir(),
            file_size_cap_bytes: default_file_size_cap(),
        }
    }
}

// ── Turn mirroring ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    On,
    Off,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default)]
    pub mode: SyncMode,
    /// Path to the external sync CLI.
    #[serde(default)]
    pub cli_path: Option<PathBuf>,
    /// Working directory handed to the sync CLI.
    #[serde(default)]
    pub sync_home: Option<PathBuf>,
    /// Deadline for one sync invocation, in seconds.
    #[serde(default = "default_sync_timeout_secs")]
    pub timeout_secs: u64,
    /// Drain an external JSONL queue file in addition to pipeline turns.
    #[serde(default)]
    pub queue_file: Option<PathBuf>,
    /// Queue-file polling cadence, in seconds.
    #[serde(default = "default_queue_poll_secs")]
    pub queue_poll_secs: u64,
    /// TTL of the duplicate-turn suppression window, in seconds.
    #[serde(default = "default_dedup_ttl_secs")]
    pub dedup_ttl_secs: u64,
}

fn default_sync_timeout_secs() -> u64 {
    20
}

fn default_queue_poll_secs() -> u64 {
    5
}

fn default_dedup_ttl_secs() -> u64 {
    600
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Auto,
            cli_path: None,
            sync_home: None,
            timeout_secs: default_sync_timeout_secs(),
            queue_file: None,
            queue_poll_secs: default_queue_poll_secs(),
            dedup_ttl_secs: default_dedup_ttl_secs(),
        }
    }
}

// ── Channel ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Telegram @usernames or numeric IDs allowed to talk to the bot. `*` = anyone.
    #[serde(default)]
    pub allowed_users: Vec<String>,
}

// ── Local engine ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Executable the local engine shells out to.
    #[serde(default = "default_agent_command")]
    pub command: String,
    /// Extra arguments preceding the prompt.
    #[serde(default)]
    pub args: Vec<String>,
    /// Hard deadline for one local engine invocation, in seconds.
    #[serde(default = "default_local_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_agent_command() -> String {
    "opencode".to_string()
}

fn default_local_timeout_secs() -> u64 {
    600
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: Vec::new(),
            timeout_secs: default_local_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

// ── Load / save ──────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        let home = UserDirs::new().map_or_else(|| PathBuf::from("."), |u| u.home_dir().to_path_buf());
        let base = home.join(".attache");
        Self {
            workspace_dir: base.join("workspace"),
            config_path: base.join("config.toml"),
            default_user: None,
            default_model: None,
            scheduler: SchedulerConfig::default(),
            routing: RoutingConfig::default(),
            pipeline: PipelineConfig::default(),
            sync: SyncConfig::default(),
            telegram: TelegramConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Config {
    pub fn load_or_init() -> Result<Self> {
        let home = UserDirs::new()
            .map(|u| u.home_dir().to_path_buf())
            .context("Could not find home directory")?;
        let base = home.join(".attache");
        let config_path = base.join("config.toml");

        if !base.exists() {
            fs::create_dir_all(&base).context("Failed to create .attache directory")?;
            fs::create_dir_all(base.join("workspace"))
                .context("Failed to create workspace directory")?;
        }

        if config_path.exists() {
            let contents =
                fs::read_to_string(&config_path).context("Failed to read config file")?;
            let mut config: Config =
                toml::from_str(&contents).context("Failed to parse config file")?;
            config.config_path = config_path;
            config.workspace_dir = base.join("workspace");
            config.apply_env_overrides();
            Ok(config)
        } else {
            let mut config = Config::default();
            config.config_path = config_path;
            config.workspace_dir = base.join("workspace");
            config.save()?;
            config.apply_env_overrides();
            Ok(config)
        }
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(user) = std::env::var("ATTACHE_USER") {
            if !user.is_empty() {
                self.default_user = Some(user);
            }
        }

        if let Ok(model) = std::env::var("ATTACHE_MODEL") {
            if !model.is_empty() {
                self.default_model = Some(model);
            }
        }

        if let Ok(workspace) = std::env::var("ATTACHE_WORKSPACE") {
            if !workspace.is_empty() {
                self.workspace_dir = PathBuf::from(workspace);
            }
        }

        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !token.is_empty() {
                self.telegram.bot_token = Some(token);
            }
        }

        if let Ok(endpoint) = std::env::var("ATTACHE_RUNNER_ENDPOINT") {
            if !endpoint.is_empty() {
                self.routing.runner_endpoint = Some(endpoint);
            }
        }

        if let Ok(token) = std::env::var("ATTACHE_RUNNER_TOKEN") {
            if !token.is_empty() {
                self.routing.runner_token = Some(token);
            }
        }

        if let Ok(percent) = std::env::var("ATTACHE_CANARY_PERCENT") {
            if let Ok(parsed) = percent.parse::<u8>() {
                self.routing.canary_percent = parsed.min(100);
            }
        }

        if let Ok(tz) = std::env::var("TZ") {
            if !tz.is_empty() {
                self.scheduler.timezone = tz;
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let parent_dir = self
            .config_path
            .parent()
            .context("Config path must have a parent directory")?;
        fs::create_dir_all(parent_dir)
            .with_context(|| format!("Failed to create {}", parent_dir.display()))?;

        fs::write(&self.config_path, toml_str)
            .with_context(|| format!("Failed to write {}", self.config_path.display()))?;
        Ok(())
    }

    /// Storage database path under the workspace.
    pub fn db_path(&self) -> PathBuf {
        self.workspace_dir.join("attache.db")
    }

    /// Marker file the registry updates on init/reload.
    pub fn scheduler_health_path(&self) -> PathBuf {
        self.workspace_dir.join("scheduler-health.json")
    }
}
