use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A persisted cron schedule owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    pub id: i64,
    pub user_id: String,
    pub name: String,
    pub cron: String,
    pub prompt: String,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }

    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("model") {
            Self::Model
        } else {
            Self::User
        }
    }
}

/// One stored conversation message, optionally carrying a condensed summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: i64,
    pub user_id: String,
    pub role: Role,
    pub content: String,
    pub summary: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Durable keyed-table store the orchestrator consumes. The concrete backend
/// is an implementation detail; everything above this trait sees CRUD plus
/// windowed and full-text reads.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn add_schedule(
        &self,
        user_id: &str,
        name: &str,
        cron: &str,
        prompt: &str,
    ) -> anyhow::Result<i64>;

    async fn get_schedule(&self, id: i64) -> anyhow::Result<Option<Schedule>>;

    async fn update_schedule(
        &self,
        id: i64,
        name: &str,
        cron: &str,
        prompt: &str,
    ) -> anyhow::Result<()>;

    async fn remove_schedule(&self, id: i64) -> anyhow::Result<()>;

    async fn get_active_schedules(&self) -> anyhow::Result<Vec<Schedule>>;

    async fn get_user_schedules(&self, user_id: &str) -> anyhow::Result<Vec<Schedule>>;

    async fn add_message(
        &self,
        user_id: &str,
        role: Role,
        content: &str,
        summary: Option<&str>,
    ) -> anyhow::Result<()>;

    /// Messages for `user_id` newer than `hours` hours, oldest first.
    async fn get_extended_history(
        &self,
        user_id: &str,
        hours: i64,
    ) -> anyhow::Result<Vec<StoredMessage>>;

    async fn get_last_message_time(&self, user_id: &str)
        -> anyhow::Result<Option<DateTime<Utc>>>;

    /// Newest-first page of messages.
    async fn recent_messages(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<StoredMessage>>;

    /// Case-insensitive substring search over content and summaries.
    async fn search_messages(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<StoredMessage>>;

    async fn clear_messages(&self, user_id: &str) -> anyhow::Result<()>;
}
