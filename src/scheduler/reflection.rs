use crate::agent::{AgentExecutor, ExecOptions};
use crate::channels::Channel;
use crate::storage::{Role, Storage, StoredMessage};
use crate::util::collapse_whitespace;
use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// What prompted a reflection run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReflectionTrigger {
    Silence,
    Scheduled,
    Manual,
}

/// Seam between the silence timers / command router and the reflection
/// engine. An edit target replaces an existing message (a placeholder from
/// `/reflect`) instead of sending a new one.
#[async_trait]
pub trait Reflector: Send + Sync {
    async fn reflect(
        &self,
        user_id: &str,
        trigger: ReflectionTrigger,
        edit_target: Option<&str>,
    ) -> Result<()>;
}

/// The engine is told to answer with this exact token when the review finds
/// nothing worth raising.
const NO_ACTION_TOKEN: &str = "NO_PENDING_ITEMS";

/// Reviews a user's recent history and surfaces unresolved items. Repeat
/// findings are suppressed by fingerprint: identical normalized output gets
/// a short "already checked" notice instead of a duplicate report.
///
/// Fingerprints live in memory only; after a restart the first reflection
/// may repeat the last report once.
pub struct ReflectionEngine {
    storage: Arc<dyn Storage>,
    agent: Arc<dyn AgentExecutor>,
    channel: Arc<dyn Channel>,
    lookback_hours: i64,
    fingerprints: Mutex<HashMap<String, String>>,
}

impl ReflectionEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        agent: Arc<dyn AgentExecutor>,
        channel: Arc<dyn Channel>,
        lookback_hours: i64,
    ) -> Self {
        Self {
            storage,
            agent,
            channel,
            lookback_hours,
            fingerprints: Mutex::new(HashMap::new()),
        }
    }

    fn fingerprint(response: &str) -> String {
        let normalized = collapse_whitespace(response);
        hex::encode(Sha256::digest(normalized.as_bytes()))
    }

    fn build_review_prompt(history: &[StoredMessage]) -> String {
        let mut transcript = String::new();
        for msg in history {
            let text = msg.summary.as_deref().unwrap_or(&msg.content);
            transcript.push_str(match msg.role {
                Role::User => "User: ",
                Role::Model => "Assistant: ",
            });
            transcript.push_str(text);
            transcript.push('\n');
        }

        format!(
            "Review the conversation below. Surface unresolved questions, things that \
             could be improved, and to-dos that seem forgotten. Be concise and concrete. \
             If there is truly nothing pending, reply with exactly {NO_ACTION_TOKEN} and \
             nothing else.\n\nConversation:\n{transcript}"
        )
    }

    fn last_fingerprint(&self, user_id: &str) -> Option<String> {
        self.fingerprints
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(user_id)
            .cloned()
    }

    fn store_fingerprint(&self, user_id: &str, fingerprint: String) {
        self.fingerprints
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(user_id.to_string(), fingerprint);
    }

    async fn record_error_turn(&self, user_id: &str, error: &str) {
        let note = format!("[reflection error] {error}");
        if let Err(e) = self.storage.add_message(user_id, Role::Model, &note, None).await {
            tracing::warn!(user_id, "Failed to record reflection error turn: {e}");
        }
    }

    async fn deliver(&self, text: &str, user_id: &str, edit_target: Option<&str>) -> Result<()> {
        if let Some(id) = edit_target {
            if self.channel.edit_message(id, text, user_id).await.is_ok() {
                return Ok(());
            }
            tracing::debug!(user_id, "Reflection edit failed; sending fresh message");
        }
        self.channel.send(text, user_id).await
    }

    async fn run(
        &self,
        user_id: &str,
        trigger: ReflectionTrigger,
        edit_target: Option<&str>,
    ) -> Result<()> {
        let history = self
            .storage
            .get_extended_history(user_id, self.lookback_hours)
            .await?;
        if history.is_empty() {
            tracing::debug!(user_id, "No recent history; skipping reflection");
            return Ok(());
        }

        let prompt = Self::build_review_prompt(&history);
        let options = ExecOptions {
            force_new_session: true,
            ..ExecOptions::default()
        };

        let response = match self.agent.execute(&prompt, &options).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(user_id, "Reflection engine call failed: {e}");
                self.record_error_turn(user_id, &e.to_string()).await;
                let _ = self
                    .deliver(
                        "I hit a problem while reviewing our conversation.",
                        user_id,
                        edit_target,
                    )
                    .await;
                return Ok(());
            }
        };

        if response.trim().starts_with(NO_ACTION_TOKEN) {
            self.storage
                .add_message(user_id, Role::Model, "Nothing pending.", None)
                .await?;
            if matches!(trigger, ReflectionTrigger::Silence | ReflectionTrigger::Manual) {
                self.deliver("✅ Checked in — nothing pending right now.", user_id, edit_target)
                    .await?;
            }
            return Ok(());
        }

        let fingerprint = Self::fingerprint(&response);
        if self.last_fingerprint(user_id).as_deref() == Some(fingerprint.as_str()) {
            tracing::debug!(user_id, "Reflection fingerprint unchanged");
            self.deliver(
                "Already checked — nothing new since last review.",
                user_id,
                edit_target,
            )
            .await?;
            return Ok(());
        }

        let formatted = format!("🔍 While you were away, I reviewed our conversation:\n\n{response}");
        self.deliver(&formatted, user_id, edit_target).await?;
        self.storage
            .add_message(user_id, Role::Model, &response, None)
            .await?;
        self.store_fingerprint(user_id, fingerprint);
        Ok(())
    }
}

#[async_trait]
impl Reflector for ReflectionEngine {
    async fn reflect(
        &self,
        user_id: &str,
        trigger: ReflectionTrigger,
        edit_target: Option<&str>,
    ) -> Result<()> {
        self.run(user_id, trigger, edit_target).await
    }
}
