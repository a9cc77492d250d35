use crate::channels::Channel;
use crate::scheduler::{ReflectionTrigger, Reflector, ScheduleRegistry};
use crate::storage::Storage;
use anyhow::Result;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

const HELP_TEXT: &str = "Commands:\n\
    /reset — clear conversation history\n\
    /new_session — start the next turn in a fresh engine session\n\
    /reflect — review recent conversation now\n\
    /search <text> — find past messages\n\
    /list_schedules — show your scheduled prompts\n\
    /add_schedule <name> | <cron> | <prompt> — add a cron-driven prompt\n\
    /remove_schedule <id> — delete a schedule";

/// Intercepts control commands before a message reaches the engine. Anything
/// unrecognized falls through to the pipeline (and possibly the passthrough
/// whitelist).
pub struct CommandRouter {
    storage: Arc<dyn Storage>,
    registry: Arc<ScheduleRegistry>,
    reflector: Arc<dyn Reflector>,
    channel: Arc<dyn Channel>,
    pending_new_session: Mutex<HashSet<String>>,
}

impl CommandRouter {
    pub fn new(
        storage: Arc<dyn Storage>,
        registry: Arc<ScheduleRegistry>,
        reflector: Arc<dyn Reflector>,
        channel: Arc<dyn Channel>,
    ) -> Self {
        Self {
            storage,
            registry,
            reflector,
            channel,
            pending_new_session: Mutex::new(HashSet::new()),
        }
    }

    /// Consumes the one-shot fresh-session flag set by `/new_session`.
    pub fn take_force_new_session(&self, user_id: &str) -> bool {
        self.pending_new_session
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(user_id)
    }

    /// Returns true when the message was a recognized command and has been
    /// fully handled, replies included.
    pub async fn handle(&self, user_id: &str, text: &str) -> Result<bool> {
        let trimmed = text.trim();
        let Some(token) = trimmed.split_whitespace().next() else {
            return Ok(false);
        };
        let Some(command) = token.strip_prefix('/') else {
            return Ok(false);
        };
        let command = command.split('@').next().unwrap_or(command);
        let rest = trimmed[token.len()..].trim();

        match command {
            "help" | "start" => {
                self.channel.send(HELP_TEXT, user_id).await?;
                Ok(true)
            }
            "reset" => {
                self.storage.clear_messages(user_id).await?;
                self.channel
                    .send("🧹 Conversation history cleared.", user_id)
                    .await?;
                Ok(true)
            }
            "new_session" => {
                self.pending_new_session
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .insert(user_id.to_string());
                self.channel
                    .send("🆕 Next message starts a fresh session.", user_id)
                    .await?;
                Ok(true)
            }
            "reflect" => {
                // Show progress immediately; the engine edits this message
                // in place once the review completes.
                let placeholder = self
                    .channel
                    .send_placeholder("🔍 Reviewing our conversation...", user_id)
                    .await
                    .ok()
                    .filter(|id| !id.is_empty());
                self.reflector
                    .reflect(user_id, ReflectionTrigger::Manual, placeholder.as_deref())
                    .await?;
                Ok(true)
            }
            "search" => {
                if rest.is_empty() {
                    self.channel.send("Usage: /search <text>", user_id).await?;
                    return Ok(true);
                }
                let hits = self.storage.search_messages(user_id, rest, 10).await?;
                let reply = if hits.is_empty() {
                    format!("No messages matching \"{rest}\".")
                } else {
                    let mut out = format!("🔎 Matches for \"{rest}\":\n");
                    for m in &hits {
                        let text = m.summary.as_deref().unwrap_or(&m.content);
                        out.push_str(&format!(
                            "[{}] {}: {}\n",
                            m.timestamp.format("%Y-%m-%d %H:%M"),
                            m.role.as_str(),
                            text
                        ));
                    }
                    out
                };
                self.channel.send(&reply, user_id).await?;
                Ok(true)
            }
            "list_schedules" => {
                let schedules = self.registry.list(user_id).await?;
                let reply = if schedules.is_empty() {
                    "No schedules yet. Add one with /add_schedule.".to_string()
                } else {
                    let mut out = String::from("📅 Your schedules:\n");
                    for s in &schedules {
                        out.push_str(&format!(
                            "#{} {} — `{}`{}\n",
                            s.id,
                            s.name,
                            s.cron,
                            if s.is_active { "" } else { " (inactive)" }
                        ));
                    }
                    out
                };
                self.channel.send(&reply, user_id).await?;
                Ok(true)
            }
            "add_schedule" => {
                let parts: Vec<&str> = rest.splitn(3, '|').map(str::trim).collect();
                if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
                    self.channel
                        .send(
                            "Usage: /add_schedule <name> | <cron> | <prompt>\n\
                             Example: /add_schedule daily | 0 9 * * * | Summarize my day",
                            user_id,
                        )
                        .await?;
                    return Ok(true);
                }
                match self.registry.add(user_id, parts[0], parts[1], parts[2]).await {
                    Ok(id) => {
                        self.channel
                            .send(&format!("✅ Schedule #{id} added ({}).", parts[1]), user_id)
                            .await?;
                    }
                    Err(e) => {
                        self.channel
                            .send(&format!("❌ Could not add schedule: {e}"), user_id)
                            .await?;
                    }
                }
                Ok(true)
            }
            "remove_schedule" => {
                let Ok(id) = rest.parse::<i64>() else {
                    self.channel
                        .send("Usage: /remove_schedule <id>", user_id)
                        .await?;
                    return Ok(true);
                };
                match self.registry.remove(id).await {
                    Ok(()) => {
                        self.channel
                            .send(&format!("🗑 Schedule #{id} removed."), user_id)
                            .await?;
                    }
                    Err(e) => {
                        self.channel
                            .send(&format!("❌ {e}"), user_id)
                            .await?;
                    }
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
