use super::traits::{Role, Schedule, Storage, StoredMessage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, Row};
use std::path::{Path, PathBuf};

/// SQLite-backed store. Connections are opened per call and the schema is
/// created on open, so a fresh workspace needs no migration step.
pub struct SqliteStorage {
    db_path: PathBuf,
}

impl SqliteStorage {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create storage directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("Failed to open storage DB: {}", self.db_path.display()))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schedules (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id    TEXT NOT NULL,
                name       TEXT NOT NULL,
                cron       TEXT NOT NULL,
                prompt     TEXT NOT NULL,
                created_at TEXT NOT NULL,
                is_active  INTEGER NOT NULL DEFAULT 1
            );
            CREATE TABLE IF NOT EXISTS messages (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id   TEXT NOT NULL,
                role      TEXT NOT NULL,
                content   TEXT NOT NULL,
                summary   TEXT,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_user_time ON messages(user_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_schedules_user ON schedules(user_id);",
        )
        .context("Failed to initialize storage schema")?;

        f(&conn)
    }
}

fn schedule_from_row(row: &Row<'_>) -> rusqlite::Result<(Schedule, String)> {
    let created_raw: String = row.get(5)?;
    Ok((
        Schedule {
            id: row.get(0)?,
            user_id: row.get(1)?,
            name: row.get(2)?,
            cron: row.get(3)?,
            prompt: row.get(4)?,
            created_at: Utc::now(), // replaced by the parsed value below
            is_active: row.get::<_, i64>(6)? != 0,
        },
        created_raw,
    ))
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<(StoredMessage, String)> {
    let role_raw: String = row.get(2)?;
    let ts_raw: String = row.get(5)?;
    Ok((
        StoredMessage {
            id: row.get(0)?,
            user_id: row.get(1)?,
            role: Role::parse(&role_raw),
            content: row.get(3)?,
            summary: row.get(4)?,
            timestamp: Utc::now(), // replaced by the parsed value below
        },
        ts_raw,
    ))
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid RFC3339 timestamp in storage DB: {raw}"))?;
    Ok(parsed.with_timezone(&Utc))
}

fn collect_schedules(rows: Vec<(Schedule, String)>) -> Result<Vec<Schedule>> {
    rows.into_iter()
        .map(|(mut schedule, created_raw)| {
            schedule.created_at = parse_rfc3339(&created_raw)?;
            Ok(schedule)
        })
        .collect()
}

fn collect_messages(rows: Vec<(StoredMessage, String)>) -> Result<Vec<StoredMessage>> {
    rows.into_iter()
        .map(|(mut message, ts_raw)| {
            message.timestamp = parse_rfc3339(&ts_raw)?;
            Ok(message)
        })
        .collect()
}

const SCHEDULE_COLUMNS: &str = "id, user_id, name, cron, prompt, created_at, is_active";
const MESSAGE_COLUMNS: &str = "id, user_id, role, content, summary, timestamp";

#[async_trait]
impl Storage for SqliteStorage {
    async fn add_schedule(
        &self,
        user_id: &str,
        name: &str,
        cron: &str,
        prompt: &str,
    ) -> Result<i64> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO schedules (user_id, name, cron, prompt, created_at, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, 1)",
                params![user_id, name, cron, prompt, Utc::now().to_rfc3339()],
            )
            .context("Failed to insert schedule")?;
            Ok(conn.last_insert_rowid())
        })
    }

    async fn get_schedule(&self, id: i64) -> Result<Option<Schedule>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE id = ?1"
            ))?;
            let found = stmt.query_row(params![id], schedule_from_row);
            match found {
                Ok(row) => Ok(collect_schedules(vec![row])?.pop()),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn update_schedule(&self, id: i64, name: &str, cron: &str, prompt: &str) -> Result<()> {
        let changed = self.with_connection(|conn| {
            conn.execute(
                "UPDATE schedules SET name = ?1, cron = ?2, prompt = ?3 WHERE id = ?4",
                params![name, cron, prompt, id],
            )
            .context("Failed to update schedule")
        })?;
        if changed == 0 {
            anyhow::bail!("Schedule #{id} not found");
        }
        Ok(())
    }

    async fn remove_schedule(&self, id: i64) -> Result<()> {
        let changed = self.with_connection(|conn| {
            conn.execute("DELETE FROM schedules WHERE id = ?1", params![id])
                .context("Failed to delete schedule")
        })?;
        if changed == 0 {
            anyhow::bail!("Schedule #{id} not found");
        }
        Ok(())
    }

    async fn get_active_schedules(&self) -> Result<Vec<Schedule>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE is_active = 1 ORDER BY id ASC"
            ))?;
            let rows = stmt
                .query_map([], schedule_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            collect_schedules(rows)
        })
    }

    async fn get_user_schedules(&self, user_id: &str) -> Result<Vec<Schedule>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SCHEDULE_COLUMNS} FROM schedules WHERE user_id = ?1 ORDER BY id ASC"
            ))?;
            let rows = stmt
                .query_map(params![user_id], schedule_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            collect_schedules(rows)
        })
    }

    async fn add_message(
        &self,
        user_id: &str,
        role: Role,
        content: &str,
        summary: Option<&str>,
    ) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO messages (user_id, role, content, summary, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, role.as_str(), content, summary, Utc::now().to_rfc3339()],
            )
            .context("Failed to insert message")?;
            Ok(())
        })
    }

    async fn get_extended_history(&self, user_id: &str, hours: i64) -> Result<Vec<StoredMessage>> {
        let cutoff = (Utc::now() - ChronoDuration::hours(hours)).to_rfc3339();
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE user_id = ?1 AND timestamp >= ?2 ORDER BY timestamp ASC"
            ))?;
            let rows = stmt
                .query_map(params![user_id, cutoff], message_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            collect_messages(rows)
        })
    }

    async fn get_last_message_time(&self, user_id: &str) -> Result<Option<DateTime<Utc>>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT timestamp FROM messages WHERE user_id = ?1
                 ORDER BY timestamp DESC LIMIT 1",
            )?;
            let found = stmt.query_row(params![user_id], |row| row.get::<_, String>(0));
            match found {
                Ok(raw) => Ok(Some(parse_rfc3339(&raw)?)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }

    async fn recent_messages(
        &self,
        user_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE user_id = ?1
                 ORDER BY timestamp DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(
                    params![user_id, limit as i64, offset as i64],
                    message_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            collect_messages(rows)
        })
    }

    async fn search_messages(
        &self,
        user_id: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        let pattern = format!("%{}%", query.trim());
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE user_id = ?1 AND (content LIKE ?2 OR summary LIKE ?2)
                 ORDER BY timestamp DESC LIMIT ?3"
            ))?;
            let rows = stmt
                .query_map(params![user_id, pattern, limit as i64], message_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            collect_messages(rows)
        })
    }

    async fn clear_messages(&self, user_id: &str) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute("DELETE FROM messages WHERE user_id = ?1", params![user_id])
                .context("Failed to clear messages")?;
            Ok(())
        })
    }
}
