use crate::storage::{Schedule, Storage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule as CronExprSchedule;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Executes one scheduled prompt when its cron fires. The implementation is
/// responsible for persisting the result and delivering it to the user.
#[async_trait]
pub trait ScheduleExecutor: Send + Sync {
    async fn run_scheduled(&self, schedule: &Schedule) -> Result<()>;
}

/// Prefix a seconds field: user-facing expressions are standard 5-field
/// crontab, the cron crate wants 6 or 7 fields.
fn normalize_expression(expression: &str) -> Result<String> {
    let expression = expression.trim();
    let field_count = expression.split_whitespace().count();
    if field_count != 5 {
        anyhow::bail!(
            "Invalid cron expression: {expression} (expected 5 fields: minute hour day month weekday, got {field_count})"
        );
    }
    Ok(format!("0 {expression}"))
}

/// Next fire time for a 5-field expression, computed in the given timezone.
pub fn next_run(
    expression: &str,
    tz: chrono_tz::Tz,
    from: DateTime<Utc>,
) -> Result<DateTime<Utc>> {
    let normalized = normalize_expression(expression)?;
    let cron = CronExprSchedule::from_str(&normalized)
        .with_context(|| format!("Invalid cron expression: {expression}"))?;
    let localized_from = from.with_timezone(&tz);
    let next_local = cron
        .after(&localized_from)
        .next()
        .ok_or_else(|| anyhow::anyhow!("No future occurrence for expression: {expression}"))?;
    Ok(next_local.with_timezone(&Utc))
}

/// Field-count check plus a trial parse. Nothing is persisted until this
/// passes.
pub fn validate_cron(expression: &str, tz: chrono_tz::Tz) -> Result<()> {
    next_run(expression, tz, Utc::now())?;
    Ok(())
}

/// Owns the set of running cron jobs. One task per active schedule; each
/// task recomputes its next fire time after every run. Job failures are
/// logged and never take the registry down.
pub struct ScheduleRegistry {
    storage: Arc<dyn Storage>,
    executor: Arc<dyn ScheduleExecutor>,
    tz: chrono_tz::Tz,
    max_schedules: usize,
    health_path: PathBuf,
    jobs: Mutex<HashMap<i64, JoinHandle<()>>>,
}

impl ScheduleRegistry {
    pub fn new(
        storage: Arc<dyn Storage>,
        executor: Arc<dyn ScheduleExecutor>,
        timezone: &str,
        max_schedules: usize,
        health_path: PathBuf,
    ) -> Result<Self> {
        let tz = chrono_tz::Tz::from_str(timezone)
            .map_err(|_| anyhow::anyhow!("Invalid IANA timezone: {timezone}"))?;
        Ok(Self {
            storage,
            executor,
            tz,
            max_schedules,
            health_path,
            jobs: Mutex::new(HashMap::new()),
        })
    }

    fn spawn_job(&self, schedule: Schedule) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let tz = self.tz;
        tokio::spawn(async move {
            loop {
                let next = match next_run(&schedule.cron, tz, Utc::now()) {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::error!(
                            schedule = %schedule.name,
                            "Stopping job with unschedulable expression: {e}"
                        );
                        return;
                    }
                };
                let wait = (next - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO);
                tokio::time::sleep(wait).await;

                tracing::info!(schedule = %schedule.name, user_id = %schedule.user_id, "Cron fired");
                if let Err(e) = executor.run_scheduled(&schedule).await {
                    tracing::warn!(schedule = %schedule.name, "Scheduled task failed: {e}");
                }
            }
        })
    }

    fn track(&self, id: i64, handle: JoinHandle<()>) {
        let mut jobs = self
            .jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(old) = jobs.insert(id, handle) {
            old.abort();
        }
    }

    fn untrack(&self, id: i64) {
        let mut jobs = self
            .jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(handle) = jobs.remove(&id) {
            handle.abort();
        }
    }

    pub fn active_job_count(&self) -> usize {
        self.jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Validates and persists a new schedule, then starts its job.
    pub async fn add(&self, user_id: &str, name: &str, cron: &str, prompt: &str) -> Result<i64> {
        validate_cron(cron, self.tz)?;

        let existing = self.storage.get_user_schedules(user_id).await?;
        if existing.len() >= self.max_schedules {
            anyhow::bail!(
                "Schedule limit reached ({} of {})",
                existing.len(),
                self.max_schedules
            );
        }

        let id = self.storage.add_schedule(user_id, name, cron, prompt).await?;
        let schedule = self
            .storage
            .get_schedule(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Schedule #{id} vanished after insert"))?;
        let handle = self.spawn_job(schedule);
        self.track(id, handle);
        tracing::info!(user_id, name, cron, "Schedule #{id} added");
        Ok(id)
    }

    /// Replaces a schedule's fields and restarts its job. The cron expression
    /// is validated before anything is written, so a bad update leaves the
    /// original schedule running untouched.
    pub async fn update(
        &self,
        user_id: &str,
        id: i64,
        name: &str,
        cron: &str,
        prompt: &str,
    ) -> Result<Schedule> {
        let existing = self
            .storage
            .get_schedule(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Schedule #{id} not found"))?;
        if existing.user_id != user_id {
            anyhow::bail!("Schedule #{id} not found");
        }

        validate_cron(cron, self.tz)?;

        self.storage.update_schedule(id, name, cron, prompt).await?;
        let updated = self
            .storage
            .get_schedule(id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("Schedule #{id} vanished after update"))?;

        let handle = self.spawn_job(updated.clone());
        self.track(id, handle);
        tracing::info!(user_id, "Schedule #{id} updated");
        Ok(updated)
    }

    pub async fn remove(&self, id: i64) -> Result<()> {
        self.storage.remove_schedule(id).await?;
        self.untrack(id);
        tracing::info!("Schedule #{id} removed");
        Ok(())
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<Schedule>> {
        self.storage.get_user_schedules(user_id).await
    }

    /// Stops every running job, reloads active schedules from storage, and
    /// restarts them. Also refreshes the on-disk health marker.
    pub async fn reload_all(&self) -> Result<usize> {
        self.reload("reload").await
    }

    /// Initial load on daemon start.
    pub async fn init(&self) -> Result<usize> {
        self.reload("init").await
    }

    async fn reload(&self, trigger: &str) -> Result<usize> {
        {
            let mut jobs = self
                .jobs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for (_, handle) in jobs.drain() {
                handle.abort();
            }
        }

        let schedules = self.storage.get_active_schedules().await?;
        let count = schedules.len();
        for schedule in schedules {
            let id = schedule.id;
            let handle = self.spawn_job(schedule);
            self.track(id, handle);
        }

        self.write_health_marker(count, trigger);
        tracing::info!(trigger, "Schedule registry reloaded: {count} active jobs");
        Ok(count)
    }

    pub fn shutdown(&self) {
        let mut jobs = self
            .jobs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (_, handle) in jobs.drain() {
            handle.abort();
        }
    }

    fn write_health_marker(&self, active_jobs: usize, trigger: &str) {
        let marker = serde_json::json!({
            "updatedAt": Utc::now().to_rfc3339(),
            "trigger": trigger,
            "activeJobs": active_jobs,
        });
        if let Some(parent) = self.health_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.health_path, marker.to_string()) {
            tracing::warn!("Failed to write scheduler health marker: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct NoopExecutor {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl ScheduleExecutor for NoopExecutor {
        async fn run_scheduled(&self, _schedule: &Schedule) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_registry(tmp: &TempDir) -> ScheduleRegistry {
        let storage = Arc::new(SqliteStorage::new(tmp.path().join("attache.db")));
        let executor = Arc::new(NoopExecutor {
            runs: AtomicUsize::new(0),
        });
        ScheduleRegistry::new(
            storage,
            executor,
            "UTC",
            64,
            tmp.path().join("scheduler-health.json"),
        )
        .unwrap()
    }

    #[test]
    fn validate_rejects_wrong_field_count() {
        let tz = chrono_tz::UTC;
        for expr in ["* * * *", "* * * * * *", "", "0 9 * * * * *"] {
            let err = validate_cron(expr, tz).unwrap_err();
            assert!(err.to_string().contains("5 fields"), "expr: {expr}");
        }
    }

    #[test]
    fn validate_rejects_unparseable_fields() {
        assert!(validate_cron("61 * * * *", chrono_tz::UTC).is_err());
        assert!(validate_cron("* 25 * * *", chrono_tz::UTC).is_err());
        assert!(validate_cron("not a cron at all", chrono_tz::UTC).is_err());
    }

    #[test]
    fn validate_accepts_standard_syntax() {
        for expr in ["0 9 * * *", "*/5 * * * *", "15 8-18 * * 1-5", "0 0 1 1 *"] {
            assert!(validate_cron(expr, chrono_tz::UTC).is_ok(), "expr: {expr}");
        }
    }

    #[test]
    fn next_run_honors_timezone() {
        let from = Utc.with_ymd_and_hms(2026, 2, 16, 0, 0, 0).unwrap();
        let next = next_run("0 9 * * *", chrono_tz::America::Los_Angeles, from).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 16, 17, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn add_then_list_returns_active_schedule() {
        let tmp = TempDir::new().unwrap();
        let registry = test_registry(&tmp);

        registry
            .add("alice", "daily", "0 9 * * *", "Summarize my day")
            .await
            .unwrap();

        let listed = registry.list("alice").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].cron, "0 9 * * *");
        assert!(listed[0].is_active);
        assert_eq!(registry.active_job_count(), 1);

        registry.shutdown();
    }

    #[tokio::test]
    async fn add_with_bad_cron_mutates_nothing() {
        let tmp = TempDir::new().unwrap();
        let registry = test_registry(&tmp);

        let err = registry
            .add("alice", "broken", "* * * *", "prompt")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("5 fields"));
        assert!(registry.list("alice").await.unwrap().is_empty());
        assert_eq!(registry.active_job_count(), 0);
    }

    #[tokio::test]
    async fn update_with_bad_cron_leaves_original() {
        let tmp = TempDir::new().unwrap();
        let registry = test_registry(&tmp);

        let id = registry
            .add("alice", "daily", "0 9 * * *", "prompt")
            .await
            .unwrap();

        let err = registry
            .update("alice", id, "daily", "bad cron", "prompt")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("5 fields"));

        let listed = registry.list("alice").await.unwrap();
        assert_eq!(listed[0].cron, "0 9 * * *");

        registry.shutdown();
    }

    #[tokio::test]
    async fn update_requires_ownership() {
        let tmp = TempDir::new().unwrap();
        let registry = test_registry(&tmp);

        let id = registry
            .add("alice", "daily", "0 9 * * *", "prompt")
            .await
            .unwrap();

        let err = registry
            .update("mallory", id, "stolen", "0 9 * * *", "prompt")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not found"));

        registry.shutdown();
    }

    #[tokio::test]
    async fn reload_all_restarts_from_storage() {
        let tmp = TempDir::new().unwrap();
        let registry = test_registry(&tmp);

        registry
            .add("alice", "a", "0 9 * * *", "p1")
            .await
            .unwrap();
        registry
            .add("alice", "b", "30 18 * * *", "p2")
            .await
            .unwrap();

        let count = registry.reload_all().await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(registry.active_job_count(), 2);

        let marker =
            std::fs::read_to_string(tmp.path().join("scheduler-health.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&marker).unwrap();
        assert_eq!(parsed["activeJobs"], 2);
        assert_eq!(parsed["trigger"], "reload");

        registry.shutdown();
        assert_eq!(registry.active_job_count(), 0);
    }

    #[tokio::test]
    async fn schedule_limit_is_enforced() {
        let tmp = TempDir::new().unwrap();
        let storage = Arc::new(SqliteStorage::new(tmp.path().join("attache.db")));
        let executor = Arc::new(NoopExecutor {
            runs: AtomicUsize::new(0),
        });
        let registry = ScheduleRegistry::new(
            storage,
            executor,
            "UTC",
            1,
            tmp.path().join("scheduler-health.json"),
        )
        .unwrap();

        registry.add("alice", "a", "0 9 * * *", "p").await.unwrap();
        let err = registry
            .add("alice", "b", "0 10 * * *", "p")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("limit"));

        registry.shutdown();
    }
}
