use super::reflection::{ReflectionTrigger, Reflector};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

struct UserTimer {
    sequence: u64,
    handle: Option<JoinHandle<()>>,
}

type TimerMap = Arc<Mutex<HashMap<String, UserTimer>>>;

/// Per-user inactivity timers. Every (re)arm bumps the user's sequence and
/// the spawned timer captures that value; a firing whose captured sequence
/// no longer matches the current one is stale and discarded without side
/// effects. This guards against a reset that interleaves between a timer's
/// deadline and its callback actually running.
pub struct SilenceTimers {
    reflector: Arc<dyn Reflector>,
    delay: Duration,
    timers: TimerMap,
}

impl SilenceTimers {
    pub fn new(reflector: Arc<dyn Reflector>, delay: Duration) -> Self {
        Self {
            reflector,
            delay,
            timers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Cancels any pending timer for the user and arms a fresh one. Called
    /// on every inbound message.
    pub fn reset(&self, user_id: &str) {
        arm(&self.timers, &self.reflector, self.delay, self.delay, user_id);
    }

    /// Arms a one-off timer with a custom delay, used when an existing
    /// silence window is already partly elapsed. Once it fires the normal
    /// rearm loop takes over with the configured delay.
    pub fn reset_after(&self, user_id: &str, delay: Duration) {
        arm(&self.timers, &self.reflector, delay, self.delay, user_id);
    }

    /// Stops the user's timer without arming a new one.
    pub fn cancel(&self, user_id: &str) {
        let mut timers = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = timers.get_mut(user_id) {
            timer.sequence += 1;
            if let Some(handle) = timer.handle.take() {
                handle.abort();
            }
        }
    }

    pub fn shutdown(&self) {
        let mut timers = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        for (_, timer) in timers.iter_mut() {
            timer.sequence += 1;
            if let Some(handle) = timer.handle.take() {
                handle.abort();
            }
        }
    }

    #[cfg(test)]
    fn current_sequence(&self, user_id: &str) -> Option<u64> {
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
            .map(|t| t.sequence)
    }
}

fn arm(
    timers: &TimerMap,
    reflector: &Arc<dyn Reflector>,
    delay: Duration,
    rearm_delay: Duration,
    user_id: &str,
) {
    let captured = {
        let mut map = timers.lock().unwrap_or_else(PoisonError::into_inner);
        let timer = map.entry(user_id.to_string()).or_insert(UserTimer {
            sequence: 0,
            handle: None,
        });
        timer.sequence += 1;
        if let Some(old) = timer.handle.take() {
            old.abort();
        }
        timer.sequence
    };

    let handle = spawn_fire(
        Arc::clone(timers),
        Arc::clone(reflector),
        delay,
        rearm_delay,
        user_id.to_string(),
        captured,
    );

    let mut map = timers.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(timer) = map.get_mut(user_id) {
        // A concurrent re-arm may have superseded us while unlocked; in that
        // case the spawned task will see a stale sequence and discard itself.
        if timer.sequence == captured {
            timer.handle = Some(handle);
        }
    }
}

fn spawn_fire(
    timers: TimerMap,
    reflector: Arc<dyn Reflector>,
    delay: Duration,
    rearm_delay: Duration,
    user_id: String,
    captured: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        let is_current = |map: &TimerMap| {
            map.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&user_id)
                .is_some_and(|t| t.sequence == captured)
        };

        if !is_current(&timers) {
            tracing::debug!(user_id, captured, "Stale silence timer discarded");
            return;
        }

        tracing::info!(user_id, "Silence timeout reached; running reflection");
        if let Err(e) = reflector
            .reflect(&user_id, ReflectionTrigger::Silence, None)
            .await
        {
            tracing::warn!(user_id, "Silence reflection failed: {e}");
        }

        // Rearm only if no reset happened while reflecting; otherwise the
        // newer reset already owns the schedule.
        if is_current(&timers) {
            arm(&timers, &reflector, rearm_delay, rearm_delay, &user_id);
        }
    })
}
