pub mod breaker;
pub mod canary;

pub use breaker::CircuitBreaker;
pub use canary::{canary_bucket, is_canary};

use crate::agent::{AgentExecutor, ExecOptions, RemoteCallError, RemoteRunner};
use crate::config::RoutingConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Why a turn failed to produce output.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Remote execution timed out after {0}s")]
    Timeout(u64),
    #[error("Remote execution failed (transient): {0}")]
    Transient(String),
    #[error("Remote execution rejected: {0}")]
    Permanent(String),
    #[error("Remote circuit is open; retry after cooldown")]
    CircuitOpen,
    #[error("Local execution failed: {0}")]
    Local(String),
}

impl From<RemoteCallError> for RouteError {
    fn from(e: RemoteCallError) -> Self {
        match e {
            RemoteCallError::Timeout(secs) => RouteError::Timeout(secs),
            RemoteCallError::Transient(msg) => RouteError::Transient(msg),
            RemoteCallError::Permanent(msg) => RouteError::Permanent(msg),
        }
    }
}

/// Remote side of the router, behind a trait so tests can stand in for the
/// HTTP client.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn run_chat(&self, input: &str, options: &ExecOptions)
        -> Result<String, RemoteCallError>;

    async fn run_summarize(&self, text: &str) -> Result<String, RemoteCallError>;
}

#[async_trait]
impl RemoteExec for RemoteRunner {
    async fn run_chat(
        &self,
        input: &str,
        options: &ExecOptions,
    ) -> Result<String, RemoteCallError> {
        self.run("chat", input, options).await
    }

    async fn run_summarize(&self, text: &str) -> Result<String, RemoteCallError> {
        let options = ExecOptions {
            force_new_session: true,
            ..ExecOptions::default()
        };
        self.run("summarize", text, &options).await
    }
}

/// Which backend ultimately served the turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPath {
    Local,
    Remote,
    LocalFallback,
}

#[derive(Debug)]
pub struct RouteResult {
    pub output: String,
    pub path: ExecutionPath,
}

/// Splits chat traffic between the local engine and a remote runner by
/// deterministic canary bucket, with a circuit breaker and optional local
/// fallback protecting the remote path.
pub struct ExecutionRouter {
    config: RoutingConfig,
    local: Arc<dyn AgentExecutor>,
    remote: Option<Arc<dyn RemoteExec>>,
    breaker: CircuitBreaker,
}

impl ExecutionRouter {
    pub fn new(
        config: RoutingConfig,
        local: Arc<dyn AgentExecutor>,
        remote: Option<Arc<dyn RemoteExec>>,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            config.failure_threshold,
            Duration::from_millis(config.cooldown_ms),
        );
        Self {
            config,
            local,
            remote,
            breaker,
        }
    }

    /// Builds the router from config, wiring up the HTTP runner client when
    /// an endpoint is configured.
    pub fn from_config(config: &RoutingConfig, local: Arc<dyn AgentExecutor>) -> Self {
        let remote: Option<Arc<dyn RemoteExec>> = config
            .runner_endpoint
            .as_deref()
            .filter(|e| !e.trim().is_empty())
            .map(|endpoint| {
                Arc::new(RemoteRunner::new(endpoint.to_string(), config)) as Arc<dyn RemoteExec>
            });
        Self::new(config.clone(), local, remote)
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    async fn run_local(
        &self,
        input: &str,
        options: &ExecOptions,
        path: ExecutionPath,
    ) -> Result<RouteResult, RouteError> {
        let output = self
            .local
            .execute(input, options)
            .await
            .map_err(|e| RouteError::Local(e.to_string()))?;
        Ok(RouteResult { output, path })
    }

    /// Routes one chat turn. Local execution never engages the breaker; only
    /// remote attempts count toward it.
    pub async fn route(
        &self,
        user_id: &str,
        message_id: &str,
        input: &str,
        options: &ExecOptions,
    ) -> Result<RouteResult, RouteError> {
        let Some(remote) = self.remote.as_ref() else {
            return self.run_local(input, options, ExecutionPath::Local).await;
        };

        if !is_canary(
            user_id,
            message_id,
            self.config.canary_percent,
            &self.config.canary_users,
        ) {
            return self.run_local(input, options, ExecutionPath::Local).await;
        }

        if !self.breaker.allow_request() {
            tracing::warn!(user_id, "Remote circuit open; skipping runner");
            if self.config.fallback_to_local {
                return self
                    .run_local(input, options, ExecutionPath::LocalFallback)
                    .await;
            }
            return Err(RouteError::CircuitOpen);
        }

        match remote.run_chat(input, options).await {
            Ok(output) => {
                self.breaker.record_success();
                tracing::debug!(user_id, "Remote runner served turn");
                Ok(RouteResult {
                    output,
                    path: ExecutionPath::Remote,
                })
            }
            Err(e) => {
                let opened = self.breaker.record_failure();
                if opened {
                    tracing::warn!(
                        user_id,
                        cooldown_ms = self.config.cooldown_ms,
                        "Remote circuit opened: {e}"
                    );
                } else {
                    tracing::warn!(user_id, "Remote runner failed: {e}");
                }
                if self.config.fallback_to_local {
                    self.run_local(input, options, ExecutionPath::LocalFallback)
                        .await
                } else {
                    Err(e.into())
                }
            }
        }
    }

    /// Summarizes text through the same backend the canary would pick for
    /// this message, so remote-served users get remote summaries too. Falls
    /// back to the local engine on any remote trouble; summaries are not
    /// worth surfacing a routing error for.
    pub async fn summarize(
        &self,
        user_id: &str,
        message_id: &str,
        text: &str,
    ) -> anyhow::Result<String> {
        if let Some(remote) = self.remote.as_ref() {
            let selected = is_canary(
                user_id,
                message_id,
                self.config.canary_percent,
                &self.config.canary_users,
            );
            if selected && self.breaker.allow_request() {
                match remote.run_summarize(text).await {
                    Ok(summary) => {
                        self.breaker.record_success();
                        return Ok(summary);
                    }
                    Err(e) => {
                        self.breaker.record_failure();
                        tracing::warn!(user_id, "Remote summarize failed; using local: {e}");
                    }
                }
            }
        }
        self.local.summarize(text).await
    }
}
