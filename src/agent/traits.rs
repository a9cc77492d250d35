use async_trait::async_trait;

/// Per-request execution options, carried from the pipeline into whichever
/// executor ends up handling the turn.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub model: Option<String>,
    pub is_passthrough_command: bool,
    pub force_new_session: bool,
}

/// An agent backend that can run a conversational turn
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &str;

    /// Run one turn and return the agent's full text output
    async fn execute(&self, input: &str, options: &ExecOptions) -> anyhow::Result<String>;

    /// Condense a long response into a short summary
    async fn summarize(&self, text: &str) -> anyhow::Result<String>;
}
