use super::traits::{AgentExecutor, ExecOptions};
use crate::config::AgentConfig;
use async_trait::async_trait;
use regex::Regex;
use std::sync::OnceLock;
use tokio::process::Command;

/// Runs the agent CLI as a subprocess on this host.
pub struct LocalAgent {
    command: String,
    base_args: Vec<String>,
    timeout: std::time::Duration,
}

fn ansi_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*[A-Za-z]").expect("valid ANSI pattern"))
}

impl LocalAgent {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            command: config.command.clone(),
            base_args: config.args.clone(),
            timeout: std::time::Duration::from_secs(config.timeout_secs),
        }
    }

    /// Strip ANSI escape sequences and banner noise the CLI prints around
    /// its actual answer.
    fn clean_output(raw: &str) -> String {
        let stripped = ansi_re().replace_all(raw, "");
        stripped
            .lines()
            .filter(|line| {
                let t = line.trim();
                !t.starts_with('█') && !t.starts_with('┃') && !t.starts_with('│')
            })
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_string()
    }

    async fn run(&self, prompt: &str, options: &ExecOptions) -> anyhow::Result<String> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.base_args);

        if let Some(model) = options.model.as_deref() {
            if !model.trim().is_empty() {
                cmd.arg("-m").arg(model);
            }
        }
        if !options.force_new_session {
            cmd.arg("--continue");
        }
        cmd.arg(prompt);
        // On timeout the output future is dropped; without this the CLI
        // process would keep running orphaned.
        cmd.kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Agent CLI `{}` timed out after {}s",
                    self.command,
                    self.timeout.as_secs()
                )
            })??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Agent CLI `{}` failed (status: {}). stderr: {}",
                self.command,
                output.status,
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let cleaned = Self::clean_output(&stdout);
        if cleaned.is_empty() {
            anyhow::bail!("Agent CLI `{}` returned empty output", self.command);
        }
        Ok(cleaned)
    }
}

#[async_trait]
impl AgentExecutor for LocalAgent {
    fn name(&self) -> &str {
        "local"
    }

    async fn execute(&self, input: &str, options: &ExecOptions) -> anyhow::Result<String> {
        self.run(input, options).await
    }

    async fn summarize(&self, text: &str) -> anyhow::Result<String> {
        let prompt = format!(
            "Summarize the following response in one or two short sentences. \
             Reply with the summary only.\n\n{text}"
        );
        self.run(
            &prompt,
            &ExecOptions {
                force_new_session: true,
                ..ExecOptions::default()
            },
        )
        .await
    }
}
