use super::traits::ExecOptions;
use crate::config::RoutingConfig;
use serde::{Deserialize, Serialize};

/// Failure classes for a remote runner call. Timeouts and 5xx/429 responses
/// are transient; other 4xx responses will not succeed on retry.
#[derive(Debug, thiserror::Error)]
pub enum RemoteCallError {
    #[error("Remote runner timed out after {0}s")]
    Timeout(u64),
    #[error("Remote runner transient failure: {0}")]
    Transient(String),
    #[error("Remote runner rejected request: {0}")]
    Permanent(String),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RunRequest<'a> {
    task: &'a str,
    input: &'a str,
    model: Option<&'a str>,
    is_passthrough_command: bool,
    force_new_session: bool,
}

#[derive(Deserialize)]
struct RunResponse {
    ok: bool,
    output: Option<String>,
    error: Option<String>,
}

/// HTTP client for the remote runner's `/run` endpoint.
pub struct RemoteRunner {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    timeout_secs: u64,
}

impl RemoteRunner {
    pub fn new(endpoint: String, config: &RoutingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token: config.runner_token.clone(),
            timeout_secs: config.remote_timeout_secs,
        }
    }

    pub async fn run(
        &self,
        task: &str,
        input: &str,
        options: &ExecOptions,
    ) -> Result<String, RemoteCallError> {
        let body = RunRequest {
            task,
            input,
            model: options.model.as_deref(),
            is_passthrough_command: options.is_passthrough_command,
            force_new_session: options.force_new_session,
        };

        let mut req = self
            .client
            .post(format!("{}/run", self.endpoint))
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .json(&body);
        if let Some(token) = self.token.as_deref() {
            req = req.header("X-Runner-Token", token);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                RemoteCallError::Timeout(self.timeout_secs)
            } else {
                RemoteCallError::Transient(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            let msg = format!("HTTP {status}: {}", detail.trim());
            return if status.is_server_error() || status.as_u16() == 429 {
                Err(RemoteCallError::Transient(msg))
            } else {
                Err(RemoteCallError::Permanent(msg))
            };
        }

        let parsed: RunResponse = resp
            .json()
            .await
            .map_err(|e| RemoteCallError::Transient(format!("Invalid runner response: {e}")))?;

        if !parsed.ok {
            return Err(RemoteCallError::Transient(
                parsed.error.unwrap_or_else(|| "runner reported failure".to_string()),
            ));
        }

        parsed
            .output
            .filter(|o| !o.trim().is_empty())
            .ok_or_else(|| RemoteCallError::Transient("runner returned empty output".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_trailing_slash_is_normalized() {
        let config = RoutingConfig::default();
        let runner = RemoteRunner::new("http://runner.local:8787/".into(), &config);
        assert_eq!(runner.endpoint, "http://runner.local:8787");
    }

    #[test]
    fn run_request_serializes_camel_case() {
        let body = RunRequest {
            task: "chat",
            input: "hi",
            model: Some("gemini-2.5-pro"),
            is_passthrough_command: false,
            force_new_session: true,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["task"], "chat");
        assert_eq!(json["isPassthroughCommand"], false);
        assert_eq!(json["forceNewSession"], true);
    }
}
