use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ToolError;
use crate::tools::{Tool, required_str};

const MAX_ERROR_BODY_CHARS: usize = 400;

/// Tool definition from the team file: a query backend reachable over HTTP.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HttpToolConfig {
    pub name: String,
    pub description: String,
    pub endpoint: String,
    #[serde(default)]
    pub required_args: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub auth_bearer_env: Option<String>,
}

/// POSTs the argument object as JSON and returns the response body as text.
///
/// Transport errors and 5xx responses are retried; 4xx responses are
/// reported straight back so the agent can fix its arguments.
pub struct HttpTool {
    config: HttpToolConfig,
    client: reqwest::Client,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl HttpTool {
    pub fn new(config: HttpToolConfig, retry_attempts: u32, retry_delay_ms: u64) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            retry_attempts: retry_attempts.max(1),
            retry_delay: Duration::from_millis(retry_delay_ms),
        }
    }

    fn validate(&self, args: &Map<String, Value>) -> Result<(), ToolError> {
        for key in &self.config.required_args {
            if args.get(key).map(Value::is_string).unwrap_or(false) {
                required_str(args, key)?;
            } else if args.get(key).map(Value::is_null).unwrap_or(true) {
                return Err(ToolError::MissingArgument(key.clone()));
            }
        }
        Ok(())
    }

    async fn send_once(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        let mut request = self.client.post(&self.config.endpoint).json(args);
        if let Some(secs) = self.config.timeout_secs {
            request = request.timeout(Duration::from_secs(secs));
        }
        if let Some(env_name) = self.config.auth_bearer_env.as_deref() {
            if let Ok(token) = std::env::var(env_name) {
                request = request.bearer_auth(token);
            }
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if status.is_success() {
            return Ok(body.trim().to_string());
        }
        Err(ToolError::Status {
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
        })
    }
}

fn is_retryable(err: &ToolError) -> bool {
    match err {
        ToolError::Http(_) => true,
        ToolError::Status { status, .. } => *status >= 500 || *status == 429,
        _ => false,
    }
}

#[async_trait]
impl Tool for HttpTool {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn description(&self) -> &str {
        &self.config.description
    }

    async fn invoke(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        self.validate(args)?;

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.send_once(args).await {
                Ok(body) => return Ok(body),
                Err(err) if is_retryable(&err) && attempts < self.retry_attempts => {
                    tracing::debug!(
                        tool = %self.config.name,
                        attempt = attempts,
                        error = %err,
                        "retrying tool request"
                    );
                    if !self.retry_delay.is_zero() {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(required: &[&str]) -> HttpTool {
        HttpTool::new(
            HttpToolConfig {
                name: "query_node_attribute".to_string(),
                description: "Look up one attribute of a KG node.".to_string(),
                endpoint: "http://127.0.0.1:9/unused".to_string(),
                required_args: required.iter().map(|s| s.to_string()).collect(),
                timeout_secs: Some(1),
                auth_bearer_env: None,
            },
            1,
            0,
        )
    }

    #[tokio::test]
    async fn missing_required_argument_fails_before_any_request() {
        let tool = tool(&["type", "id"]);
        let args = json!({"type": "Protein"}).as_object().cloned().unwrap();
        let err = tool.invoke(&args).await.unwrap_err();
        assert_eq!(err.to_string(), "missing required argument 'id'");
    }

    #[tokio::test]
    async fn blank_string_argument_counts_as_missing() {
        let tool = tool(&["id"]);
        let args = json!({"id": "  "}).as_object().cloned().unwrap();
        assert!(matches!(
            tool.invoke(&args).await,
            Err(ToolError::MissingArgument(key)) if key == "id"
        ));
    }

    #[test]
    fn only_server_side_statuses_are_retried() {
        assert!(is_retryable(&ToolError::Status {
            status: 503,
            body: String::new()
        }));
        assert!(!is_retryable(&ToolError::Status {
            status: 400,
            body: String::new()
        }));
        assert!(!is_retryable(&ToolError::MissingArgument("id".into())));
    }
}
