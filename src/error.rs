use thiserror::Error;

use crate::message::{NodeId, Receiver};

/// Failure of the model capability itself (transport, status, empty output).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ModelError {
    #[error("model transport failed: {0}")]
    Transport(String),

    #[error("model API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("model returned no text")]
    Empty,

    #[error("scripted model '{0}' has no replies left")]
    Exhausted(String),
}

/// Why one rung of the recovery ladder did not produce JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyFailure {
    pub strategy: &'static str,
    pub reason: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("no JSON object could be recovered ({})", describe_failures(.0))]
    Unrecoverable(Vec<StrategyFailure>),

    #[error("payload is missing field '{0}'")]
    MissingField(&'static str),

    #[error("unknown receiver '{0}'")]
    UnknownReceiver(String),

    #[error("receiver '{0}' is not reachable from this agent")]
    ForbiddenReceiver(String),

    #[error("tool '{0}' is not registered")]
    UnknownTool(String),

    #[error("tool arguments must be a JSON object, got {0}")]
    MalformedArguments(String),
}

fn describe_failures(failures: &[StrategyFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.strategy, f.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("node {node:?} may address {receiver:?} but the routing table has no entry for it")]
    MissingRoute { node: NodeId, receiver: Receiver },

    #[error("route {node:?} -> {receiver:?} targets unregistered node {target:?}")]
    UnknownTarget {
        node: NodeId,
        receiver: Receiver,
        target: NodeId,
    },

    #[error("node {0:?} is not registered")]
    MissingNode(NodeId),

    #[error("node {0:?} is not part of the team roster")]
    NotInRoster(NodeId),

    #[error("node {node:?} produced unroutable receiver {receiver:?}")]
    Unroutable { node: NodeId, receiver: Receiver },

    #[error("tool executor was invoked without a calling agent")]
    NoToolCaller,

    #[error("graph configuration error: {0}")]
    Config(String),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("memory budget of {capacity} entries is exhausted")]
pub struct MemoryFull {
    pub capacity: usize,
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("tool '{tool}' timed out after {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error("tool '{tool}' panicked: {message}")]
    Panicked { tool: String, message: String },

    #[error("missing required argument '{0}'")]
    MissingArgument(String),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Provider,
    Config,
    Tooling,
    Input,
    Internal,
}

impl ErrorCategory {
    pub fn code(self) -> &'static str {
        match self {
            ErrorCategory::Provider => "PROVIDER",
            ErrorCategory::Config => "CONFIG",
            ErrorCategory::Tooling => "TOOLING",
            ErrorCategory::Input => "INPUT",
            ErrorCategory::Internal => "INTERNAL",
        }
    }

    pub fn hint(self) -> &'static str {
        match self {
            ErrorCategory::Provider => {
                "Set provider credentials (for example OPENAI_API_KEY) or pass --provider and --base-url explicitly."
            }
            ErrorCategory::Config => {
                "Check --config-path/--team-path and the field names in the referenced TOML files."
            }
            ErrorCategory::Tooling => {
                "Review tool endpoints in the team file and retry with RUST_LOG=info for tool logs."
            }
            ErrorCategory::Input => "Run teamcheck --help and correct command arguments.",
            ErrorCategory::Internal => {
                "Retry with RUST_LOG=debug. If it persists, capture logs and open an issue."
            }
        }
    }
}

pub fn categorize_error(err: &anyhow::Error) -> ErrorCategory {
    let msg = format!("{err:#}").to_ascii_lowercase();

    if msg.contains("api_key") || msg.contains("provider") || msg.contains("model api") {
        return ErrorCategory::Provider;
    }

    if msg.contains("invalid value")
        || msg.contains("unknown argument")
        || msg.contains("failed to read input")
        || msg.contains("dataset")
    {
        return ErrorCategory::Input;
    }

    if msg.contains("profile")
        || msg.contains("team file")
        || msg.contains("configuration")
        || msg.contains("routing table")
    {
        return ErrorCategory::Config;
    }

    if msg.contains("tool") || msg.contains("endpoint") {
        return ErrorCategory::Tooling;
    }

    ErrorCategory::Internal
}

pub fn format_cli_error(err: &anyhow::Error) -> String {
    let category = categorize_error(err);
    format!(
        "[{}] {}\nHint: {}",
        category.code(),
        redact_sensitive_text(&format!("{err:#}")),
        category.hint()
    )
}

/// Mask bearer tokens and `sk-` style API keys that leak into error text.
pub fn redact_sensitive_text(text: &str) -> String {
    let mut out = Vec::new();
    let mut redact_next = false;
    for token in text.split(' ') {
        if redact_next {
            out.push("[REDACTED]".to_string());
            redact_next = false;
            continue;
        }
        if token.eq_ignore_ascii_case("bearer") {
            redact_next = true;
            out.push(token.to_string());
        } else if token.starts_with("sk-") && token.len() > 8 {
            out.push("sk-[REDACTED]".to_string());
        } else {
            out.push(token.to_string());
        }
    }
    out.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_lists_every_strategy() {
        let err = ParseError::Unrecoverable(vec![
            StrategyFailure {
                strategy: "direct",
                reason: "expected value".to_string(),
            },
            StrategyFailure {
                strategy: "brace_span",
                reason: "no object".to_string(),
            },
        ]);
        assert_eq!(
            err.to_string(),
            "no JSON object could be recovered (direct: expected value; brace_span: no object)"
        );
    }

    #[test]
    fn redaction_masks_keys_and_bearer_tokens() {
        let text = "request with Bearer abc123 and key sk-1234567890 failed";
        assert_eq!(
            redact_sensitive_text(text),
            "request with Bearer [REDACTED] and key sk-[REDACTED] failed"
        );
    }
}
