//! Recovery of structured `{receiver, content}` and tool-call payloads from
//! free-form model text.
//!
//! Recovery runs an ordered ladder of strategies and stops at the first one
//! that yields a JSON object:
//!
//! 1. `direct` parses the whole text as strict JSON.
//! 2. `brace_span` parses the span from the first `{` to the last `}`, then
//!    the first balanced `{...}` block if the greedy span is not valid JSON.
//! 3. `formatter` asks a separate deterministic model to rewrite the text as
//!    JSON and parses its answer. This costs one model call per recovery.
//!
//! Shape checks run on the recovered object, never inside the ladder.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{ParseError, StrategyFailure};
use crate::message::Receiver;
use crate::model::{ChatMessage, ChatModel};
use crate::prompts::{FORMATTER_TEMPLATE, render_template};
use crate::roster::Roster;
use crate::tools::ToolRegistry;

const TOOL_NAME_KEYS: [&str; 3] = ["tool name", "tool_name", "tool"];
const TOOL_ARGS_KEYS: [&str; 2] = ["args", "arguments"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Direct,
    BraceSpan,
    Formatter,
}

impl Strategy {
    pub const LADDER: [Strategy; 3] = [Strategy::Direct, Strategy::BraceSpan, Strategy::Formatter];

    pub fn label(self) -> &'static str {
        match self {
            Strategy::Direct => "direct",
            Strategy::BraceSpan => "brace_span",
            Strategy::Formatter => "formatter",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recovered {
    pub object: Map<String, Value>,
    pub strategy: Strategy,
}

/// A validated agent-to-agent routing decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedReply {
    pub receiver: Receiver,
    pub content: String,
    pub strategy: Strategy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

#[derive(Clone, Default)]
pub struct ResponseParser {
    formatter: Option<Arc<dyn ChatModel>>,
}

impl ResponseParser {
    pub fn new(formatter: Option<Arc<dyn ChatModel>>) -> Self {
        Self { formatter }
    }

    pub fn has_formatter(&self) -> bool {
        self.formatter.is_some()
    }

    pub async fn recover(&self, raw: &str) -> Result<Recovered, ParseError> {
        let mut failures = Vec::with_capacity(Strategy::LADDER.len());
        for strategy in Strategy::LADDER {
            match self.attempt(strategy, raw).await {
                Ok(object) => {
                    if !failures.is_empty() {
                        tracing::debug!(
                            strategy = strategy.label(),
                            skipped = failures.len(),
                            "recovered JSON after fallback"
                        );
                    }
                    return Ok(Recovered { object, strategy });
                }
                Err(reason) => failures.push(StrategyFailure {
                    strategy: strategy.label(),
                    reason,
                }),
            }
        }
        Err(ParseError::Unrecoverable(failures))
    }

    async fn attempt(&self, strategy: Strategy, raw: &str) -> Result<Map<String, Value>, String> {
        match strategy {
            Strategy::Direct => parse_object(raw),
            Strategy::BraceSpan => extract_object(raw),
            Strategy::Formatter => {
                let Some(model) = self.formatter.as_ref() else {
                    return Err("no formatter model configured".to_string());
                };
                let prompt = render_template(FORMATTER_TEMPLATE, &[("text", raw)]);
                let corrected = model
                    .complete(&[ChatMessage::user(prompt)])
                    .await
                    .map_err(|err| err.to_string())?;
                parse_object(&corrected).or_else(|_| extract_object(&corrected))
            }
        }
    }

    /// Recover a routing payload and check the receiver against the labels
    /// this agent may address.
    pub async fn parse_route(
        &self,
        raw: &str,
        roster: &Roster,
        allowed: &BTreeSet<Receiver>,
    ) -> Result<RoutedReply, ParseError> {
        let recovered = self.recover(raw).await?;
        let label = recovered
            .object
            .get("receiver")
            .and_then(Value::as_str)
            .ok_or(ParseError::MissingField("receiver"))?;
        let receiver = roster
            .resolve(label)
            .ok_or_else(|| ParseError::UnknownReceiver(label.to_string()))?;
        if !allowed.contains(&receiver) {
            return Err(ParseError::ForbiddenReceiver(label.to_string()));
        }
        let content = match recovered.object.get("content") {
            None | Some(Value::Null) => return Err(ParseError::MissingField("content")),
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
        };
        Ok(RoutedReply {
            receiver,
            content,
            strategy: recovered.strategy,
        })
    }

    pub async fn parse_tool_call(
        &self,
        raw: &str,
        registry: &ToolRegistry,
    ) -> Result<ToolCall, ParseError> {
        let recovered = self.recover(raw).await?;
        let tool_name = first_field(&recovered.object, &TOOL_NAME_KEYS)
            .and_then(Value::as_str)
            .map(|name| name.trim().to_string())
            .ok_or(ParseError::MissingField("tool name"))?;
        if !registry.contains(&tool_name) {
            return Err(ParseError::UnknownTool(tool_name));
        }
        let arguments = match first_field(&recovered.object, &TOOL_ARGS_KEYS) {
            None => return Err(ParseError::MissingField("args")),
            Some(Value::Object(map)) => map.clone(),
            Some(other) => return Err(ParseError::MalformedArguments(json_kind(other).to_string())),
        };
        Ok(ToolCall {
            tool_name,
            arguments,
        })
    }
}

fn first_field<'a>(object: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| object.get(*key))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub fn parse_object(text: &str) -> Result<Map<String, Value>, String> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(format!("top-level JSON is {}, not an object", json_kind(&other))),
        Err(err) => Err(err.to_string()),
    }
}

/// Greedy `{ ... }` span first, then the first balanced block.
pub fn extract_object(text: &str) -> Result<Map<String, Value>, String> {
    let greedy = greedy_span(text).ok_or_else(|| "no '{...}' span in text".to_string())?;
    match parse_object(greedy) {
        Ok(map) => Ok(map),
        Err(greedy_err) => match balanced_span(text) {
            Some(span) if span.len() != greedy.len() => parse_object(span),
            _ => Err(greedy_err),
        },
    }
}

fn greedy_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// First `{...}` block whose braces balance, ignoring braces inside strings.
pub fn balanced_span(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn greedy_span_recovers_object_wrapped_in_prose() {
        let text = "Sure! Here you go:\n{\"receiver\": \"kg_agent\", \"content\": \"go\"}\nThanks.";
        let map = extract_object(text).unwrap();
        assert_eq!(map["receiver"], "kg_agent");
    }

    #[test]
    fn balanced_span_handles_two_objects() {
        let text = "first {\"a\": 1} then {\"b\": 2}";
        assert!(parse_object(greedy_span(text).unwrap()).is_err());
        let map = extract_object(text).unwrap();
        assert_eq!(map["a"], 1);
    }

    #[test]
    fn balanced_span_ignores_braces_in_strings() {
        let text = "x {\"content\": \"a } b\", \"n\": {\"k\": 1}} y";
        assert_eq!(
            balanced_span(text),
            Some("{\"content\": \"a } b\", \"n\": {\"k\": 1}}")
        );
    }

    #[test]
    fn non_object_json_is_rejected() {
        assert!(parse_object("[1, 2]").unwrap_err().contains("an array"));
    }
}
