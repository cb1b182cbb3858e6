pub mod http;

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::error::{GraphError, ToolError};
use crate::message::{ConversationState, NodeId, NodeUpdate, Receiver};
use crate::parser::{ResponseParser, ToolCall};
use crate::telemetry::TelemetrySink;

pub const INVALID_TOOL_INFORMATION: &str =
    "Invalid tool information. Please provide the correct tool information.";
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 45;

/// An external capability an agent can call through the tool executor.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    async fn invoke(&self, args: &Map<String, Value>) -> Result<String, ToolError>;
}

/// Immutable name -> tool map, shared read-only by every task instance.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), GraphError> {
        let name = tool.name().trim().to_string();
        if name.is_empty() {
            return Err(GraphError::Config("tool name cannot be empty".to_string()));
        }
        if self.tools.contains_key(&name) {
            return Err(GraphError::Config(format!(
                "tool '{name}' is registered more than once"
            )));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn with_tool(mut self, tool: Arc<dyn Tool>) -> Result<Self, GraphError> {
        self.register(tool)?;
        Ok(self)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool usage block for system prompts, restricted to `names` when given.
    pub fn describe(&self, names: Option<&[String]>) -> String {
        let mut out = String::new();
        for (name, tool) in &self.tools {
            if let Some(filter) = names {
                if !filter.iter().any(|n| n == name) {
                    continue;
                }
            }
            out.push_str(&format!("{name}:\n  {}\n", tool.description()));
        }
        if out.is_empty() {
            out.push_str("(no tools available)\n");
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolOutcome {
    Succeeded { tool: String, output: String },
    Failed { tool: String, error: String },
    /// The caller named a registered tool it is not allowed to use.
    Denied { tool: String },
    Invalid { reason: String },
}

impl ToolOutcome {
    /// Text the calling agent sees on its next turn.
    pub fn text(&self) -> String {
        match self {
            ToolOutcome::Succeeded { output, .. } => output.clone(),
            ToolOutcome::Failed { tool, error } => format!(
                "Tool '{tool}' failed: {error}. Check the arguments and call the tool again."
            ),
            ToolOutcome::Denied { tool } => format!(
                "Tool '{tool}' is not available to you. Use one of the tools listed in your instructions."
            ),
            ToolOutcome::Invalid { .. } => INVALID_TOOL_INFORMATION.to_string(),
        }
    }
}

/// Graph node that executes one tool call and replies to its caller.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    parser: ResponseParser,
    timeout: Duration,
    /// Agents listed here may only call the named tools; absent agents may
    /// call anything registered.
    permissions: BTreeMap<NodeId, BTreeSet<String>>,
    telemetry: TelemetrySink,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, parser: ResponseParser) -> Self {
        Self {
            registry,
            parser,
            timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
            permissions: BTreeMap::new(),
            telemetry: TelemetrySink::disabled(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn with_permissions(mut self, permissions: BTreeMap<NodeId, BTreeSet<String>>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn permits(&self, caller: NodeId, tool: &str) -> bool {
        self.permissions
            .get(&caller)
            .is_none_or(|allowed| allowed.contains(tool))
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Never fails: every problem becomes outcome text for the caller.
    pub async fn execute(&self, content: &str) -> ToolOutcome {
        self.execute_for(None, content).await
    }

    /// Like `execute`, but checks the caller's tool permissions first.
    pub async fn execute_for(&self, caller: Option<NodeId>, content: &str) -> ToolOutcome {
        let call = match self.parser.parse_tool_call(content, &self.registry).await {
            Ok(call) => call,
            Err(err) => {
                tracing::info!(error = %err, "tool instruction could not be parsed");
                self.telemetry
                    .emit("tool.invalid", json!({ "error": err.to_string() }));
                return ToolOutcome::Invalid {
                    reason: err.to_string(),
                };
            }
        };

        if let Some(caller) = caller {
            if !self.permits(caller, &call.tool_name) {
                tracing::info!(tool = %call.tool_name, ?caller, "tool not permitted for caller");
                self.telemetry
                    .emit("tool.denied", json!({ "tool": call.tool_name }));
                return ToolOutcome::Denied {
                    tool: call.tool_name,
                };
            }
        }

        let Some(tool) = self.registry.get(&call.tool_name) else {
            return ToolOutcome::Invalid {
                reason: format!("tool '{}' is not registered", call.tool_name),
            };
        };

        let started = std::time::Instant::now();
        let result = self.invoke(tool, &call).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                tracing::info!(tool = %call.tool_name, elapsed_ms, "tool succeeded");
                self.telemetry.emit(
                    "tool.succeeded",
                    json!({ "tool": call.tool_name, "elapsed_ms": elapsed_ms }),
                );
                ToolOutcome::Succeeded {
                    tool: call.tool_name,
                    output,
                }
            }
            Err(err) => {
                tracing::warn!(tool = %call.tool_name, error = %err, "tool failed");
                self.telemetry.emit(
                    "tool.failed",
                    json!({
                        "tool": call.tool_name,
                        "elapsed_ms": elapsed_ms,
                        "error": err.to_string(),
                    }),
                );
                ToolOutcome::Failed {
                    tool: call.tool_name,
                    error: err.to_string(),
                }
            }
        }
    }

    /// The tool runs on its own task so a panic inside it surfaces as a
    /// failed call instead of unwinding through the run loop.
    async fn invoke(&self, tool: &Arc<dyn Tool>, call: &ToolCall) -> Result<String, ToolError> {
        let tool = Arc::clone(tool);
        let args = call.arguments.clone();
        let task = tokio::spawn(async move { tool.invoke(&args).await });
        let abort = task.abort_handle();

        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) if err.is_panic() => Err(ToolError::Panicked {
                tool: call.tool_name.clone(),
                message: panic_message(err.into_panic()),
            }),
            Ok(Err(err)) => Err(ToolError::Other(format!("tool task was cancelled: {err}"))),
            Err(_) => {
                abort.abort();
                Err(ToolError::Timeout {
                    tool: call.tool_name.clone(),
                    secs: self.timeout.as_secs(),
                })
            }
        }
    }

    /// Run the tool named in the latest message and address the result to
    /// the agent that sent it.
    pub async fn handle(&self, state: &ConversationState) -> Result<NodeUpdate, GraphError> {
        let caller = state
            .sender()
            .filter(|id| id.is_agent())
            .ok_or(GraphError::NoToolCaller)?;
        let content = state.last().map(|m| m.content.as_str()).unwrap_or_default();
        let outcome = self.execute_for(Some(caller), content).await;
        Ok(NodeUpdate::new(
            NodeId::ToolExecutor,
            Receiver::Node(caller),
            outcome.text(),
        ))
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        return (*text).to_string();
    }
    match payload.downcast::<String>() {
        Ok(text) => *text,
        Err(_) => "non-string panic payload".to_string(),
    }
}

/// Tool backed by a plain async closure. Handy for wiring in-process
/// capabilities and for tests.
pub struct FnTool<F> {
    name: String,
    description: String,
    func: F,
}

impl<F> FnTool<F> {
    pub fn new(name: impl Into<String>, description: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            func,
        }
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<String, ToolError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn invoke(&self, args: &Map<String, Value>) -> Result<String, ToolError> {
        (self.func)(args.clone()).await
    }
}

pub fn required_str<'a>(args: &'a Map<String, Value>, key: &str) -> Result<&'a str, ToolError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ToolError::MissingArgument(key.to_string()))
}
