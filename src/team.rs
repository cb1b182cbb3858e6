use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::agent::{Agent, AgentDeps, AgentProfile};
use crate::error::GraphError;
use crate::graph::{ConversationGraph, DEFAULT_MAX_STEPS, GraphBuilder, RoutingTable, RunOutcome, RunReport};
use crate::message::{NodeId, Receiver};
use crate::model::ChatModel;
use crate::parser::{ResponseParser, extract_object};
use crate::prompts::{
    DEFAULT_KG_ROLE, DEFAULT_KG_TASK, DEFAULT_LEADER_ROLE, DEFAULT_LEADER_TASK,
    DEFAULT_VALIDATION_ROLE, DEFAULT_VALIDATION_TASK,
};
use crate::roster::{DEFAULT_END_LABEL, DEFAULT_LEADER_LABEL, DEFAULT_TOOL_EXECUTOR_LABEL, Roster};
use crate::telemetry::TelemetrySink;
use crate::tools::{DEFAULT_TOOL_TIMEOUT_SECS, ToolExecutor, ToolRegistry};

pub const DEFAULT_LEADER_CAPACITY: usize = 20;
pub const DEFAULT_WORKER_CAPACITY: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Support,
    Refute,
}

impl Verdict {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "support" => Some(Verdict::Support),
            "refute" => Some(Verdict::Refute),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Verdict::Support => "support",
            Verdict::Refute => "refute",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conclusion {
    pub conclusion: Option<Verdict>,
    pub reason: String,
}

/// What a task instance hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskAnswer {
    Conclusion(Conclusion),
    Raw(String),
}

impl TaskAnswer {
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            TaskAnswer::Conclusion(c) => c.conclusion,
            TaskAnswer::Raw(_) => None,
        }
    }
}

/// Structured conclusion if the text holds a JSON object with a
/// `conclusion` key, otherwise the text itself.
pub fn extract_answer(text: &str) -> TaskAnswer {
    let Ok(object) = extract_object(text) else {
        return TaskAnswer::Raw(text.trim().to_string());
    };
    let Some(raw_conclusion) = object.get("conclusion") else {
        return TaskAnswer::Raw(text.trim().to_string());
    };

    let conclusion = match raw_conclusion {
        Value::Null => None,
        Value::String(s) => match Verdict::parse(s) {
            Some(verdict) => Some(verdict),
            None => return TaskAnswer::Raw(text.trim().to_string()),
        },
        _ => return TaskAnswer::Raw(text.trim().to_string()),
    };
    let reason = match object.get("reason") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    TaskAnswer::Conclusion(Conclusion { conclusion, reason })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub report: RunReport,
    pub answer: TaskAnswer,
}

impl TaskResult {
    /// A normal completion that produced a support/refute verdict.
    pub fn is_clean(&self) -> bool {
        self.report.outcome == RunOutcome::Completed && self.answer.verdict().is_some()
    }
}

fn answer_for(report: &RunReport) -> TaskAnswer {
    match report.final_text() {
        Some(text) => extract_answer(text),
        None => TaskAnswer::Raw(
            report
                .transcript
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default(),
        ),
    }
}

pub fn default_leader_profile() -> AgentProfile {
    AgentProfile {
        name: DEFAULT_LEADER_LABEL.to_string(),
        role_description: DEFAULT_LEADER_ROLE.to_string(),
        task_description: DEFAULT_LEADER_TASK.to_string(),
        tools: None,
        capacity: DEFAULT_LEADER_CAPACITY,
    }
}

pub fn default_worker_profiles() -> Vec<AgentProfile> {
    vec![
        AgentProfile {
            name: "kg_agent".to_string(),
            role_description: DEFAULT_KG_ROLE.to_string(),
            task_description: DEFAULT_KG_TASK.to_string(),
            tools: None,
            capacity: DEFAULT_WORKER_CAPACITY,
        },
        AgentProfile {
            name: "validation_agent".to_string(),
            role_description: DEFAULT_VALIDATION_ROLE.to_string(),
            task_description: DEFAULT_VALIDATION_TASK.to_string(),
            tools: None,
            capacity: DEFAULT_WORKER_CAPACITY,
        },
    ]
}

/// The immutable parts of a team. Every task gets its own graph, agents and
/// memories from `instantiate`; only the blueprint is shared.
pub struct TeamBlueprint {
    model: Arc<dyn ChatModel>,
    parser: ResponseParser,
    roster: Arc<Roster>,
    routes: Arc<RoutingTable>,
    tools: Arc<ToolRegistry>,
    leader: AgentProfile,
    workers: Vec<AgentProfile>,
    team_description: String,
    max_steps: usize,
    tool_timeout: Duration,
}

impl TeamBlueprint {
    pub fn new(
        model: Arc<dyn ChatModel>,
        leader: AgentProfile,
        workers: Vec<AgentProfile>,
        tools: ToolRegistry,
    ) -> Result<Self, GraphError> {
        let roster = Roster::new(
            leader.name.clone(),
            workers.iter().map(|w| w.name.clone()).collect(),
            DEFAULT_TOOL_EXECUTOR_LABEL.to_string(),
            DEFAULT_END_LABEL.to_string(),
        )?;
        for profile in std::iter::once(&leader).chain(workers.iter()) {
            if profile.capacity == 0 {
                return Err(GraphError::Config(format!(
                    "agent '{}' needs a capacity of at least 1",
                    profile.name
                )));
            }
            if let Some(names) = &profile.tools {
                if let Some(missing) = names.iter().find(|n| !tools.contains(n)) {
                    return Err(GraphError::Config(format!(
                        "agent '{}' lists unknown tool '{}'",
                        profile.name, missing
                    )));
                }
            }
        }

        let team_description = workers
            .iter()
            .map(|w| format!("{}: {}", w.name, w.role_description))
            .collect::<Vec<_>>()
            .join("\n");
        let routes = RoutingTable::identity(&roster);

        let blueprint = Self {
            model,
            parser: ResponseParser::default(),
            roster: Arc::new(roster),
            routes: Arc::new(routes),
            tools: Arc::new(tools),
            leader,
            workers,
            team_description,
            max_steps: DEFAULT_MAX_STEPS,
            tool_timeout: Duration::from_secs(DEFAULT_TOOL_TIMEOUT_SECS),
        };
        // Surface routing gaps now rather than on the first task.
        blueprint.instantiate(&TelemetrySink::disabled())?;
        Ok(blueprint)
    }

    pub fn with_formatter(mut self, formatter: Arc<dyn ChatModel>) -> Self {
        self.parser = ResponseParser::new(Some(formatter));
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn leader(&self) -> &AgentProfile {
        &self.leader
    }

    pub fn workers(&self) -> &[AgentProfile] {
        &self.workers
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Fresh graph with empty memories for one task.
    pub fn instantiate(&self, telemetry: &TelemetrySink) -> Result<ConversationGraph, GraphError> {
        let deps = AgentDeps {
            model: Arc::clone(&self.model),
            parser: self.parser.clone(),
            roster: Arc::clone(&self.roster),
            tools: Arc::clone(&self.tools),
            team_description: self.team_description.clone(),
            telemetry: telemetry.clone(),
        };

        let mut builder = GraphBuilder::new(Arc::clone(&self.roster))
            .routes(Arc::clone(&self.routes))
            .entry(NodeId::Leader)
            .max_steps(self.max_steps)
            .telemetry(telemetry.clone())
            .agent(Agent::leader(self.leader.clone(), deps.clone()));
        for (index, profile) in self.workers.iter().enumerate() {
            builder = builder.agent(Agent::worker(index, profile.clone(), deps.clone()));
        }
        let executor = ToolExecutor::new(Arc::clone(&self.tools), self.parser.clone())
            .with_timeout(self.tool_timeout)
            .with_permissions(self.tool_permissions())
            .with_telemetry(telemetry.clone());
        builder.tool_executor(executor).build()
    }

    /// Agents whose profile names a tool list, keyed by node.
    pub fn tool_permissions(&self) -> BTreeMap<NodeId, BTreeSet<String>> {
        std::iter::once((NodeId::Leader, &self.leader))
            .chain(
                self.workers
                    .iter()
                    .enumerate()
                    .map(|(index, profile)| (NodeId::Worker(index), profile)),
            )
            .filter_map(|(id, profile)| {
                let names = profile.tools.as_ref()?;
                Some((id, names.iter().cloned().collect::<BTreeSet<_>>()))
            })
            .collect()
    }

    pub async fn run_task(
        &self,
        instruction: &str,
        telemetry: &TelemetrySink,
    ) -> Result<TaskResult, GraphError> {
        telemetry.emit(
            "task.started",
            json!({ "instruction_chars": instruction.chars().count() }),
        );
        let started = Instant::now();
        let graph = self.instantiate(telemetry)?;

        match graph.run(instruction).await {
            Ok(report) => {
                let answer = answer_for(&report);
                telemetry.emit(
                    "task.completed",
                    json!({
                        "outcome": report.outcome.label(),
                        "steps": report.steps,
                        "exhausted_agents": report.exhausted_agents,
                        "elapsed_ms": started.elapsed().as_millis() as u64,
                    }),
                );
                Ok(TaskResult { report, answer })
            }
            Err(err) => {
                telemetry.emit("task.failed", json!({ "error": err.to_string() }));
                Err(err)
            }
        }
    }

    /// Human-readable summary for `team show`.
    pub fn describe(&self) -> String {
        let roster = &self.roster;
        let mut out = String::new();
        out.push_str(&format!(
            "Leader: {} (capacity {})\n",
            self.leader.name, self.leader.capacity
        ));
        for worker in &self.workers {
            let tools = match &worker.tools {
                Some(names) => names.join(", "),
                None => "all".to_string(),
            };
            out.push_str(&format!(
                "Worker: {} (capacity {}, tools: {})\n",
                worker.name, worker.capacity, tools
            ));
        }
        let tool_names = self.tools.names();
        out.push_str(&format!(
            "Tools: {}\n",
            if tool_names.is_empty() {
                "(none)".to_string()
            } else {
                tool_names.join(", ")
            }
        ));
        out.push_str(&format!("Max steps: {}\n", self.max_steps));
        out.push_str("Routes:\n");
        for (node, declared, target) in self.routes.entries() {
            let target_label = match target {
                Receiver::End => "<end>".to_string(),
                other => roster.display_receiver(other),
            };
            out.push_str(&format!(
                "  {} --{}--> {}\n",
                roster.display_receiver(Receiver::Node(node)),
                roster.display_receiver(declared),
                target_label
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_structured_conclusion_from_prose() {
        let text = "Final answer: {\"conclusion\": \"Refute\", \"reason\": \"name differs\"} done";
        assert_eq!(
            extract_answer(text),
            TaskAnswer::Conclusion(Conclusion {
                conclusion: Some(Verdict::Refute),
                reason: "name differs".to_string(),
            })
        );
    }

    #[test]
    fn null_conclusion_is_kept_structured() {
        let answer = extract_answer(r#"{"conclusion": null, "reason": "budget exhausted"}"#);
        assert_eq!(answer.verdict(), None);
        assert!(matches!(answer, TaskAnswer::Conclusion(_)));
    }

    #[test]
    fn text_without_conclusion_stays_raw() {
        assert_eq!(
            extract_answer("  I could not decide.  "),
            TaskAnswer::Raw("I could not decide.".to_string())
        );
        assert!(matches!(
            extract_answer(r#"{"receiver": "FINISH", "content": "x"}"#),
            TaskAnswer::Raw(_)
        ));
    }

    #[test]
    fn default_team_uses_documented_capacities() {
        let workers = default_worker_profiles();
        assert_eq!(workers.len(), 2);
        assert!(workers.iter().all(|w| w.capacity == DEFAULT_WORKER_CAPACITY));
        assert_eq!(default_leader_profile().capacity, DEFAULT_LEADER_CAPACITY);
    }
}
