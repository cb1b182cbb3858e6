use std::collections::BTreeSet;
use std::sync::Arc;

use serde_json::json;

use crate::memory::BudgetedMemory;
use crate::message::{Message, NodeId, NodeUpdate, Receiver, Sender};
use crate::model::{ChatMessage, ChatModel};
use crate::parser::ResponseParser;
use crate::prompts::{
    LEADER_CHAT_TEMPLATE, LEADER_PLAN_TEMPLATE, WORKER_CHAT_TEMPLATE, WORKER_PLAN_TEMPLATE,
    render_template,
};
use crate::roster::Roster;
use crate::telemetry::TelemetrySink;
use crate::tools::ToolRegistry;

pub const MAX_REPLY_ATTEMPTS: usize = 3;

pub const WORKER_BUDGET_MESSAGE: &str =
    "I'm sorry, but I have exceeded my budget, so I can no longer provide services.";
pub const LEADER_BUDGET_CONCLUSION: &str =
    r#"{"conclusion": null, "reason": "budget exhausted"}"#;
pub const PLAN_REPLAY_PREFIX: &str = "My plan for this task:\n";
pub const FALLBACK_MESSAGE: &str = "I'm sorry, I'm facing some difficulties and cannot respond \
to you at the moment. You can come back to ask me later.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Leader,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentPhase {
    /// No task received yet.
    Fresh,
    /// Synthesizing the one-shot plan for the first assignment.
    Planning,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentProfile {
    pub name: String,
    pub role_description: String,
    pub task_description: String,
    /// Tools this agent may call; the executor refuses any other. `None`
    /// means every registered tool.
    pub tools: Option<Vec<String>>,
    pub capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    Routed,
    Fallback,
    BudgetExhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub update: NodeUpdate,
    pub kind: ReplyKind,
}

/// Everything an agent borrows from its team rather than owning.
#[derive(Clone)]
pub struct AgentDeps {
    pub model: Arc<dyn ChatModel>,
    pub parser: ResponseParser,
    pub roster: Arc<Roster>,
    pub tools: Arc<ToolRegistry>,
    pub team_description: String,
    pub telemetry: TelemetrySink,
}

pub struct Agent {
    id: NodeId,
    role: AgentRole,
    profile: AgentProfile,
    memory: BudgetedMemory,
    phase: AgentPhase,
    allowed: BTreeSet<Receiver>,
    tool_description: String,
    /// Memory position of the plan, if planning succeeded.
    plan_entry: Option<usize>,
    deps: AgentDeps,
}

impl Agent {
    pub fn leader(profile: AgentProfile, deps: AgentDeps) -> Self {
        Self::build(NodeId::Leader, AgentRole::Leader, profile, deps)
    }

    pub fn worker(index: usize, profile: AgentProfile, deps: AgentDeps) -> Self {
        Self::build(NodeId::Worker(index), AgentRole::Worker, profile, deps)
    }

    fn build(id: NodeId, role: AgentRole, profile: AgentProfile, deps: AgentDeps) -> Self {
        let allowed = deps.roster.possible_receivers(id);
        let tool_description = deps.tools.describe(profile.tools.as_deref());
        Self {
            id,
            role,
            memory: BudgetedMemory::new(profile.capacity),
            profile,
            phase: AgentPhase::Fresh,
            allowed,
            tool_description,
            plan_entry: None,
            deps,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn phase(&self) -> AgentPhase {
        self.phase
    }

    pub fn memory(&self) -> &BudgetedMemory {
        &self.memory
    }

    /// Receivers this agent may declare; anything else is a parse failure.
    pub fn allowed_receivers(&self) -> &BTreeSet<Receiver> {
        &self.allowed
    }

    /// Take one turn: record the inbound message, plan on the first
    /// assignment, then produce exactly one routed outbound message.
    pub async fn handle(&mut self, inbound: &Message) -> AgentReply {
        if self.memory.append(inbound.clone()).is_err() {
            return self.budget_exhausted();
        }
        let needed = match self.phase {
            AgentPhase::Fresh => 2,
            _ => 1,
        };
        if self.memory.remaining() < needed {
            return self.budget_exhausted();
        }

        if self.phase == AgentPhase::Fresh {
            self.phase = AgentPhase::Planning;
            self.plan(inbound).await;
            self.phase = AgentPhase::Active;
        }

        let history = self.chat_history();
        for attempt in 1..=MAX_REPLY_ATTEMPTS {
            let raw = match self.deps.model.complete(&history).await {
                Ok(raw) => raw,
                Err(err) => {
                    tracing::info!(
                        agent = %self.profile.name,
                        attempt,
                        error = %err,
                        "reply generation failed"
                    );
                    continue;
                }
            };

            match self
                .deps
                .parser
                .parse_route(&raw, &self.deps.roster, &self.allowed)
                .await
            {
                Ok(reply) => {
                    let update = NodeUpdate::new(self.id, reply.receiver, reply.content);
                    return self.accept(update, ReplyKind::Routed);
                }
                Err(err) => {
                    tracing::info!(
                        agent = %self.profile.name,
                        attempt,
                        max_attempts = MAX_REPLY_ATTEMPTS,
                        error = %err,
                        "failed to parse reply"
                    );
                    self.deps.telemetry.emit(
                        "agent.parse_failed",
                        json!({
                            "agent": self.profile.name,
                            "attempt": attempt,
                            "error": err.to_string(),
                        }),
                    );
                }
            }
        }

        let receiver = inbound.sender.node().map_or(Receiver::End, Receiver::Node);
        tracing::warn!(agent = %self.profile.name, "giving up after {MAX_REPLY_ATTEMPTS} attempts");
        let update = NodeUpdate::new(self.id, receiver, FALLBACK_MESSAGE);
        self.accept(update, ReplyKind::Fallback)
    }

    fn accept(&mut self, update: NodeUpdate, kind: ReplyKind) -> AgentReply {
        // Room for this entry was reserved before the model was called.
        let _ = self.memory.append(update.message.clone());
        AgentReply { update, kind }
    }

    fn budget_exhausted(&self) -> AgentReply {
        tracing::info!(
            agent = %self.profile.name,
            capacity = self.memory.capacity(),
            "agent has run out of its chat round budget"
        );
        self.deps.telemetry.emit(
            "agent.budget_exhausted",
            json!({ "agent": self.profile.name, "capacity": self.memory.capacity() }),
        );
        let update = match self.role {
            AgentRole::Leader => NodeUpdate::new(self.id, Receiver::End, LEADER_BUDGET_CONCLUSION),
            AgentRole::Worker => NodeUpdate::new(
                self.id,
                Receiver::Node(NodeId::Leader),
                WORKER_BUDGET_MESSAGE,
            ),
        };
        AgentReply {
            update,
            kind: ReplyKind::BudgetExhausted,
        }
    }

    async fn plan(&mut self, assignment: &Message) {
        let roster = &self.deps.roster;
        let prompt = match self.role {
            AgentRole::Leader => render_template(
                LEADER_PLAN_TEMPLATE,
                &[
                    ("role_description", self.profile.role_description.as_str()),
                    ("task_description", self.profile.task_description.as_str()),
                    ("team_description", self.deps.team_description.as_str()),
                    ("user_input", assignment.content.as_str()),
                ],
            ),
            AgentRole::Worker => render_template(
                WORKER_PLAN_TEMPLATE,
                &[
                    ("role_description", self.profile.role_description.as_str()),
                    ("task_description", self.profile.task_description.as_str()),
                    ("tool_executor", roster.tool_executor_label()),
                    ("tool_description", self.tool_description.as_str()),
                    ("user_input", assignment.content.as_str()),
                ],
            ),
        };

        match self.deps.model.complete(&[ChatMessage::user(prompt)]).await {
            Ok(plan) => {
                tracing::debug!(agent = %self.profile.name, "plan ready");
                let entry = Message::ai(self.id, Receiver::Node(self.id), plan.trim());
                let position = self.memory.size();
                if self.memory.append(entry).is_ok() {
                    self.plan_entry = Some(position);
                }
            }
            Err(err) => {
                tracing::info!(
                    agent = %self.profile.name,
                    error = %err,
                    "failed to make a plan for the upcoming work"
                );
            }
        }
    }

    fn system_prompt(&self) -> String {
        let roster = &self.deps.roster;
        let receivers = self
            .allowed
            .iter()
            .filter_map(|r| roster.label(*r))
            .collect::<Vec<_>>()
            .join(", ");
        let template = match self.role {
            AgentRole::Leader => LEADER_CHAT_TEMPLATE,
            AgentRole::Worker => WORKER_CHAT_TEMPLATE,
        };
        render_template(
            template,
            &[
                ("role_description", self.profile.role_description.as_str()),
                ("team_description", self.deps.team_description.as_str()),
                ("tool_description", self.tool_description.as_str()),
                ("receivers", receivers.as_str()),
                ("tool_executor", roster.tool_executor_label()),
                ("leader", roster.leader_label()),
                ("end", roster.end_label()),
            ],
        )
    }

    /// System prompt followed by the memory snapshot. The agent's own routed
    /// entries are replayed as the JSON it is expected to produce; the plan is
    /// a note to itself, not a routed message.
    fn chat_history(&self) -> Vec<ChatMessage> {
        let roster = &self.deps.roster;
        let mut messages = Vec::with_capacity(self.memory.size() + 1);
        messages.push(ChatMessage::system(self.system_prompt()));
        for (position, entry) in self.memory.snapshot().iter().enumerate() {
            if self.plan_entry == Some(position) {
                messages.push(ChatMessage::assistant(format!(
                    "{PLAN_REPLAY_PREFIX}{}",
                    entry.content
                )));
            } else if entry.sender == Sender::Node(self.id) {
                let replay = json!({
                    "receiver": roster.display_receiver(entry.receiver),
                    "content": entry.content,
                });
                messages.push(ChatMessage::assistant(replay.to_string()));
            } else {
                messages.push(ChatMessage::user(format!(
                    "{}: {}",
                    roster.display_sender(entry.sender),
                    entry.content
                )));
            }
        }
        messages
    }
}
