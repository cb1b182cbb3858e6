use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use crate::agent::{Agent, ReplyKind};
use crate::error::GraphError;
use crate::message::{ConversationState, Message, NodeId, NodeUpdate, Receiver};
use crate::roster::Roster;
use crate::telemetry::TelemetrySink;
use crate::tools::ToolExecutor;

pub const DEFAULT_MAX_STEPS: usize = 50;

/// node -> declared receiver -> next hop. Built once, never mutated while a
/// graph runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    routes: BTreeMap<NodeId, BTreeMap<Receiver, Receiver>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every declared receiver routes to itself; `End` routes to the sink.
    pub fn identity(roster: &Roster) -> Self {
        let mut table = Self::new();
        for node in roster.node_ids() {
            for receiver in roster.possible_receivers(node) {
                table.insert(node, receiver, receiver);
            }
        }
        table
    }

    pub fn insert(&mut self, node: NodeId, declared: Receiver, target: Receiver) {
        self.routes.entry(node).or_default().insert(declared, target);
    }

    pub fn remove(&mut self, node: NodeId, declared: Receiver) -> Option<Receiver> {
        self.routes.get_mut(&node)?.remove(&declared)
    }

    pub fn resolve(&self, node: NodeId, declared: Receiver) -> Option<Receiver> {
        self.routes.get(&node)?.get(&declared).copied()
    }

    pub fn entries(&self) -> impl Iterator<Item = (NodeId, Receiver, Receiver)> + '_ {
        self.routes.iter().flat_map(|(node, edges)| {
            edges
                .iter()
                .map(move |(declared, target)| (*node, *declared, *target))
        })
    }
}

pub enum GraphNode {
    Agent(Box<Agent>),
    ToolExecutor(ToolExecutor),
}

impl GraphNode {
    fn declared_receivers(&self, roster: &Roster) -> BTreeSet<Receiver> {
        match self {
            GraphNode::Agent(agent) => agent.allowed_receivers().clone(),
            GraphNode::ToolExecutor(_) => roster.possible_receivers(NodeId::ToolExecutor),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// The leader addressed the terminal sink.
    Completed,
    /// The conversation ended because an agent's memory budget ran out.
    BudgetExhausted { agent: String },
    /// The message that reached the sink was an agent's give-up reply after
    /// it failed to produce a routable answer.
    Fallback { agent: String },
    /// The graph-level step ceiling stopped the run.
    StepLimitReached { max_steps: usize },
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::BudgetExhausted { .. } => "budget_exhausted",
            RunOutcome::Fallback { .. } => "fallback",
            RunOutcome::StepLimitReached { .. } => "step_limit_reached",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// Node invocations performed.
    pub steps: usize,
    pub transcript: Vec<Message>,
    /// Agents that answered with their budget message at least once.
    pub exhausted_agents: Vec<String>,
}

impl RunReport {
    /// Content of the message that reached the terminal sink.
    pub fn final_text(&self) -> Option<&str> {
        match self.outcome {
            RunOutcome::StepLimitReached { .. } => None,
            _ => self
                .transcript
                .last()
                .filter(|m| m.receiver == Receiver::End)
                .map(|m| m.content.as_str()),
        }
    }
}

pub struct GraphBuilder {
    roster: Arc<Roster>,
    nodes: BTreeMap<NodeId, GraphNode>,
    routes: Option<Arc<RoutingTable>>,
    entry: NodeId,
    max_steps: usize,
    telemetry: TelemetrySink,
}

impl GraphBuilder {
    pub fn new(roster: Arc<Roster>) -> Self {
        Self {
            roster,
            nodes: BTreeMap::new(),
            routes: None,
            entry: NodeId::Leader,
            max_steps: DEFAULT_MAX_STEPS,
            telemetry: TelemetrySink::disabled(),
        }
    }

    pub fn agent(mut self, agent: Agent) -> Self {
        self.nodes
            .insert(agent.id(), GraphNode::Agent(Box::new(agent)));
        self
    }

    pub fn tool_executor(mut self, executor: ToolExecutor) -> Self {
        self.nodes
            .insert(NodeId::ToolExecutor, GraphNode::ToolExecutor(executor));
        self
    }

    /// Defaults to `RoutingTable::identity` over the roster. Pass an `Arc` to
    /// share one table across task instances.
    pub fn routes(mut self, routes: impl Into<Arc<RoutingTable>>) -> Self {
        self.routes = Some(routes.into());
        self
    }

    pub fn entry(mut self, entry: NodeId) -> Self {
        self.entry = entry;
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn telemetry(mut self, telemetry: TelemetrySink) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// Check that every receiver every node can declare has a route to a
    /// registered node or the sink.
    pub fn build(self) -> Result<ConversationGraph, GraphError> {
        if self.max_steps == 0 {
            return Err(GraphError::Config("max_steps must be at least 1".to_string()));
        }
        if !self.nodes.contains_key(&self.entry) {
            return Err(GraphError::MissingNode(self.entry));
        }
        if let Some(stray) = self.nodes.keys().find(|id| !self.roster.contains(**id)) {
            return Err(GraphError::NotInRoster(*stray));
        }

        let routes = self
            .routes
            .unwrap_or_else(|| Arc::new(RoutingTable::identity(&self.roster)));

        for (node_id, node) in &self.nodes {
            for receiver in node.declared_receivers(&self.roster) {
                match routes.resolve(*node_id, receiver) {
                    None => {
                        return Err(GraphError::MissingRoute {
                            node: *node_id,
                            receiver,
                        });
                    }
                    Some(Receiver::Node(target)) if !self.nodes.contains_key(&target) => {
                        return Err(GraphError::UnknownTarget {
                            node: *node_id,
                            receiver,
                            target,
                        });
                    }
                    Some(_) => {}
                }
            }
        }

        Ok(ConversationGraph {
            roster: self.roster,
            nodes: self.nodes,
            routes,
            entry: self.entry,
            max_steps: self.max_steps,
            telemetry: self.telemetry,
        })
    }
}

/// One task instance: owns its agents (and their memories) for one run.
pub struct ConversationGraph {
    roster: Arc<Roster>,
    nodes: BTreeMap<NodeId, GraphNode>,
    routes: Arc<RoutingTable>,
    entry: NodeId,
    max_steps: usize,
    telemetry: TelemetrySink,
}

impl std::fmt::Debug for ConversationGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationGraph")
            .field("nodes", &self.nodes.keys().collect::<Vec<_>>())
            .field("entry", &self.entry)
            .field("max_steps", &self.max_steps)
            .finish()
    }
}

impl ConversationGraph {
    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    /// Drive the conversation until the sink is reached or the step ceiling
    /// stops it. The graph is consumed: memories live for one task only.
    pub async fn run(mut self, instruction: &str) -> Result<RunReport, GraphError> {
        let mut state = ConversationState::seed(instruction, self.entry);
        let mut steps = 0usize;
        let mut exhausted_agents = Vec::<String>::new();
        // How the run ends if the latest reply is the one that reaches the sink.
        let mut degraded_end: Option<RunOutcome> = None;

        loop {
            let current = match state.receiver().unwrap_or(Receiver::End) {
                Receiver::End => {
                    let outcome = degraded_end.unwrap_or(RunOutcome::Completed);
                    return Ok(self.report(state, steps, outcome, exhausted_agents));
                }
                Receiver::Node(id) => id,
            };

            if steps >= self.max_steps {
                tracing::warn!(max_steps = self.max_steps, "step ceiling reached");
                let outcome = RunOutcome::StepLimitReached {
                    max_steps: self.max_steps,
                };
                return Ok(self.report(state, steps, outcome, exhausted_agents));
            }

            let label = self
                .roster
                .node_label(current)
                .ok_or(GraphError::NotInRoster(current))?
                .to_string();
            let node = self
                .nodes
                .get_mut(&current)
                .ok_or(GraphError::MissingNode(current))?;
            steps += 1;
            tracing::debug!(step = steps, node = %label, "invoking node");
            self.telemetry
                .emit("node.invoked", json!({ "step": steps, "node": label }));

            let update = match node {
                GraphNode::Agent(agent) => {
                    let inbound = state.last().cloned().ok_or_else(|| {
                        GraphError::Config("conversation has no messages".to_string())
                    })?;
                    let reply = agent.handle(&inbound).await;
                    degraded_end = match reply.kind {
                        ReplyKind::Routed => None,
                        ReplyKind::Fallback => Some(RunOutcome::Fallback {
                            agent: label.clone(),
                        }),
                        ReplyKind::BudgetExhausted => {
                            if !exhausted_agents.contains(&label) {
                                exhausted_agents.push(label.clone());
                            }
                            Some(RunOutcome::BudgetExhausted {
                                agent: label.clone(),
                            })
                        }
                    };
                    reply.update
                }
                GraphNode::ToolExecutor(executor) => {
                    degraded_end = None;
                    executor.handle(&state).await?
                }
            };

            let declared = update.receiver;
            let next = self
                .routes
                .resolve(current, declared)
                .ok_or(GraphError::Unroutable {
                    node: current,
                    receiver: declared,
                })?;
            state = state.apply(NodeUpdate {
                receiver: next,
                ..update
            });
        }
    }

    fn report(
        &self,
        state: ConversationState,
        steps: usize,
        outcome: RunOutcome,
        exhausted_agents: Vec<String>,
    ) -> RunReport {
        tracing::info!(outcome = outcome.label(), steps, "conversation finished");
        RunReport {
            outcome,
            steps,
            transcript: state.into_messages(),
            exhausted_agents,
        }
    }
}
