use std::collections::BTreeSet;

use crate::error::GraphError;
use crate::message::{NodeId, Receiver, Sender};

pub const DEFAULT_LEADER_LABEL: &str = "team_leader";
pub const DEFAULT_TOOL_EXECUTOR_LABEL: &str = "call_tool";
pub const DEFAULT_END_LABEL: &str = "FINISH";
pub const EXTERNAL_SENDER_LABEL: &str = "user";

/// Receiver labels for one team, as the model is told to write them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    leader: String,
    workers: Vec<String>,
    tool_executor: String,
    end: String,
}

impl Roster {
    pub fn new(
        leader: impl Into<String>,
        workers: Vec<String>,
        tool_executor: impl Into<String>,
        end: impl Into<String>,
    ) -> Result<Self, GraphError> {
        let roster = Self {
            leader: leader.into().trim().to_string(),
            workers: workers.into_iter().map(|w| w.trim().to_string()).collect(),
            tool_executor: tool_executor.into().trim().to_string(),
            end: end.into().trim().to_string(),
        };
        roster.validate()?;
        Ok(roster)
    }

    pub fn with_workers(workers: Vec<String>) -> Result<Self, GraphError> {
        Self::new(
            DEFAULT_LEADER_LABEL,
            workers,
            DEFAULT_TOOL_EXECUTOR_LABEL,
            DEFAULT_END_LABEL,
        )
    }

    fn validate(&self) -> Result<(), GraphError> {
        let mut seen = BTreeSet::new();
        for label in self.all_labels() {
            if label.is_empty() {
                return Err(GraphError::Config("roster labels cannot be empty".to_string()));
            }
            if !seen.insert(label.to_ascii_lowercase()) {
                return Err(GraphError::Config(format!(
                    "roster label '{label}' is used more than once"
                )));
            }
        }
        Ok(())
    }

    fn all_labels(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.leader.as_str())
            .chain(self.workers.iter().map(String::as_str))
            .chain([self.tool_executor.as_str(), self.end.as_str()])
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn agent_ids(&self) -> Vec<NodeId> {
        std::iter::once(NodeId::Leader)
            .chain((0..self.workers.len()).map(NodeId::Worker))
            .collect()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids = self.agent_ids();
        ids.push(NodeId::ToolExecutor);
        ids
    }

    pub fn contains(&self, id: NodeId) -> bool {
        match id {
            NodeId::Worker(index) => index < self.workers.len(),
            NodeId::Leader | NodeId::ToolExecutor => true,
        }
    }

    pub fn leader_label(&self) -> &str {
        &self.leader
    }

    pub fn tool_executor_label(&self) -> &str {
        &self.tool_executor
    }

    pub fn end_label(&self) -> &str {
        &self.end
    }

    /// `None` for a worker index outside this roster.
    pub fn node_label(&self, id: NodeId) -> Option<&str> {
        match id {
            NodeId::Leader => Some(&self.leader),
            NodeId::ToolExecutor => Some(&self.tool_executor),
            NodeId::Worker(index) => self.workers.get(index).map(String::as_str),
        }
    }

    pub fn label(&self, receiver: Receiver) -> Option<&str> {
        match receiver {
            Receiver::End => Some(&self.end),
            Receiver::Node(id) => self.node_label(id),
        }
    }

    pub fn sender_label(&self, sender: Sender) -> Option<&str> {
        match sender {
            Sender::External => Some(EXTERNAL_SENDER_LABEL),
            Sender::Node(id) => self.node_label(id),
        }
    }

    /// Label for transcripts and prompts. Ids outside the roster render as
    /// `<unknown Worker(n)>` rather than borrowing a real name.
    pub fn display_receiver(&self, receiver: Receiver) -> String {
        match self.label(receiver) {
            Some(label) => label.to_string(),
            None => format!("<unknown {receiver:?}>"),
        }
    }

    pub fn display_sender(&self, sender: Sender) -> String {
        match self.sender_label(sender) {
            Some(label) => label.to_string(),
            None => format!("<unknown {sender:?}>"),
        }
    }

    /// Resolve a label written by the model. Comparison ignores case and
    /// surrounding whitespace.
    pub fn resolve(&self, label: &str) -> Option<Receiver> {
        let wanted = label.trim();
        let same = |candidate: &str| candidate.eq_ignore_ascii_case(wanted);

        if same(&self.end) {
            return Some(Receiver::End);
        }
        if same(&self.leader) {
            return Some(Receiver::Node(NodeId::Leader));
        }
        if same(&self.tool_executor) {
            return Some(Receiver::Node(NodeId::ToolExecutor));
        }
        self.workers
            .iter()
            .position(|w| same(w))
            .map(|index| Receiver::Node(NodeId::Worker(index)))
    }

    /// Receivers a node may legitimately produce.
    pub fn possible_receivers(&self, node: NodeId) -> BTreeSet<Receiver> {
        let agents = self.agent_ids().into_iter().map(Receiver::Node);
        match node {
            NodeId::Leader => agents
                .chain([Receiver::Node(NodeId::ToolExecutor), Receiver::End])
                .collect(),
            NodeId::Worker(_) => agents
                .chain(std::iter::once(Receiver::Node(NodeId::ToolExecutor)))
                .collect(),
            NodeId::ToolExecutor => agents.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roster() -> Roster {
        Roster::with_workers(vec!["kg_agent".to_string(), "validation_agent".to_string()])
            .unwrap()
    }

    #[test]
    fn resolves_labels_case_insensitively() {
        let roster = roster();
        assert_eq!(roster.resolve(" KG_Agent "), Some(Receiver::Node(NodeId::Worker(0))));
        assert_eq!(roster.resolve("finish"), Some(Receiver::End));
        assert_eq!(roster.resolve("call_tool"), Some(Receiver::Node(NodeId::ToolExecutor)));
        assert_eq!(roster.resolve("someone_else"), None);
    }

    #[test]
    fn workers_cannot_address_end() {
        let roster = roster();
        assert!(!roster.possible_receivers(NodeId::Worker(1)).contains(&Receiver::End));
        assert!(roster.possible_receivers(NodeId::Leader).contains(&Receiver::End));
        assert!(
            !roster
                .possible_receivers(NodeId::ToolExecutor)
                .contains(&Receiver::Node(NodeId::ToolExecutor))
        );
    }

    #[test]
    fn out_of_range_worker_has_no_label() {
        let roster = roster();
        assert_eq!(roster.node_label(NodeId::Worker(1)), Some("validation_agent"));
        assert_eq!(roster.node_label(NodeId::Worker(2)), None);
        assert!(!roster.contains(NodeId::Worker(2)));
        assert_eq!(roster.label(Receiver::Node(NodeId::Worker(7))), None);
        assert_eq!(
            roster.display_receiver(Receiver::Node(NodeId::Worker(7))),
            "<unknown Node(Worker(7))>"
        );
        assert_eq!(roster.display_sender(Sender::External), "user");
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let err = Roster::with_workers(vec!["a".to_string(), "A".to_string()]).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }
}
