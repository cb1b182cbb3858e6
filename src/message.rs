use serde::{Deserialize, Serialize};

/// Closed set of graph nodes. Workers are addressed by their position in the
/// team's worker list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    Leader,
    Worker(usize),
    ToolExecutor,
}

impl NodeId {
    pub fn is_agent(self) -> bool {
        !matches!(self, NodeId::ToolExecutor)
    }
}

/// Declared next participant of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Receiver {
    Node(NodeId),
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    External,
    Node(NodeId),
}

impl Sender {
    pub fn node(self) -> Option<NodeId> {
        match self {
            Sender::External => None,
            Sender::Node(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Human,
    Ai,
}

/// Immutable unit of conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub sender: Sender,
    pub receiver: Receiver,
    pub content: String,
}

impl Message {
    pub fn human(content: impl Into<String>, receiver: Receiver) -> Self {
        Self {
            role: Role::Human,
            sender: Sender::External,
            receiver,
            content: content.into(),
        }
    }

    pub fn ai(from: NodeId, receiver: Receiver, content: impl Into<String>) -> Self {
        Self {
            role: Role::Ai,
            sender: Sender::Node(from),
            receiver,
            content: content.into(),
        }
    }
}

/// Partial update a node hands back to the run loop: one new message plus the
/// overwritten sender/receiver scalars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeUpdate {
    pub message: Message,
    pub sender: NodeId,
    pub receiver: Receiver,
}

impl NodeUpdate {
    /// Only graph nodes produce updates, so the sender is always a node.
    pub fn new(from: NodeId, receiver: Receiver, content: impl Into<String>) -> Self {
        Self {
            message: Message::ai(from, receiver, content),
            sender: from,
            receiver,
        }
    }
}

/// State threaded through the graph. Messages are only ever appended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationState {
    messages: Vec<Message>,
    sender: Option<NodeId>,
    receiver: Option<Receiver>,
}

impl ConversationState {
    pub fn seed(instruction: impl Into<String>, entry: NodeId) -> Self {
        let message = Message::human(instruction, Receiver::Node(entry));
        Self {
            receiver: Some(message.receiver),
            messages: vec![message],
            sender: None,
        }
    }

    /// Merge a node update, consuming the previous state.
    pub fn apply(mut self, update: NodeUpdate) -> Self {
        self.messages.push(update.message);
        self.sender = Some(update.sender);
        self.receiver = Some(update.receiver);
        self
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Node that produced the most recent update; `None` right after seeding.
    pub fn sender(&self) -> Option<NodeId> {
        self.sender
    }

    pub fn receiver(&self) -> Option<Receiver> {
        self.receiver
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_appends_and_overwrites_scalars() {
        let state = ConversationState::seed("check it", NodeId::Leader);
        assert_eq!(state.receiver(), Some(Receiver::Node(NodeId::Leader)));
        assert_eq!(state.sender(), None);

        let update = NodeUpdate::new(
            NodeId::Leader,
            Receiver::Node(NodeId::Worker(0)),
            "kg_agent, look it up",
        );
        let state = state.apply(update);

        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[0].role, Role::Human);
        assert_eq!(state.sender(), Some(NodeId::Leader));
        assert_eq!(state.receiver(), Some(Receiver::Node(NodeId::Worker(0))));
    }

    #[test]
    fn update_sender_matches_the_producing_node() {
        let update = NodeUpdate::new(
            NodeId::ToolExecutor,
            Receiver::Node(NodeId::Worker(1)),
            "name=SCART1",
        );
        assert_eq!(update.sender, NodeId::ToolExecutor);
        assert_eq!(update.message.sender, Sender::Node(NodeId::ToolExecutor));
        assert_eq!(update.message.role, Role::Ai);
        assert_eq!(update.message.receiver, update.receiver);

        let state = ConversationState::seed("check it", NodeId::Leader).apply(update);
        assert_eq!(state.sender(), Some(NodeId::ToolExecutor));
    }
}
