use crate::error::MemoryFull;
use crate::message::Message;

/// Append-only conversation history owned by one agent.
///
/// The capacity is a hard ceiling with no eviction: once it is reached the
/// owning agent stops taking normal turns. A sliding window that drops the
/// oldest turns would be the alternative policy; it is not implemented.
#[derive(Debug, Clone)]
pub struct BudgetedMemory {
    entries: Vec<Message>,
    capacity: usize,
}

impl BudgetedMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity.min(64)),
            capacity,
        }
    }

    pub fn append(&mut self, message: Message) -> Result<(), MemoryFull> {
        if self.is_full() {
            return Err(MemoryFull {
                capacity: self.capacity,
            });
        }
        self.entries.push(message);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.entries.len())
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn snapshot(&self) -> &[Message] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{NodeId, Receiver};

    fn msg(text: &str) -> Message {
        Message::human(text, Receiver::Node(NodeId::Leader))
    }

    #[test]
    fn fills_at_capacity_and_refuses_more() {
        let mut memory = BudgetedMemory::new(3);
        for i in 0..3 {
            assert!(!memory.is_full());
            memory.append(msg(&format!("turn {i}"))).unwrap();
        }
        assert!(memory.is_full());
        assert_eq!(memory.remaining(), 0);
        assert_eq!(memory.append(msg("one more")), Err(MemoryFull { capacity: 3 }));
        assert_eq!(memory.size(), 3);
        assert_eq!(memory.snapshot()[2].content, "turn 2");
    }

    #[test]
    fn zero_capacity_is_full_from_the_start() {
        let memory = BudgetedMemory::new(0);
        assert!(memory.is_full());
    }
}
