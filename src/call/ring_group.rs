/// Position in the ring group roster. Reset to 0 whenever a call ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingGroupCursor {
    pub index: usize,
}

/// Fixed ordered roster of agents used for round-robin escalation. Agent
/// availability is not checked.
#[derive(Debug, Clone, Default)]
pub struct RingGroup {
    agents: Vec<String>,
    cursor: RingGroupCursor,
}

impl RingGroup {
    pub fn new(agents: Vec<String>) -> Self {
        Self {
            agents,
            cursor: RingGroupCursor::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn cursor(&self) -> RingGroupCursor {
        self.cursor
    }

    pub fn agents(&self) -> &[String] {
        &self.agents
    }

    /// Move to the next agent, wrapping at the end of the roster.
    pub fn advance(&mut self) -> Option<&str> {
        if self.agents.is_empty() {
            return None;
        }
        self.cursor.index = (self.cursor.index + 1) % self.agents.len();
        self.agents.get(self.cursor.index).map(|s| s.as_str())
    }

    pub fn reset(&mut self) {
        self.cursor = RingGroupCursor::default();
    }
}
