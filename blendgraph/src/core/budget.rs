//! Step budget for a single graph invocation.

/// Counts node executions against a hard ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepBudget {
    limit: u32,
    taken: u32,
}

impl StepBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, taken: 0 }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn taken(&self) -> u32 {
        self.taken
    }

    /// Consume one step. Returns `false` once the ceiling is reached.
    pub fn try_take(&mut self) -> bool {
        if self.taken >= self.limit {
            return false;
        }
        self.taken += 1;
        true
    }
}
