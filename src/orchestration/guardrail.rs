//! Pass-count guardrail

/// Result of a guardrail check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailCheck {
    /// The pass may run; carries its 1-based number
    Ok { pass: u32 },
    /// The ceiling was reached; no further pass may run
    Tripped { passes: u32, limit: u32 },
}

impl GuardrailCheck {
    pub fn is_tripped(&self) -> bool {
        matches!(self, GuardrailCheck::Tripped { .. })
    }
}

/// Per-run pass counter. Monotonic; once tripped it stays tripped.
#[derive(Debug, Clone)]
pub struct GuardrailCounter {
    limit: u32,
    passes: u32,
}

impl GuardrailCounter {
    pub fn new(limit: u32) -> Self {
        Self { limit, passes: 0 }
    }

    /// Count one more pass, or report that the ceiling is reached
    pub fn check_and_increment(&mut self) -> GuardrailCheck {
        if self.passes >= self.limit {
            return GuardrailCheck::Tripped {
                passes: self.passes,
                limit: self.limit,
            };
        }
        self.passes += 1;
        GuardrailCheck::Ok { pass: self.passes }
    }

    pub fn passes(&self) -> u32 {
        self.passes
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.passes)
    }
}
