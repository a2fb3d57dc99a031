//! Terminal outcome of a run

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::session::RunStatus;

/// How a call to [`Orchestrator::advance`](super::Orchestrator::advance) ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnOutcome {
    /// The model called `respond`
    Responded { payload: Value },
    /// The model called `end`
    Ended {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    /// Plain assistant message with no tool calls
    Replied { text: String },
    /// The pass ceiling was reached
    GuardrailTripped { passes: u32, limit: u32 },
    /// Unrecoverable provider or action error
    Fatal {
        error: String,
        /// Streamed text received before the failure
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partial: Option<String>,
    },
    /// Aborted from outside
    Cancelled,
}

impl TurnOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            TurnOutcome::Responded { .. } => RunStatus::Responded,
            TurnOutcome::Ended { .. } => RunStatus::Ended,
            TurnOutcome::Replied { .. } => RunStatus::Replied,
            TurnOutcome::GuardrailTripped { .. } => RunStatus::GuardrailTripped,
            TurnOutcome::Fatal { .. } => RunStatus::Fatal,
            TurnOutcome::Cancelled => RunStatus::Cancelled,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, TurnOutcome::Fatal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_serialized_form_carries_status() {
        let outcome = TurnOutcome::GuardrailTripped { passes: 3, limit: 3 };
        assert_eq!(
            serde_json::to_value(&outcome).unwrap(),
            json!({"status": "guardrail_tripped", "passes": 3, "limit": 3})
        );
        assert_eq!(outcome.status(), RunStatus::GuardrailTripped);

        let parsed: TurnOutcome = serde_json::from_value(json!({"status": "ended"})).unwrap();
        assert_eq!(parsed, TurnOutcome::Ended { message: None });
    }
}
