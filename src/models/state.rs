//! Agent readiness classification reported by a state detector.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// Classified activity of the agent inside a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// Finished its work and ready for a prompt.
    Idle,
    /// Working on something.
    Busy,
    /// Blocked on a question to the operator.
    WaitingInput,
    /// Showing an error.
    Error,
    /// Output did not match any known shape.
    #[default]
    Unknown,
}

impl AgentState {
    /// Whether a new prompt may be delivered.
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Self::Idle | Self::WaitingInput)
    }
}

impl Display for AgentState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::WaitingInput => "waiting_input",
            Self::Error => "error",
            Self::Unknown => "unknown",
        })
    }
}

/// Raw detector output for one sample of session output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub struct DetectedState {
    /// Primary status.
    pub status: AgentState,
    /// The agent is prompting for input.
    pub is_waiting: bool,
    /// Error output was seen.
    pub has_error: bool,
}

impl DetectedState {
    /// Detected state with no flags set.
    #[must_use]
    pub fn of(status: AgentState) -> Self {
        Self {
            status,
            is_waiting: false,
            has_error: false,
        }
    }

    /// Fold the flags into a single classification. The waiting flag
    /// takes precedence over the error flag.
    #[must_use]
    pub fn classification(&self) -> AgentState {
        if self.is_waiting {
            AgentState::WaitingInput
        } else if self.has_error {
            AgentState::Error
        } else {
            self.status
        }
    }
}
