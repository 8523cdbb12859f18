use serde::{Deserialize, Serialize};

/// Position of an execution surface in its lifecycle.
///
/// ```text
/// idle ──start──▶ preparing ──▶ initiating ──▶ waiting ──response:start──▶ receiving
///                                                                           │  ▲ chunk
///                                                                           ▼──┘
/// completed ◀──────────────────────response:complete────────────────────────┘
/// completed ──follow-up──▶ receiving        completed ──end──▶ waiting
/// any in-flight stage ──response:error / cancel──▶ idle
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStage {
    #[default]
    Idle,
    Preparing,
    Initiating,
    Waiting,
    Receiving,
    Completed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid stage transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: ExecutionStage,
    pub to: ExecutionStage,
}

impl ExecutionStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Preparing => "preparing",
            Self::Initiating => "initiating",
            Self::Waiting => "waiting",
            Self::Receiving => "receiving",
            Self::Completed => "completed",
        }
    }

    /// A turn is outstanding: something was (or is about to be) sent and no terminal event arrived.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            Self::Preparing | Self::Initiating | Self::Waiting | Self::Receiving
        )
    }

    /// Nothing outstanding; a caller waiting on the surface can resume.
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Idle | Self::Completed)
    }

    /// Whether a fresh `start` may begin from this stage.
    pub fn accepts_start(self) -> bool {
        self.is_settled()
    }

    pub fn can_transition_to(self, to: Self) -> bool {
        use ExecutionStage::{Completed, Idle, Initiating, Preparing, Receiving, Waiting};
        match (self, to) {
            (Idle | Completed, Preparing) => true,
            (Preparing, Initiating) => true,
            (Initiating, Waiting) => true,
            (Waiting | Receiving, Receiving) => true,
            // A terminal event may arrive without any response:start when the server skips it.
            (Waiting | Receiving, Completed) => true,
            // Continuations skip the local preparation steps.
            (Idle | Completed, Receiving | Waiting) => true,
            (Preparing | Initiating | Waiting | Receiving | Completed, Idle) => true,
            (Idle, Idle)
            | (Idle | Completed, Initiating | Completed)
            | (Preparing, Preparing | Waiting | Receiving | Completed)
            | (Initiating, Preparing | Initiating | Receiving | Completed)
            | (Waiting, Preparing | Initiating | Waiting)
            | (Receiving, Preparing | Initiating | Waiting) => false,
        }
    }

    pub fn transition(self, to: Self) -> Result<Self, InvalidTransition> {
        if self.can_transition_to(to) {
            Ok(to)
        } else {
            Err(InvalidTransition { from: self, to })
        }
    }
}

impl std::fmt::Display for ExecutionStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
