use serde::{Deserialize, Serialize};

use crate::conversation::ConversationTurn;
use crate::ids::{DocumentId, InteractionId, SurfaceId};
use crate::stage::ExecutionStage;

/// Observable progress of one execution surface, broadcast to any number of listeners.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ExecutionEvent {
    #[serde(rename = "stage_changed")]
    StageChanged {
        surface_id: SurfaceId,
        from: ExecutionStage,
        to: ExecutionStage,
    },

    #[serde(rename = "interaction_started")]
    InteractionStarted {
        surface_id: SurfaceId,
        interaction_id: InteractionId,
    },

    /// Provisional text for the current turn.
    #[serde(rename = "chunk")]
    Chunk {
        surface_id: SurfaceId,
        text: String,
    },

    /// Canonical content for the current turn.
    #[serde(rename = "completed")]
    Completed {
        surface_id: SurfaceId,
        interaction_id: InteractionId,
        document_id: Option<DocumentId>,
        content: String,
    },

    #[serde(rename = "failed")]
    Failed {
        surface_id: SurfaceId,
        kind: String,
        message: String,
        retryable: bool,
    },

    #[serde(rename = "turn_appended")]
    TurnAppended {
        surface_id: SurfaceId,
        turn: ConversationTurn,
    },

    #[serde(rename = "cancelled")]
    Cancelled {
        surface_id: SurfaceId,
        interaction_id: Option<InteractionId>,
    },
}

impl ExecutionEvent {
    pub fn surface_id(&self) -> &SurfaceId {
        match self {
            Self::StageChanged { surface_id, .. }
            | Self::InteractionStarted { surface_id, .. }
            | Self::Chunk { surface_id, .. }
            | Self::Completed { surface_id, .. }
            | Self::Failed { surface_id, .. }
            | Self::TurnAppended { surface_id, .. }
            | Self::Cancelled { surface_id, .. } => surface_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StageChanged { .. } => "stage_changed",
            Self::InteractionStarted { .. } => "interaction_started",
            Self::Chunk { .. } => "chunk",
            Self::Completed { .. } => "completed",
            Self::Failed { .. } => "failed",
            Self::TurnAppended { .. } => "turn_appended",
            Self::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}
