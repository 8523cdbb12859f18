use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use skillrun_core::ExecutionStage;
use skillrun_transport::{ConnectionError, DispatchError};

/// Why a single parameter failed validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldError {
    Required,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => f.write_str("required"),
        }
    }
}

/// Per-field validation failures, keyed by parameter name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidationError {
    pub fields: BTreeMap<String, FieldError>,
}

impl ValidationError {
    /// `{name: "required", ..}` for inline display.
    pub fn messages(&self) -> BTreeMap<String, String> {
        self.fields
            .iter()
            .map(|(name, err)| (name.clone(), err.to_string()))
            .collect()
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid parameters: ")?;
        for (i, (name, err)) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name} {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("{0}")]
    Protocol(String),

    #[error("execution already in progress (stage: {stage})")]
    Busy { stage: ExecutionStage },

    #[error("no active interaction")]
    NoInteraction,

    #[error("conversation has ended")]
    ConversationEnded,

    #[error("skill does not support follow-ups")]
    NotMultiTurn,

    #[error("no response from the execution service for {0:?}")]
    Timeout(Duration),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("execution cancelled")]
    Cancelled,
}

impl EngineError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Connection(_) => "connection",
            Self::Dispatch(_) => "dispatch",
            Self::Protocol(_) => "protocol",
            Self::Busy { .. } => "busy",
            Self::NoInteraction => "no_interaction",
            Self::ConversationEnded => "conversation_ended",
            Self::NotMultiTurn => "not_multi_turn",
            Self::Timeout(_) => "timeout",
            Self::ConnectionLost(_) => "connection_lost",
            Self::Cancelled => "cancelled",
        }
    }

    /// Banner-level errors the user can retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Protocol(_) | Self::Timeout(_) | Self::ConnectionLost(_)
        )
    }
}
