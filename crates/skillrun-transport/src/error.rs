#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("not connected to the execution service")]
    NotConnected,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("send queue full")]
    QueueFull,
    #[error("connection closed")]
    Closed,
    #[error("failed to encode {event} payload: {reason}")]
    Encode { event: String, reason: String },
}

impl ConnectionError {
    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::Handshake(_) => "handshake",
            Self::QueueFull => "queue_full",
            Self::Closed => "closed",
            Self::Encode { .. } => "encode",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("an execution surface is already attached to this dispatcher")]
    AlreadyAttached,
    #[error("no execution surface is attached to this dispatcher")]
    NotAttached,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_are_human_readable() {
        assert_eq!(
            ConnectionError::NotConnected.to_string(),
            "not connected to the execution service"
        );
        assert_eq!(
            ConnectionError::Handshake("401".into()).to_string(),
            "handshake failed: 401"
        );
        assert_eq!(ConnectionError::QueueFull.error_kind(), "queue_full");
    }
}
