use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One message of a multi-turn conversation. Append-only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    /// Position in the conversation, starting at 0.
    pub sequence: u32,
    pub at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn user(sequence: u32, content: impl Into<String>) -> Self {
        Self::new(Role::User, sequence, content)
    }

    pub fn assistant(sequence: u32, content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, sequence, content)
    }

    fn new(role: Role, sequence: u32, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            sequence,
            at: Utc::now(),
        }
    }
}
