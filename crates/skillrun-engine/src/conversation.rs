//! Multi-turn bookkeeping for one execution surface.
//!
//! Holds the server-assigned interaction id, the ordered turns and the
//! optimistic user turn of the continuation in flight, and decides what a
//! user action means given the current stage.

use std::collections::BTreeMap;

use skillrun_core::{ConversationTurn, ExecutionStage, InteractionId};
use tracing::{debug, warn};

use crate::error::{EngineError, FieldError, ValidationError};

/// What the user asked the surface to do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UserAction {
    Execute,
    FollowUp(String),
    End,
    NewConversation,
}

/// How an accepted [`UserAction`] is carried out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Plan {
    /// Send parameters with no interaction id.
    Fresh,
    /// Send a message on the existing interaction.
    FollowUp {
        interaction_id: InteractionId,
        message: String,
    },
    /// Ask the server to close the interaction.
    End { interaction_id: InteractionId },
    /// Forget the interaction locally. Nothing is sent beyond the cancel of
    /// a turn still in flight.
    Reset { cancel_in_flight: bool },
}

#[derive(Clone, Debug, Default)]
pub struct Conversation {
    interaction_id: Option<InteractionId>,
    turns: Vec<ConversationTurn>,
    ended: bool,
    /// Sequence of the user turn appended before the server confirmed it.
    pending_user: Option<u32>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn interaction_id(&self) -> Option<&InteractionId> {
        self.interaction_id.as_ref()
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    pub fn has_pending(&self) -> bool {
        self.pending_user.is_some()
    }

    /// Classify `action` against the current stage.
    pub fn plan(
        &self,
        action: &UserAction,
        stage: ExecutionStage,
        multi_turn: bool,
    ) -> Result<Plan, EngineError> {
        match action {
            UserAction::Execute => {
                if !stage.accepts_start() {
                    return Err(EngineError::Busy { stage });
                }
                Ok(Plan::Fresh)
            }
            UserAction::FollowUp(message) => {
                if !multi_turn {
                    return Err(EngineError::NotMultiTurn);
                }
                let interaction_id = self.continuable(stage)?;
                if message.trim().is_empty() {
                    let mut fields = BTreeMap::new();
                    fields.insert("message".to_string(), FieldError::Required);
                    return Err(ValidationError { fields }.into());
                }
                Ok(Plan::FollowUp {
                    interaction_id,
                    message: message.clone(),
                })
            }
            UserAction::End => {
                let interaction_id = self.continuable(stage)?;
                Ok(Plan::End { interaction_id })
            }
            UserAction::NewConversation => Ok(Plan::Reset {
                cancel_in_flight: stage.is_in_flight(),
            }),
        }
    }

    /// Continuations need a live interaction and nothing outstanding.
    fn continuable(&self, stage: ExecutionStage) -> Result<InteractionId, EngineError> {
        let interaction_id = self
            .interaction_id
            .clone()
            .ok_or(EngineError::NoInteraction)?;
        if self.ended {
            return Err(EngineError::ConversationEnded);
        }
        if !stage.is_settled() {
            return Err(EngineError::Busy { stage });
        }
        Ok(interaction_id)
    }

    /// Record the id from `response:start`. The first id wins; a different one
    /// later is ignored. Returns `true` when the id was newly assigned.
    pub fn set_interaction(&mut self, id: InteractionId) -> bool {
        match &self.interaction_id {
            None => {
                debug!(interaction_id = %id, "interaction established");
                self.interaction_id = Some(id);
                true
            }
            Some(current) if *current == id => false,
            Some(current) => {
                warn!(current = %current, received = %id, "ignoring conflicting interaction id");
                false
            }
        }
    }

    /// Append the user's message before the server has seen it.
    pub fn push_pending_user(&mut self, content: impl Into<String>) -> ConversationTurn {
        let turn = ConversationTurn::user(self.next_sequence(), content);
        self.pending_user = Some(turn.sequence);
        self.turns.push(turn.clone());
        turn
    }

    /// Append canonical assistant content. Confirms any pending user turn.
    pub fn push_assistant(&mut self, content: impl Into<String>) -> ConversationTurn {
        self.pending_user = None;
        let turn = ConversationTurn::assistant(self.next_sequence(), content);
        self.turns.push(turn.clone());
        turn
    }

    /// Keep the pending user turn as part of the history.
    pub fn confirm_pending(&mut self) {
        self.pending_user = None;
    }

    /// Remove the pending user turn after its send failed or was cancelled.
    pub fn rollback_pending(&mut self) -> Option<ConversationTurn> {
        let sequence = self.pending_user.take()?;
        let index = self.turns.iter().rposition(|t| t.sequence == sequence)?;
        let turn = self.turns.remove(index);
        debug!(sequence, "optimistic user turn rolled back");
        Some(turn)
    }

    pub fn mark_ended(&mut self) {
        self.ended = true;
    }

    /// A termination that failed may be retried.
    pub fn reopen(&mut self) {
        self.ended = false;
    }

    /// Back to "never executed": no interaction, no turns.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn next_sequence(&self) -> u32 {
        self.turns.last().map_or(0, |t| t.sequence + 1)
    }
}
