//! Wire protocol spoken over the duplex channel.
//!
//! Every message is one [`Frame`]: `{"event": "<name>", "data": <payload>}`.
//! Payload fields are camelCase; absent optionals are omitted.

use serde::{Deserialize, Serialize};

use crate::ids::{CustomerId, DocumentId, InteractionId, SkillId, TeamId};
use crate::skill::ParameterValues;

// Outbound
pub const SKILL_EXECUTE: &str = "skill:execute";
pub const SKILL_CANCEL: &str = "skill:cancel";

// Inbound
pub const RESPONSE_START: &str = "response:start";
pub const RESPONSE_CHUNK: &str = "response:chunk";
pub const RESPONSE_COMPLETE: &str = "response:complete";
pub const RESPONSE_ERROR: &str = "response:error";

// Raised locally by the connection, never sent by the server.
pub const DISCONNECT: &str = "disconnect";
pub const RECONNECT: &str = "reconnect";

/// One event on the channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }

    /// Build a frame from any serializable payload.
    pub fn encode<T: Serialize>(event: &str, payload: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event, serde_json::to_value(payload)?))
    }

    /// Decode the payload into a typed struct.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }
}

/// `skill:execute` payload.
///
/// Built only through [`ExecutionRequest::fresh`], [`ExecutionRequest::follow_up`] or
/// [`ExecutionRequest::end_conversation`], so exactly one of parameters, message or
/// the end flag is ever set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionRequest {
    pub skill_id: SkillId,
    pub team_id: TeamId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<CustomerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<ParameterValues>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interaction_id: Option<InteractionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_conversation: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_document_id: Option<DocumentId>,
}

/// Routing fields shared by every `skill:execute` send of one surface.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestTarget {
    pub skill_id: SkillId,
    pub team_id: TeamId,
    pub customer_id: Option<CustomerId>,
}

impl ExecutionRequest {
    fn base(target: &RequestTarget) -> Self {
        Self {
            skill_id: target.skill_id.clone(),
            team_id: target.team_id.clone(),
            customer_id: target.customer_id.clone(),
            parameters: None,
            message: None,
            interaction_id: None,
            end_conversation: None,
            reference_document_id: None,
        }
    }

    /// A new execution. Never carries an interaction id.
    pub fn fresh(
        target: &RequestTarget,
        parameters: ParameterValues,
        reference_document_id: Option<DocumentId>,
    ) -> Self {
        Self {
            parameters: Some(parameters),
            reference_document_id,
            ..Self::base(target)
        }
    }

    /// A continuation of an existing interaction.
    pub fn follow_up(
        target: &RequestTarget,
        interaction_id: InteractionId,
        message: impl Into<String>,
    ) -> Self {
        Self {
            message: Some(message.into()),
            interaction_id: Some(interaction_id),
            ..Self::base(target)
        }
    }

    /// Ask the server to close the interaction and reply with a summary.
    pub fn end_conversation(target: &RequestTarget, interaction_id: InteractionId) -> Self {
        Self {
            interaction_id: Some(interaction_id),
            end_conversation: Some(true),
            ..Self::base(target)
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.interaction_id.is_none()
    }
}

/// `skill:cancel` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub interaction_id: InteractionId,
}

/// `response:start` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStart {
    pub interaction_id: InteractionId,
}

/// `response:chunk` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseChunk {
    pub chunk: String,
}

/// `response:complete` payload. `content` is canonical and replaces whatever was streamed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseComplete {
    pub interaction_id: InteractionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<DocumentId>,
    pub content: String,
}

/// `response:error` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub message: String,
}

/// Payload of the local `disconnect` notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DisconnectNotice {
    pub reason: String,
}
