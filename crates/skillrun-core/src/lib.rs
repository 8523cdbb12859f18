//! Shared data model for skill executions: ids, skills and their parameters,
//! the duplex wire protocol, conversation turns and execution events.

pub mod conversation;
pub mod events;
pub mod ids;
pub mod protocol;
pub mod skill;
pub mod stage;

pub use conversation::{ConversationTurn, Role};
pub use events::ExecutionEvent;
pub use ids::{CustomerId, DocumentId, InteractionId, SkillId, SurfaceId, TeamId};
pub use protocol::{ExecutionRequest, Frame};
pub use skill::{ParameterSpec, ParameterType, ParameterValue, ParameterValues, Skill};
pub use stage::ExecutionStage;
