//! Skill execution engine: parameter preparation, the per-surface execution
//! state machine and multi-turn conversation tracking.

pub mod buffer;
pub mod catalog;
pub mod conversation;
pub mod error;
pub mod orchestrator;
pub mod params;

pub use buffer::StreamBuffer;
pub use catalog::{CatalogError, InMemorySkillCatalog, SkillCatalog};
pub use conversation::{Conversation, Plan, UserAction};
pub use error::{EngineError, FieldError, ValidationError};
pub use orchestrator::{ExecutionConfig, ExecutionOrchestrator, ExecutionSnapshot};
pub use params::{prepare, validate, AmbientContext, CustomerContext, ParameterForm, Validation};
