//! Duplex channel plumbing: one owned connection per application, and a
//! per-surface dispatcher that routes turn events to an execution surface.

pub mod connection;
pub mod connector;
pub mod dispatcher;
pub mod error;
pub mod memory;
pub mod ws;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState, Handler, SubscriptionId};
pub use connector::{Connector, Link};
pub use dispatcher::{EventDispatcher, TurnId, TurnSink};
pub use error::{ConnectionError, DispatchError};
pub use memory::{MemoryConnector, MemoryServer};
pub use ws::WsConnector;
