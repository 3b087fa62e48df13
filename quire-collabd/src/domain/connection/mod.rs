pub mod aggregate;
pub mod events;
pub mod value_object;

pub use aggregate::Connection;
pub use events::{ConnectionEvent, ConnectionEventEnvelope};
pub use value_object::{ConnectionId, ConnectionPhase, ConnectionStatus};
