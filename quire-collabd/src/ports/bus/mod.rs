pub mod message_bus;

pub use message_bus::{BusEnvelope, BusPayload, MessageBus};
