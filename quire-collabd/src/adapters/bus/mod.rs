pub mod broadcast;

pub use broadcast::{BroadcastBus, DEFAULT_BUS_CAPACITY};
