pub mod registry;

pub use registry::{TimerKind, TimerRegistry};
