pub mod frames;
pub mod manager;

pub use frames::{error_frame, AuthError, LifecycleError, ServerFrame};
pub use manager::{ConnectionManager, LifecycleResult, LifecycleSettings};
