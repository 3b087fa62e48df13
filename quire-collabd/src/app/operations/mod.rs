pub mod service;

pub use service::{CancelOutcome, OperationError, OperationResult, OperationService};
