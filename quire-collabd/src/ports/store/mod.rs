pub mod activity_store;
pub mod hold_store;
pub mod operation_store;

pub use activity_store::ProjectActivityStore;
pub use hold_store::HoldStore;
pub use operation_store::{AppendOutcome, OperationStore};
