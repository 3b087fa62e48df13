pub mod service;

pub use service::{CollabKind, HoldError, HoldResult, HoldService};
