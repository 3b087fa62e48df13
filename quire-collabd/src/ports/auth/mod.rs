pub mod authenticator;

pub use authenticator::{AuthRequest, Authenticator};
