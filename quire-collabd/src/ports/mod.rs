pub mod auth;
pub mod bus;
pub mod store;
