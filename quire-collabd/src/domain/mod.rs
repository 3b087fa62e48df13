pub mod connection;
pub mod hold;
pub mod operation;
pub mod session;
