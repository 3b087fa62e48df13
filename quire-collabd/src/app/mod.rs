pub mod envelope;
pub mod holds;
pub mod lifecycle;
pub mod operations;
pub mod reclamation;
pub mod timers;
