use super::value_object::ConnectionId;
use crate::domain::session::Uid;
use chrono::{DateTime, Utc};

#[derive(Clone, Debug, PartialEq)]
pub enum ConnectionEvent {
    AuthStarted,
    AuthFailed,
    Authorized { uid: Uid },
    OperationsStarted,
    Destroyed { reason: String },
}

impl ConnectionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ConnectionEvent::AuthStarted => "auth_started",
            ConnectionEvent::AuthFailed => "auth_failed",
            ConnectionEvent::Authorized { .. } => "authorized",
            ConnectionEvent::OperationsStarted => "operations_started",
            ConnectionEvent::Destroyed { .. } => "destroyed",
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConnectionEventEnvelope {
    pub connection_id: ConnectionId,
    pub occurred_at: DateTime<Utc>,
    pub event: ConnectionEvent,
}

impl ConnectionEventEnvelope {
    pub fn new(connection_id: ConnectionId, event: ConnectionEvent) -> Self {
        Self {
            connection_id,
            occurred_at: Utc::now(),
            event,
        }
    }
}
