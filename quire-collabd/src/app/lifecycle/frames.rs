use crate::app::holds::HoldError;
use crate::app::operations::OperationError;
use crate::domain::connection::ConnectionId;
use serde_json::json;
use thiserror::Error;

/// Frame queued for a connection's socket task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerFrame {
    Text(String),
    Close,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("malformed auth request: {0}")]
    Malformed(String),
    #[error("auth collaborator failed: {0}")]
    Collaborator(String),
    #[error("invalid auth transition: {0}")]
    Transition(String),
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error(transparent)]
    Hold(#[from] HoldError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),
    #[error("invalid connection state: {0}")]
    State(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("bus error: {0}")]
    Bus(String),
}

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::Operation(OperationError::UnknownChannel(_)) => "unknown_channel",
            LifecycleError::Operation(OperationError::CannotBeCanceled(_)) => "cannot_be_canceled",
            LifecycleError::Operation(OperationError::UnknownIndex { .. }) => "unknown_operation",
            LifecycleError::Hold(HoldError::NotImplemented(_)) => "not_implemented",
            LifecycleError::Hold(HoldError::UnhandledOperationType(_)) => {
                "unhandled_operation_type"
            }
            LifecycleError::Hold(HoldError::Invalid(_)) => "invalid_hold",
            LifecycleError::Operation(OperationError::Store(_))
            | LifecycleError::Hold(HoldError::Store(_))
            | LifecycleError::Store(_) => "store_unavailable",
            LifecycleError::Auth(_) => "auth_failed",
            LifecycleError::UnknownConnection(_) => "unknown_connection",
            LifecycleError::State(_) => "invalid_state",
            LifecycleError::Bus(_) => "bus_unavailable",
        }
    }
}

/// `{"error": {"code": ..., "message": ...}}`
pub fn error_frame(err: &LifecycleError) -> String {
    json!({
        "error": {
            "code": err.code(),
            "message": err.to_string(),
        }
    })
    .to_string()
}
