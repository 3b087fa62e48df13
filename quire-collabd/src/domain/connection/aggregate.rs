use super::events::{ConnectionEvent, ConnectionEventEnvelope};
use super::value_object::{ConnectionId, ConnectionPhase, ConnectionStatus};
use crate::domain::session::{SocketId, Uid};
use chrono::{DateTime, Utc};

/// Aggregate tracking one transport through handshake, steady state and teardown.
#[derive(Clone, Debug)]
pub struct Connection {
    id: ConnectionId,
    socket_id: SocketId,
    uid: Option<Uid>,
    status: Option<ConnectionStatus>,
    auth_pending: bool,
    created_at: DateTime<Utc>,
    last_active_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(socket_id: SocketId) -> Self {
        let now = Utc::now();
        Self {
            id: ConnectionId::new(),
            socket_id,
            uid: None,
            status: None,
            auth_pending: false,
            created_at: now,
            last_active_at: now,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn socket_id(&self) -> &SocketId {
        &self.socket_id
    }

    pub fn uid(&self) -> Option<&Uid> {
        self.uid.as_ref()
    }

    pub fn status(&self) -> Option<ConnectionStatus> {
        self.status
    }

    pub fn auth_pending(&self) -> bool {
        self.auth_pending
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn last_active_at(&self) -> DateTime<Utc> {
        self.last_active_at
    }

    pub fn phase(&self) -> ConnectionPhase {
        match (self.status, self.auth_pending, self.uid.is_some()) {
            (Some(ConnectionStatus::Destroy), _, _) => ConnectionPhase::Destroy,
            (Some(ConnectionStatus::Operations), _, _) => ConnectionPhase::Operations,
            (Some(ConnectionStatus::Authorize), true, _) => ConnectionPhase::Authorizing,
            (Some(ConnectionStatus::Authorize), false, true) => ConnectionPhase::Authorized,
            _ => ConnectionPhase::New,
        }
    }

    pub fn touch(&mut self) {
        self.last_active_at = Utc::now();
    }

    pub fn begin_auth(&mut self) -> Result<ConnectionEventEnvelope, String> {
        if self.uid.is_some() {
            return Err("connection is already authorized".into());
        }
        if self.auth_pending {
            return Err("authorization already in progress".into());
        }
        if matches!(self.status, Some(ConnectionStatus::Destroy)) {
            return Err("authorization attempted on destroyed connection".into());
        }
        self.status = Some(ConnectionStatus::Authorize);
        self.auth_pending = true;
        self.touch();
        Ok(self.event(ConnectionEvent::AuthStarted))
    }

    /// Assigns the session id; only ever succeeds once per connection.
    pub fn authorize(&mut self, uid: Uid) -> Result<ConnectionEventEnvelope, String> {
        if self.uid.is_some() {
            return Err("session id already assigned".into());
        }
        if !self.auth_pending {
            return Err("no authorization in progress".into());
        }
        if uid.socket_id() != Some(&self.socket_id) {
            return Err(format!(
                "session id {uid} does not belong to socket {}",
                self.socket_id
            ));
        }
        self.uid = Some(uid.clone());
        self.auth_pending = false;
        self.touch();
        Ok(self.event(ConnectionEvent::Authorized { uid }))
    }

    pub fn fail_auth(&mut self) -> Result<ConnectionEventEnvelope, String> {
        if !self.auth_pending {
            return Err("no authorization in progress".into());
        }
        self.auth_pending = false;
        self.status = None;
        Ok(self.event(ConnectionEvent::AuthFailed))
    }

    /// Returns `None` when the connection is already exchanging operations.
    pub fn enter_operations(&mut self) -> Result<Option<ConnectionEventEnvelope>, String> {
        if self.uid.is_none() {
            return Err("operations require an authorized connection".into());
        }
        match self.status {
            Some(ConnectionStatus::Destroy) => {
                Err("operations attempted on destroyed connection".into())
            }
            Some(ConnectionStatus::Operations) => Ok(None),
            _ => {
                self.status = Some(ConnectionStatus::Operations);
                self.touch();
                Ok(Some(self.event(ConnectionEvent::OperationsStarted)))
            }
        }
    }

    pub fn destroy(&mut self, reason: impl Into<String>) -> Result<ConnectionEventEnvelope, String> {
        if matches!(self.status, Some(ConnectionStatus::Destroy)) {
            return Err("connection already destroyed".into());
        }
        self.status = Some(ConnectionStatus::Destroy);
        self.auth_pending = false;
        Ok(self.event(ConnectionEvent::Destroyed {
            reason: reason.into(),
        }))
    }

    fn event(&self, event: ConnectionEvent) -> ConnectionEventEnvelope {
        ConnectionEventEnvelope::new(self.id, event)
    }
}
