use crate::domain::session::{SocketId, Uid};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of an `{auth: ...}` frame.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub session_hash: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Resolves the request to a socket-scoped uid; `None` rejects it.
    async fn authorize(
        &self,
        request: &AuthRequest,
        socket_id: &SocketId,
    ) -> anyhow::Result<Option<Uid>>;
}
