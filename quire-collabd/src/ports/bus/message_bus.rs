use crate::domain::connection::ConnectionStatus;
use crate::domain::operation::Operation;
use crate::domain::session::Uid;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Body of a fan-out message; serializes to the socket frame shape.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusPayload {
    Operations(Vec<Operation>),
    Auth(Value),
    Destroy(Value),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEnvelope {
    pub uid: Uid,
    pub payload: BusPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_status: Option<ConnectionStatus>,
}

impl BusEnvelope {
    pub fn new(uid: Uid, payload: BusPayload, client_status: Option<ConnectionStatus>) -> Self {
        Self {
            uid,
            payload,
            client_status,
        }
    }
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, envelope: BusEnvelope) -> anyhow::Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<BusEnvelope>;
}
