use crate::ports::bus::{BusEnvelope, MessageBus};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// In-process fan-out; every subscriber sees every envelope, including the publisher.
pub struct BroadcastBus {
    sender: broadcast::Sender<BusEnvelope>,
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl MessageBus for BroadcastBus {
    async fn publish(&self, envelope: BusEnvelope) -> Result<()> {
        // No subscribers is not an error: nobody is listening yet.
        match self.sender.send(envelope) {
            Ok(receivers) => trace!(receivers, "bus envelope published"),
            Err(_) => trace!("bus envelope dropped without subscribers"),
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEnvelope> {
        self.sender.subscribe()
    }
}
