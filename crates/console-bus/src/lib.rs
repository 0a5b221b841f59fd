use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

/// One fire-and-forget announcement on a named channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub channel: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus channel closed")]
    Closed,
    #[error("bus backend error: {0}")]
    Backend(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// Cross-tab broadcast seam. Publishing must never gate correctness:
/// a publish with zero subscribers succeeds, and subscribers may miss
/// messages sent before they attached.
pub trait BroadcastBus: Send + Sync {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Envelope>;
    fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()>;
}

/// In-process bus; stands in for a browser BroadcastChannel when all
/// consumers share one process.
#[derive(Debug, Default)]
pub struct InProcessBus {
    channels: parking_lot::RwLock<std::collections::HashMap<String, broadcast::Sender<Envelope>>>,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<Envelope> {
        let mut guard = self.channels.write();
        guard
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }
}

impl BroadcastBus for InProcessBus {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<Envelope> {
        self.sender_for(channel).subscribe()
    }

    fn publish(&self, channel: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(channel);
        // A send error only means nobody is listening right now.
        let _ = sender.send(Envelope {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }
}
