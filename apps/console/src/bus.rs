//! Typed announcements over the cross-tab broadcast channel. Strictly
//! informational: "this tab is now driving asset X". Nothing in the
//! console gates correctness on a sibling having received one.

use bytes::Bytes;
use console_bus::{BroadcastBus, Envelope};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::tunnel::Protocol;

pub const TAB_ANNOUNCE_CHANNEL: &str = "tabs/active";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabAnnouncement {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
}

/// Fire-and-forget publish; an undeliverable announcement is logged
/// and dropped.
pub fn announce_tab(bus: &dyn BroadcastBus, announcement: &TabAnnouncement) {
    let payload = match serde_json::to_vec(announcement) {
        Ok(payload) => payload,
        Err(err) => {
            debug!(target = "console::bus", error = %err, "announcement not serializable");
            return;
        }
    };
    if let Err(err) = bus.publish(TAB_ANNOUNCE_CHANNEL, Bytes::from(payload)) {
        debug!(target = "console::bus", error = %err, "announcement dropped");
    }
}

pub fn subscribe_tabs(bus: &dyn BroadcastBus) -> broadcast::Receiver<Envelope> {
    bus.subscribe(TAB_ANNOUNCE_CHANNEL)
}

pub fn decode_announcement(envelope: &Envelope) -> Option<TabAnnouncement> {
    serde_json::from_slice(&envelope.payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use console_bus::InProcessBus;

    #[tokio::test]
    async fn announcement_round_trip() {
        let bus = InProcessBus::new();
        let mut rx = subscribe_tabs(&bus);
        announce_tab(
            &bus,
            &TabAnnouncement {
                id: "asset-42".into(),
                name: "db-primary".into(),
                protocol: Protocol::Ssh,
            },
        );
        let envelope = rx.recv().await.expect("envelope");
        let announcement = decode_announcement(&envelope).expect("decode");
        assert_eq!(announcement.id, "asset-42");
        assert_eq!(announcement.protocol, Protocol::Ssh);
    }

    #[test]
    fn announce_without_subscribers_is_silent() {
        let bus = InProcessBus::new();
        announce_tab(
            &bus,
            &TabAnnouncement {
                id: "asset-1".into(),
                name: "web".into(),
                protocol: Protocol::Rdp,
            },
        );
    }
}
