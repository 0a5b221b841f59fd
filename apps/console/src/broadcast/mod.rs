//! Fans one line of input out to many independent terminal sessions
//! for batch execution. The working set is deliberately separate from
//! the tab registry: a bulk item is an ephemeral execution context
//! with its own session, torn down per item.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::session::SessionManager;
use crate::session::connection::{Presentation, SessionConnection};
use crate::tunnel::{DisplaySize, Protocol, TunnelFactory};

pub struct BulkItem {
    asset_id: String,
    connection: Arc<SessionConnection>,
}

impl BulkItem {
    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn connection(&self) -> &Arc<SessionConnection> {
        &self.connection
    }
}

pub struct BulkBroadcaster {
    manager: SessionManager,
    factory: Arc<dyn TunnelFactory>,
    viewport: DisplaySize,
    items: Vec<BulkItem>,
}

impl BulkBroadcaster {
    pub fn new(
        manager: SessionManager,
        factory: Arc<dyn TunnelFactory>,
        viewport: DisplaySize,
    ) -> Self {
        Self {
            manager,
            factory,
            viewport,
            items: Vec::new(),
        }
    }

    pub fn assets(&self) -> Vec<String> {
        self.items
            .iter()
            .map(|item| item.asset_id.clone())
            .collect()
    }

    pub fn item(&self, asset_id: &str) -> Option<&BulkItem> {
        self.items.iter().find(|item| item.asset_id == asset_id)
    }

    /// Add an asset to the working set with its own SSH-class session.
    pub fn add(&mut self, asset_id: &str) -> Arc<SessionConnection> {
        let connection = Arc::new(SessionConnection::new(
            asset_id,
            Protocol::Ssh,
            self.manager.clone(),
            self.factory.clone(),
            self.viewport,
        ));
        {
            let connection = connection.clone();
            tokio::spawn(async move {
                let _ = connection.connect(None).await;
            });
        }
        self.items.push(BulkItem {
            asset_id: asset_id.to_string(),
            connection: connection.clone(),
        });
        connection
    }

    /// Deliver `line` to every currently connected item; an empty line
    /// becomes a bare carriage return. Items that are not connected
    /// skip this broadcast, and one item's send failure never blocks
    /// the rest. Returns how many items were delivered to.
    pub async fn broadcast(&self, line: &str) -> usize {
        let payload: &[u8] = if line.is_empty() { b"\r" } else { line.as_bytes() };
        let mut delivered = 0;
        for item in &self.items {
            if item.connection.snapshot().presentation() != Presentation::Connected {
                debug!(
                    target = "console::broadcast",
                    asset_id = %item.asset_id,
                    "skipping item that is not connected"
                );
                continue;
            }
            match item.connection.send_input(payload).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    warn!(
                        target = "console::broadcast",
                        asset_id = %item.asset_id,
                        error = %err,
                        "bulk delivery failed for one item"
                    );
                }
            }
        }
        delivered
    }

    /// Remove one item and tear its session down; others are
    /// unaffected.
    pub fn dismiss(&mut self, asset_id: &str) -> bool {
        let Some(index) = self
            .items
            .iter()
            .position(|item| item.asset_id == asset_id)
        else {
            return false;
        };
        let item = self.items.remove(index);
        tokio::spawn(async move {
            item.connection.disconnect().await;
        });
        true
    }

    pub fn dismiss_all(&mut self) {
        for item in self.items.drain(..) {
            tokio::spawn(async move {
                item.connection.disconnect().await;
            });
        }
    }
}
