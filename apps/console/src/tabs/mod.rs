//! Ordered collection of open session tabs. The registry is the sole
//! mutator of tab ordering and activation; sessions only publish state
//! that the owner re-renders from. Registry mutations are synchronous;
//! session teardown and (re)connection run in the background and never
//! corrupt registry invariants.

use std::sync::Arc;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::bus::{self, TabAnnouncement};
use crate::session::SessionManager;
use crate::session::auth::SecurityToken;
use crate::session::connection::SessionConnection;
use crate::tunnel::{DisplaySize, Protocol, TunnelFactory};
use console_bus::BroadcastBus;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown tab {0}")]
    UnknownTab(String),
}

pub struct Tab {
    key: String,
    name: String,
    connection: Arc<SessionConnection>,
}

impl Tab {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &Arc<SessionConnection> {
        &self.connection
    }
}

pub struct TabRegistry {
    manager: SessionManager,
    factory: Arc<dyn TunnelFactory>,
    default_viewport: DisplaySize,
    bus: Option<Arc<dyn BroadcastBus>>,
    tabs: Vec<Tab>,
    active: Option<String>,
}

impl TabRegistry {
    pub fn new(
        manager: SessionManager,
        factory: Arc<dyn TunnelFactory>,
        default_viewport: DisplaySize,
    ) -> Self {
        Self {
            manager,
            factory,
            default_viewport,
            bus: None,
            tabs: Vec::new(),
            active: None,
        }
    }

    /// Attach the cross-tab announcement bus. Informational only; no
    /// registry operation depends on a sibling receiving anything.
    pub fn with_bus(mut self, bus: Arc<dyn BroadcastBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn keys(&self) -> Vec<String> {
        self.tabs.iter().map(|tab| tab.key.clone()).collect()
    }

    pub fn active_key(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn len(&self) -> usize {
        self.tabs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tabs.is_empty()
    }

    pub fn tab(&self, key: &str) -> Option<&Tab> {
        self.tabs.iter().find(|tab| tab.key == key)
    }

    /// Open a new tab at the end and activate it. Repeated opens for
    /// the same asset create independent sessions on purpose.
    pub fn open_tab(&mut self, asset_id: &str, name: &str, protocol: Protocol) -> String {
        let key = format!("tab-{}", Uuid::new_v4());
        let connection = Arc::new(SessionConnection::new(
            asset_id,
            protocol,
            self.manager.clone(),
            self.factory.clone(),
            self.default_viewport,
        ));
        {
            let connection = connection.clone();
            tokio::spawn(async move {
                // Failures stay on the connection's own error surface.
                let _ = connection.connect(None).await;
            });
        }
        self.tabs.push(Tab {
            key: key.clone(),
            name: name.to_string(),
            connection,
        });
        self.active = Some(key.clone());
        if let Some(bus) = &self.bus {
            bus::announce_tab(
                bus.as_ref(),
                &TabAnnouncement {
                    id: asset_id.to_string(),
                    name: name.to_string(),
                    protocol,
                },
            );
        }
        debug!(target = "console::tabs", key = %key, asset_id = %asset_id, "tab opened");
        key
    }

    pub fn activate(&mut self, key: &str) -> Result<(), RegistryError> {
        if self.tab(key).is_none() {
            return Err(RegistryError::UnknownTab(key.to_string()));
        }
        self.active = Some(key.to_string());
        Ok(())
    }

    /// Close one tab. The newly active tab is the left neighbor if one
    /// exists, else the new first tab, else none.
    pub fn close_tab(&mut self, key: &str) -> Result<(), RegistryError> {
        let index = self
            .tabs
            .iter()
            .position(|tab| tab.key == key)
            .ok_or_else(|| RegistryError::UnknownTab(key.to_string()))?;
        let tab = self.tabs.remove(index);
        teardown(tab.connection);
        if self.active.as_deref() == Some(key) {
            self.active = if index > 0 {
                Some(self.tabs[index - 1].key.clone())
            } else {
                self.tabs.first().map(|tab| tab.key.clone())
            };
        }
        Ok(())
    }

    /// Close every tab strictly left of `key`.
    pub fn close_left(&mut self, key: &str) -> Result<(), RegistryError> {
        let index = self
            .tabs
            .iter()
            .position(|tab| tab.key == key)
            .ok_or_else(|| RegistryError::UnknownTab(key.to_string()))?;
        for tab in self.tabs.drain(..index) {
            teardown(tab.connection);
        }
        self.ensure_active_present(key);
        Ok(())
    }

    /// Close every tab strictly right of `key`.
    pub fn close_right(&mut self, key: &str) -> Result<(), RegistryError> {
        let index = self
            .tabs
            .iter()
            .position(|tab| tab.key == key)
            .ok_or_else(|| RegistryError::UnknownTab(key.to_string()))?;
        for tab in self.tabs.drain(index + 1..) {
            teardown(tab.connection);
        }
        self.ensure_active_present(key);
        Ok(())
    }

    pub fn close_others(&mut self, key: &str) -> Result<(), RegistryError> {
        if self.tab(key).is_none() {
            return Err(RegistryError::UnknownTab(key.to_string()));
        }
        let mut kept = Vec::with_capacity(1);
        for tab in self.tabs.drain(..) {
            if tab.key == key {
                kept.push(tab);
            } else {
                teardown(tab.connection);
            }
        }
        self.tabs = kept;
        self.active = Some(key.to_string());
        Ok(())
    }

    pub fn close_all(&mut self) {
        for tab in self.tabs.drain(..) {
            teardown(tab.connection);
        }
        self.active = None;
    }

    /// Move a tab to the position currently held by `to_key`; every
    /// other tab shifts to stay contiguous. Activation is unaffected.
    pub fn reorder(&mut self, from_key: &str, to_key: &str) -> Result<(), RegistryError> {
        let from = self
            .tabs
            .iter()
            .position(|tab| tab.key == from_key)
            .ok_or_else(|| RegistryError::UnknownTab(from_key.to_string()))?;
        let to = self
            .tabs
            .iter()
            .position(|tab| tab.key == to_key)
            .ok_or_else(|| RegistryError::UnknownTab(to_key.to_string()))?;
        let tab = self.tabs.remove(from);
        self.tabs.insert(to, tab);
        Ok(())
    }

    /// Tear down and renegotiate the tab's session in place; key and
    /// position are untouched. The optional token satisfies a prior
    /// step-up refusal.
    pub fn reconnect(
        &self,
        key: &str,
        security_token: Option<SecurityToken>,
    ) -> Result<(), RegistryError> {
        let tab = self
            .tab(key)
            .ok_or_else(|| RegistryError::UnknownTab(key.to_string()))?;
        let connection = tab.connection.clone();
        tokio::spawn(async move {
            let _ = connection.connect(security_token.as_ref()).await;
        });
        Ok(())
    }

    fn ensure_active_present(&mut self, fallback: &str) {
        let active_exists = self
            .active
            .as_deref()
            .is_some_and(|active| self.tabs.iter().any(|tab| tab.key == active));
        if !active_exists {
            self.active = Some(fallback.to_string());
        }
    }
}

fn teardown(connection: Arc<SessionConnection>) {
    tokio::spawn(async move {
        connection.disconnect().await;
    });
}
