//! Bridges text between the local clipboard and the remote session's
//! clipboard stream.
//!
//! Inbound payloads are never applied silently: they park in the
//! bridge until the user acknowledges or dismisses them. Outbound
//! pushes are single-flight per session and only count as delivered
//! once the stream's end-of-stream marker went out.

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

#[cfg(not(test))]
use copypasta::{ClipboardContext, ClipboardProvider};

use crate::session::connection::SessionConnection;
use crate::tunnel::{ClipboardPayload, TunnelError};

#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("no inbound clipboard payload pending")]
    NothingPending,
    #[error("local clipboard unavailable: {0}")]
    Local(String),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}


#[cfg(not(test))]
mod local {
    use super::*;

    pub fn set(contents: &str) -> Result<(), String> {
        let mut ctx = ClipboardContext::new().map_err(|err| err.to_string())?;
        ctx.set_contents(contents.to_string())
            .map_err(|err| err.to_string())
    }

    pub fn get() -> Result<String, String> {
        let mut ctx = ClipboardContext::new().map_err(|err| err.to_string())?;
        ctx.get_contents().map_err(|err| err.to_string())
    }
}

pub struct ClipboardBridge {
    connection: Arc<SessionConnection>,
    pending: Arc<Mutex<Option<ClipboardPayload>>>,
    // Serializes outbound pushes; a second push waits for the first
    // stream to terminate.
    outbound: AsyncMutex<()>,
    inbound_task: Option<tokio::task::JoinHandle<()>>,
}

impl ClipboardBridge {
    /// Attach to a session. Claims the session's inbound clipboard
    /// event stream; only one bridge per session receives payloads.
    pub fn attach(connection: Arc<SessionConnection>) -> Self {
        let pending = Arc::new(Mutex::new(None));
        let inbound_task = match connection.take_clipboard_events() {
            Some(mut events) => {
                let pending = pending.clone();
                Some(tokio::spawn(async move {
                    while let Some(payload) = events.recv().await {
                        debug!(
                            target = "console::clipboard",
                            mime = %payload.mime,
                            bytes = payload.text.len(),
                            "inbound clipboard parked for acknowledgement"
                        );
                        // Latest payload wins; no history is kept.
                        *pending.lock() = Some(payload);
                    }
                }))
            }
            None => {
                warn!(
                    target = "console::clipboard",
                    "clipboard events already claimed; bridge is outbound-only"
                );
                None
            }
        };
        Self {
            connection,
            pending,
            outbound: AsyncMutex::new(()),
            inbound_task,
        }
    }

    /// The inbound payload awaiting user acknowledgement, if any.
    pub fn pending_inbound(&self) -> Option<ClipboardPayload> {
        self.pending.lock().clone()
    }

    /// User accepted the inbound payload: write it to the local
    /// clipboard and clear it.
    pub fn acknowledge_inbound(&self) -> Result<ClipboardPayload, ClipboardError> {
        let payload = self
            .pending
            .lock()
            .take()
            .ok_or(ClipboardError::NothingPending)?;
        local::set(&payload.text).map_err(ClipboardError::Local)?;
        Ok(payload)
    }

    pub fn dismiss_inbound(&self) {
        *self.pending.lock() = None;
    }

    /// Read the local clipboard, e.g. to prefill an outbound push.
    pub fn capture_local(&self) -> Result<String, ClipboardError> {
        local::get().map_err(ClipboardError::Local)
    }

    /// Send text to the remote clipboard. The payload is delivered
    /// only once end-of-stream is signaled; a failure mid-stream
    /// leaves the bridge idle for the user to retry.
    pub async fn push_outbound(&self, text: &str, mime: &str) -> Result<(), ClipboardError> {
        let _guard = self.outbound.lock().await;
        let mut sink = self.connection.open_clipboard(mime).await?;
        sink.write(text.as_bytes()).await?;
        sink.finish().await?;
        Ok(())
    }
}

impl Drop for ClipboardBridge {
    fn drop(&mut self) {
        if let Some(task) = self.inbound_task.take() {
            task.abort();
        }
    }
}
