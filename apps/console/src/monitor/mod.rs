//! Read-only observation of a live session.
//!
//! A monitor opens a parallel, output-only tunnel keyed by an existing
//! session id; it exposes no input path at all, and tearing it down
//! never touches the primary session. Sharing mints a token-scoped
//! viewer URL through the backend; the relay only surfaces the URL and
//! its cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::session::connection::ConnectionSnapshot;
use crate::session::{SessionError, SessionManager, ShareDescriptor};
use crate::tunnel::{
    ClientState, DisplaySize, Protocol, Tunnel, TunnelError, TunnelEvent, TunnelFactory,
    TunnelParams, TunnelState,
};

pub struct SessionMonitor {
    tunnel: Arc<dyn Tunnel>,
    state_tx: watch::Sender<ConnectionSnapshot>,
    output_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    pump: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SessionMonitor {
    /// Attach an output-only stream to an existing session.
    pub async fn open(
        factory: Arc<dyn TunnelFactory>,
        session_id: &str,
        protocol: Protocol,
        viewport: DisplaySize,
    ) -> Result<Self, TunnelError> {
        let params = TunnelParams::for_protocol(protocol, viewport);
        let handle = factory.open(session_id, protocol, params).await?;
        debug!(target = "console::monitor", session_id = %session_id, "monitor stream opened");

        let (state_tx, _) = watch::channel(ConnectionSnapshot {
            session_id: Some(session_id.to_string()),
            client_state: ClientState::Connecting,
            tunnel_state: TunnelState::Connecting,
            status: None,
            display: None,
        });
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_monitor(handle.events, state_tx.clone(), output_tx));

        Ok(Self {
            tunnel: handle.tunnel,
            state_tx,
            output_rx: parking_lot::Mutex::new(Some(output_rx)),
            pump: parking_lot::Mutex::new(Some(pump)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state_tx.borrow().clone()
    }

    /// Rendered output; takeable once by whatever displays the
    /// monitored session.
    pub fn take_output_events(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.output_rx.lock().take()
    }

    /// Close the viewer stream. Idempotent, and independent of the
    /// primary session's tunnel.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
        if let Err(err) = self.tunnel.disconnect().await {
            warn!(target = "console::monitor", error = %err, "monitor disconnect failed");
        }
        self.state_tx.send_modify(|snapshot| {
            snapshot.client_state = ClientState::Disconnected;
            snapshot.tunnel_state = TunnelState::Closed;
        });
    }
}

async fn pump_monitor(
    mut events: mpsc::UnboundedReceiver<TunnelEvent>,
    state_tx: watch::Sender<ConnectionSnapshot>,
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            TunnelEvent::Client(state) => {
                state_tx.send_modify(|snapshot| snapshot.client_state = state);
            }
            TunnelEvent::Transport(state) => {
                state_tx.send_modify(|snapshot| snapshot.tunnel_state = state);
            }
            TunnelEvent::Status(status) => {
                state_tx.send_modify(|snapshot| snapshot.status = Some(status));
            }
            TunnelEvent::Resize(size) => {
                state_tx.send_modify(|snapshot| snapshot.display = Some(size));
            }
            TunnelEvent::Output(bytes) => {
                let _ = output_tx.send(bytes);
            }
            // Viewers never receive the session's clipboard.
            TunnelEvent::Clipboard(_) => {}
        }
    }
}

/// Owns the share-URL lifecycle for one session: create and cancel.
/// Authorization of viewers is entirely the backend's concern.
pub struct ShareController {
    manager: SessionManager,
    session_id: String,
    active: parking_lot::Mutex<Option<ShareDescriptor>>,
}

impl ShareController {
    pub fn new(manager: SessionManager, session_id: impl Into<String>) -> Self {
        Self {
            manager,
            session_id: session_id.into(),
            active: parking_lot::Mutex::new(None),
        }
    }

    pub fn active_share(&self) -> Option<ShareDescriptor> {
        self.active.lock().clone()
    }

    pub async fn create(
        &self,
        share_token: Option<&str>,
    ) -> Result<ShareDescriptor, SessionError> {
        let share = self
            .manager
            .create_share(&self.session_id, share_token)
            .await?;
        *self.active.lock() = Some(share.clone());
        Ok(share)
    }

    /// Invalidate the shared URL.
    pub async fn cancel(&self) -> Result<(), SessionError> {
        self.manager.cancel_share(&self.session_id).await?;
        *self.active.lock() = None;
        Ok(())
    }
}
