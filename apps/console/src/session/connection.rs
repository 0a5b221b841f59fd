//! One live remote-access session: negotiation, tunnel lifecycle, and
//! the derived presentation the tab UI renders from.
//!
//! Two independent signals drive presentation: the client library's
//! protocol state and the transport's connectivity state. They are
//! kept as separate enums and only combined by [`derive_presentation`];
//! the remote server can logically disconnect while the socket stays
//! open, and the socket can drop while the client still believes it is
//! connected.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, trace, warn};

use super::{SessionError, SessionManager};
use crate::session::auth::SecurityToken;
use crate::tunnel::{
    ClientState, ClipboardPayload, ClipboardSink, DisplaySize, Protocol, Tunnel, TunnelError,
    TunnelEvent, TunnelFactory, TunnelState, TunnelStatus,
};

/// Everything the UI needs to render one session's status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub session_id: Option<String>,
    pub client_state: ClientState,
    pub tunnel_state: TunnelState,
    pub status: Option<TunnelStatus>,
    pub display: Option<DisplaySize>,
}

impl ConnectionSnapshot {
    fn initial() -> Self {
        Self {
            session_id: None,
            client_state: ClientState::Idle,
            tunnel_state: TunnelState::Connecting,
            status: None,
            display: None,
        }
    }

    pub fn presentation(&self) -> Presentation {
        derive_presentation(self.client_state, self.tunnel_state, self.status.as_ref())
    }
}

/// What the session surface shows. `Error` takes precedence over
/// `Loading`; overlays are hidden only for `Connected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Presentation {
    Connected,
    Error {
        code: Option<u32>,
        message: String,
    },
    Loading {
        client_state: ClientState,
        tunnel_state: TunnelState,
    },
}

pub fn derive_presentation(
    client_state: ClientState,
    tunnel_state: TunnelState,
    status: Option<&TunnelStatus>,
) -> Presentation {
    if client_state == ClientState::Connected
        && matches!(tunnel_state, TunnelState::Open | TunnelState::Unstable)
    {
        return Presentation::Connected;
    }
    let status_error = status.filter(|status| status.code > 0);
    if status_error.is_some()
        || client_state == ClientState::Disconnected
        || tunnel_state == TunnelState::Closed
    {
        return Presentation::Error {
            code: status_error.map(|status| status.code),
            message: status_error
                .map(|status| status.message.clone())
                .unwrap_or_else(|| "disconnected".to_string()),
        };
    }
    Presentation::Loading {
        client_state,
        tunnel_state,
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("session negotiation failed: {0}")]
    Negotiation(#[from] SessionError),
    #[error("tunnel open failed: {0}")]
    Tunnel(#[from] TunnelError),
    /// A newer connect or a teardown started while this attempt was in
    /// flight; its result was discarded.
    #[error("connection attempt superseded")]
    Superseded,
}

struct ActiveAttempt {
    generation: u64,
    session_id: String,
    tunnel: Arc<dyn Tunnel>,
    pump: tokio::task::JoinHandle<()>,
}

/// Owns one session end to end. Reconnect is never automatic: a failed
/// or dropped session stays in its error presentation until the user
/// asks for a fresh [`SessionConnection::connect`].
pub struct SessionConnection {
    asset_id: String,
    protocol: Protocol,
    manager: SessionManager,
    factory: Arc<dyn TunnelFactory>,
    state_tx: watch::Sender<ConnectionSnapshot>,
    generation: Arc<AtomicU64>,
    active: AsyncMutex<Option<ActiveAttempt>>,
    viewport: parking_lot::Mutex<DisplaySize>,
    clipboard_tx: mpsc::UnboundedSender<ClipboardPayload>,
    clipboard_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ClipboardPayload>>>,
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
    output_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl SessionConnection {
    pub fn new(
        asset_id: impl Into<String>,
        protocol: Protocol,
        manager: SessionManager,
        factory: Arc<dyn TunnelFactory>,
        viewport: DisplaySize,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionSnapshot::initial());
        let (clipboard_tx, clipboard_rx) = mpsc::unbounded_channel();
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            asset_id: asset_id.into(),
            protocol,
            manager,
            factory,
            state_tx,
            generation: Arc::new(AtomicU64::new(0)),
            active: AsyncMutex::new(None),
            viewport: parking_lot::Mutex::new(viewport),
            clipboard_tx,
            clipboard_rx: parking_lot::Mutex::new(Some(clipboard_rx)),
            output_tx,
            output_rx: parking_lot::Mutex::new(Some(output_rx)),
        }
    }

    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionSnapshot> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        self.state_tx.borrow().clone()
    }

    /// Inbound remote-clipboard payloads; takeable once, by the
    /// clipboard bridge.
    pub fn take_clipboard_events(&self) -> Option<mpsc::UnboundedReceiver<ClipboardPayload>> {
        self.clipboard_rx.lock().take()
    }

    /// Rendered output bytes; takeable once, by whatever renders the
    /// session surface.
    pub fn take_output_events(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.output_rx.lock().take()
    }

    pub fn set_viewport(&self, size: DisplaySize) {
        *self.viewport.lock() = size;
    }

    /// Full negotiation from scratch: a new backend session, a new
    /// tunnel. Any prior attempt, pending or live, is torn down first;
    /// a stale attempt's late notifications are discarded via the
    /// generation counter.
    pub async fn connect(
        &self,
        security_token: Option<&SecurityToken>,
    ) -> Result<(), ConnectError> {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.teardown_active().await;

        self.state_tx.send_replace(ConnectionSnapshot {
            session_id: None,
            client_state: ClientState::Connecting,
            tunnel_state: TunnelState::Connecting,
            status: None,
            display: None,
        });

        let viewport = *self.viewport.lock();
        let mut params = crate::tunnel::TunnelParams::for_protocol(self.protocol, viewport);
        if let Some(token) = security_token {
            params = params.with_token(token.as_str());
        }

        let descriptor = match self
            .manager
            .create_session(&self.asset_id, self.protocol, security_token, &params)
            .await
        {
            Ok(descriptor) => descriptor,
            Err(err) => {
                if self.generation.load(Ordering::SeqCst) == generation {
                    self.state_tx.send_modify(|snapshot| {
                        snapshot.client_state = ClientState::Disconnected;
                        snapshot.tunnel_state = TunnelState::Closed;
                    });
                }
                return Err(err.into());
            }
        };

        // The tab may have been closed or reconnected while the
        // negotiation was in flight; do not apply a stale session.
        if self.generation.load(Ordering::SeqCst) != generation {
            let manager = self.manager.clone();
            let stale_id = descriptor.id.clone();
            tokio::spawn(async move {
                let _ = manager.disconnect_session(&stale_id).await;
            });
            return Err(ConnectError::Superseded);
        }

        let handle = match self
            .factory
            .open(&descriptor.id, self.protocol, params)
            .await
        {
            Ok(handle) => handle,
            Err(err) => {
                if self.generation.load(Ordering::SeqCst) == generation {
                    self.state_tx.send_modify(|snapshot| {
                        snapshot.session_id = Some(descriptor.id.clone());
                        snapshot.client_state = ClientState::Disconnected;
                        snapshot.tunnel_state = TunnelState::Closed;
                    });
                }
                return Err(err.into());
            }
        };

        if self.generation.load(Ordering::SeqCst) != generation {
            let _ = handle.tunnel.disconnect().await;
            return Err(ConnectError::Superseded);
        }

        self.state_tx.send_modify(|snapshot| {
            snapshot.session_id = Some(descriptor.id.clone());
            snapshot.display = match (descriptor.width, descriptor.height) {
                (Some(width), Some(height)) => Some(DisplaySize { width, height }),
                _ => None,
            };
        });

        let pump = tokio::spawn(pump_events(
            handle.events,
            handle.tunnel.clone(),
            self.state_tx.clone(),
            self.generation.clone(),
            generation,
            self.protocol,
            viewport,
            self.clipboard_tx.clone(),
            self.output_tx.clone(),
        ));

        let mut active = self.active.lock().await;
        *active = Some(ActiveAttempt {
            generation,
            session_id: descriptor.id.clone(),
            tunnel: handle.tunnel,
            pump,
        });
        debug!(
            target = "console::session",
            asset_id = %self.asset_id,
            session_id = %descriptor.id,
            generation,
            "connection attempt established"
        );
        Ok(())
    }

    /// Tear the session down. Idempotent: a second call on an already
    /// closed session is a no-op.
    pub async fn disconnect(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if !self.teardown_active().await {
            return;
        }
        self.state_tx.send_modify(|snapshot| {
            snapshot.client_state = ClientState::Disconnected;
            snapshot.tunnel_state = TunnelState::Closed;
        });
    }

    async fn teardown_active(&self) -> bool {
        let attempt = { self.active.lock().await.take() };
        let Some(attempt) = attempt else {
            return false;
        };
        trace!(
            target = "console::session",
            session_id = %attempt.session_id,
            generation = attempt.generation,
            "tearing down attempt"
        );
        attempt.pump.abort();
        if let Err(err) = attempt.tunnel.disconnect().await {
            warn!(target = "console::session", error = %err, "tunnel disconnect failed");
        }
        let manager = self.manager.clone();
        let session_id = attempt.session_id;
        tokio::spawn(async move {
            if let Err(err) = manager.disconnect_session(&session_id).await {
                debug!(target = "console::session", error = %err, "backend disconnect skipped");
            }
        });
        true
    }

    /// Forward input to the live tunnel. Refused while the session is
    /// not presenting as connected.
    pub async fn send_input(&self, data: &[u8]) -> Result<(), TunnelError> {
        if self.snapshot().presentation() != Presentation::Connected {
            return Err(TunnelError::NotConnected);
        }
        let tunnel = self.active_tunnel().await.ok_or(TunnelError::NotConnected)?;
        tunnel.send_input(data).await
    }

    /// Push the local viewport size to the remote side. A no-op unless
    /// the client is connected and the protocol resizes.
    pub async fn send_size(&self, size: DisplaySize) -> Result<(), TunnelError> {
        self.set_viewport(size);
        if !self.protocol.supports_display_resize() {
            return Ok(());
        }
        if self.snapshot().client_state != ClientState::Connected {
            return Ok(());
        }
        let tunnel = self.active_tunnel().await.ok_or(TunnelError::NotConnected)?;
        tunnel.send_size(size).await
    }

    pub async fn open_clipboard(&self, mime: &str) -> Result<Box<dyn ClipboardSink>, TunnelError> {
        let tunnel = self.active_tunnel().await.ok_or(TunnelError::NotConnected)?;
        tunnel.open_clipboard(mime).await
    }

    async fn active_tunnel(&self) -> Option<Arc<dyn Tunnel>> {
        self.active.lock().await.as_ref().map(|a| a.tunnel.clone())
    }
}

#[allow(clippy::too_many_arguments)]
async fn pump_events(
    mut events: mpsc::UnboundedReceiver<TunnelEvent>,
    tunnel: Arc<dyn Tunnel>,
    state_tx: watch::Sender<ConnectionSnapshot>,
    current_generation: Arc<AtomicU64>,
    generation: u64,
    protocol: Protocol,
    viewport: DisplaySize,
    clipboard_tx: mpsc::UnboundedSender<ClipboardPayload>,
    output_tx: mpsc::UnboundedSender<Vec<u8>>,
) {
    let mut seen_connected = false;
    while let Some(event) = events.recv().await {
        if current_generation.load(Ordering::SeqCst) != generation {
            trace!(
                target = "console::session",
                generation, "discarding stale tunnel event"
            );
            break;
        }
        match event {
            TunnelEvent::Client(state) => {
                state_tx.send_modify(|snapshot| snapshot.client_state = state);
                if state == ClientState::Connected && !seen_connected {
                    seen_connected = true;
                    // One-time probe so the remote display matches the
                    // viewport that existed before we connected.
                    if protocol.supports_display_resize() {
                        if let Err(err) = tunnel.send_size(viewport).await {
                            warn!(target = "console::session", error = %err, "size probe failed");
                        }
                    }
                }
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
            TunnelEvent::Clipboard(payload) => {
                let _ = clipboard_tx.send(payload);
            }
            TunnelEvent::Output(bytes) => {
                let _ = output_tx.send(bytes);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsoleConfig;
    use crate::session::mock::MockSessionBackend;
    use crate::tunnel::mock::MockTunnelFactory;
    use std::time::Duration;
    use tokio::time::timeout;

    const ALL_CLIENT: [ClientState; 6] = [
        ClientState::Idle,
        ClientState::Connecting,
        ClientState::Waiting,
        ClientState::Connected,
        ClientState::Disconnecting,
        ClientState::Disconnected,
    ];
    const ALL_TUNNEL: [TunnelState; 4] = [
        TunnelState::Connecting,
        TunnelState::Open,
        TunnelState::Closed,
        TunnelState::Unstable,
    ];

    #[test]
    fn connected_rule_holds_across_all_combinations() {
        for client_state in ALL_CLIENT {
            for tunnel_state in ALL_TUNNEL {
                let presentation = derive_presentation(client_state, tunnel_state, None);
                let expect_connected = client_state == ClientState::Connected
                    && matches!(tunnel_state, TunnelState::Open | TunnelState::Unstable);
                assert_eq!(
                    presentation == Presentation::Connected,
                    expect_connected,
                    "client={client_state:?} tunnel={tunnel_state:?}"
                );
                if !expect_connected {
                    let expect_error = client_state == ClientState::Disconnected
                        || tunnel_state == TunnelState::Closed;
                    match presentation {
                        Presentation::Error { .. } => assert!(
                            expect_error,
                            "unexpected error for client={client_state:?} tunnel={tunnel_state:?}"
                        ),
                        Presentation::Loading { .. } => assert!(
                            !expect_error,
                            "expected error for client={client_state:?} tunnel={tunnel_state:?}"
                        ),
                        Presentation::Connected => unreachable!(),
                    }
                }
            }
        }
    }

    #[test]
    fn status_code_forces_error_over_loading() {
        let status = TunnelStatus {
            code: 519,
            message: "session closed by server".into(),
        };
        let presentation = derive_presentation(
            ClientState::Connecting,
            TunnelState::Open,
            Some(&status),
        );
        assert_eq!(
            presentation,
            Presentation::Error {
                code: Some(519),
                message: "session closed by server".into()
            }
        );
    }

    #[test]
    fn zero_status_code_is_not_an_error() {
        let status = TunnelStatus {
            code: 0,
            message: "ok".into(),
        };
        let presentation =
            derive_presentation(ClientState::Waiting, TunnelState::Open, Some(&status));
        assert!(matches!(presentation, Presentation::Loading { .. }));
    }

    fn connection_with(
        factory: Arc<MockTunnelFactory>,
        backend: MockSessionBackend,
    ) -> SessionConnection {
        let config = ConsoleConfig::new("bastion.example.com").expect("config");
        let manager = SessionManager::with_backend(config, Arc::new(backend));
        SessionConnection::new(
            "asset-1",
            Protocol::Ssh,
            manager,
            factory,
            DisplaySize {
                width: 1024,
                height: 768,
            },
        )
    }

    async fn wait_connected(connection: &SessionConnection) {
        let mut rx = connection.subscribe();
        timeout(
            Duration::from_secs(1),
            rx.wait_for(|snapshot| snapshot.presentation() == Presentation::Connected),
        )
        .await
        .expect("timed out waiting for connected")
        .expect("watch closed");
    }

    #[tokio::test]
    async fn connect_reaches_connected_presentation() {
        let factory = Arc::new(MockTunnelFactory::new());
        let connection = connection_with(factory.clone(), MockSessionBackend::new());
        connection.connect(None).await.expect("connect");
        wait_connected(&connection).await;
        let snapshot = connection.snapshot();
        assert_eq!(snapshot.session_id.as_deref(), Some("sess-1"));
    }

    #[tokio::test]
    async fn tunnel_close_while_client_connected_shows_error() {
        let factory = Arc::new(MockTunnelFactory::new());
        let connection = connection_with(factory.clone(), MockSessionBackend::new());
        connection.connect(None).await.expect("connect");
        wait_connected(&connection).await;

        let tunnel = factory.last_opened().expect("tunnel");
        tunnel.emit(TunnelEvent::Transport(TunnelState::Closed));

        let mut rx = connection.subscribe();
        let snapshot = timeout(
            Duration::from_secs(1),
            rx.wait_for(|snapshot| {
                matches!(snapshot.presentation(), Presentation::Error { .. })
            }),
        )
        .await
        .expect("timed out")
        .expect("watch closed")
        .clone();
        // Client still says connected; the tunnel signal must win.
        assert_eq!(snapshot.client_state, ClientState::Connected);
    }

    #[tokio::test]
    async fn size_probe_fires_once_on_first_connected() {
        let factory = Arc::new(MockTunnelFactory::new());
        let connection = connection_with(factory.clone(), MockSessionBackend::new());
        connection.connect(None).await.expect("connect");
        wait_connected(&connection).await;

        let tunnel = factory.last_opened().expect("tunnel");
        // A repeated CONNECTED notification must not re-probe.
        tunnel.emit(TunnelEvent::Client(ClientState::Connected));
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(tunnel.sent_sizes().len(), 1);
    }

    #[tokio::test]
    async fn reconnect_discards_stale_connected_notification() {
        let factory = Arc::new(MockTunnelFactory::silent());
        let connection = connection_with(factory.clone(), MockSessionBackend::new());

        connection.connect(None).await.expect("first connect");
        connection.connect(None).await.expect("second connect");
        let tunnels = factory.opened();
        assert_eq!(tunnels.len(), 2);

        // Late CONNECTED from the abandoned first attempt.
        tunnels[0].emit(TunnelEvent::Transport(TunnelState::Open));
        tunnels[0].emit(TunnelEvent::Client(ClientState::Connected));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_ne!(connection.snapshot().presentation(), Presentation::Connected);

        tunnels[1].emit(TunnelEvent::Transport(TunnelState::Open));
        tunnels[1].emit(TunnelEvent::Client(ClientState::Connected));
        wait_connected(&connection).await;
        assert_eq!(connection.snapshot().session_id.as_deref(), Some("sess-2"));
    }

    #[tokio::test]
    async fn disconnect_twice_is_idempotent() {
        let factory = Arc::new(MockTunnelFactory::new());
        let connection = connection_with(factory.clone(), MockSessionBackend::new());
        connection.connect(None).await.expect("connect");
        wait_connected(&connection).await;

        connection.disconnect().await;
        connection.disconnect().await;

        let tunnel = factory.last_opened().expect("tunnel");
        assert_eq!(tunnel.disconnect_calls(), 1);
        let snapshot = connection.snapshot();
        assert_eq!(snapshot.client_state, ClientState::Disconnected);
        assert!(matches!(
            snapshot.presentation(),
            Presentation::Error { .. }
        ));
    }

    #[tokio::test]
    async fn negotiation_failure_surfaces_step_up() {
        let backend = MockSessionBackend::new();
        backend.require_step_up(vec!["one-time-code".into()]);
        let factory = Arc::new(MockTunnelFactory::new());
        let connection = connection_with(factory.clone(), backend);
        let err = connection.connect(None).await.expect_err("must refuse");
        assert!(matches!(
            err,
            ConnectError::Negotiation(SessionError::RequiresStepUp { .. })
        ));
        assert!(factory.opened().is_empty());
        assert!(matches!(
            connection.snapshot().presentation(),
            Presentation::Error { .. }
        ));
    }

    #[tokio::test]
    async fn input_refused_until_connected() {
        let factory = Arc::new(MockTunnelFactory::silent());
        let connection = connection_with(factory.clone(), MockSessionBackend::new());
        connection.connect(None).await.expect("connect");
        let err = connection.send_input(b"ls\n").await.expect_err("refuse");
        assert!(matches!(err, TunnelError::NotConnected));
    }
}
