use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod mock;
pub mod websocket;

/// Remote-access protocol carried by a session. Decides which tunnel
/// variant is opened and which affordances (clipboard, resize, file
/// panel) apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    Ssh,
    Rdp,
    Vnc,
    Telnet,
    Kubernetes,
    HttpTerminal,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Ssh => "ssh",
            Protocol::Rdp => "rdp",
            Protocol::Vnc => "vnc",
            Protocol::Telnet => "telnet",
            Protocol::Kubernetes => "kubernetes",
            Protocol::HttpTerminal => "http-terminal",
        }
    }

    /// Terminal-class protocols take line input and participate in
    /// bulk command fan-out.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Protocol::Ssh | Protocol::Telnet | Protocol::Kubernetes | Protocol::HttpTerminal
        )
    }

    pub fn supports_clipboard(self) -> bool {
        matches!(self, Protocol::Ssh | Protocol::Rdp | Protocol::Vnc)
    }

    pub fn supports_display_resize(self) -> bool {
        !matches!(self, Protocol::Telnet)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol-level state reported by the remote client library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ClientState {
    Idle,
    Connecting,
    Waiting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// Transport-level connectivity, independent of [`ClientState`]. The
/// socket can stay open while the client logically disconnects, and
/// vice versa; presentation combines the two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TunnelState {
    Connecting,
    Open,
    Closed,
    Unstable,
}

/// Terminal status reported by the tunnel; a code above zero is an
/// error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatus {
    pub code: u32,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisplaySize {
    pub width: u32,
    pub height: u32,
}

/// Remote clipboard payload. No history is kept; at most one inbound
/// payload is pending at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClipboardPayload {
    pub text: String,
    pub mime: String,
}

/// Asynchronous notifications from the tunnel. Within one tunnel they
/// arrive in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelEvent {
    Client(ClientState),
    Transport(TunnelState),
    Status(TunnelStatus),
    Resize(DisplaySize),
    Clipboard(ClipboardPayload),
    /// Rendered output (terminal bytes or framed display updates),
    /// passed through opaquely to whatever renders it.
    Output(Vec<u8>),
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel is not connected")]
    NotConnected,
    #[error("tunnel transport error: {0}")]
    Transport(String),
    #[error("tunnel frame encoding failed: {0}")]
    Encoding(String),
    #[error("clipboard stream already in flight")]
    ClipboardBusy,
}

/// Connection parameters sent as the first frame after the socket
/// opens: cols/rows for terminal protocols, width/height/dpi for
/// graphical ones, plus the session auth token.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TunnelParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dpi: Option<u32>,
}

impl TunnelParams {
    pub fn terminal(cols: u16, rows: u16) -> Self {
        Self {
            cols: Some(cols),
            rows: Some(rows),
            ..Self::default()
        }
    }

    pub fn graphical(width: u32, height: u32, dpi: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            dpi: Some(dpi),
            ..Self::default()
        }
    }

    pub fn for_protocol(protocol: Protocol, size: DisplaySize) -> Self {
        if protocol.is_terminal() {
            // Nominal cell metrics; the first debounced resize refines them.
            let cols = (size.width / 8).clamp(20, 500) as u16;
            let rows = (size.height / 16).clamp(5, 200) as u16;
            Self::terminal(cols, rows)
        } else {
            Self::graphical(size.width, size.height, 96)
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Outbound clipboard stream. The payload counts as delivered only
/// after [`ClipboardSink::finish`] signals end-of-stream.
#[async_trait]
pub trait ClipboardSink: Send {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TunnelError>;
    async fn finish(self: Box<Self>) -> Result<(), TunnelError>;
}

/// Capability seam over the external streaming client. Implementations
/// deliver their notifications through the event receiver returned at
/// open time.
#[async_trait]
pub trait Tunnel: Send + Sync {
    async fn send_input(&self, data: &[u8]) -> Result<(), TunnelError>;

    async fn send_size(&self, size: DisplaySize) -> Result<(), TunnelError>;

    /// Open a fresh outbound clipboard stream for one payload.
    async fn open_clipboard(&self, mime: &str) -> Result<Box<dyn ClipboardSink>, TunnelError>;

    /// Request teardown. Must be idempotent.
    async fn disconnect(&self) -> Result<(), TunnelError>;

    fn is_connected(&self) -> bool;
}

/// A live tunnel plus the receiving half of its event stream.
pub struct TunnelHandle {
    pub tunnel: Arc<dyn Tunnel>,
    pub events: mpsc::UnboundedReceiver<TunnelEvent>,
}

/// Opens one tunnel per connection attempt, keyed by the negotiated
/// session id.
#[async_trait]
pub trait TunnelFactory: Send + Sync {
    async fn open(
        &self,
        session_id: &str,
        protocol: Protocol,
        params: TunnelParams,
    ) -> Result<TunnelHandle, TunnelError>;
}
