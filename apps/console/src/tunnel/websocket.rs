use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};
use url::Url;

use super::{
    ClientState, ClipboardPayload, ClipboardSink, DisplaySize, Protocol, Tunnel, TunnelError,
    TunnelEvent, TunnelFactory, TunnelHandle, TunnelParams, TunnelState, TunnelStatus,
};

/// JSON frames exchanged after the connection parameter frame. Unknown
/// frame types are ignored so the backend can extend the protocol.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireFrame {
    State { state: ClientState },
    Tunnel { state: TunnelState },
    Error { code: u32, message: String },
    Resize { width: u32, height: u32 },
    Clipboard { data: String, mime: String, last: bool },
    Input { data: String },
    Size { width: u32, height: u32 },
    Output { data: String },
    #[serde(other)]
    Unknown,
}

/// Opens one framed WebSocket per connection attempt against
/// `{endpoint}/tunnels/{session_id}`.
pub struct WebSocketTunnelFactory {
    endpoint: Url,
}

impl WebSocketTunnelFactory {
    pub fn new(endpoint: Url) -> Self {
        Self { endpoint }
    }

    fn tunnel_url(&self, session_id: &str) -> Result<Url, TunnelError> {
        let mut url = self
            .endpoint
            .join(&format!("tunnels/{session_id}"))
            .map_err(|err| TunnelError::Encoding(format!("invalid tunnel url: {err}")))?;
        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            _ => "wss",
        };
        url.set_scheme(scheme)
            .map_err(|_| TunnelError::Encoding("unable to set websocket scheme".into()))?;
        Ok(url)
    }
}

#[async_trait]
impl TunnelFactory for WebSocketTunnelFactory {
    async fn open(
        &self,
        session_id: &str,
        protocol: Protocol,
        params: TunnelParams,
    ) -> Result<TunnelHandle, TunnelError> {
        let url = self.tunnel_url(session_id)?;
        debug!(target = "console::tunnel", %url, %protocol, "opening websocket tunnel");
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TunnelError::Transport(err.to_string()))?;
        let (mut ws_sink, ws_source) = ws_stream.split();

        let param_frame = serde_json::to_string(&params)
            .map_err(|err| TunnelError::Encoding(err.to_string()))?;
        ws_sink
            .send(Message::Text(param_frame))
            .await
            .map_err(|err| TunnelError::Transport(err.to_string()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();
        let connected = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(pump_outbound(out_rx, ws_sink));
        let reader = tokio::spawn(pump_inbound(
            ws_source,
            events_tx.clone(),
            connected.clone(),
        ));

        let tunnel = Arc::new(WebSocketTunnel {
            out: out_tx,
            connected,
            closing: AtomicBool::new(false),
            tasks: parking_lot::Mutex::new(vec![writer, reader]),
        });
        let _ = events_tx.send(TunnelEvent::Transport(TunnelState::Connecting));
        Ok(TunnelHandle {
            tunnel,
            events: events_rx,
        })
    }
}

pub struct WebSocketTunnel {
    out: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
    closing: AtomicBool,
    tasks: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl WebSocketTunnel {
    fn send_frame(&self, frame: &WireFrame) -> Result<(), TunnelError> {
        if !self.is_connected() {
            return Err(TunnelError::NotConnected);
        }
        let text =
            serde_json::to_string(frame).map_err(|err| TunnelError::Encoding(err.to_string()))?;
        self.out
            .send(Message::Text(text))
            .map_err(|err| TunnelError::Transport(err.to_string()))
    }
}

#[async_trait]
impl Tunnel for WebSocketTunnel {
    async fn send_input(&self, data: &[u8]) -> Result<(), TunnelError> {
        self.send_frame(&WireFrame::Input {
            data: BASE64.encode(data),
        })
    }

    async fn send_size(&self, size: DisplaySize) -> Result<(), TunnelError> {
        self.send_frame(&WireFrame::Size {
            width: size.width,
            height: size.height,
        })
    }

    async fn open_clipboard(&self, mime: &str) -> Result<Box<dyn ClipboardSink>, TunnelError> {
        if !self.is_connected() {
            return Err(TunnelError::NotConnected);
        }
        Ok(Box::new(WebSocketClipboardSink {
            out: self.out.clone(),
            mime: mime.to_string(),
        }))
    }

    async fn disconnect(&self) -> Result<(), TunnelError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.out.send(Message::Close(None));
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct WebSocketClipboardSink {
    out: mpsc::UnboundedSender<Message>,
    mime: String,
}

impl WebSocketClipboardSink {
    fn send_chunk(&self, chunk: &[u8], last: bool) -> Result<(), TunnelError> {
        let frame = WireFrame::Clipboard {
            data: BASE64.encode(chunk),
            mime: self.mime.clone(),
            last,
        };
        let text =
            serde_json::to_string(&frame).map_err(|err| TunnelError::Encoding(err.to_string()))?;
        self.out
            .send(Message::Text(text))
            .map_err(|err| TunnelError::Transport(err.to_string()))
    }
}

#[async_trait]
impl ClipboardSink for WebSocketClipboardSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TunnelError> {
        self.send_chunk(chunk, false)
    }

    async fn finish(self: Box<Self>) -> Result<(), TunnelError> {
        self.send_chunk(&[], true)
    }
}

async fn pump_outbound(
    mut out_rx: mpsc::UnboundedReceiver<Message>,
    mut ws_sink: impl SinkExt<Message> + Unpin,
) {
    while let Some(message) = out_rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if ws_sink.send(message).await.is_err() {
            break;
        }
        if closing {
            break;
        }
    }
}

async fn pump_inbound(
    mut ws_source: impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
    + Unpin,
    events: mpsc::UnboundedSender<TunnelEvent>,
    connected: Arc<AtomicBool>,
) {
    // Inbound clipboard chunks accumulate until the last-marked frame.
    let mut clipboard_buf: Vec<u8> = Vec::new();
    let mut clipboard_mime = String::from("text/plain");

    while let Some(message) = ws_source.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let frame = match serde_json::from_str::<WireFrame>(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        trace!(target = "console::tunnel", error = %err, "unparseable frame");
                        continue;
                    }
                };
                match frame {
                    WireFrame::State { state } => {
                        let _ = events.send(TunnelEvent::Client(state));
                    }
                    WireFrame::Tunnel { state } => {
                        let _ = events.send(TunnelEvent::Transport(state));
                    }
                    WireFrame::Error { code, message } => {
                        let _ = events.send(TunnelEvent::Status(TunnelStatus { code, message }));
                    }
                    WireFrame::Resize { width, height } => {
                        let _ = events.send(TunnelEvent::Resize(DisplaySize { width, height }));
                    }
                    WireFrame::Clipboard { data, mime, last } => {
                        match BASE64.decode(data.as_bytes()) {
                            Ok(chunk) => clipboard_buf.extend_from_slice(&chunk),
                            Err(err) => {
                                warn!(target = "console::tunnel", error = %err, "bad clipboard chunk");
                                continue;
                            }
                        }
                        clipboard_mime = mime;
                        if last {
                            let text = String::from_utf8_lossy(&clipboard_buf).into_owned();
                            clipboard_buf.clear();
                            let _ = events.send(TunnelEvent::Clipboard(ClipboardPayload {
                                text,
                                mime: std::mem::replace(
                                    &mut clipboard_mime,
                                    "text/plain".into(),
                                ),
                            }));
                        }
                    }
                    WireFrame::Output { data } => {
                        if let Ok(bytes) = BASE64.decode(data.as_bytes()) {
                            let _ = events.send(TunnelEvent::Output(bytes));
                        }
                    }
                    WireFrame::Input { .. } | WireFrame::Size { .. } | WireFrame::Unknown => {}
                }
            }
            Ok(Message::Binary(data)) => {
                let _ = events.send(TunnelEvent::Output(data));
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(target = "console::tunnel", error = %err, "websocket read failed");
                let _ = events.send(TunnelEvent::Transport(TunnelState::Unstable));
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    let _ = events.send(TunnelEvent::Transport(TunnelState::Closed));
}
