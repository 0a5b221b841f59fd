use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

use super::{
    ClipboardSink, DisplaySize, Protocol, Tunnel, TunnelError, TunnelEvent, TunnelFactory,
    TunnelHandle, TunnelParams,
};

/// Scriptable tunnel for tests: records everything sent into it and
/// replays whatever events the test injects.
pub struct MockTunnel {
    connected: AtomicBool,
    disconnect_calls: AtomicUsize,
    fail_input: AtomicBool,
    inputs: Mutex<Vec<Vec<u8>>>,
    sizes: Mutex<Vec<DisplaySize>>,
    clipboard_payloads: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
    events: mpsc::UnboundedSender<TunnelEvent>,
    pub opened_params: TunnelParams,
}

impl MockTunnel {
    pub fn open_pair(params: TunnelParams) -> (Arc<Self>, TunnelHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tunnel = Arc::new(Self {
            connected: AtomicBool::new(true),
            disconnect_calls: AtomicUsize::new(0),
            fail_input: AtomicBool::new(false),
            inputs: Mutex::new(Vec::new()),
            sizes: Mutex::new(Vec::new()),
            clipboard_payloads: Arc::new(Mutex::new(Vec::new())),
            events: tx,
            opened_params: params,
        });
        let handle = TunnelHandle {
            tunnel: tunnel.clone(),
            events: rx,
        };
        (tunnel, handle)
    }

    /// Inject an event as if the remote side emitted it.
    pub fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }

    pub fn fail_next_input(&self) {
        self.fail_input.store(true, Ordering::SeqCst);
    }

    pub fn sent_inputs(&self) -> Vec<Vec<u8>> {
        self.inputs.lock().clone()
    }

    pub fn sent_sizes(&self) -> Vec<DisplaySize> {
        self.sizes.lock().clone()
    }

    /// Clipboard payloads that reached end-of-stream, as (mime, data).
    pub fn finished_clipboard(&self) -> Vec<(String, Vec<u8>)> {
        self.clipboard_payloads.lock().clone()
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tunnel for MockTunnel {
    async fn send_input(&self, data: &[u8]) -> Result<(), TunnelError> {
        if self.fail_input.swap(false, Ordering::SeqCst) {
            return Err(TunnelError::Transport("scripted input failure".into()));
        }
        if !self.is_connected() {
            return Err(TunnelError::NotConnected);
        }
        self.inputs.lock().push(data.to_vec());
        Ok(())
    }

    async fn send_size(&self, size: DisplaySize) -> Result<(), TunnelError> {
        if !self.is_connected() {
            return Err(TunnelError::NotConnected);
        }
        self.sizes.lock().push(size);
        Ok(())
    }

    async fn open_clipboard(&self, mime: &str) -> Result<Box<dyn ClipboardSink>, TunnelError> {
        if !self.is_connected() {
            return Err(TunnelError::NotConnected);
        }
        Ok(Box::new(MockClipboardSink {
            mime: mime.to_string(),
            buffer: Vec::new(),
            sink: self.clipboard_payloads.clone(),
        }))
    }

    async fn disconnect(&self) -> Result<(), TunnelError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

struct MockClipboardSink {
    mime: String,
    buffer: Vec<u8>,
    sink: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

#[async_trait]
impl ClipboardSink for MockClipboardSink {
    async fn write(&mut self, chunk: &[u8]) -> Result<(), TunnelError> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<(), TunnelError> {
        self.sink.lock().push((self.mime, self.buffer));
        Ok(())
    }
}

/// Factory that hands out [`MockTunnel`]s and keeps a log of every
/// tunnel it opened. Each open replays the next scripted event batch,
/// or the default connect sequence when nothing is queued.
pub struct MockTunnelFactory {
    scripts: Mutex<Vec<Vec<TunnelEvent>>>,
    opened: Mutex<Vec<Arc<MockTunnel>>>,
    fail_next: AtomicBool,
    auto_connect: bool,
}

impl MockTunnelFactory {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(Vec::new()),
            opened: Mutex::new(Vec::new()),
            fail_next: AtomicBool::new(false),
            auto_connect: true,
        }
    }

    /// A factory whose tunnels stay silent until the test emits
    /// events itself.
    pub fn silent() -> Self {
        Self {
            auto_connect: false,
            ..Self::new()
        }
    }

    /// Queue the event batch replayed by the next open.
    pub fn push_script(&self, events: Vec<TunnelEvent>) {
        self.scripts.lock().push(events);
    }

    pub fn fail_next_open(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn opened(&self) -> Vec<Arc<MockTunnel>> {
        self.opened.lock().clone()
    }

    pub fn last_opened(&self) -> Option<Arc<MockTunnel>> {
        self.opened.lock().last().cloned()
    }

    fn default_script() -> Vec<TunnelEvent> {
        vec![
            TunnelEvent::Client(super::ClientState::Connecting),
            TunnelEvent::Transport(super::TunnelState::Open),
            TunnelEvent::Client(super::ClientState::Connected),
        ]
    }
}

impl Default for MockTunnelFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelFactory for MockTunnelFactory {
    async fn open(
        &self,
        _session_id: &str,
        _protocol: Protocol,
        params: TunnelParams,
    ) -> Result<TunnelHandle, TunnelError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(TunnelError::Transport("scripted open failure".into()));
        }
        let (tunnel, handle) = MockTunnel::open_pair(params);
        let script = {
            let mut scripts = self.scripts.lock();
            if scripts.is_empty() {
                if self.auto_connect {
                    Self::default_script()
                } else {
                    Vec::new()
                }
            } else {
                scripts.remove(0)
            }
        };
        for event in script {
            tunnel.emit(event);
        }
        self.opened.lock().push(tunnel);
        Ok(handle)
    }
}
