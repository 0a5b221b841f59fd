//! Keeps the remote display consistent with the local viewport:
//! viewport changes are coalesced and forwarded while connected, and
//! remote sizes are mapped to a client-side fit scale.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::debug;

use crate::session::connection::SessionConnection;
use crate::tunnel::DisplaySize;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Uniform scale that fits the remote display inside the viewport
/// without cropping. Returns `None` while the remote size is unknown
/// (zero either way); never scales past 1:1 unless `allow_upscale`.
pub fn fit_scale(viewport: DisplaySize, remote: DisplaySize, allow_upscale: bool) -> Option<f64> {
    if remote.width == 0 || remote.height == 0 || viewport.width == 0 || viewport.height == 0 {
        return None;
    }
    let scale = (viewport.width as f64 / remote.width as f64)
        .min(viewport.height as f64 / remote.height as f64);
    if allow_upscale {
        Some(scale)
    } else {
        Some(scale.min(1.0))
    }
}

/// Debounces viewport resize bursts into a single remote size update.
/// The update itself is a no-op unless the session is connected and
/// its protocol resizes; [`SessionConnection::send_size`] enforces
/// that.
pub struct GeometryNegotiator {
    viewport_tx: watch::Sender<Option<DisplaySize>>,
    task: tokio::task::JoinHandle<()>,
}

impl GeometryNegotiator {
    pub fn spawn(connection: Arc<SessionConnection>, debounce: Duration) -> Self {
        let (viewport_tx, viewport_rx) = watch::channel(None);
        let task = tokio::spawn(debounce_loop(connection, viewport_rx, debounce));
        Self { viewport_tx, task }
    }

    /// Record a local viewport resize. Rapid successive calls coalesce
    /// into one remote update carrying the final size.
    pub fn observe_viewport(&self, size: DisplaySize) {
        self.viewport_tx.send_replace(Some(size));
    }
}

impl Drop for GeometryNegotiator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn debounce_loop(
    connection: Arc<SessionConnection>,
    mut viewport_rx: watch::Receiver<Option<DisplaySize>>,
    debounce: Duration,
) {
    loop {
        if viewport_rx.changed().await.is_err() {
            break;
        }
        // Absorb further changes until the burst quiets down.
        loop {
            tokio::select! {
                _ = sleep(debounce) => break,
                changed = viewport_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
        let size = *viewport_rx.borrow();
        if let Some(size) = size {
            if let Err(err) = connection.send_size(size).await {
                debug!(target = "console::display", error = %err, "size update skipped");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsoleConfig;
    use crate::session::SessionManager;
    use crate::session::connection::Presentation;
    use crate::session::mock::MockSessionBackend;
    use crate::tunnel::Protocol;
    use crate::tunnel::mock::MockTunnelFactory;
    use tokio::time::timeout;

    #[test]
    fn scale_fits_without_cropping() {
        let viewport = DisplaySize {
            width: 1024,
            height: 768,
        };
        let remote = DisplaySize {
            width: 1920,
            height: 1080,
        };
        let scale = fit_scale(viewport, remote, false).expect("scale");
        assert!((scale - 1024.0 / 1920.0).abs() < 1e-9);
    }

    #[test]
    fn scale_never_exceeds_one_to_one_by_default() {
        let viewport = DisplaySize {
            width: 2560,
            height: 1440,
        };
        let remote = DisplaySize {
            width: 800,
            height: 600,
        };
        assert_eq!(fit_scale(viewport, remote, false), Some(1.0));
        let upscaled = fit_scale(viewport, remote, true).expect("scale");
        assert!(upscaled > 1.0);
    }

    #[test]
    fn unknown_remote_size_is_a_no_op() {
        let viewport = DisplaySize {
            width: 1024,
            height: 768,
        };
        let remote = DisplaySize {
            width: 0,
            height: 0,
        };
        assert_eq!(fit_scale(viewport, remote, false), None);
    }

    async fn connected_connection(factory: Arc<MockTunnelFactory>) -> Arc<SessionConnection> {
        let config = ConsoleConfig::new("bastion.example.com").expect("config");
        let manager = SessionManager::with_backend(config, Arc::new(MockSessionBackend::new()));
        let connection = Arc::new(SessionConnection::new(
            "asset-1",
            Protocol::Rdp,
            manager,
            factory,
            DisplaySize {
                width: 1024,
                height: 768,
            },
        ));
        connection.connect(None).await.expect("connect");
        let mut rx = connection.subscribe();
        timeout(
            Duration::from_secs(1),
            rx.wait_for(|snapshot| snapshot.presentation() == Presentation::Connected),
        )
        .await
        .expect("timeout")
        .expect("watch");
        connection
    }

    #[tokio::test]
    async fn resize_burst_coalesces_into_one_update() {
        let factory = Arc::new(MockTunnelFactory::new());
        let connection = connected_connection(factory.clone()).await;
        let tunnel = factory.last_opened().expect("tunnel");
        let probe_count = tunnel.sent_sizes().len();

        let negotiator =
            GeometryNegotiator::spawn(connection.clone(), Duration::from_millis(30));
        negotiator.observe_viewport(DisplaySize {
            width: 1100,
            height: 800,
        });
        negotiator.observe_viewport(DisplaySize {
            width: 1200,
            height: 850,
        });
        negotiator.observe_viewport(DisplaySize {
            width: 1280,
            height: 900,
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        let sizes = tunnel.sent_sizes();
        assert_eq!(sizes.len(), probe_count + 1, "burst must coalesce");
        assert_eq!(
            sizes.last().copied(),
            Some(DisplaySize {
                width: 1280,
                height: 900
            })
        );
    }
}
