//! End-to-end session lifecycle against the in-memory backend and
//! tunnel mocks: step-up refusal and recovery, tunnel loss surfacing
//! as an error presentation, and reconnection superseding the old
//! session.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use gatehouse_console_core::config::ConsoleConfig;
use gatehouse_console_core::session::auth::SecurityToken;
use gatehouse_console_core::session::connection::{
    ConnectError, Presentation, SessionConnection,
};
use gatehouse_console_core::session::mock::MockSessionBackend;
use gatehouse_console_core::session::{SessionError, SessionManager};
use gatehouse_console_core::tabs::TabRegistry;
use gatehouse_console_core::tunnel::mock::MockTunnelFactory;
use gatehouse_console_core::tunnel::{DisplaySize, Protocol, TunnelEvent, TunnelState};

fn manager(backend: MockSessionBackend) -> SessionManager {
    let config = ConsoleConfig::new("bastion.example.com").expect("config");
    SessionManager::with_backend(config, Arc::new(backend))
}

fn connection(
    backend: MockSessionBackend,
    factory: Arc<MockTunnelFactory>,
) -> Arc<SessionConnection> {
    Arc::new(SessionConnection::new(
        "asset-1",
        Protocol::Ssh,
        manager(backend),
        factory,
        DisplaySize {
            width: 1024,
            height: 768,
        },
    ))
}

async fn wait_for(connection: &SessionConnection, expected: Presentation) {
    let mut rx = connection.subscribe();
    timeout(
        Duration::from_secs(1),
        rx.wait_for(|snapshot| snapshot.presentation() == expected),
    )
    .await
    .expect("presentation timeout")
    .expect("watch closed");
}

#[tokio::test]
async fn step_up_refusal_then_token_reconnect() {
    let backend = MockSessionBackend::new();
    backend.require_step_up(vec!["code".into()]);
    let factory = Arc::new(MockTunnelFactory::new());
    let connection = connection(backend.clone(), factory.clone());

    let err = connection.connect(None).await.expect_err("must refuse");
    match err {
        ConnectError::Negotiation(SessionError::RequiresStepUp { parameters }) => {
            assert_eq!(parameters, vec!["code".to_string()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    // Refusal never opens a tunnel.
    assert!(factory.opened().is_empty());

    let token = SecurityToken::new("tok-step-up");
    connection.connect(Some(&token)).await.expect("connect");
    wait_for(&connection, Presentation::Connected).await;
    assert_eq!(backend.last_security_token(), Some("tok-step-up".into()));
    assert_eq!(backend.created_sessions().len(), 2);
}

#[tokio::test]
async fn tunnel_loss_surfaces_error_and_reconnect_recovers() {
    let backend = MockSessionBackend::new();
    let factory = Arc::new(MockTunnelFactory::new());
    let connection = connection(backend.clone(), factory.clone());

    connection.connect(None).await.expect("connect");
    wait_for(&connection, Presentation::Connected).await;
    assert_eq!(connection.snapshot().session_id.as_deref(), Some("sess-1"));

    factory.last_opened().expect("tunnel").emit(TunnelEvent::Transport(TunnelState::Closed));
    let mut rx = connection.subscribe();
    let snapshot = timeout(
        Duration::from_secs(1),
        rx.wait_for(|snapshot| {
            matches!(snapshot.presentation(), Presentation::Error { .. })
        }),
    )
    .await
    .expect("timeout")
    .expect("watch")
    .clone();
    assert!(matches!(snapshot.presentation(), Presentation::Error { code: None, .. }));

    connection.connect(None).await.expect("reconnect");
    wait_for(&connection, Presentation::Connected).await;
    assert_eq!(connection.snapshot().session_id.as_deref(), Some("sess-2"));

    // The first session was released on the backend and its tunnel
    // torn down exactly once.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.disconnect_calls("sess-1"), 1);
    assert_eq!(factory.opened()[0].disconnect_calls(), 1);
    assert_eq!(factory.opened()[1].disconnect_calls(), 0);
}

#[tokio::test]
async fn registry_drives_independent_sessions() {
    let backend = MockSessionBackend::new();
    let factory = Arc::new(MockTunnelFactory::new());
    let mut registry = TabRegistry::new(
        manager(backend.clone()),
        factory.clone(),
        DisplaySize {
            width: 1024,
            height: 768,
        },
    );

    let ssh = registry.open_tab("asset-1", "db-primary", Protocol::Ssh);
    let rdp = registry.open_tab("asset-2", "win-jump", Protocol::Rdp);
    assert_eq!(registry.active_key(), Some(rdp.as_str()));

    for key in [&ssh, &rdp] {
        let connection = registry.tab(key).expect("tab").connection().clone();
        wait_for(&connection, Presentation::Connected).await;
    }
    assert_eq!(backend.created_sessions().len(), 2);

    // Closing one tab tears down only its own session.
    let ssh_session = registry
        .tab(&ssh)
        .expect("tab")
        .connection()
        .snapshot()
        .session_id
        .expect("session id");
    registry.close_tab(&ssh).expect("close");
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(backend.disconnect_calls(&ssh_session), 1);

    let survivor = registry.tab(&rdp).expect("tab").connection().clone();
    assert_eq!(survivor.snapshot().presentation(), Presentation::Connected);
}
