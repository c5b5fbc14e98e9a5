//! Integration tests for client and controller links.
//!
//! Runs a controller endpoint and control clients over the in-memory
//! transport and exercises requests, events, session resumption and
//! shutdown end to end.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tether_core::{
    AddressType, ConnectorConfig, LinkError, RegisterControl, Registration, Result, ServerConfig,
};
use tether_link::messages::{Empty, builtin_registry, ping};
use tether_link::{
    Accepted, ClientConnector, Connector, ConnectorEvent, ConnectorState, Event, Link, LinkPair,
    Permission, PermissionSet, Request, ServerEndpoint, TokenAuthenticator,
};
use tether_transport::memory::{self, MemoryDialer};
use tokio::sync::{broadcast, mpsc};

const TOKEN: &str = "integration-secret";

// ============================================================================
// Harness
// ============================================================================

/// A controller endpoint accepting connections from a memory listener.
struct Controller {
    dialer: MemoryDialer,
    links: mpsc::UnboundedReceiver<Link>,
    resumed: Arc<AtomicUsize>,
}

impl Controller {
    /// Start a controller whose new links are configured by `setup`.
    fn spawn<F>(setup: F) -> Self
    where
        F: Fn(&Link) -> Result<()> + Send + Sync + 'static,
    {
        let (dialer, mut acceptor) = memory::listener();
        let endpoint = Arc::new(
            ServerEndpoint::new(ServerConfig::default(), TokenAuthenticator::new(TOKEN)).unwrap(),
        );
        let registry = Arc::new(builtin_registry().unwrap());
        let setup = Arc::new(setup);
        let (tx, links) = mpsc::unbounded_channel();
        let resumed = Arc::new(AtomicUsize::new(0));
        let resumed_count = Arc::clone(&resumed);

        tokio::spawn(async move {
            while let Some(connection) = acceptor.accept().await {
                let endpoint = Arc::clone(&endpoint);
                let registry = Arc::clone(&registry);
                let setup = Arc::clone(&setup);
                let tx = tx.clone();
                let resumed = Arc::clone(&resumed_count);
                tokio::spawn(async move {
                    match endpoint.accept(connection).await {
                        Ok(Accepted::New { connector, .. }) => {
                            let pair =
                                LinkPair::new(AddressType::Controller, connector.dst().kind());
                            let link = Link::new(pair, Arc::new(connector)).unwrap();
                            registry.attach_all(&link).unwrap();
                            setup(&link).unwrap();
                            let _ = tx.send(link);
                        }
                        Ok(Accepted::Resumed(_)) => {
                            resumed.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(_) => {}
                    }
                });
            }
        });

        Self {
            dialer,
            links,
            resumed,
        }
    }

    /// Next link created by a fresh registration.
    async fn next_link(&mut self) -> Link {
        within(self.links.recv()).await.expect("controller stopped")
    }

    fn resumed(&self) -> usize {
        self.resumed.load(Ordering::SeqCst)
    }
}

fn registration(token: &str) -> Registration {
    Registration::Control(RegisterControl {
        token: token.to_string(),
        agent: "tether-integration".to_string(),
        version: "0.3.0".to_string(),
    })
}

fn client_config() -> ConnectorConfig {
    ConnectorConfig {
        reconnect_delay_secs: 0.05,
        connect_timeout_secs: 5,
        ..Default::default()
    }
}

/// Connect a control client and build its link.
async fn connect_control(dialer: &MemoryDialer) -> (ClientConnector, Link) {
    let connector = ClientConnector::new(dialer.clone(), registration(TOKEN), client_config())
        .expect("valid config");
    within(connector.connect()).await.expect("connect");
    let link = Link::new(
        "control-controller".parse().unwrap(),
        Arc::new(connector.clone()),
    )
    .unwrap();
    (connector, link)
}

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

async fn wait_for_event(
    events: &mut broadcast::Receiver<ConnectorEvent>,
    expected: ConnectorEvent,
) {
    within(async {
        loop {
            match events.recv().await {
                Ok(event) if event == expected => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
}

fn boom() -> Request<Empty, Empty> {
    Request::builder("boom")
        .links(["control-controller"])
        .permission(Permission::named("test.boom"))
        .build()
        .unwrap()
}

// ============================================================================
// Requests
// ============================================================================

/// A ping answered by the controller's default handler costs exactly one
/// sequence number on the client.
#[tokio::test]
async fn test_ping_round_trip() {
    let mut controller = Controller::spawn(|_| Ok(()));
    let (connector, link) = connect_control(&controller.dialer).await;
    let _server = controller.next_link().await;

    let before = connector.next_seq().await;
    within(ping().unwrap().send(&link, &Empty {}))
        .await
        .unwrap();
    assert_eq!(connector.next_seq().await, before + 1);
    assert_eq!(link.pending_waiters(), 0);
}

/// A handler error reaches the caller as a request error and leaves the
/// connection up.
#[tokio::test]
async fn test_handler_error_surfaces_to_caller() {
    let mut controller = Controller::spawn(|link| {
        link.set_permission_check(Arc::new(PermissionSet::all()))?;
        boom().attach(link, |_ctx, _req: Empty| async {
            Err::<Empty, _>(LinkError::request("boom"))
        })
    });
    let (connector, link) = connect_control(&controller.dialer).await;
    let _server = controller.next_link().await;

    let err = within(boom().send(&link, &Empty {})).await.unwrap_err();
    assert_eq!(err, LinkError::request("boom"));
    assert_eq!(connector.state().await, ConnectorState::Connected);

    within(ping().unwrap().send(&link, &Empty {}))
        .await
        .unwrap();
}

/// Requests from control clients are checked against the link's
/// permissions before the handler runs.
#[tokio::test]
async fn test_permission_denied() {
    let mut controller = Controller::spawn(|link| {
        link.set_permission_check(Arc::new(PermissionSet::none().grant("test.other")))?;
        boom().attach(link, |_ctx, req: Empty| async move { Ok(req) })
    });
    let (_connector, link) = connect_control(&controller.dialer).await;
    let _server = controller.next_link().await;

    match within(boom().send(&link, &Empty {})).await {
        Err(LinkError::Request { code, .. }) => assert_eq!(code.as_deref(), Some("PermissionDenied")),
        other => panic!("unexpected {other:?}"),
    }
}

/// Requests nobody handles are answered with an error instead of hanging.
#[tokio::test]
async fn test_unhandled_request_is_answered() {
    let mut controller = Controller::spawn(|_| Ok(()));
    let (_connector, link) = connect_control(&controller.dialer).await;
    let _server = controller.next_link().await;

    match within(boom().send(&link, &Empty {})).await {
        Err(LinkError::Request { code, .. }) => assert_eq!(code.as_deref(), Some("InvalidMessage")),
        other => panic!("unexpected {other:?}"),
    }
}

/// Pending requests fail with `SessionLost` when the client closes.
#[tokio::test]
async fn test_close_rejects_pending_requests() {
    let mut controller = Controller::spawn(|link| {
        link.set_permission_check(Arc::new(PermissionSet::all()))?;
        boom().attach(link, |_ctx, req: Empty| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(req)
        })
    });
    let (connector, link) = connect_control(&controller.dialer).await;
    let _server = controller.next_link().await;

    let pending = {
        let link = link.clone();
        tokio::spawn(async move { boom().send(&link, &Empty {}).await })
    };
    within(async {
        while link.pending_waiters() == 0 {
            tokio::task::yield_now().await;
        }
    })
    .await;

    connector.close(1000, "test done").await;
    let result = within(pending).await.unwrap();
    assert!(matches!(result, Err(LinkError::SessionLost(_))));
    assert_eq!(link.pending_waiters(), 0);
}

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Notice {
    text: String,
}

#[tokio::test]
async fn test_event_reaches_controller_handler() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let notice = || -> Event<Notice> {
        Event::builder("notice")
            .links(["control-controller"])
            .build()
            .unwrap()
    };
    let mut controller = Controller::spawn(move |link| {
        let tx = tx.clone();
        notice().attach(link, move |ctx, event: Notice| {
            let tx = tx.clone();
            async move {
                tx.send((ctx.src, event.text)).unwrap();
                Ok(())
            }
        })
    });
    let (connector, link) = connect_control(&controller.dialer).await;
    let _server = controller.next_link().await;

    notice()
        .send(&link, &Notice { text: "hello".into() })
        .await
        .unwrap();
    let (src, text) = within(rx.recv()).await.unwrap();
    assert_eq!(src, connector.src());
    assert_eq!(text, "hello");
}

// ============================================================================
// Sessions
// ============================================================================

/// A dropped socket is resumed with the same session token and requests
/// sent while detached are delivered after the resume.
#[tokio::test]
async fn test_resume_after_drop() {
    let mut controller = Controller::spawn(|_| Ok(()));
    let (connector, link) = connect_control(&controller.dialer).await;
    let _server = controller.next_link().await;
    let token = connector.session_token().await;
    assert!(token.is_some());

    let mut events = connector.subscribe();
    connector.abort_socket().await;
    wait_for_event(&mut events, ConnectorEvent::Drop).await;

    // Buffered until the session is back
    within(ping().unwrap().send(&link, &Empty {}))
        .await
        .unwrap();
    wait_for_event(&mut events, ConnectorEvent::Connect { resumed: true }).await;

    assert_eq!(connector.session_token().await, token);
    assert_eq!(controller.resumed(), 1);
    assert_eq!(controller.dialer.dial_count(), 2);
}

/// A wrong token fails the connect and is not retried.
#[tokio::test]
async fn test_bad_token_is_terminal() {
    let controller = Controller::spawn(|_| Ok(()));
    let connector =
        ClientConnector::new(controller.dialer.clone(), registration("wrong"), client_config())
            .unwrap();

    let err = within(connector.connect()).await.unwrap_err();
    assert!(matches!(err, LinkError::AuthenticationFailed(_)));
    assert_eq!(connector.state().await, ConnectorState::Closed);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(controller.dialer.dial_count(), 1);
}

/// `disconnect` drains the peer and closes both ends normally.
#[tokio::test]
async fn test_graceful_disconnect() {
    let mut controller = Controller::spawn(|_| Ok(()));
    let (connector, link) = connect_control(&controller.dialer).await;
    let server = controller.next_link().await;

    let mut client_events = connector.subscribe();
    let mut server_events = server.connector().subscribe();
    link.disconnect().await.unwrap();

    wait_for_event(&mut client_events, ConnectorEvent::Close).await;
    wait_for_event(&mut server_events, ConnectorEvent::Close).await;
    assert_eq!(connector.state().await, ConnectorState::New);
}

/// Each registration gets its own control id.
#[tokio::test]
async fn test_controls_are_numbered() {
    let mut controller = Controller::spawn(|_| Ok(()));
    let (first, _first_link) = connect_control(&controller.dialer).await;
    let (second, _second_link) = connect_control(&controller.dialer).await;
    let _a = controller.next_link().await;
    let _b = controller.next_link().await;

    assert_eq!(first.src().kind(), AddressType::Control);
    assert_eq!(second.src().kind(), AddressType::Control);
    assert_ne!(first.src(), second.src());
}
