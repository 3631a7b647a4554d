use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::anyhow;
use async_trait::async_trait;
use shared::{
    domain::UserProfile,
    protocol::{TypingNotice, TypingPayload},
};

use super::*;
use crate::transport::TransportKind;

/// Server side of a scripted link.
struct RemoteEnd {
    sent: mpsc::UnboundedReceiver<ClientFrame>,
    push: mpsc::UnboundedSender<ServerFrame>,
}

/// Each `open` pops the next scripted outcome; an empty script fails.
struct ScriptedConnector {
    outcomes: Mutex<VecDeque<bool>>,
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    attempts: AtomicUsize,
}

impl ScriptedConnector {
    fn new(outcomes: &[bool]) -> (Arc<Self>, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes, remote_rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            outcomes: Mutex::new(outcomes.iter().copied().collect()),
            remotes,
            attempts: AtomicUsize::new(0),
        });
        (connector, remote_rx)
    }

    fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn open(&self, token: &str) -> anyhow::Result<TransportLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        assert_eq!(token, "tok");
        let succeed = self
            .outcomes
            .lock()
            .expect("outcomes lock")
            .pop_front()
            .unwrap_or(false);
        if !succeed {
            return Err(anyhow!("connection refused"));
        }
        let (outbound, sent) = mpsc::unbounded_channel();
        let (push, inbound) = mpsc::unbounded_channel();
        let _ = self.remotes.send(RemoteEnd { sent, push });
        Ok(TransportLink {
            kind: TransportKind::WebSocket,
            outbound,
            inbound,
        })
    }
}

fn session(user: &str) -> Session {
    Session::new(
        UserProfile {
            id: UserId::from(user),
            username: user.to_string(),
            email: format!("{user}@example.com"),
        },
        "tok",
    )
}

fn policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        enabled: true,
        max_attempts,
        delay: Duration::from_millis(100),
    }
}

async fn wait_for(handle: &ConnectionHandle, wanted: ConnectionStatus) {
    let mut status = handle.watch_status();
    status
        .wait_for(|current| *current == wanted)
        .await
        .expect("status channel open");
}

async fn wait_until_finished(handle: &ConnectionHandle) {
    while handle.is_live() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn announces_presence_before_anything_else() {
    let (connector, mut remotes) = ScriptedConnector::new(&[true]);
    let mut manager = ConnectionManager::new(connector, policy(5));
    let handle = manager.acquire(&session("alice")).expect("handle");

    let mut remote = remotes.recv().await.expect("link opened");
    wait_for(&handle, ConnectionStatus::Connected).await;

    assert!(handle.emit(ClientFrame::Typing(TypingPayload {
        sender_id: UserId::from("alice"),
        recipient_id: UserId::from("bob"),
    })));

    assert_eq!(
        remote.sent.recv().await,
        Some(ClientFrame::JoinRoom(UserId::from("alice")))
    );
    assert!(matches!(remote.sent.recv().await, Some(ClientFrame::Typing(_))));
}

#[tokio::test(start_paused = true)]
async fn reconnect_announces_presence_exactly_once() {
    let (connector, mut remotes) = ScriptedConnector::new(&[true, true]);
    let mut manager = ConnectionManager::new(connector.clone(), policy(5));
    let handle = manager.acquire(&session("alice")).expect("handle");

    let mut first = remotes.recv().await.expect("first link");
    wait_for(&handle, ConnectionStatus::Connected).await;
    assert_eq!(
        first.sent.recv().await,
        Some(ClientFrame::JoinRoom(UserId::from("alice")))
    );

    // Server drops the connection.
    drop(first.push);
    assert_eq!(first.sent.recv().await, None);

    let mut second = remotes.recv().await.expect("second link");
    wait_for(&handle, ConnectionStatus::Connected).await;
    assert_eq!(
        second.sent.recv().await,
        Some(ClientFrame::JoinRoom(UserId::from("alice")))
    );
    assert!(second.sent.try_recv().is_err());
    assert_eq!(connector.attempts(), 2);
    assert!(handle.is_live());
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_bounded_attempts() {
    let (connector, _remotes) = ScriptedConnector::new(&[]);
    let mut manager = ConnectionManager::new(connector.clone(), policy(2));
    let handle = manager.acquire(&session("alice")).expect("handle");

    wait_until_finished(&handle).await;

    assert_eq!(connector.attempts(), 3);
    assert_eq!(handle.status(), ConnectionStatus::Disconnected);
    assert!(!handle.emit(ClientFrame::JoinRoom(UserId::from("alice"))));
}

#[tokio::test(start_paused = true)]
async fn reconnection_disabled_stops_after_first_drop() {
    let (connector, mut remotes) = ScriptedConnector::new(&[true, true]);
    let mut manager = ConnectionManager::new(
        connector.clone(),
        ReconnectPolicy {
            enabled: false,
            ..policy(5)
        },
    );
    let handle = manager.acquire(&session("alice")).expect("handle");
    let first = remotes.recv().await.expect("first link");
    wait_for(&handle, ConnectionStatus::Connected).await;

    drop(first.push);
    wait_until_finished(&handle).await;
    assert_eq!(connector.attempts(), 1);
    assert_eq!(handle.status(), ConnectionStatus::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn acquire_is_idempotent_while_live() {
    let (connector, mut remotes) = ScriptedConnector::new(&[true]);
    let mut manager = ConnectionManager::new(connector.clone(), policy(5));
    let first = manager.acquire(&session("alice")).expect("handle");
    let _remote = remotes.recv().await.expect("link");
    wait_for(&first, ConnectionStatus::Connected).await;

    let second = manager.acquire(&session("alice")).expect("handle");
    assert!(first.same_connection(&second));
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn acquire_replaces_a_connection_that_gave_up() {
    let (connector, mut remotes) = ScriptedConnector::new(&[false, true]);
    let mut manager = ConnectionManager::new(
        connector.clone(),
        ReconnectPolicy {
            enabled: false,
            ..policy(0)
        },
    );
    let dead = manager.acquire(&session("alice")).expect("handle");
    wait_until_finished(&dead).await;

    let fresh = manager.acquire(&session("alice")).expect("handle");
    assert!(!fresh.same_connection(&dead));
    let mut remote = remotes.recv().await.expect("link");
    wait_for(&fresh, ConnectionStatus::Connected).await;
    assert_eq!(
        remote.sent.recv().await,
        Some(ClientFrame::JoinRoom(UserId::from("alice")))
    );
}

#[tokio::test]
async fn acquire_without_credentials_returns_none() {
    let (connector, _remotes) = ScriptedConnector::new(&[true]);
    let mut manager = ConnectionManager::new(connector.clone(), policy(5));
    let mut signed_out = session("alice");
    signed_out.token.clear();

    assert!(manager.acquire(&signed_out).is_none());
    assert!(manager.current().is_none());
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test(start_paused = true)]
async fn server_frames_fan_out_to_every_subscriber() {
    let (connector, mut remotes) = ScriptedConnector::new(&[true]);
    let mut manager = ConnectionManager::new(connector, policy(5));
    let handle = manager.acquire(&session("alice")).expect("handle");
    let mut global = handle.subscribe();
    let mut scoped = handle.subscribe();

    let remote = remotes.recv().await.expect("link");
    wait_for(&handle, ConnectionStatus::Connected).await;

    let frame = ServerFrame::Typing(TypingNotice {
        sender_id: UserId::from("bob"),
    });
    remote.push.send(frame.clone()).expect("push");

    assert_eq!(global.recv().await.expect("global"), frame);
    assert_eq!(scoped.recv().await.expect("scoped"), frame);
}

#[tokio::test(start_paused = true)]
async fn release_closes_the_link() {
    let (connector, mut remotes) = ScriptedConnector::new(&[true]);
    let mut manager = ConnectionManager::new(connector, policy(5));
    let handle = manager.acquire(&session("alice")).expect("handle");
    let mut remote = remotes.recv().await.expect("link");
    wait_for(&handle, ConnectionStatus::Connected).await;

    manager.release();

    assert_eq!(handle.status(), ConnectionStatus::Disconnected);
    assert!(!handle.is_live());
    assert_eq!(
        remote.sent.recv().await,
        Some(ClientFrame::JoinRoom(UserId::from("alice")))
    );
    assert_eq!(remote.sent.recv().await, None);
    assert!(manager.current().is_none());
}
