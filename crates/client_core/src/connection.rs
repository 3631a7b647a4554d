use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use shared::{
    domain::{ConnectionStatus, UserId},
    protocol::{ClientFrame, ServerFrame},
};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{
    config::ClientSettings,
    session::Session,
    transport::{Connector, TransportChain, TransportLink},
};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Consecutive failed attempts tolerated after the first one before giving up.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            delay: Duration::from_millis(1000),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            enabled: settings.reconnection,
            max_attempts: settings.reconnect_attempts,
            delay: settings.reconnect_delay,
        }
    }
}

struct ConnectionShared {
    user_id: UserId,
    status: watch::Sender<ConnectionStatus>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
    events: broadcast::Sender<ServerFrame>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionShared {
    fn set_status(&self, next: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<ClientFrame>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn supervisor(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.supervisor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Announces presence, then pumps server frames until the link closes.
    async fn run_link(&self, link: TransportLink) {
        let TransportLink {
            kind,
            outbound,
            mut inbound,
        } = link;

        if outbound
            .send(ClientFrame::JoinRoom(self.user_id.clone()))
            .is_err()
        {
            warn!(user_id = %self.user_id, transport = %kind, "realtime: link closed before presence announcement");
            return;
        }
        info!(user_id = %self.user_id, transport = %kind, "realtime: joined room");

        *self.outbound() = Some(outbound);
        self.set_status(ConnectionStatus::Connected);

        while let Some(frame) = inbound.recv().await {
            debug!(event = frame.event_name(), "realtime: frame received");
            // No subscribers is not an error; the frame is simply unobserved.
            let _ = self.events.send(frame);
        }

        self.outbound().take();
    }
}

/// Shared reference to the one realtime connection of a session.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<ConnectionShared>,
}

impl ConnectionHandle {
    pub fn user_id(&self) -> &UserId {
        &self.shared.user_id
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// False once the supervisor has given up or the handle was released.
    pub fn is_live(&self) -> bool {
        self.shared
            .supervisor()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerFrame> {
        self.shared.events.subscribe()
    }

    /// Sends a frame over the current link. Returns `false` and drops the frame
    /// when there is no connected link.
    pub fn emit(&self, frame: ClientFrame) -> bool {
        let guard = self.shared.outbound();
        let Some(outbound) = guard.as_ref() else {
            debug!(event = frame.event_name(), "realtime: not connected, frame dropped");
            return false;
        };
        let event = frame.event_name();
        if outbound.send(frame).is_err() {
            debug!(event, "realtime: link closing, frame dropped");
            return false;
        }
        true
    }

    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn shutdown(&self) {
        if let Some(task) = self.shared.supervisor().take() {
            task.abort();
        }
        self.shared.outbound().take();
        self.shared.set_status(ConnectionStatus::Disconnected);
        info!(user_id = %self.shared.user_id, "realtime: connection released");
    }
}

/// Owns the realtime connection for the lifetime of a session. Other components
/// only ever receive clones of the handle it hands out.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    current: Option<ConnectionHandle>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            current: None,
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(
            Arc::new(TransportChain::from_settings(settings)),
            ReconnectPolicy::from_settings(settings),
        )
    }

    pub fn current(&self) -> Option<ConnectionHandle> {
        self.current.clone()
    }

    /// Returns the live handle for this session, creating it when none exists or
    /// the previous one has given up. Must be called from within a tokio runtime.
    pub fn acquire(&mut self, session: &Session) -> Option<ConnectionHandle> {
        if !session.has_credentials() {
            debug!("realtime: no credentials, not connecting");
            return None;
        }

        if let Some(handle) = &self.current {
            if handle.user_id() == session.user_id() && handle.is_live() {
                return Some(handle.clone());
            }
            handle.shutdown();
        }

        let (status, _) = watch::channel(ConnectionStatus::Connecting);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(ConnectionShared {
            user_id: session.user_id().clone(),
            status,
            outbound: Mutex::new(None),
            events,
            supervisor: Mutex::new(None),
        });

        let task = tokio::spawn(supervise(
            Arc::clone(&shared),
            Arc::clone(&self.connector),
            session.token.clone(),
            self.policy,
        ));
        *shared.supervisor() = Some(task);

        let handle = ConnectionHandle { shared };
        self.current = Some(handle.clone());
        Some(handle)
    }

    /// Tears the connection down, e.g. on logout.
    pub fn release(&mut self) {
        if let Some(handle) = self.current.take() {
            handle.shutdown();
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.release();
    }
}

async fn supervise(
    shared: Arc<ConnectionShared>,
    connector: Arc<dyn Connector>,
    token: String,
    policy: ReconnectPolicy,
) {
    let mut failures: u32 = 0;
    loop {
        shared.set_status(ConnectionStatus::Connecting);
        match connector.open(&token).await {
            Ok(link) => {
                failures = 0;
                info!(user_id = %shared.user_id, transport = %link.kind, "realtime: connected");
                shared.run_link(link).await;
                shared.set_status(ConnectionStatus::Disconnected);
                info!(user_id = %shared.user_id, "realtime: disconnected");
            }
            Err(err) => {
                failures += 1;
                shared.set_status(ConnectionStatus::Disconnected);
                error!(user_id = %shared.user_id, attempt = failures, error = %err, "realtime: connect failed");
            }
        }

        if !policy.enabled {
            break;
        }
        if failures > policy.max_attempts {
            warn!(user_id = %shared.user_id, attempts = failures, "realtime: reconnection attempts exhausted");
            break;
        }
        tokio::time::sleep(policy.delay).await;
    }
    shared.set_status(ConnectionStatus::Disconnected);
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
