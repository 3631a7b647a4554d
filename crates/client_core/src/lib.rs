use std::sync::Arc;

use futures::{future::BoxFuture, stream::FuturesUnordered, StreamExt};
use shared::{
    domain::{ConnectionStatus, UserId},
    protocol::{ChatMessage, FriendSummary, ServerFrame},
};
use tokio::{
    sync::{broadcast, mpsc},
    time::Instant,
};
use tracing::{error, info, warn};

pub mod api;
pub mod chat_view;
pub mod config;
pub mod connection;
pub mod error;
pub mod fanout;
pub mod reconciler;
pub mod session;
pub mod transport;
pub mod typing;

pub use api::{AuthApi, ChatApi, HttpChatApi};
pub use chat_view::{ChatView, Effect};
pub use config::{load_settings, ClientSettings};
pub use connection::{ConnectionHandle, ConnectionManager, ReconnectPolicy};
pub use error::{ClientError, Result};
pub use fanout::{
    AppFocus, NotificationPermission, NotificationRequest, Notifier, UnreadFanout, UnreadIndex,
};
pub use session::{Session, SessionStore};

use crate::{fanout::RefreshToken, reconciler::FetchTicket};

const CLIENT_EVENT_CAPACITY: usize = 1024;

/// Updates published to the presentation layer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionChanged(ConnectionStatus),
    MessagesUpdated {
        peer: Option<UserId>,
        messages: Vec<ChatMessage>,
    },
    PeerTyping {
        peer: UserId,
        typing: bool,
    },
    FriendsUpdated(Vec<FriendSummary>),
    Notification(NotificationRequest),
    Error(String),
}

/// Requests from the presentation layer.
#[derive(Debug, Clone)]
pub enum Command {
    SelectPeer(UserId),
    ClearPeer,
    InputChanged,
    Send(String),
    RefreshFriends,
    Reconnect,
    NotificationClicked(NotificationRequest),
    Shutdown,
}

enum Completion {
    Fetched(FetchTicket, Result<Vec<ChatMessage>>),
    MarkedRead(UserId, Result<()>),
    Sent(UserId, Result<ChatMessage>),
    Friends(RefreshToken, Result<Vec<FriendSummary>>),
}

/// Event loop for one signed-in session. All state is owned by the loop; realtime
/// frames, timer expiry, command input and request completions are handled one
/// at a time, each checking that it still applies to the current state.
pub struct ChatClient {
    session: Session,
    api: Arc<dyn ChatApi>,
    connections: ConnectionManager,
    view: ChatView,
    fanout: UnreadFanout,
    events: broadcast::Sender<ClientEvent>,
    pending: FuturesUnordered<BoxFuture<'static, Completion>>,
    friends_in_flight: bool,
    failed_refresh: Option<RefreshToken>,
}

impl ChatClient {
    pub fn new(
        settings: &ClientSettings,
        session: Session,
        api: Arc<dyn ChatApi>,
        connections: ConnectionManager,
        notifier: Arc<dyn Notifier>,
        focus: Arc<dyn AppFocus>,
    ) -> Self {
        let (events, _) = broadcast::channel(CLIENT_EVENT_CAPACITY);
        let self_id = session.user_id().clone();
        Self {
            view: ChatView::new(self_id.clone(), settings.typing_window),
            fanout: UnreadFanout::new(self_id, notifier, focus),
            session,
            api,
            connections,
            events,
            pending: FuturesUnordered::new(),
            friends_in_flight: false,
            failed_refresh: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn view(&self) -> &ChatView {
        &self.view
    }

    pub fn fanout(&self) -> &UnreadFanout {
        &self.fanout
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) -> Result<()> {
        let mut handle = self
            .connections
            .acquire(&self.session)
            .ok_or(ClientError::NotSignedIn)?;
        let mut frames = handle.subscribe();
        let mut status = handle.watch_status();
        self.update_status(*status.borrow_and_update());

        self.fanout.bootstrap().await;
        self.schedule_friends_refresh();
        info!(user_id = %self.session.user.id, "client: running");

        loop {
            let deadline = self.view.next_deadline();
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        Command::Shutdown => break,
                        Command::Reconnect => {
                            let Some(next) = self.connections.acquire(&self.session) else {
                                break;
                            };
                            if !next.same_connection(&handle) {
                                info!(user_id = %self.session.user.id, "client: switched to a new connection");
                                handle = next;
                                frames = handle.subscribe();
                                status = handle.watch_status();
                                self.view.connection_lost();
                                self.update_status(*status.borrow_and_update());
                            }
                        }
                        other => self.handle_command(other, &handle),
                    }
                }
                frame = frames.recv() => match frame {
                    Ok(frame) => self.handle_frame(&frame, &handle),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "client: realtime frames lagged");
                        self.fanout.invalidate();
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        error!("client: realtime event channel closed");
                        break;
                    }
                },
                Ok(()) = status.changed() => {
                    let current = *status.borrow_and_update();
                    self.update_status(current);
                }
                Some(done) = self.pending.next(), if !self.pending.is_empty() => {
                    self.handle_completion(done, &handle);
                }
                () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    let effects = self.view.tick(Instant::now());
                    self.apply(effects, &handle);
                }
            }
            self.schedule_friends_refresh();
        }

        self.connections.release();
        self.session.status = ConnectionStatus::Disconnected;
        info!(user_id = %self.session.user.id, "client: stopped");
        Ok(())
    }

    fn handle_command(&mut self, command: Command, handle: &ConnectionHandle) {
        let effects = match command {
            Command::SelectPeer(peer) => self.view.select_peer(peer),
            Command::ClearPeer => self.view.clear_peer(),
            Command::InputChanged => self
                .view
                .input_changed(Instant::now(), handle.is_connected()),
            Command::Send(text) => match self.view.send(&text) {
                Ok(effects) => effects,
                Err(err) => {
                    self.publish(ClientEvent::Error(err.to_string()));
                    Vec::new()
                }
            },
            Command::RefreshFriends => {
                self.failed_refresh = None;
                self.fanout.invalidate();
                Vec::new()
            }
            Command::NotificationClicked(request) => {
                self.fanout.on_notification_clicked(&request);
                Vec::new()
            }
            Command::Reconnect | Command::Shutdown => Vec::new(),
        };
        self.apply(effects, handle);
    }

    fn handle_frame(&mut self, frame: &ServerFrame, handle: &ConnectionHandle) {
        if let Some(request) = self.fanout.handle_frame(frame) {
            self.publish(ClientEvent::Notification(request));
        }
        let effects = self.view.handle_frame(frame);
        self.apply(effects, handle);
    }

    fn handle_completion(&mut self, done: Completion, handle: &ConnectionHandle) {
        match done {
            Completion::Fetched(ticket, result) => {
                let effects = self.view.complete_fetch(&ticket, result);
                self.apply(effects, handle);
            }
            Completion::MarkedRead(peer, result) => match result {
                Ok(()) => self.fanout.invalidate(),
                Err(err) => {
                    warn!(peer = %peer, error = %err, "client: mark as read failed");
                    self.publish(ClientEvent::Error(err.to_string()));
                }
            },
            Completion::Sent(receiver, result) => match result {
                Ok(message) => {
                    info!(message_id = %message.id, receiver = %receiver, "client: message sent");
                    let effects = self.view.message_sent(&receiver);
                    self.apply(effects, handle);
                }
                Err(err) => {
                    error!(receiver = %receiver, error = %err, "client: send failed");
                    self.publish(ClientEvent::Error(err.to_string()));
                }
            },
            Completion::Friends(token, result) => {
                self.friends_in_flight = false;
                match result {
                    Ok(friends) => {
                        self.failed_refresh = None;
                        self.fanout.complete_refresh(token, friends);
                        self.publish(ClientEvent::FriendsUpdated(self.fanout.friends().to_vec()));
                    }
                    Err(err) => {
                        warn!(error = %err, "client: friends refresh failed");
                        self.failed_refresh = Some(token);
                        self.publish(ClientEvent::Error(err.to_string()));
                    }
                }
            }
        }
    }

    fn apply(&mut self, effects: Vec<Effect>, handle: &ConnectionHandle) {
        for effect in effects {
            match effect {
                Effect::Emit(frame) => {
                    handle.emit(frame);
                }
                Effect::Fetch(ticket) => {
                    let api = Arc::clone(&self.api);
                    self.pending.push(Box::pin(async move {
                        let result = api.get_messages(ticket.peer()).await;
                        Completion::Fetched(ticket, result)
                    }));
                }
                Effect::MarkRead(peer) => {
                    let api = Arc::clone(&self.api);
                    self.pending.push(Box::pin(async move {
                        let result = api.mark_read(&peer).await;
                        Completion::MarkedRead(peer, result)
                    }));
                }
                Effect::Send { receiver, content } => {
                    let api = Arc::clone(&self.api);
                    self.pending.push(Box::pin(async move {
                        let result = api.send_message(&receiver, &content).await;
                        Completion::Sent(receiver, result)
                    }));
                }
                Effect::InvalidateUnread => self.fanout.invalidate(),
                Effect::MessagesChanged => self.publish(ClientEvent::MessagesUpdated {
                    peer: self.view.active_peer().cloned(),
                    messages: self.view.messages().to_vec(),
                }),
                Effect::PeerTypingChanged(typing) => {
                    if let Some(peer) = self.view.active_peer().cloned() {
                        self.publish(ClientEvent::PeerTyping { peer, typing });
                    }
                }
            }
        }
    }

    fn schedule_friends_refresh(&mut self) {
        if self.friends_in_flight || !self.fanout.needs_refresh() {
            return;
        }
        let token = self.fanout.begin_refresh();
        if self.failed_refresh == Some(token) {
            return;
        }
        self.friends_in_flight = true;
        let api = Arc::clone(&self.api);
        self.pending.push(Box::pin(async move {
            let result = api.get_friends().await;
            Completion::Friends(token, result)
        }));
    }

    fn update_status(&mut self, current: ConnectionStatus) {
        if current != ConnectionStatus::Connected {
            self.view.connection_lost();
        }
        if self.session.status != current {
            self.session.status = current;
            self.publish(ClientEvent::ConnectionChanged(current));
        }
    }

    fn publish(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
