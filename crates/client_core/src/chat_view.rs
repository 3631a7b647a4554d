use std::time::Duration;

use shared::{
    domain::UserId,
    protocol::{ChatMessage, ClientFrame, ServerFrame},
};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    error::{ClientError, Result},
    reconciler::{FetchTicket, MessageStream, PushOutcome},
    typing::TypingTracker,
};

/// Work requested by the view. The driver performs it and reports completions back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Emit(ClientFrame),
    Fetch(FetchTicket),
    MarkRead(UserId),
    Send { receiver: UserId, content: String },
    InvalidateUnread,
    MessagesChanged,
    PeerTypingChanged(bool),
}

/// State of the open conversation: its message list and typing indicators.
#[derive(Debug)]
pub struct ChatView {
    stream: MessageStream,
    typing: TypingTracker,
}

impl ChatView {
    pub fn new(self_id: UserId, typing_window: Duration) -> Self {
        Self {
            stream: MessageStream::new(),
            typing: TypingTracker::new(self_id, typing_window),
        }
    }

    pub fn active_peer(&self) -> Option<&UserId> {
        self.stream.active_peer()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.stream.messages()
    }

    pub fn is_peer_typing(&self) -> bool {
        self.typing.is_peer_typing()
    }

    pub fn is_self_typing(&self) -> bool {
        self.typing.is_self_typing()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.typing.next_deadline()
    }

    /// Opens the conversation with `peer`. Re-selecting the open peer does nothing.
    pub fn select_peer(&mut self, peer: UserId) -> Vec<Effect> {
        if self.stream.active_peer() == Some(&peer) {
            return Vec::new();
        }
        let was_peer_typing = self.typing.is_peer_typing();
        self.typing.switch_peer(Some(peer.clone()));
        let ticket = self.stream.open(peer.clone());

        let mut effects = vec![Effect::MessagesChanged];
        if was_peer_typing {
            effects.push(Effect::PeerTypingChanged(false));
        }
        effects.push(Effect::MarkRead(peer));
        effects.push(Effect::Fetch(ticket));
        effects
    }

    pub fn clear_peer(&mut self) -> Vec<Effect> {
        if self.stream.active_peer().is_none() {
            return Vec::new();
        }
        let was_peer_typing = self.typing.is_peer_typing();
        self.typing.switch_peer(None);
        self.stream.close();
        let mut effects = vec![Effect::MessagesChanged];
        if was_peer_typing {
            effects.push(Effect::PeerTypingChanged(false));
        }
        effects
    }

    pub fn input_changed(&mut self, now: Instant, connected: bool) -> Vec<Effect> {
        self.typing
            .on_input(now, connected)
            .map(Effect::Emit)
            .into_iter()
            .collect()
    }

    pub fn tick(&mut self, now: Instant) -> Vec<Effect> {
        self.typing
            .poll_expired(now)
            .map(Effect::Emit)
            .into_iter()
            .collect()
    }

    pub fn connection_lost(&mut self) {
        self.typing.on_connection_lost();
    }

    pub fn send(&mut self, text: &str) -> Result<Vec<Effect>> {
        let receiver = self
            .stream
            .active_peer()
            .cloned()
            .ok_or(ClientError::NoActiveConversation)?;
        let content = text.trim();
        if content.is_empty() {
            debug!("chat: ignoring empty message");
            return Ok(Vec::new());
        }
        Ok(vec![Effect::Send {
            receiver,
            content: content.to_string(),
        }])
    }

    /// The backend accepted a message; the conversation is re-read so the list
    /// reflects confirmed state only.
    pub fn message_sent(&mut self, receiver: &UserId) -> Vec<Effect> {
        if self.stream.active_peer() != Some(receiver) {
            return Vec::new();
        }
        self.stream
            .refetch_ticket()
            .map(Effect::Fetch)
            .into_iter()
            .collect()
    }

    pub fn complete_fetch(
        &mut self,
        ticket: &FetchTicket,
        result: Result<Vec<ChatMessage>>,
    ) -> Vec<Effect> {
        match result {
            Ok(messages) => {
                if self.stream.apply_fetch(ticket, messages) {
                    vec![Effect::MessagesChanged]
                } else {
                    Vec::new()
                }
            }
            Err(err) => {
                warn!(peer = %ticket.peer(), error = %err, "chat: failed to load conversation");
                Vec::new()
            }
        }
    }

    pub fn handle_frame(&mut self, frame: &ServerFrame) -> Vec<Effect> {
        match frame {
            ServerFrame::ReceiveMessage(message) => {
                let sender = message.sender_id.clone();
                match self.stream.apply_push(message.clone()) {
                    PushOutcome::Appended { mark_read } => {
                        let mut effects = vec![Effect::MessagesChanged];
                        if mark_read {
                            effects.push(Effect::MarkRead(sender));
                        }
                        effects
                    }
                    PushOutcome::Duplicate { mark_read: true } => vec![Effect::MarkRead(sender)],
                    PushOutcome::Duplicate { mark_read: false } => Vec::new(),
                    PushOutcome::OtherConversation => vec![Effect::InvalidateUnread],
                }
            }
            ServerFrame::Typing(_) | ServerFrame::StopTyping(_) => {
                if self.typing.on_remote(frame) {
                    vec![Effect::PeerTypingChanged(self.typing.is_peer_typing())]
                } else {
                    Vec::new()
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/chat_view_tests.rs"]
mod tests;
