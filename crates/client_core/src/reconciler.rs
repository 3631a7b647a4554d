use std::collections::HashSet;

use shared::{
    domain::{MessageId, UserId},
    protocol::ChatMessage,
};
use tracing::{debug, warn};

/// Identifies the conversation a fetch was started for. A completion is only
/// applied if the stream is still on the same peer and generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTicket {
    peer: UserId,
    generation: u64,
}

impl FetchTicket {
    pub fn peer(&self) -> &UserId {
        &self.peer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Appended { mark_read: bool },
    /// Already listed. The peer may still have unread copies on the server.
    Duplicate { mark_read: bool },
    /// Belongs to a conversation that is not open; only the unread summary is affected.
    OtherConversation,
}

/// Message list of the active conversation, merged from fetches and realtime pushes.
#[derive(Debug, Default)]
pub struct MessageStream {
    peer: Option<UserId>,
    messages: Vec<ChatMessage>,
    ids: HashSet<MessageId>,
    generation: u64,
}

impl MessageStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_peer(&self) -> Option<&UserId> {
        self.peer.as_ref()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Switches to `peer`, clearing the list. The returned ticket guards the fetch.
    pub fn open(&mut self, peer: UserId) -> FetchTicket {
        self.clear_messages();
        self.generation += 1;
        self.peer = Some(peer.clone());
        FetchTicket {
            peer,
            generation: self.generation,
        }
    }

    pub fn close(&mut self) {
        self.clear_messages();
        self.generation += 1;
        self.peer = None;
    }

    /// Ticket for re-fetching the current conversation without resetting it.
    pub fn refetch_ticket(&self) -> Option<FetchTicket> {
        self.peer.as_ref().map(|peer| FetchTicket {
            peer: peer.clone(),
            generation: self.generation,
        })
    }

    /// Replaces the list with a fetched snapshot. Returns false for stale tickets.
    pub fn apply_fetch(&mut self, ticket: &FetchTicket, fetched: Vec<ChatMessage>) -> bool {
        if ticket.generation != self.generation || self.peer.as_ref() != Some(&ticket.peer) {
            debug!(peer = %ticket.peer, "reconciler: discarding stale fetch");
            return false;
        }

        self.clear_messages();
        for message in fetched {
            if self.ids.insert(message.id.clone()) {
                self.messages.push(message);
            }
        }
        true
    }

    pub fn apply_push(&mut self, message: ChatMessage) -> PushOutcome {
        let Some(peer) = self.peer.as_ref() else {
            return PushOutcome::OtherConversation;
        };
        if !message.involves(peer) {
            return PushOutcome::OtherConversation;
        }
        let mark_read = &message.sender_id == peer;
        if self.ids.contains(&message.id) {
            debug!(message_id = %message.id, "reconciler: duplicate push discarded");
            return PushOutcome::Duplicate { mark_read };
        }

        if let Some(last) = self.messages.last() {
            if message.timestamp < last.timestamp {
                // Appended as delivered; the list is not re-sorted.
                warn!(
                    message_id = %message.id,
                    last_id = %last.id,
                    "reconciler: realtime message older than list tail"
                );
            }
        }
        self.ids.insert(message.id.clone());
        self.messages.push(message);
        PushOutcome::Appended { mark_read }
    }

    pub fn is_chronological(&self) -> bool {
        self.messages
            .windows(2)
            .all(|pair| pair[0].timestamp <= pair[1].timestamp)
    }

    fn clear_messages(&mut self) {
        self.messages.clear();
        self.ids.clear();
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
