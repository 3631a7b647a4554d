use std::time::Duration;

use shared::{
    domain::UserId,
    protocol::{ClientFrame, ServerFrame, TypingPayload},
};
use tokio::time::Instant;
use tracing::debug;

pub const DEFAULT_TYPING_WINDOW: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Typing { deadline: Instant },
}

/// Typing state for the active conversation.
///
/// Local input moves `Idle -> Typing` and emits one `typing` frame; further input
/// only pushes the inactivity deadline out. When the deadline passes the tracker
/// returns to `Idle` and emits one `stop_typing`. Remote notices only count when
/// they come from the active peer.
#[derive(Debug)]
pub struct TypingTracker {
    self_id: UserId,
    peer: Option<UserId>,
    window: Duration,
    phase: Phase,
    peer_typing: bool,
}

impl TypingTracker {
    pub fn new(self_id: UserId, window: Duration) -> Self {
        Self {
            self_id,
            peer: None,
            window,
            phase: Phase::Idle,
            peer_typing: false,
        }
    }

    pub fn peer(&self) -> Option<&UserId> {
        self.peer.as_ref()
    }

    pub fn is_self_typing(&self) -> bool {
        matches!(self.phase, Phase::Typing { .. })
    }

    pub fn is_peer_typing(&self) -> bool {
        self.peer_typing
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        match self.phase {
            Phase::Idle => None,
            Phase::Typing { deadline } => Some(deadline),
        }
    }

    /// Resets everything for a new conversation. Nothing is emitted for the old one.
    pub fn switch_peer(&mut self, peer: Option<UserId>) {
        self.phase = Phase::Idle;
        self.peer_typing = false;
        self.peer = peer;
    }

    pub fn on_input(&mut self, now: Instant, connected: bool) -> Option<ClientFrame> {
        let peer = self.peer.as_ref()?;
        if !connected {
            return None;
        }
        let deadline = now + self.window;
        match self.phase {
            Phase::Idle => {
                self.phase = Phase::Typing { deadline };
                Some(ClientFrame::Typing(TypingPayload {
                    sender_id: self.self_id.clone(),
                    recipient_id: peer.clone(),
                }))
            }
            Phase::Typing { .. } => {
                self.phase = Phase::Typing { deadline };
                None
            }
        }
    }

    pub fn poll_expired(&mut self, now: Instant) -> Option<ClientFrame> {
        let Phase::Typing { deadline } = self.phase else {
            return None;
        };
        if now < deadline {
            return None;
        }
        self.phase = Phase::Idle;
        let peer = self.peer.as_ref()?;
        Some(ClientFrame::StopTyping(TypingPayload {
            sender_id: self.self_id.clone(),
            recipient_id: peer.clone(),
        }))
    }

    /// Drops local typing state without emitting; there is no link to emit on.
    pub fn on_connection_lost(&mut self) {
        self.phase = Phase::Idle;
    }

    /// Applies a remote typing notice. Returns true when the peer flag changed.
    pub fn on_remote(&mut self, frame: &ServerFrame) -> bool {
        let (notice, typing) = match frame {
            ServerFrame::Typing(notice) => (notice, true),
            ServerFrame::StopTyping(notice) => (notice, false),
            ServerFrame::ReceiveMessage(_) => return false,
        };
        if self.peer.as_ref() != Some(&notice.sender_id) {
            debug!(sender_id = %notice.sender_id, "typing: ignoring notice from inactive peer");
            return false;
        }
        let changed = self.peer_typing != typing;
        self.peer_typing = typing;
        changed
    }
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
