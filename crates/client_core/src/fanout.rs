use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use shared::{
    domain::UserId,
    protocol::{ChatMessage, FriendSummary, ServerFrame},
};
use tracing::{debug, info};

pub const NOTIFICATION_TITLE: &str = "New Message";
pub const NOTIFICATION_TAG: &str = "chat-message";
pub const CHAT_ROUTE: &str = "/dashboard/chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPermission {
    Default,
    Granted,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub title: String,
    pub body: String,
    pub tag: String,
    pub target_route: String,
}

impl NotificationRequest {
    pub fn for_message(message: &ChatMessage) -> Self {
        Self {
            title: NOTIFICATION_TITLE.to_string(),
            body: message.content.clone(),
            tag: NOTIFICATION_TAG.to_string(),
            target_route: CHAT_ROUTE.to_string(),
        }
    }
}

/// Platform notification surface.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn permission(&self) -> NotificationPermission;
    async fn request_permission(&self) -> NotificationPermission;
    fn show(&self, request: &NotificationRequest);
}

/// Whether the application currently has the user's attention.
pub trait AppFocus: Send + Sync {
    fn is_foreground(&self) -> bool;
    fn bring_to_foreground(&self);
    fn navigate(&self, route: &str);
}

/// Local mirror of the backend's per-peer unread counts. Never adjusted locally;
/// it is marked stale and re-read from the friends listing instead.
#[derive(Debug, Clone)]
pub struct UnreadIndex {
    counts: HashMap<UserId, u32>,
    stale: bool,
    epoch: u64,
}

impl Default for UnreadIndex {
    fn default() -> Self {
        Self {
            counts: HashMap::new(),
            stale: true,
            epoch: 0,
        }
    }
}

/// Marks the index state a refresh was started against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshToken(u64);

impl UnreadIndex {
    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn invalidate(&mut self) {
        self.stale = true;
        self.epoch += 1;
    }

    pub fn begin_refresh(&self) -> RefreshToken {
        RefreshToken(self.epoch)
    }

    /// Installs fresh counts. The index stays stale if it was invalidated again
    /// while the refresh was in flight.
    pub fn complete_refresh(&mut self, token: RefreshToken, friends: &[FriendSummary]) {
        self.counts = friends
            .iter()
            .map(|friend| (friend.id.clone(), friend.unread()))
            .collect();
        self.stale = token.0 != self.epoch;
    }

    pub fn count(&self, peer: &UserId) -> u32 {
        self.counts.get(peer).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u32 {
        self.counts.values().sum()
    }
}

/// Process-wide listener for incoming messages, independent of the open conversation.
pub struct UnreadFanout {
    self_id: UserId,
    notifier: Arc<dyn Notifier>,
    focus: Arc<dyn AppFocus>,
    index: UnreadIndex,
    friends: Vec<FriendSummary>,
    permission_requested: bool,
}

impl UnreadFanout {
    pub fn new(self_id: UserId, notifier: Arc<dyn Notifier>, focus: Arc<dyn AppFocus>) -> Self {
        Self {
            self_id,
            notifier,
            focus,
            index: UnreadIndex::default(),
            friends: Vec::new(),
            permission_requested: false,
        }
    }

    /// Asks for notification permission at most once, and only while undecided.
    pub async fn bootstrap(&mut self) -> NotificationPermission {
        let current = self.notifier.permission();
        if self.permission_requested || current != NotificationPermission::Default {
            return current;
        }
        self.permission_requested = true;
        let granted = self.notifier.request_permission().await;
        info!(permission = ?granted, "notifications: permission requested");
        granted
    }

    pub fn unread_index(&self) -> &UnreadIndex {
        &self.index
    }

    pub fn friends(&self) -> &[FriendSummary] {
        &self.friends
    }

    pub fn needs_refresh(&self) -> bool {
        self.index.is_stale()
    }

    pub fn invalidate(&mut self) {
        self.index.invalidate();
    }

    pub fn begin_refresh(&self) -> RefreshToken {
        self.index.begin_refresh()
    }

    pub fn complete_refresh(&mut self, token: RefreshToken, friends: Vec<FriendSummary>) {
        self.index.complete_refresh(token, &friends);
        self.friends = friends;
    }

    /// Returns the notification raised for this frame, if any.
    pub fn handle_frame(&mut self, frame: &ServerFrame) -> Option<NotificationRequest> {
        let ServerFrame::ReceiveMessage(message) = frame else {
            return None;
        };
        self.index.invalidate();

        if message.sender_id == self.self_id {
            return None;
        }
        if self.notifier.permission() != NotificationPermission::Granted {
            return None;
        }
        if self.focus.is_foreground() {
            debug!(message_id = %message.id, "notifications: app in foreground, skipping");
            return None;
        }

        let request = NotificationRequest::for_message(message);
        self.notifier.show(&request);
        info!(message_id = %message.id, sender_id = %message.sender_id, "notifications: shown");
        Some(request)
    }

    pub fn on_notification_clicked(&self, request: &NotificationRequest) {
        self.focus.bring_to_foreground();
        self.focus.navigate(&request.target_route);
    }
}

#[cfg(test)]
#[path = "tests/fanout_tests.rs"]
mod tests;
