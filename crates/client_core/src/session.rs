use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use shared::domain::{ConnectionStatus, UserId, UserProfile};
use tracing::{info, warn};

use crate::error::Result;

/// The signed-in identity. One live session per client process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub user: UserProfile,
    pub token: String,
    #[serde(skip)]
    pub status: ConnectionStatus,
}

impl Session {
    pub fn new(user: UserProfile, token: impl Into<String>) -> Self {
        Self {
            user,
            token: token.into(),
            status: ConnectionStatus::Disconnected,
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }

    pub fn has_credentials(&self) -> bool {
        !self.token.trim().is_empty() && !self.user.id.is_empty()
    }

    pub fn is_self(&self, user_id: &UserId) -> bool {
        &self.user.id == user_id
    }
}

/// Persists the session between runs so a restart does not require a new login.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn save(&self, session: &Session) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let raw = serde_json::to_string_pretty(session)?;
        fs::write(&self.path, raw)?;
        info!(user_id = %session.user.id, path = %self.path.display(), "session: saved");
        Ok(())
    }

    /// Returns `None` when nothing is stored or the stored data cannot be used.
    pub fn load(&self) -> Result<Option<Session>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        match serde_json::from_str::<Session>(&raw) {
            Ok(session) if session.has_credentials() => Ok(Some(session)),
            Ok(_) => {
                warn!(path = %self.path.display(), "session: stored session has no credentials");
                Ok(None)
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "session: discarding unreadable session file");
                Ok(None)
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "session: cleared");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
