//! Session state machine: which session this client holds and how the next connection starts it.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::ws::payload::Ready;

/// Connection state of a gateway client
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// connection opened, will send IDENTIFY after hello
    StartIdentifying,
    /// connection opened, will send RESUME after hello
    StartResuming,
    /// session ready, commands are sent
    Connected,
    /// connection is closing, the close cause is being classified
    Disconnecting,
    /// waiting to open a new connection that resumes the session
    Resuming,
    /// waiting to open a new connection that starts a new session
    Reconnecting,
    /// terminal, the client never reconnects again
    Disconnected,
}

impl ConnectionState {
    /// is a session ready on the current connection
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }

    /// is the client stopped for good
    pub fn is_terminal(self) -> bool {
        self == Self::Disconnected
    }

    /// state name
    pub fn name(self) -> &'static str {
        match self {
            Self::StartIdentifying => "start identifying",
            Self::StartResuming => "start resuming",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Resuming => "resuming",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
        }
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Snapshot of a resumable session, can be persisted to resume in another process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// session id from READY
    pub session_id: String,
    /// last sequence number received
    pub sequence: u64,
}

/// Session of a gateway client, outlives single connections
#[derive(Debug, Default)]
pub struct Session {
    session_id: Option<String>,
    sequence: Option<u64>,
    resume_url: Option<String>,
}

impl Session {
    /// Create an empty session, or one restored from a snapshot
    pub fn new(resume: Option<SessionInfo>) -> Self {
        match resume {
            Some(info) => Self {
                session_id: Some(info.session_id),
                sequence: Some(info.sequence),
                resume_url: None,
            },
            None => Self::default(),
        }
    }

    /// current session id
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// last sequence number received
    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// url the remote asked to use for resuming
    pub fn resume_url(&self) -> Option<&str> {
        self.resume_url.as_deref()
    }

    /// can the next connection RESUME instead of IDENTIFY
    pub fn resumable(&self) -> bool {
        self.session_id.is_some()
    }

    /// resume arguments, if resumable
    pub fn info(&self) -> Option<SessionInfo> {
        self.session_id.as_ref().map(|session_id| SessionInfo {
            session_id: session_id.clone(),
            sequence: self.sequence.unwrap_or_default(),
        })
    }

    /// State a new connection starts in
    pub fn start_state(&self) -> ConnectionState {
        if self.resumable() {
            ConnectionState::StartResuming
        } else {
            ConnectionState::StartIdentifying
        }
    }

    /// Record a received sequence number, returns false if it is not newer than the last one
    pub fn observe_sequence(&mut self, sequence: u64) -> bool {
        match self.sequence {
            Some(last) if sequence <= last => {
                log::debug!(
                    "Ignore sequence {} not newer than last sequence {}",
                    sequence,
                    last
                );
                false
            }
            _ => {
                self.sequence = Some(sequence);
                true
            }
        }
    }

    /// Start a new session from READY
    pub fn on_ready(&mut self, ready: &Ready) {
        log::debug!("New session {}", ready.session_id);

        self.session_id = Some(ready.session_id.clone());
        self.resume_url = ready.resume_gateway_url.clone();
    }

    /// Forget the session, the next connection must IDENTIFY
    pub fn invalidate(&mut self) {
        if let Some(id) = self.session_id.take() {
            log::debug!("Session {} invalidated", id);
        }
        self.sequence = None;
        self.resume_url = None;
    }
}
