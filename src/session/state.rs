//! Connection status and the transitions allowed between them.

use std::fmt;

use thiserror::Error;

/// Lifecycle state of a session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectionStatus {
    #[default]
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
    Draining = 4,
    Closed = 5,
}

impl ConnectionStatus {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::Reconnecting,
            4 => Self::Draining,
            5 => Self::Closed,
            _ => Self::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Draining => "DRAINING",
            Self::Closed => "CLOSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Disconnected, Connecting)
            | (Connecting, Connected | Reconnecting)
            | (Connected, Reconnecting | Draining)
            | (Draining, Reconnecting)
            | (Reconnecting, Connecting) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("invalid session transition {from} -> {to}")]
pub struct TransitionError {
    pub from: ConnectionStatus,
    pub to: ConnectionStatus,
}

/// State owned by the session worker.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionState {
    status: ConnectionStatus,
    reconnect_attempts: u32,
    last_error: Option<String>,
}

impl SessionState {
    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Move to `next`, refusing transitions the state machine does not
    /// define.
    pub fn transition(&mut self, next: ConnectionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        if next == ConnectionStatus::Connected {
            self.reconnect_attempts = 0;
        }
        self.status = next;
        Ok(())
    }

    pub(crate) fn set_attempts(&mut self, attempts: u32) {
        self.reconnect_attempts = attempts;
    }

    pub(crate) fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }
}
