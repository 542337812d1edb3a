//! Stream session: the state machine tying queue, formatter and transport
//! together.
//!
//! A [`StreamSession`] moves through DISCONNECTED, CONNECTING, CONNECTED,
//! RECONNECTING, DRAINING and CLOSED (see [`ConnectionStatus`]). Transient
//! transport failures are absorbed by reconnecting with exponential backoff;
//! only an exhausted retry budget surfaces, as a [`FatalSessionError`]
//! delivered to the callbacks registered with
//! [`StreamSession::on_error`] and returned from [`StreamSession::stop`].

mod backoff;
mod config;
mod handle;
mod state;
mod worker;

#[cfg(test)]
mod tests;

use thiserror::Error;

use crate::{
    log_record::RecordError,
    queue::{PushError, QueueFullError},
};

pub use backoff::BackoffState;
pub use config::{
    BackoffPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, DEFAULT_BACKOFF_JITTER,
    DEFAULT_DRAIN_TIMEOUT, DEFAULT_MAX_RECONNECT_ATTEMPTS, DEFAULT_PING_INTERVAL,
    DEFAULT_POLL_INTERVAL, DEFAULT_PONG_WAIT, KeepalivePolicy, SessionConfig,
};
pub use handle::StreamSession;
pub use state::{ConnectionStatus, SessionState, TransitionError};

/// Errors returned synchronously to producers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error(transparent)]
    QueueFull(#[from] QueueFullError),
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    InvalidRecord(#[from] RecordError),
}

impl From<PushError> for LogError {
    fn from(err: PushError) -> Self {
        match err {
            PushError::Full(full) => LogError::QueueFull(full),
            PushError::Closed => LogError::Closed,
        }
    }
}

/// The session exhausted its reconnect budget and closed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("gave up after {attempts} reconnect attempts: {last_error}")]
pub struct FatalSessionError {
    pub attempts: u32,
    pub last_error: String,
}
