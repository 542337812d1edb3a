//! Configuration consumed by the session lifecycle.
//!
//! `SessionBuilder` validates these values before passing them to
//! [`StreamSession`](super::StreamSession); constructing a `SessionConfig`
//! directly skips that validation.

use std::time::Duration;

use crate::{
    formatter::Formatter,
    log_record::{Facility, Hostname},
    queue::{DEFAULT_MAX_QUEUE_SIZE, OverflowPolicy},
    rate_limited_warner::DEFAULT_WARN_INTERVAL,
    transport::{ConnectOptions, DEFAULT_CONNECT_TIMEOUT, DEFAULT_WRITE_TIMEOUT},
};

/// Default number of reconnect attempts before the session gives up.
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
/// Default base delay for exponential backoff retries.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(1);
/// Default maximum delay for exponential backoff retries.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(30);
/// Default relative jitter applied to each backoff delay (±20%).
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.2;
/// Default wait for inbound traffic while the queue is idle.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Default time allowed for draining the queue on stop.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
/// Default idle time before a keepalive PING is sent.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
/// Default time to wait for any traffic after a PING.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(10);

/// Configuration object describing how to construct a
/// [`StreamSession`](super::StreamSession).
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub max_queue_size: usize,
    pub overflow: OverflowPolicy,
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    pub backoff: BackoffPolicy,
    /// Disabled when `None`.
    pub keepalive: Option<KeepalivePolicy>,
    /// Record codec and stream framing.
    pub formatter: Formatter,
    pub poll_interval: Duration,
    pub drain_timeout: Duration,
    pub warn_interval: Duration,
    /// Hostname stamped on records created through `StreamSession::log`.
    pub hostname: Hostname,
    pub facility: Facility,
    /// Websocket request path; replaces the endpoint's path when set.
    pub stream_path: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            overflow: OverflowPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            backoff: BackoffPolicy::default(),
            keepalive: None,
            formatter: Formatter::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            warn_interval: DEFAULT_WARN_INTERVAL,
            hostname: Hostname::default(),
            facility: Facility::default(),
            stream_path: None,
        }
    }
}

impl SessionConfig {
    /// Socket options derived from the timeouts and formatter.
    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            connect_timeout: self.connect_timeout,
            write_timeout: self.write_timeout,
            framing: self.formatter.framing(),
            max_frame_size: self.formatter.max_frame_size(),
            text_payloads: self.formatter.is_text(),
        }
    }
}

/// Exponential backoff policy for reconnection attempts.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Relative jitter in `[0, 1)`; each delay is scaled by a factor drawn
    /// from `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            cap: DEFAULT_BACKOFF_CAP,
            jitter: DEFAULT_BACKOFF_JITTER,
            max_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Liveness probing for idle connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeepalivePolicy {
    pub ping_interval: Duration,
    pub pong_wait: Duration,
}

impl Default for KeepalivePolicy {
    fn default() -> Self {
        Self {
            ping_interval: DEFAULT_PING_INTERVAL,
            pong_wait: DEFAULT_PONG_WAIT,
        }
    }
}
