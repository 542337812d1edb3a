//! Log-forwarding and live-stream relay client.
//!
//! Records produced by any thread are queued in a bounded
//! [`DeliveryQueue`], encoded by a [`Formatter`] and delivered in order over
//! TCP, TLS, Unix sockets or websockets by a [`StreamSession`]. The session
//! reconnects with exponential backoff, redelivers anything not yet
//! acknowledged and hands inbound messages to subscribers.
//!
//! ```no_run
//! use streamrelay::{SessionBuilder, Severity};
//!
//! let session = SessionBuilder::new()
//!     .with_endpoint("tcp://127.0.0.1:6514")
//!     .with_max_reconnect_attempts(5)
//!     .connect()?;
//! session.log(Severity::Info, "service started", [("pid", "42")])?;
//! session.stop()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod builder;
pub mod file_config;
pub mod formatter;
pub mod level;
pub mod log_record;
pub mod queue;
pub mod rate_limited_warner;
pub mod session;
pub mod transport;
pub mod wire;

pub use builder::{BuildError, SessionBuilder};
pub use file_config::{builder_from_ini, load_ini};
pub use formatter::{
    EncodeError, Formatter, Framing, ParseError, RecordCodec, RecordFormat, SyslogCodec,
};
pub use level::Severity;
pub use log_record::{Facility, Hostname, LogRecord, RecordError};
pub use queue::{DeliveryQueue, OverflowPolicy, QueueEntry, QueueFullError};
pub use session::{
    ConnectionStatus, FatalSessionError, LogError, SessionConfig, StreamSession,
};
pub use transport::{Endpoint, NetworkTransport, Transport, logstream_path};
pub use wire::{Opcode, WireMessage};
