//! Network transports.
//!
//! [`connect`] opens a [`Connection`] to an [`Endpoint`]: a framed TCP,
//! TLS or Unix stream, or a websocket. The session is written against the
//! [`Transport`] and [`Link`] traits so the state machine can be driven by
//! an in-memory transport in tests; [`NetworkTransport`] is the production
//! implementation.

mod connection;
mod endpoint;
mod stream;


use std::{io, time::Duration};

use thiserror::Error;

use crate::{
    formatter::{DEFAULT_MAX_FRAME_SIZE, EncodeError, Framing, ParseError},
    wire::WireMessage,
};

pub use connection::{Connection, Incoming};
pub use endpoint::{
    Endpoint, TcpTransport, TlsOptions, UnixTransport, WebSocketTransport, logstream_path,
};

/// Default connection timeout applied when establishing sockets.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default write timeout applied to socket writes.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid endpoint '{input}': {reason}")]
pub struct EndpointError {
    pub input: String,
    pub reason: String,
}

/// Failure to establish a connection (unreachable, refused, timed out).
#[derive(Debug, Error)]
#[error("failed to connect to {endpoint}: {source}")]
pub struct ConnectError {
    pub endpoint: String,
    #[source]
    pub source: io::Error,
}

impl ConnectError {
    pub fn new(endpoint: impl Into<String>, source: io::Error) -> Self {
        Self {
            endpoint: endpoint.into(),
            source,
        }
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

#[derive(Debug, Error)]
pub enum SendError {
    /// The connection broke while writing.
    #[error("send failed: {0}")]
    Io(#[from] io::Error),
    /// The message could not be framed; the connection is unaffected.
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("receive failed: {0}")]
    Io(#[from] io::Error),
    /// A single malformed frame; the connection stays usable.
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),
    #[error("connection closed by peer")]
    Closed,
}

/// Socket options applied to every connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
    /// Stream framing; ignored by websockets, which frame natively.
    pub framing: Framing,
    pub max_frame_size: usize,
    /// Send DATA as websocket text frames rather than binary.
    pub text_payloads: bool,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            framing: Framing::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            text_payloads: true,
        }
    }
}

/// Establish a connection using the provided endpoint definition.
pub fn connect(endpoint: &Endpoint, options: &ConnectOptions) -> Result<Connection, ConnectError> {
    let peer = endpoint.to_string();
    let result = match endpoint {
        Endpoint::Tcp(config) => stream::open_tcp(
            &config.host,
            config.port,
            config.tls.as_ref(),
            options.connect_timeout,
        )
        .and_then(|socket| Connection::framed(socket, peer.clone(), options)),
        Endpoint::Unix(config) => stream::open_unix(config)
            .and_then(|socket| Connection::framed(socket, peer.clone(), options)),
        Endpoint::WebSocket(config) => Connection::websocket(config, options),
    };
    result.map_err(|source| ConnectError::new(peer, source))
}

/// One live connection as seen by the session worker.
pub trait Link: Send {
    fn send(&mut self, message: &WireMessage) -> Result<(), SendError>;

    /// Wait up to `wait` for an inbound message.
    fn poll_receive(&mut self, wait: Duration) -> Result<Option<WireMessage>, ReceiveError>;

    fn close(&mut self);
}

/// Factory of [`Link`]s; called again on every reconnect.
pub trait Transport: Send + 'static {
    type Conn: Link;

    fn connect(&mut self) -> Result<Self::Conn, ConnectError>;

    /// Peer description used in log messages.
    fn describe(&self) -> String;
}

impl Link for Connection {
    fn send(&mut self, message: &WireMessage) -> Result<(), SendError> {
        Connection::send(self, message)
    }

    fn poll_receive(&mut self, wait: Duration) -> Result<Option<WireMessage>, ReceiveError> {
        Connection::poll_receive(self, wait)
    }

    fn close(&mut self) {
        Connection::close(self);
    }
}

/// Real sockets reaching an [`Endpoint`].
#[derive(Clone, Debug)]
pub struct NetworkTransport {
    endpoint: Endpoint,
    options: ConnectOptions,
}

impl NetworkTransport {
    pub fn new(endpoint: Endpoint, options: ConnectOptions) -> Self {
        Self { endpoint, options }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn options(&self) -> &ConnectOptions {
        &self.options
    }
}

impl Transport for NetworkTransport {
    type Conn = Connection;

    fn connect(&mut self) -> Result<Connection, ConnectError> {
        connect(&self.endpoint, &self.options)
    }

    fn describe(&self) -> String {
        self.endpoint.to_string()
    }
}
