//! Established connections: framed byte streams and websockets.

use std::{
    borrow::Cow,
    fmt,
    io::{self, Read, Write},
    iter::FusedIterator,
    time::Duration,
};

use log::debug;
use tungstenite::{
    Message, WebSocket,
    handshake::HandshakeError,
    protocol::{CloseFrame, WebSocketConfig, frame::coding::CloseCode},
};

use crate::{
    formatter::{FrameDecoder, Framing, ParseError},
    wire::{Opcode, WireMessage},
};

use super::{
    ConnectOptions, ReceiveError, SendError,
    endpoint::WebSocketTransport,
    stream::{StreamSocket, open_tcp},
};

const READ_CHUNK: usize = 8 * 1024;
const MIN_READ_WAIT: Duration = Duration::from_millis(1);
const INCOMING_POLL: Duration = Duration::from_millis(100);

enum Channel {
    Framed {
        socket: StreamSocket,
        framing: Framing,
        max_frame_size: usize,
        decoder: FrameDecoder,
    },
    WebSocket {
        socket: Box<WebSocket<StreamSocket>>,
        text: bool,
    },
}

/// An open connection to the remote peer.
///
/// The socket is released on [`Connection::close`] or when the value is
/// dropped, whichever comes first.
pub struct Connection {
    channel: Channel,
    peer: String,
    read_timeout: Option<Duration>,
    closed: bool,
}

impl Connection {
    pub(crate) fn framed(
        socket: StreamSocket,
        peer: String,
        options: &ConnectOptions,
    ) -> io::Result<Self> {
        socket.set_write_timeout(Some(options.write_timeout))?;
        Ok(Self {
            channel: Channel::Framed {
                socket,
                framing: options.framing,
                max_frame_size: options.max_frame_size,
                decoder: FrameDecoder::new(options.framing, options.max_frame_size),
            },
            peer,
            read_timeout: None,
            closed: false,
        })
    }

    pub(crate) fn websocket(
        config: &WebSocketTransport,
        options: &ConnectOptions,
    ) -> io::Result<Self> {
        let socket = open_tcp(
            &config.host,
            config.port,
            config.tls.as_ref(),
            options.connect_timeout,
        )?;
        socket.set_read_timeout(Some(options.connect_timeout))?;
        socket.set_write_timeout(Some(options.connect_timeout))?;

        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(options.max_frame_size);
        ws_config.max_frame_size = Some(options.max_frame_size);

        let url = config.url();
        let (socket, _response) =
            tungstenite::client::client_with_config(url.as_str(), socket, Some(ws_config))
                .map_err(|err| match err {
                    HandshakeError::Interrupted(_) => {
                        io::Error::new(io::ErrorKind::TimedOut, "websocket handshake timed out")
                    }
                    HandshakeError::Failure(err) => ws_io_error(err),
                })?;
        socket.get_ref().set_read_timeout(None)?;
        socket.get_ref().set_write_timeout(Some(options.write_timeout))?;
        Ok(Self {
            channel: Channel::WebSocket {
                socket: Box::new(socket),
                text: options.text_payloads,
            },
            peer: url,
            read_timeout: None,
            closed: false,
        })
    }

    /// Human-readable peer address used in diagnostics.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Transmit one message.
    pub fn send(&mut self, message: &WireMessage) -> Result<(), SendError> {
        if self.closed {
            return Err(SendError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            )));
        }
        match &mut self.channel {
            Channel::Framed {
                socket,
                framing,
                max_frame_size,
                ..
            } => {
                let frame = framing.encode(message, *max_frame_size)?;
                socket.write_all(&frame)?;
                socket.flush()?;
                Ok(())
            }
            Channel::WebSocket { socket, text } => {
                let outbound = match message.opcode {
                    Opcode::Data if *text => match String::from_utf8(message.payload.clone()) {
                        Ok(text) => Message::Text(text),
                        Err(_) => Message::Binary(message.payload.clone()),
                    },
                    Opcode::Data => Message::Binary(message.payload.clone()),
                    Opcode::Ping => Message::Ping(message.payload.clone()),
                    // Pings read from the socket are answered by tungstenite
                    // itself; flushing pushes the queued reply out.
                    Opcode::Pong => return socket.flush().map_err(|err| ws_io_error(err).into()),
                    Opcode::Close => Message::Close(Some(CloseFrame {
                        code: CloseCode::Normal,
                        reason: Cow::Owned(String::from_utf8_lossy(&message.payload).into_owned()),
                    })),
                };
                socket.send(outbound).map_err(|err| ws_io_error(err).into())
            }
        }
    }

    /// Wait up to `wait` for the next inbound message.
    ///
    /// `Ok(None)` means nothing arrived in time. A protocol error affects a
    /// single frame and the connection stays usable; [`ReceiveError::Closed`]
    /// is returned once the peer has gone away.
    pub fn poll_receive(&mut self, wait: Duration) -> Result<Option<WireMessage>, ReceiveError> {
        if self.closed {
            return Err(ReceiveError::Closed);
        }
        let wait = Some(wait.max(MIN_READ_WAIT));
        match &mut self.channel {
            Channel::Framed {
                socket, decoder, ..
            } => {
                if let Some(frame) = decoder.next_frame() {
                    return frame.map(Some).map_err(ReceiveError::Protocol);
                }
                if self.read_timeout != wait {
                    socket.set_read_timeout(wait)?;
                    self.read_timeout = wait;
                }
                let mut chunk = [0u8; READ_CHUNK];
                match socket.read(&mut chunk) {
                    Ok(0) => {
                        self.closed = true;
                        Err(ReceiveError::Closed)
                    }
                    Ok(n) => {
                        decoder.extend(&chunk[..n]);
                        decoder
                            .next_frame()
                            .transpose()
                            .map_err(ReceiveError::Protocol)
                    }
                    Err(err) if is_idle(&err) => Ok(None),
                    Err(err) => Err(ReceiveError::Io(err)),
                }
            }
            Channel::WebSocket { socket, .. } => {
                if self.read_timeout != wait {
                    socket.get_ref().set_read_timeout(wait)?;
                    self.read_timeout = wait;
                }
                match socket.read() {
                    Ok(Message::Text(text)) => Ok(Some(WireMessage::data(text.into_bytes()))),
                    Ok(Message::Binary(data)) => Ok(Some(WireMessage::data(data))),
                    Ok(Message::Ping(data)) => Ok(Some(WireMessage::ping(data))),
                    Ok(Message::Pong(data)) => Ok(Some(WireMessage::pong(data))),
                    Ok(Message::Close(frame)) => Ok(Some(WireMessage::close(
                        frame.as_ref().map_or("", |f| &*f.reason),
                    ))),
                    Ok(Message::Frame(_)) => Ok(None),
                    Err(tungstenite::Error::Io(err)) if is_idle(&err) => Ok(None),
                    Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                        self.closed = true;
                        Err(ReceiveError::Closed)
                    }
                    Err(tungstenite::Error::Utf8 { .. }) => {
                        Err(ReceiveError::Protocol(ParseError::InvalidUtf8))
                    }
                    Err(tungstenite::Error::Capacity(err)) => Err(ReceiveError::Protocol(
                        ParseError::InvalidLength(err.to_string()),
                    )),
                    Err(err) => Err(ReceiveError::Io(ws_io_error(err))),
                }
            }
        }
    }

    /// Blocking iterator over inbound messages.
    ///
    /// Yields until the peer closes the connection or an I/O error ends it;
    /// once finished it stays finished.
    pub fn incoming(&mut self) -> Incoming<'_> {
        Incoming {
            done: self.closed,
            connection: self,
        }
    }

    /// Release the socket. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match &mut self.channel {
            Channel::Framed { socket, .. } => socket.shutdown(),
            Channel::WebSocket { socket, .. } => {
                let _ = socket.close(None);
                let _ = socket.flush();
                socket.get_mut().shutdown();
            }
        }
        debug!("closed connection to {}", self.peer);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.channel {
            Channel::Framed { framing, .. } => framing.to_string(),
            Channel::WebSocket { .. } => "websocket".to_owned(),
        };
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("kind", &kind)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Iterator returned by [`Connection::incoming`].
pub struct Incoming<'a> {
    connection: &'a mut Connection,
    done: bool,
}

impl Iterator for Incoming<'_> {
    type Item = Result<WireMessage, ReceiveError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            match self.connection.poll_receive(INCOMING_POLL) {
                Ok(Some(message)) => return Some(Ok(message)),
                Ok(None) => continue,
                Err(ReceiveError::Closed) => {
                    self.done = true;
                    return None;
                }
                Err(err @ ReceiveError::Io(_)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

impl FusedIterator for Incoming<'_> {}

fn is_idle(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

fn ws_io_error(err: tungstenite::Error) -> io::Error {
    match err {
        tungstenite::Error::Io(err) => err,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")
        }
        other => io::Error::other(other.to_string()),
    }
}
