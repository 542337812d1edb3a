//! Record codecs and stream framing.
//!
//! A [`Formatter`] pairs a [`RecordCodec`] (how a [`LogRecord`] becomes a
//! payload) with a [`Framing`] (how payloads are delimited on a byte
//! stream). Encoding is pure and deterministic; decoding reports malformed
//! input through [`ParseError`] so callers can drop a single bad frame
//! without tearing down the connection.
//!
//! Three codecs ship with the crate:
//!
//! - **Syslog** (default): RFC 5424 text with structured fields rendered as
//!   an SD-ELEMENT.
//! - **JSON**: one JSON object per record, for text-oriented consumers.
//! - **MessagePack**: compact binary maps.

mod framing;
mod serialise;
mod syslog;


use std::{fmt, str::FromStr, sync::Arc};

use thiserror::Error;

use crate::{
    log_record::LogRecord,
    wire::{Opcode, WireMessage},
};

pub use framing::{FrameDecoder, Framing};
pub use serialise::{JsonCodec, MessagePackCodec};
pub use syslog::{SyslogCodec, is_valid_app_name};

/// Default maximum payload size (in bytes) accepted in either direction.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1 << 20; // 1 MiB

/// Errors raised while decoding inbound bytes.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("missing frame delimiter")]
    MissingDelimiter,
    #[error("invalid length prefix: {0}")]
    InvalidLength(String),
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed record: {0}")]
    MalformedRecord(String),
}

/// Errors raised while encoding outbound messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("payload of {len} bytes exceeds frame limit of {max}")]
    FrameTooLarge { len: usize, max: usize },
    #[error("{framing} framing cannot carry {opcode} messages")]
    UnsupportedOpcode {
        framing: &'static str,
        opcode: Opcode,
    },
    #[error("serialisation failed: {0}")]
    Serialise(String),
}

/// Converts records to payload bytes and back.
///
/// Implementors must be thread-safe so a codec can be shared between the
/// session thread and producers.
pub trait RecordCodec: Send + Sync {
    /// Render a record as a payload. Must be deterministic.
    fn encode(&self, record: &LogRecord) -> Result<Vec<u8>, EncodeError>;

    /// Parse a payload produced by [`RecordCodec::encode`].
    fn decode(&self, payload: &[u8]) -> Result<LogRecord, ParseError>;

    /// Whether payloads are UTF-8 text (sent as websocket text frames).
    fn is_text(&self) -> bool {
        true
    }
}

/// Shared codec trait object.
#[derive(Clone)]
pub struct SharedCodec {
    inner: Arc<dyn RecordCodec>,
}

impl SharedCodec {
    pub fn new<C>(codec: C) -> Self
    where
        C: RecordCodec + 'static,
    {
        Self {
            inner: Arc::new(codec),
        }
    }
}

impl fmt::Debug for SharedCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedCodec(<dyn RecordCodec>)")
    }
}

/// Built-in record encodings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RecordFormat {
    #[default]
    Syslog,
    Json,
    MessagePack,
}

impl RecordFormat {
    fn codec(self) -> SharedCodec {
        match self {
            RecordFormat::Syslog => SharedCodec::new(SyslogCodec::default()),
            RecordFormat::Json => SharedCodec::new(JsonCodec),
            RecordFormat::MessagePack => SharedCodec::new(MessagePackCodec),
        }
    }
}

impl fmt::Display for RecordFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordFormat::Syslog => "syslog",
            RecordFormat::Json => "json",
            RecordFormat::MessagePack => "msgpack",
        })
    }
}

impl FromStr for RecordFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "syslog" | "rfc5424" => Ok(Self::Syslog),
            "json" => Ok(Self::Json),
            "msgpack" | "messagepack" => Ok(Self::MessagePack),
            other => Err(format!(
                "invalid record format '{other}'. Valid options are: syslog, json, msgpack"
            )),
        }
    }
}

/// Codec and framing used by a session.
#[derive(Clone, Debug)]
pub struct Formatter {
    codec: SharedCodec,
    framing: Framing,
    max_frame_size: usize,
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new(RecordFormat::default(), Framing::default())
    }
}

impl Formatter {
    pub fn new(format: RecordFormat, framing: Framing) -> Self {
        Self {
            codec: format.codec(),
            framing,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Build a formatter around a custom codec.
    pub fn from_codec<C>(codec: C, framing: Framing) -> Self
    where
        C: RecordCodec + 'static,
    {
        Self {
            codec: SharedCodec::new(codec),
            framing,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    pub fn is_text(&self) -> bool {
        self.codec.inner.is_text()
    }

    /// Encode a record into a complete frame ready for a byte stream.
    pub fn encode(&self, record: &LogRecord) -> Result<Vec<u8>, EncodeError> {
        let message = self.encode_message(record)?;
        self.encode_frame(&message)
    }

    /// Encode a record into a DATA message.
    pub fn encode_message(&self, record: &LogRecord) -> Result<WireMessage, EncodeError> {
        let payload = self.codec.inner.encode(record)?;
        if payload.len() > self.max_frame_size {
            return Err(EncodeError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_size,
            });
        }
        Ok(WireMessage::data(payload))
    }

    /// Frame an arbitrary message for a byte stream.
    pub fn encode_frame(&self, message: &WireMessage) -> Result<Vec<u8>, EncodeError> {
        self.framing.encode(message, self.max_frame_size)
    }

    /// Decode exactly one complete frame.
    pub fn decode(&self, bytes: &[u8]) -> Result<WireMessage, ParseError> {
        self.framing.decode(bytes, self.max_frame_size)
    }

    /// Decode the record carried by a DATA payload.
    pub fn decode_record(&self, payload: &[u8]) -> Result<LogRecord, ParseError> {
        self.codec.inner.decode(payload)
    }

    /// Incremental decoder for a byte stream using this formatter's framing.
    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder::new(self.framing, self.max_frame_size)
    }
}
