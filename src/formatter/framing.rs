//! Stream framing: delimiting one message from the next on a byte stream.

use std::{fmt, str::FromStr};

use crate::wire::{Opcode, WireMessage};

use super::{EncodeError, ParseError};

/// Size of the `[opcode u8][len u32 BE]` header.
const HEADER_LEN: usize = 5;
/// Longest decimal length accepted by octet counting (`u32::MAX` has 10 digits).
const MAX_LEN_DIGITS: usize = 10;

/// Byte-level framing convention.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Framing {
    /// Binary `[opcode u8][len u32 BE][payload]` frames carrying every opcode.
    #[default]
    LengthPrefixed,
    /// RFC 6587 octet counting (`LEN SP PAYLOAD`), DATA only.
    OctetCounting,
}

impl Framing {
    fn name(self) -> &'static str {
        match self {
            Framing::LengthPrefixed => "length-prefixed",
            Framing::OctetCounting => "octet-counting",
        }
    }

    /// Whether this framing can carry messages of the given kind.
    pub fn supports(self, opcode: Opcode) -> bool {
        match self {
            Framing::LengthPrefixed => true,
            Framing::OctetCounting => opcode == Opcode::Data,
        }
    }

    /// Frame a message, enforcing the payload size limit.
    pub fn encode(self, message: &WireMessage, max_size: usize) -> Result<Vec<u8>, EncodeError> {
        if !self.supports(message.opcode) {
            return Err(EncodeError::UnsupportedOpcode {
                framing: self.name(),
                opcode: message.opcode,
            });
        }
        let payload = &message.payload;
        let too_large = EncodeError::FrameTooLarge {
            len: payload.len(),
            max: max_size,
        };
        if payload.len() > max_size {
            return Err(too_large);
        }
        match self {
            Framing::LengthPrefixed => {
                let len = u32::try_from(payload.len()).map_err(|_| too_large)?;
                let mut framed = Vec::with_capacity(HEADER_LEN + payload.len());
                framed.push(message.opcode.as_byte());
                framed.extend(len.to_be_bytes());
                framed.extend_from_slice(payload);
                Ok(framed)
            }
            Framing::OctetCounting => {
                let prefix = format!("{} ", payload.len());
                let mut framed = Vec::with_capacity(prefix.len() + payload.len());
                framed.extend_from_slice(prefix.as_bytes());
                framed.extend_from_slice(payload);
                Ok(framed)
            }
        }
    }

    /// Decode a buffer holding exactly one frame.
    pub fn decode(self, bytes: &[u8], max_size: usize) -> Result<WireMessage, ParseError> {
        match scan(self, bytes, max_size) {
            Scan::Complete { message, consumed } if consumed == bytes.len() => Ok(message),
            Scan::Complete { consumed, .. } => Err(ParseError::InvalidLength(format!(
                "frame declares {consumed} bytes but {} were supplied",
                bytes.len()
            ))),
            Scan::Rejected { error, .. } => Err(error),
            Scan::Incomplete { needed: Some(expected) } => Err(ParseError::Truncated {
                expected,
                found: bytes.len(),
            }),
            Scan::Incomplete { needed: None } => match self {
                Framing::LengthPrefixed => Err(ParseError::Truncated {
                    expected: HEADER_LEN,
                    found: bytes.len(),
                }),
                Framing::OctetCounting => Err(ParseError::MissingDelimiter),
            },
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "length" | "length-prefixed" => Ok(Self::LengthPrefixed),
            "octet" | "octet-counting" => Ok(Self::OctetCounting),
            other => Err(format!(
                "invalid framing '{other}'. Valid options are: length-prefixed, octet-counting"
            )),
        }
    }
}

/// Outcome of looking for one frame at the start of a buffer.
enum Scan {
    /// More bytes are required; `needed` is the full frame length when known.
    Incomplete { needed: Option<usize> },
    Complete {
        message: WireMessage,
        consumed: usize,
    },
    /// The frame is invalid. `discard` bytes (possibly more than are
    /// buffered) must be skipped to reach the next frame boundary.
    Rejected { error: ParseError, discard: usize },
}

fn scan(framing: Framing, buf: &[u8], max_size: usize) -> Scan {
    match framing {
        Framing::LengthPrefixed => scan_length_prefixed(buf, max_size),
        Framing::OctetCounting => scan_octet_counting(buf, max_size),
    }
}

fn scan_length_prefixed(buf: &[u8], max_size: usize) -> Scan {
    if buf.len() < HEADER_LEN {
        return Scan::Incomplete { needed: None };
    }
    let op = buf[0];
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    let total = HEADER_LEN.saturating_add(len);
    if len > max_size {
        return Scan::Rejected {
            error: ParseError::FrameTooLarge { len, max: max_size },
            discard: total,
        };
    }
    if buf.len() < total {
        return Scan::Incomplete {
            needed: Some(total),
        };
    }
    let payload = &buf[HEADER_LEN..total];
    let Some(opcode) = Opcode::from_byte(op) else {
        return Scan::Rejected {
            error: ParseError::UnknownOpcode(op),
            discard: total,
        };
    };
    if opcode == Opcode::Close && std::str::from_utf8(payload).is_err() {
        return Scan::Rejected {
            error: ParseError::InvalidUtf8,
            discard: total,
        };
    }
    Scan::Complete {
        message: WireMessage::new(opcode, payload),
        consumed: total,
    }
}

/// Bytes to drop when an octet-counted header is unreadable: resynchronise
/// after the next LF, or give up on everything buffered.
fn resync_point(buf: &[u8]) -> usize {
    buf.iter()
        .position(|&b| b == b'\n')
        .map_or(buf.len(), |idx| idx + 1)
}

fn scan_octet_counting(buf: &[u8], max_size: usize) -> Scan {
    let window = &buf[..buf.len().min(MAX_LEN_DIGITS + 1)];
    let Some(space) = window.iter().position(|&b| b == b' ') else {
        if !window.iter().all(u8::is_ascii_digit) {
            return Scan::Rejected {
                error: ParseError::InvalidLength(String::from_utf8_lossy(window).into_owned()),
                discard: resync_point(buf),
            };
        }
        if buf.len() > MAX_LEN_DIGITS {
            return Scan::Rejected {
                error: ParseError::MissingDelimiter,
                discard: resync_point(buf),
            };
        }
        return Scan::Incomplete { needed: None };
    };
    let digits = &buf[..space];
    let parsed = std::str::from_utf8(digits)
        .ok()
        .filter(|d| !d.is_empty() && !d.starts_with('0') && d.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|d| d.parse::<usize>().ok());
    let Some(len) = parsed else {
        return Scan::Rejected {
            error: ParseError::InvalidLength(String::from_utf8_lossy(digits).into_owned()),
            discard: resync_point(buf),
        };
    };
    let total = space + 1 + len;
    if len > max_size {
        return Scan::Rejected {
            error: ParseError::FrameTooLarge { len, max: max_size },
            discard: total,
        };
    }
    if buf.len() < total {
        return Scan::Incomplete {
            needed: Some(total),
        };
    }
    Scan::Complete {
        message: WireMessage::data(&buf[space + 1..total]),
        consumed: total,
    }
}

/// Incremental decoder turning stream chunks into messages.
///
/// Bad frames are reported once and skipped; the decoder stays aligned on
/// the next frame boundary whenever the framing allows it.
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    max_frame_size: usize,
    buffer: Vec<u8>,
    skip: usize,
}

impl FrameDecoder {
    pub fn new(framing: Framing, max_frame_size: usize) -> Self {
        Self {
            framing,
            max_frame_size,
            buffer: Vec::new(),
            skip: 0,
        }
    }

    /// Append bytes read from the stream.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Number of bytes waiting for a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pop the next frame, if one is complete.
    pub fn next_frame(&mut self) -> Option<Result<WireMessage, ParseError>> {
        if self.skip > 0 {
            let n = self.skip.min(self.buffer.len());
            self.buffer.drain(..n);
            self.skip -= n;
            if self.skip > 0 {
                return None;
            }
        }
        match scan(self.framing, &self.buffer, self.max_frame_size) {
            Scan::Incomplete { .. } => None,
            Scan::Complete { message, consumed } => {
                self.buffer.drain(..consumed);
                Some(Ok(message))
            }
            Scan::Rejected { error, discard } => {
                let n = discard.min(self.buffer.len());
                self.buffer.drain(..n);
                self.skip = discard - n;
                Some(Err(error))
            }
        }
    }
}
