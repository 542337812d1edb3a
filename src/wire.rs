//! Transport-level message model.

use std::fmt;

/// Kind of a [`WireMessage`].
///
/// Discriminants match the websocket opcodes so both framings agree on the
/// numbering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Data = 0x1,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x1 => Some(Self::Data),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Control opcodes are everything except `Data`.
    pub fn is_control(self) -> bool {
        !matches!(self, Self::Data)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Data => "DATA",
            Opcode::Close => "CLOSE",
            Opcode::Ping => "PING",
            Opcode::Pong => "PONG",
        };
        f.write_str(name)
    }
}

/// One message exchanged with the remote peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMessage {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl WireMessage {
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            payload: payload.into(),
        }
    }

    pub fn data(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Data, payload)
    }

    /// A CLOSE message carrying a UTF-8 reason.
    pub fn close(reason: &str) -> Self {
        Self::new(Opcode::Close, reason.as_bytes())
    }

    pub fn ping(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Ping, payload)
    }

    pub fn pong(payload: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::Pong, payload)
    }

    /// Payload as text, when it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
