//! Serde-backed codecs: JSON text and MessagePack maps.

use crate::log_record::LogRecord;

use super::{EncodeError, ParseError, RecordCodec};

/// One JSON object per record.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl RecordCodec for JsonCodec {
    fn encode(&self, record: &LogRecord) -> Result<Vec<u8>, EncodeError> {
        serde_json::to_vec(record).map_err(|err| EncodeError::Serialise(err.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<LogRecord, ParseError> {
        let text = std::str::from_utf8(payload).map_err(|_| ParseError::InvalidUtf8)?;
        serde_json::from_str(text).map_err(|err| ParseError::MalformedRecord(err.to_string()))
    }
}

/// MessagePack maps keyed by field name.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessagePackCodec;

impl RecordCodec for MessagePackCodec {
    fn encode(&self, record: &LogRecord) -> Result<Vec<u8>, EncodeError> {
        rmp_serde::to_vec_named(record).map_err(|err| EncodeError::Serialise(err.to_string()))
    }

    fn decode(&self, payload: &[u8]) -> Result<LogRecord, ParseError> {
        rmp_serde::from_slice(payload).map_err(|err| ParseError::MalformedRecord(err.to_string()))
    }

    fn is_text(&self) -> bool {
        false
    }
}
