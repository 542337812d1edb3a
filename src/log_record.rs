//! Log record representation for the relay client.
//!
//! A [`LogRecord`] is immutable once built: constructors capture the
//! timestamp and validate the hostname, facility, and structured field names
//! so every record can be rendered by any of the wire codecs without loss.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::level::Severity;

/// Sub-second precision retained on timestamps (microseconds, as RFC 5424
/// `TIME-SECFRAC` allows at most six digits).
const TIMESTAMP_DIGITS: u16 = 6;
const MAX_HOSTNAME_LEN: usize = 255;
const MAX_LABEL_LEN: usize = 63;
const MAX_FIELD_NAME_LEN: usize = 32;
/// RFC 3339 `date-fullyear` is exactly four digits.
const MAX_YEAR: i32 = 9999;

/// Errors raised while constructing a record.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid hostname '{0}'")]
    InvalidHostname(String),
    #[error("facility {0} is outside the syslog range 0..=23")]
    InvalidFacility(u8),
    #[error("timestamp {0} is outside the years 0000..=9999")]
    InvalidTimestamp(DateTime<Utc>),
    #[error("invalid structured field name '{0}'")]
    InvalidFieldName(String),
}

/// Syslog facility identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Facility(u8);

impl Facility {
    pub const KERN: Facility = Facility(0);
    pub const USER: Facility = Facility(1);
    pub const DAEMON: Facility = Facility(3);
    pub const LOCAL0: Facility = Facility(16);
    pub const LOCAL7: Facility = Facility(23);

    pub fn new(code: u8) -> Result<Self, RecordError> {
        if code > 23 {
            return Err(RecordError::InvalidFacility(code));
        }
        Ok(Self(code))
    }

    pub fn code(&self) -> u8 {
        self.0
    }
}

impl Default for Facility {
    fn default() -> Self {
        Self::USER
    }
}

impl TryFrom<u8> for Facility {
    type Error = RecordError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::new(code)
    }
}

impl From<Facility> for u8 {
    fn from(facility: Facility) -> Self {
        facility.0
    }
}

/// Validated host name attached to every record.
///
/// Labels follow DNS rules (ASCII alphanumerics and `-`, no leading or
/// trailing hyphen) so the name is safe as a syslog HOSTNAME field and as a
/// websocket route segment.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Hostname(String);

impl Hostname {
    pub fn parse(name: impl Into<String>) -> Result<Self, RecordError> {
        let name = name.into();
        if is_valid_hostname(&name) {
            Ok(Self(name))
        } else {
            Err(RecordError::InvalidHostname(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= MAX_LABEL_LEN
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
    })
}

impl Default for Hostname {
    fn default() -> Self {
        Self("localhost".into())
    }
}

impl TryFrom<String> for Hostname {
    type Error = RecordError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Hostname> for String {
    fn from(hostname: Hostname) -> Self {
        hostname.0
    }
}

impl fmt::Display for Hostname {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Check a structured field name against RFC 5424 `SD-NAME` rules.
pub fn is_valid_field_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_FIELD_NAME_LEN
        && name
            .bytes()
            .all(|b| (33..=126).contains(&b) && !matches!(b, b'=' | b']' | b'"'))
}

#[derive(Deserialize)]
struct RawRecord {
    timestamp: DateTime<Utc>,
    severity: Severity,
    facility: Facility,
    hostname: Hostname,
    message: String,
    #[serde(default)]
    fields: BTreeMap<String, String>,
}

/// A single structured log event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRecord")]
pub struct LogRecord {
    timestamp: DateTime<Utc>,
    severity: Severity,
    facility: Facility,
    hostname: Hostname,
    message: String,
    fields: BTreeMap<String, String>,
}

fn normalise_timestamp(timestamp: DateTime<Utc>) -> Result<DateTime<Utc>, RecordError> {
    if !(0..=MAX_YEAR).contains(&timestamp.year()) {
        return Err(RecordError::InvalidTimestamp(timestamp));
    }
    Ok(timestamp.trunc_subsecs(TIMESTAMP_DIGITS))
}

impl TryFrom<RawRecord> for LogRecord {
    type Error = RecordError;

    fn try_from(raw: RawRecord) -> Result<Self, Self::Error> {
        if let Some(bad) = raw.fields.keys().find(|k| !is_valid_field_name(k)) {
            return Err(RecordError::InvalidFieldName(bad.clone()));
        }
        Ok(Self {
            timestamp: normalise_timestamp(raw.timestamp)?,
            severity: raw.severity,
            facility: raw.facility,
            hostname: raw.hostname,
            message: raw.message,
            fields: raw.fields,
        })
    }
}

impl LogRecord {
    /// Construct a record stamped with the current time and default origin.
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().trunc_subsecs(TIMESTAMP_DIGITS),
            severity,
            facility: Facility::default(),
            hostname: Hostname::default(),
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Override the timestamp. Only years 0000..=9999 are accepted, the
    /// range every codec can render.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Result<Self, RecordError> {
        self.timestamp = normalise_timestamp(timestamp)?;
        Ok(self)
    }

    pub fn with_hostname(mut self, hostname: Hostname) -> Self {
        self.hostname = hostname;
        self
    }

    pub fn with_facility(mut self, facility: Facility) -> Self {
        self.facility = facility;
        self
    }

    /// Attach a structured field, rejecting names syslog cannot carry.
    pub fn with_field(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Self, RecordError> {
        let name = name.into();
        if !is_valid_field_name(&name) {
            return Err(RecordError::InvalidFieldName(name));
        }
        self.fields.insert(name, value.into());
        Ok(self)
    }

    /// Attach every field from an iterator of name/value pairs.
    pub fn with_fields<I, K, V>(self, fields: I) -> Result<Self, RecordError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        fields
            .into_iter()
            .try_fold(self, |record, (k, v)| record.with_field(k, v))
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn facility(&self) -> Facility {
        self.facility
    }

    pub fn hostname(&self) -> &Hostname {
        &self.hostname
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.hostname, self.severity, self.message)
    }
}
