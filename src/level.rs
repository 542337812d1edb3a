//! Severity levels carried by log records.
//!
//! The four levels map onto RFC 5424 severity codes so the syslog codec can
//! derive the PRI value directly from a record.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

/// Error returned when a severity name cannot be parsed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown severity '{0}'")]
pub struct ParseSeverityError(pub String);

impl Severity {
    /// Return the canonical upper-case name of the level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }

    /// RFC 5424 severity code (0 = emergency, 7 = debug).
    pub fn syslog_code(&self) -> u8 {
        match self {
            Severity::Debug => 7,
            Severity::Info => 6,
            Severity::Warn => 4,
            Severity::Error => 3,
        }
    }

    /// Map an RFC 5424 severity code back onto the closest level.
    ///
    /// Codes above emergency collapse into the nearest supported level:
    /// 0..=3 become `Error`, 5 (notice) becomes `Info`.
    pub fn from_syslog_code(code: u8) -> Option<Self> {
        match code {
            0..=3 => Some(Severity::Error),
            4 => Some(Severity::Warn),
            5 | 6 => Some(Severity::Info),
            7 => Some(Severity::Debug),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseSeverityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" => Ok(Self::Error),
            _ => Err(ParseSeverityError(s.to_owned())),
        }
    }
}
