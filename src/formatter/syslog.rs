//! RFC 5424 syslog codec.
//!
//! Records render as
//! `<PRI>1 TIMESTAMP HOSTNAME APP-NAME - - [fields@32473 k="v"] MSG`.
//! PROCID and MSGID are always the NILVALUE; structured fields travel in a
//! single SD-ELEMENT and are read back from every element on decode.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{
    level::Severity,
    log_record::{Facility, Hostname, LogRecord},
};

use super::{EncodeError, ParseError, RecordCodec};

const NILVALUE: &str = "-";
const FIELDS_SD_ID: &str = "fields@32473";
const MAX_APP_NAME_LEN: usize = 48;
const MAX_PRI: u16 = 191;

/// Check an APP-NAME against RFC 5424 (1..=48 printable ASCII, no spaces).
pub fn is_valid_app_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_APP_NAME_LEN
        && name.bytes().all(|b| (33..=126).contains(&b))
}

/// RFC 5424 codec with a fixed APP-NAME.
#[derive(Clone, Debug)]
pub struct SyslogCodec {
    app_name: String,
}

impl Default for SyslogCodec {
    fn default() -> Self {
        Self {
            app_name: NILVALUE.into(),
        }
    }
}

impl SyslogCodec {
    /// Create a codec stamping `app_name` on every record. Names that
    /// violate [`is_valid_app_name`] fall back to the NILVALUE.
    pub fn new(app_name: impl Into<String>) -> Self {
        let app_name = app_name.into();
        if is_valid_app_name(&app_name) {
            Self { app_name }
        } else {
            Self::default()
        }
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }
}

fn escape_param_value(value: &str, out: &mut String) {
    for c in value.chars() {
        if matches!(c, '"' | '\\' | ']') {
            out.push('\\');
        }
        out.push(c);
    }
}

fn render_structured_data(fields: &BTreeMap<String, String>, out: &mut String) {
    if fields.is_empty() {
        out.push_str(NILVALUE);
        return;
    }
    out.push('[');
    out.push_str(FIELDS_SD_ID);
    for (name, value) in fields {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        escape_param_value(value, out);
        out.push('"');
    }
    out.push(']');
}

impl RecordCodec for SyslogCodec {
    fn encode(&self, record: &LogRecord) -> Result<Vec<u8>, EncodeError> {
        let pri = u16::from(record.facility().code()) * 8
            + u16::from(record.severity().syslog_code());
        let timestamp = record
            .timestamp()
            .to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut out = String::with_capacity(96 + record.message().len());
        out.push_str(&format!(
            "<{pri}>1 {timestamp} {} {} {NILVALUE} {NILVALUE} ",
            record.hostname(),
            self.app_name
        ));
        render_structured_data(record.fields(), &mut out);
        if !record.message().is_empty() {
            out.push(' ');
            out.push_str(record.message());
        }
        Ok(out.into_bytes())
    }

    fn decode(&self, payload: &[u8]) -> Result<LogRecord, ParseError> {
        let text = std::str::from_utf8(payload).map_err(|_| ParseError::InvalidUtf8)?;
        let mut cursor = Cursor { rest: text };

        let pri = cursor.priority()?;
        let version = cursor.token("version")?;
        if version != "1" {
            return Err(malformed(format!("unsupported syslog version '{version}'")));
        }
        let timestamp = cursor.token("timestamp")?;
        let hostname = cursor.token("hostname")?;
        cursor.token("app-name")?;
        cursor.token("procid")?;
        cursor.token("msgid")?;
        let fields = cursor.structured_data()?;
        let message = cursor.message()?;

        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|err| malformed(format!("invalid timestamp '{timestamp}': {err}")))?
            .with_timezone(&Utc);
        let hostname = Hostname::parse(hostname).map_err(|err| malformed(err.to_string()))?;
        let severity = Severity::from_syslog_code((pri % 8) as u8)
            .ok_or_else(|| malformed(format!("invalid priority {pri}")))?;
        let facility =
            Facility::new((pri / 8) as u8).map_err(|err| malformed(err.to_string()))?;

        LogRecord::new(severity, message)
            .with_timestamp(timestamp)
            .map_err(|err| malformed(err.to_string()))?
            .with_hostname(hostname)
            .with_facility(facility)
            .with_fields(fields)
            .map_err(|err| malformed(err.to_string()))
    }
}

fn malformed(reason: impl Into<String>) -> ParseError {
    ParseError::MalformedRecord(reason.into())
}

struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn eat(&mut self, c: char) -> bool {
        match self.rest.strip_prefix(c) {
            Some(rest) => {
                self.rest = rest;
                true
            }
            None => false,
        }
    }

    fn expect(&mut self, c: char, context: &str) -> Result<(), ParseError> {
        if self.eat(c) {
            Ok(())
        } else {
            Err(malformed(format!("expected '{c}' {context}")))
        }
    }

    fn take_while(&mut self, keep: impl Fn(char) -> bool) -> &'a str {
        let end = self.rest.find(|c| !keep(c)).unwrap_or(self.rest.len());
        let (taken, rest) = self.rest.split_at(end);
        self.rest = rest;
        taken
    }

    /// Read a space-terminated header field.
    fn token(&mut self, what: &str) -> Result<&'a str, ParseError> {
        let (token, rest) = self
            .rest
            .split_once(' ')
            .ok_or_else(|| malformed(format!("missing {what}")))?;
        if token.is_empty() {
            return Err(malformed(format!("empty {what}")));
        }
        self.rest = rest;
        Ok(token)
    }

    fn priority(&mut self) -> Result<u16, ParseError> {
        self.expect('<', "at start of priority")?;
        let digits = self.take_while(|c| c.is_ascii_digit());
        if digits.is_empty() || digits.len() > 3 {
            return Err(malformed(format!("invalid priority '{digits}'")));
        }
        let pri: u16 = digits
            .parse()
            .map_err(|_| malformed(format!("invalid priority '{digits}'")))?;
        if pri > MAX_PRI {
            return Err(malformed(format!("priority {pri} out of range")));
        }
        self.expect('>', "after priority")?;
        Ok(pri)
    }

    fn structured_data(&mut self) -> Result<BTreeMap<String, String>, ParseError> {
        let mut fields = BTreeMap::new();
        if self.eat('-') {
            return Ok(fields);
        }
        if !self.rest.starts_with('[') {
            return Err(malformed("missing structured data"));
        }
        while self.eat('[') {
            let id = self.take_while(|c| c != ' ' && c != ']');
            if id.is_empty() {
                return Err(malformed("empty SD-ID"));
            }
            while self.eat(' ') {
                let name = self.take_while(|c| c != '=');
                self.expect('=', "after SD-PARAM name")?;
                self.expect('"', "before SD-PARAM value")?;
                let value = self.param_value()?;
                fields.insert(name.to_owned(), value);
            }
            self.expect(']', "closing SD-ELEMENT")?;
        }
        Ok(fields)
    }

    fn param_value(&mut self) -> Result<String, ParseError> {
        let rest = self.rest;
        let mut value = String::new();
        let mut chars = rest.char_indices();
        while let Some((idx, c)) = chars.next() {
            match c {
                '"' => {
                    self.rest = &rest[idx + 1..];
                    return Ok(value);
                }
                '\\' => match chars.next() {
                    Some((_, escaped @ ('"' | '\\' | ']'))) => value.push(escaped),
                    Some((_, other)) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => break,
                },
                _ => value.push(c),
            }
        }
        Err(malformed("unterminated SD-PARAM value"))
    }

    fn message(&mut self) -> Result<String, ParseError> {
        if self.rest.is_empty() {
            return Ok(String::new());
        }
        self.expect(' ', "before message")?;
        let message = std::mem::take(&mut self.rest);
        Ok(message.to_owned())
    }
}
