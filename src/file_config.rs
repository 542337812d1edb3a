//! INI configuration for sessions.
//!
//! Reads one section of an INI file through `rust-ini` and turns its keys
//! into a [`SessionBuilder`]. Validation still happens when the builder is
//! built, so a file only has to be syntactically sound to load.
//!
//! ```ini
//! [relay]
//! endpoint = wss://relay.example.com
//! stream_path = /logstream/web-1
//! format = json
//! max_reconnect_attempts = 5
//! ```

use std::{fs, io::ErrorKind, path::Path, str::FromStr};

use ini::{Ini, Properties};

use crate::builder::{BuildError, SessionBuilder};

const KNOWN_KEYS: &[&str] = &[
    "endpoint",
    "max_queue_size",
    "overflow",
    "max_reconnect_attempts",
    "backoff_base_ms",
    "backoff_cap_ms",
    "backoff_jitter",
    "connect_timeout_ms",
    "write_timeout_ms",
    "poll_interval_ms",
    "drain_timeout_ms",
    "max_frame_size",
    "format",
    "framing",
    "hostname",
    "facility",
    "app_name",
    "stream_path",
    "tls_domain",
    "tls_insecure",
    "ping_interval_ms",
    "pong_wait_ms",
];

/// Load `section` of the INI file at `path`.
pub fn load_ini(path: impl AsRef<Path>, section: &str) -> Result<SessionBuilder, BuildError> {
    let path = path.as_ref();
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(BuildError::InvalidConfig(format!(
                "{} doesn't exist",
                path.display()
            )));
        }
        Err(err) => return Err(BuildError::Io(err)),
    };
    if text.trim().is_empty() {
        return Err(BuildError::InvalidConfig(format!(
            "{} is an empty file",
            path.display()
        )));
    }
    let ini = Ini::load_from_str(&text)
        .map_err(|err| BuildError::InvalidConfig(format!("{} is invalid: {err}", path.display())))?;
    builder_from_ini(&ini, section)
}

/// Build a [`SessionBuilder`] from an already parsed INI document.
pub fn builder_from_ini(ini: &Ini, section: &str) -> Result<SessionBuilder, BuildError> {
    let props = ini
        .section(Some(section))
        .ok_or_else(|| BuildError::InvalidConfig(format!("missing section [{section}]")))?;
    reject_unknown_keys(section, props)?;
    let reader = SectionReader { section, props };

    let mut builder = SessionBuilder::new();
    if let Some(endpoint) = props.get("endpoint") {
        builder = builder.with_endpoint(endpoint.trim());
    }
    if let Some(v) = reader.parsed("max_queue_size")? {
        builder = builder.with_max_queue_size(v);
    }
    if let Some(v) = reader.parsed("overflow")? {
        builder = builder.with_overflow_policy(v);
    }
    if let Some(v) = reader.parsed("max_reconnect_attempts")? {
        builder = builder.with_max_reconnect_attempts(v);
    }
    if let Some(v) = reader.parsed("backoff_base_ms")? {
        builder = builder.with_backoff_base_ms(v);
    }
    if let Some(v) = reader.parsed("backoff_cap_ms")? {
        builder = builder.with_backoff_cap_ms(v);
    }
    if let Some(v) = reader.parsed("backoff_jitter")? {
        builder = builder.with_backoff_jitter(v);
    }
    if let Some(v) = reader.parsed("connect_timeout_ms")? {
        builder = builder.with_connect_timeout_ms(v);
    }
    if let Some(v) = reader.parsed("write_timeout_ms")? {
        builder = builder.with_write_timeout_ms(v);
    }
    if let Some(v) = reader.parsed("poll_interval_ms")? {
        builder = builder.with_poll_interval_ms(v);
    }
    if let Some(v) = reader.parsed("drain_timeout_ms")? {
        builder = builder.with_drain_timeout_ms(v);
    }
    if let Some(v) = reader.parsed("max_frame_size")? {
        builder = builder.with_max_frame_size(v);
    }
    if let Some(v) = reader.parsed("format")? {
        builder = builder.with_format(v);
    }
    if let Some(v) = reader.parsed("framing")? {
        builder = builder.with_framing(v);
    }
    if let Some(v) = reader.text("hostname") {
        builder = builder.with_hostname(v);
    }
    if let Some(v) = reader.parsed("facility")? {
        builder = builder.with_facility(v);
    }
    if let Some(v) = reader.text("app_name") {
        builder = builder.with_app_name(v);
    }
    if let Some(v) = reader.text("stream_path") {
        builder = builder.with_stream_path(v);
    }
    if let Some(v) = reader.parsed("ping_interval_ms")? {
        builder = builder.with_ping_interval_ms(v);
    }
    if let Some(v) = reader.parsed("pong_wait_ms")? {
        builder = builder.with_pong_wait_ms(v);
    }
    let domain = reader.text("tls_domain");
    let insecure = reader.flag("tls_insecure")?;
    if domain.is_some() || insecure.is_some() {
        builder = builder.with_tls(domain, insecure.unwrap_or(false));
    }
    Ok(builder)
}

fn reject_unknown_keys(section: &str, props: &Properties) -> Result<(), BuildError> {
    match props.iter().find(|(key, _)| !KNOWN_KEYS.contains(key)) {
        Some((key, _)) => Err(BuildError::InvalidConfig(format!(
            "unknown key '{key}' in section [{section}]"
        ))),
        None => Ok(()),
    }
}

struct SectionReader<'a> {
    section: &'a str,
    props: &'a Properties,
}

impl SectionReader<'_> {
    fn text(&self, key: &str) -> Option<String> {
        self.props.get(key).map(|v| v.trim().to_owned())
    }

    fn parsed<T>(&self, key: &str) -> Result<Option<T>, BuildError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.props.get(key) else {
            return Ok(None);
        };
        raw.trim().parse().map(Some).map_err(|err| {
            BuildError::InvalidConfig(format!(
                "[{}] {key} = '{}': {err}",
                self.section,
                raw.trim()
            ))
        })
    }

    fn flag(&self, key: &str) -> Result<Option<bool>, BuildError> {
        let Some(raw) = self.props.get(key) else {
            return Ok(None);
        };
        match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => Err(BuildError::InvalidConfig(format!(
                "[{}] {key} = '{other}': expected a boolean",
                self.section
            ))),
        }
    }
}
