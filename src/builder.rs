//! Builder for [`StreamSession`](crate::session::StreamSession).
//!
//! Exposes endpoint selection, queue sizing, timeout tuning, TLS
//! configuration, record encoding and exponential backoff parameters. Every
//! value is validated before a session is constructed.

use std::{io, path::PathBuf, time::Duration};

use thiserror::Error;

use crate::{
    formatter::{Formatter, Framing, RecordFormat, SyslogCodec, is_valid_app_name},
    log_record::{Facility, Hostname},
    queue::OverflowPolicy,
    session::{KeepalivePolicy, SessionConfig, StreamSession},
    transport::{Endpoint, TlsOptions},
};

/// Errors raised while building a session.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Invalid user supplied configuration.
    #[error("invalid session configuration: {0}")]
    InvalidConfig(String),
    /// Underlying I/O error whilst creating the session.
    #[error(transparent)]
    Io(#[from] io::Error),
}

macro_rules! ensure_positive {
    ($value:expr, $field:expr) => {{
        if $value == 0 {
            Err(BuildError::InvalidConfig(format!(
                "{} must be greater than zero",
                $field
            )))
        } else {
            Ok($value)
        }
    }};
}

macro_rules! option_setter {
    ($(#[$meta:meta])* $fn_name:ident, $field:ident, $ty:ty) => {
        $(#[$meta])*
        pub fn $fn_name(mut self, value: $ty) -> Self {
            self.$field = Some(value);
            self
        }
    };
}

#[derive(Clone, Debug)]
enum EndpointConfig {
    Address(String),
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

#[derive(Clone, Debug, Default)]
struct TlsConfig {
    domain: Option<String>,
    insecure: bool,
}

/// Builder for constructing [`StreamSession`] instances.
#[derive(Clone, Debug, Default)]
pub struct SessionBuilder {
    endpoint: Option<EndpointConfig>,
    tls: Option<TlsConfig>,
    stream_path: Option<String>,
    max_queue_size: Option<usize>,
    overflow: Option<OverflowPolicy>,
    max_reconnect_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_cap_ms: Option<u64>,
    backoff_jitter: Option<f64>,
    connect_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    drain_timeout_ms: Option<u64>,
    max_frame_size: Option<usize>,
    format: Option<RecordFormat>,
    framing: Option<Framing>,
    app_name: Option<String>,
    hostname: Option<String>,
    facility: Option<u8>,
    ping_interval_ms: Option<u64>,
    pong_wait_ms: Option<u64>,
}

impl SessionBuilder {
    /// Create a new builder with no endpoint configured.
    pub fn new() -> Self {
        Self::default()
    }

    /// Target an endpoint string such as `tcp://host:514` or
    /// `wss://relay/logstream/web-1`. See [`Endpoint::parse`].
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(EndpointConfig::Address(endpoint.into()));
        self
    }

    /// Configure the builder to use TCP.
    pub fn with_tcp(mut self, host: impl Into<String>, port: u16) -> Self {
        self.endpoint = Some(EndpointConfig::Tcp {
            host: host.into(),
            port,
        });
        self
    }

    /// Configure the builder to use a Unix domain socket.
    pub fn with_unix_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.endpoint = Some(EndpointConfig::Unix { path: path.into() });
        self
    }

    /// Configure TLS using the provided domain and validation policy.
    pub fn with_tls(mut self, domain: Option<String>, insecure: bool) -> Self {
        self.tls = Some(TlsConfig { domain, insecure });
        self
    }

    /// Enable keepalive probing of idle connections.
    pub fn with_keepalive(mut self, ping_interval_ms: u64, pong_wait_ms: u64) -> Self {
        self.ping_interval_ms = Some(ping_interval_ms);
        self.pong_wait_ms = Some(pong_wait_ms);
        self
    }

    option_setter!(
        #[doc = "Set the delivery queue capacity."]
        with_max_queue_size,
        max_queue_size,
        usize
    );
    option_setter!(with_overflow_policy, overflow, OverflowPolicy);
    option_setter!(
        #[doc = "Set how many reconnect attempts are made before the session fails."]
        with_max_reconnect_attempts,
        max_reconnect_attempts,
        u32
    );
    option_setter!(with_backoff_base_ms, backoff_base_ms, u64);
    option_setter!(with_backoff_cap_ms, backoff_cap_ms, u64);
    option_setter!(
        #[doc = "Set relative backoff jitter; must lie in `[0, 1)`."]
        with_backoff_jitter,
        backoff_jitter,
        f64
    );
    option_setter!(with_connect_timeout_ms, connect_timeout_ms, u64);
    option_setter!(with_write_timeout_ms, write_timeout_ms, u64);
    option_setter!(with_poll_interval_ms, poll_interval_ms, u64);
    option_setter!(
        #[doc = "Bound how long `stop` waits for the queue to drain."]
        with_drain_timeout_ms,
        drain_timeout_ms,
        u64
    );
    option_setter!(with_max_frame_size, max_frame_size, usize);
    option_setter!(with_format, format, RecordFormat);
    option_setter!(with_framing, framing, Framing);
    option_setter!(with_app_name, app_name, String);
    option_setter!(with_hostname, hostname, String);
    option_setter!(with_facility, facility, u8);
    option_setter!(
        #[doc = "Websocket request path, e.g. from [`logstream_path`](crate::transport::logstream_path)."]
        with_stream_path,
        stream_path,
        String
    );
    option_setter!(with_ping_interval_ms, ping_interval_ms, u64);
    option_setter!(with_pong_wait_ms, pong_wait_ms, u64);

    /// Validate the options and assemble the endpoint and configuration.
    pub fn build_config(&self) -> Result<(Endpoint, SessionConfig), BuildError> {
        let endpoint = self.build_endpoint()?;
        self.validate_positive()?;
        let mut config = SessionConfig::default();
        self.apply_optional_fields(&mut config)?;
        self.apply_backoff(&mut config)?;
        config.formatter = self.build_formatter()?;
        config.keepalive = self.build_keepalive(&endpoint, &config.formatter)?;
        if self.stream_path.is_some() && !endpoint.is_websocket() {
            return Err(BuildError::InvalidConfig(
                "stream_path is only supported for websocket endpoints".into(),
            ));
        }
        config.stream_path = self.stream_path.clone();
        Ok((endpoint, config))
    }

    /// Build a session in the DISCONNECTED state.
    pub fn build(&self) -> Result<StreamSession, BuildError> {
        let (endpoint, config) = self.build_config()?;
        Ok(StreamSession::create(endpoint, config))
    }

    /// Build and start a session.
    pub fn connect(&self) -> Result<StreamSession, BuildError> {
        let session = self.build()?;
        session.start()?;
        Ok(session)
    }

    fn build_endpoint(&self) -> Result<Endpoint, BuildError> {
        let endpoint = match &self.endpoint {
            None => {
                return Err(BuildError::InvalidConfig(
                    "session requires an endpoint".into(),
                ));
            }
            Some(EndpointConfig::Address(address)) => Endpoint::parse(address)
                .map_err(|err| BuildError::InvalidConfig(err.to_string()))?,
            Some(EndpointConfig::Tcp { host, port }) => {
                if host.trim().is_empty() {
                    return Err(BuildError::InvalidConfig(
                        "tcp host must not be empty".into(),
                    ));
                }
                ensure_positive!(*port, "port")?;
                Endpoint::tcp(host.clone(), *port)
            }
            Some(EndpointConfig::Unix { path }) => Endpoint::unix(path.clone()),
        };
        let Some(tls) = &self.tls else {
            return Ok(endpoint);
        };
        let options = |host: &str| TlsOptions {
            domain: tls
                .domain
                .clone()
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| host.to_owned()),
            insecure_skip_verify: tls.insecure,
        };
        match endpoint {
            Endpoint::Unix(_) => Err(BuildError::InvalidConfig(
                "tls is only supported for tcp and websocket transports".into(),
            )),
            Endpoint::Tcp(mut tcp) => {
                tcp.tls = Some(options(&tcp.host));
                Ok(Endpoint::Tcp(tcp))
            }
            Endpoint::WebSocket(mut ws) => {
                if ws.tls.is_none() {
                    return Err(BuildError::InvalidConfig(
                        "tls requires a wss:// endpoint".into(),
                    ));
                }
                ws.tls = Some(options(&ws.host));
                Ok(Endpoint::WebSocket(ws))
            }
        }
    }

    fn validate_positive(&self) -> Result<(), BuildError> {
        if let Some(size) = self.max_queue_size {
            ensure_positive!(size, "max_queue_size")?;
        }
        if let Some(size) = self.max_frame_size {
            ensure_positive!(size, "max_frame_size")?;
        }
        let timings = [
            (self.connect_timeout_ms, "connect_timeout_ms"),
            (self.write_timeout_ms, "write_timeout_ms"),
            (self.poll_interval_ms, "poll_interval_ms"),
            (self.drain_timeout_ms, "drain_timeout_ms"),
            (self.backoff_base_ms, "backoff_base_ms"),
            (self.backoff_cap_ms, "backoff_cap_ms"),
            (self.ping_interval_ms, "ping_interval_ms"),
            (self.pong_wait_ms, "pong_wait_ms"),
        ];
        for (value, field) in timings {
            if let Some(ms) = value {
                ensure_positive!(ms, field)?;
            }
        }
        Ok(())
    }

    fn apply_optional_fields(&self, config: &mut SessionConfig) -> Result<(), BuildError> {
        if let Some(size) = self.max_queue_size {
            config.max_queue_size = size;
        }
        if let Some(overflow) = self.overflow {
            config.overflow = overflow;
        }
        if let Some(timeout) = self.connect_timeout_ms {
            config.connect_timeout = Duration::from_millis(timeout);
        }
        if let Some(timeout) = self.write_timeout_ms {
            config.write_timeout = Duration::from_millis(timeout);
        }
        if let Some(interval) = self.poll_interval_ms {
            config.poll_interval = Duration::from_millis(interval);
        }
        if let Some(timeout) = self.drain_timeout_ms {
            config.drain_timeout = Duration::from_millis(timeout);
        }
        if let Some(hostname) = &self.hostname {
            config.hostname = Hostname::parse(hostname.as_str())
                .map_err(|err| BuildError::InvalidConfig(err.to_string()))?;
        }
        if let Some(code) = self.facility {
            config.facility =
                Facility::new(code).map_err(|err| BuildError::InvalidConfig(err.to_string()))?;
        }
        Ok(())
    }

    fn apply_backoff(&self, config: &mut SessionConfig) -> Result<(), BuildError> {
        let policy = &mut config.backoff;
        if let Some(attempts) = self.max_reconnect_attempts {
            policy.max_attempts = attempts;
        }
        if let Some(base) = self.backoff_base_ms {
            policy.base = Duration::from_millis(base);
        }
        if let Some(cap) = self.backoff_cap_ms {
            policy.cap = Duration::from_millis(cap);
        }
        if let Some(jitter) = self.backoff_jitter {
            if !(0.0..1.0).contains(&jitter) {
                return Err(BuildError::InvalidConfig(format!(
                    "backoff_jitter must be in [0, 1), got {jitter}"
                )));
            }
            policy.jitter = jitter;
        }
        if policy.cap < policy.base {
            return Err(BuildError::InvalidConfig(
                "backoff_cap_ms must not be smaller than backoff_base_ms".into(),
            ));
        }
        Ok(())
    }

    fn build_formatter(&self) -> Result<Formatter, BuildError> {
        let format = self.format.unwrap_or_default();
        let framing = self.framing.unwrap_or_default();
        let formatter = match (&self.app_name, format) {
            (None, format) => Formatter::new(format, framing),
            (Some(name), RecordFormat::Syslog) => {
                if !is_valid_app_name(name) {
                    return Err(BuildError::InvalidConfig(format!(
                        "invalid app_name '{name}': expected 1..=48 printable ASCII characters"
                    )));
                }
                Formatter::from_codec(SyslogCodec::new(name.as_str()), framing)
            }
            (Some(_), _) => {
                return Err(BuildError::InvalidConfig(
                    "app_name only applies to the syslog format".into(),
                ));
            }
        };
        Ok(match self.max_frame_size {
            Some(size) => formatter.with_max_frame_size(size),
            None => formatter,
        })
    }

    fn build_keepalive(
        &self,
        endpoint: &Endpoint,
        formatter: &Formatter,
    ) -> Result<Option<KeepalivePolicy>, BuildError> {
        if self.ping_interval_ms.is_none() && self.pong_wait_ms.is_none() {
            return Ok(None);
        }
        let defaults = KeepalivePolicy::default();
        let policy = KeepalivePolicy {
            ping_interval: self
                .ping_interval_ms
                .map_or(defaults.ping_interval, Duration::from_millis),
            pong_wait: self
                .pong_wait_ms
                .map_or(defaults.pong_wait, Duration::from_millis),
        };
        if !endpoint.is_websocket() && formatter.framing() == Framing::OctetCounting {
            return Err(BuildError::InvalidConfig(
                "keepalive requires a framing that carries control frames".into(),
            ));
        }
        Ok(Some(policy))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn invalid(builder: SessionBuilder) -> String {
        match builder.build_config() {
            Err(BuildError::InvalidConfig(msg)) => msg,
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[rstest]
    fn builder_requires_endpoint() {
        assert!(invalid(SessionBuilder::new()).contains("endpoint"));
    }

    #[rstest]
    fn defaults_follow_documented_values() {
        let (endpoint, config) = SessionBuilder::new()
            .with_endpoint("127.0.0.1:9020")
            .build_config()
            .expect("valid");
        assert_eq!(endpoint, Endpoint::tcp("127.0.0.1", 9020));
        assert_eq!(config.max_queue_size, 10_000);
        assert_eq!(config.backoff.max_attempts, 10);
        assert_eq!(config.backoff.base, Duration::from_secs(1));
        assert_eq!(config.backoff.cap, Duration::from_secs(30));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert!(config.keepalive.is_none());
    }

    #[rstest]
    #[case(SessionBuilder::new().with_tcp("h", 1).with_max_queue_size(0), "max_queue_size")]
    #[case(SessionBuilder::new().with_tcp("h", 1).with_connect_timeout_ms(0), "connect_timeout_ms")]
    #[case(SessionBuilder::new().with_tcp("h", 1).with_backoff_base_ms(0), "backoff_base_ms")]
    #[case(SessionBuilder::new().with_tcp("h", 1).with_max_frame_size(0), "max_frame_size")]
    #[case(SessionBuilder::new().with_tcp("h", 0), "port")]
    #[case(SessionBuilder::new().with_tcp(" ", 1), "host")]
    #[case(SessionBuilder::new().with_tcp("h", 1).with_backoff_base_ms(500).with_backoff_cap_ms(100), "backoff_cap_ms")]
    #[case(SessionBuilder::new().with_tcp("h", 1).with_backoff_jitter(1.5), "backoff_jitter")]
    #[case(SessionBuilder::new().with_tcp("h", 1).with_hostname("bad host".into()), "hostname")]
    #[case(SessionBuilder::new().with_tcp("h", 1).with_facility(24), "facility")]
    #[case(SessionBuilder::new().with_endpoint("nonsense"), "endpoint")]
    fn builder_rejects_invalid_values(#[case] builder: SessionBuilder, #[case] field: &str) {
        let msg = invalid(builder);
        assert!(msg.contains(field), "message '{msg}' should mention {field}");
    }

    #[rstest]
    fn builder_rejects_tls_for_unix() {
        let msg = invalid(
            SessionBuilder::new()
                .with_unix_path("/tmp/streamrelay.sock")
                .with_tls(Some("example.com".into()), false),
        );
        assert!(msg.contains("tls"));
    }

    #[rstest]
    fn tls_domain_defaults_to_host() {
        let (endpoint, _) = SessionBuilder::new()
            .with_tcp("logs.example.com", 6514)
            .with_tls(None, true)
            .build_config()
            .expect("valid");
        assert_eq!(
            endpoint.tls(),
            Some(&TlsOptions {
                domain: "logs.example.com".into(),
                insecure_skip_verify: true,
            })
        );
    }

    #[rstest]
    fn keepalive_needs_control_frames() {
        let msg = invalid(
            SessionBuilder::new()
                .with_tcp("h", 514)
                .with_framing(Framing::OctetCounting)
                .with_keepalive(1_000, 500),
        );
        assert!(msg.contains("keepalive"));
        let (_, config) = SessionBuilder::new()
            .with_endpoint("ws://relay:8000")
            .with_framing(Framing::OctetCounting)
            .with_keepalive(1_000, 500)
            .build_config()
            .expect("websockets carry pings");
        assert_eq!(
            config.keepalive,
            Some(KeepalivePolicy {
                ping_interval: Duration::from_secs(1),
                pong_wait: Duration::from_millis(500),
            })
        );
    }

    #[rstest]
    fn stream_path_requires_websocket() {
        let msg = invalid(
            SessionBuilder::new()
                .with_tcp("h", 1)
                .with_stream_path("/logstream/web-1".into()),
        );
        assert!(msg.contains("stream_path"));
    }

    #[rstest]
    fn app_name_only_for_syslog() {
        let msg = invalid(
            SessionBuilder::new()
                .with_tcp("h", 1)
                .with_format(RecordFormat::Json)
                .with_app_name("relay".into()),
        );
        assert!(msg.contains("app_name"));
    }

    #[rstest]
    fn build_leaves_session_disconnected() {
        let session = SessionBuilder::new()
            .with_endpoint("127.0.0.1:9")
            .build()
            .expect("valid");
        assert_eq!(
            session.status(),
            crate::session::ConnectionStatus::Disconnected
        );
    }
}
