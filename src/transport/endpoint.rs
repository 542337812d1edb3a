//! Endpoint descriptions and address parsing.

use std::{fmt, io, path::PathBuf, str::FromStr};

use native_tls::TlsConnector;

use crate::log_record::Hostname;

use super::EndpointError;

const DEFAULT_WS_PORT: u16 = 80;
const DEFAULT_WSS_PORT: u16 = 443;

/// Route under which a relay publishes the live stream of one host.
pub fn logstream_path(hostname: &Hostname) -> String {
    format!("/logstream/{hostname}")
}

/// Remote peer a session connects to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP stream with optional TLS.
    Tcp(TcpTransport),
    /// Unix domain socket stream.
    Unix(UnixTransport),
    /// WebSocket (`ws://` or `wss://`).
    WebSocket(WebSocketTransport),
}

/// TCP transport configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TcpTransport {
    /// Hostname or IP address to connect to.
    pub host: String,
    /// TCP port number.
    pub port: u16,
    /// Optional TLS configuration.
    pub tls: Option<TlsOptions>,
}

/// Unix domain socket configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnixTransport {
    /// Path to the socket file.
    pub path: PathBuf,
}

/// WebSocket transport configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WebSocketTransport {
    pub host: String,
    pub port: u16,
    /// Request path, always starting with `/`.
    pub path: String,
    /// Present for `wss://` endpoints.
    pub tls: Option<TlsOptions>,
}

/// TLS connection options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsOptions {
    /// Domain name presented during the TLS handshake.
    pub domain: String,
    /// Skip certificate validation when true (intended for tests).
    pub insecure_skip_verify: bool,
}

impl TlsOptions {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            insecure_skip_verify: false,
        }
    }

    pub(crate) fn connector(&self) -> io::Result<TlsConnector> {
        let mut builder = TlsConnector::builder();
        if self.insecure_skip_verify {
            builder.danger_accept_invalid_certs(true);
            builder.danger_accept_invalid_hostnames(true);
        }
        builder.build().map_err(io::Error::other)
    }
}

impl WebSocketTransport {
    /// Full request URL, e.g. `wss://relay.example:443/logstream/web-1`.
    pub fn url(&self) -> String {
        let scheme = if self.tls.is_some() { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{}", bracket_host(&self.host), self.port, self.path)
    }

    /// Replace the request path. A missing leading `/` is added.
    pub fn with_path(mut self, path: &str) -> Self {
        self.path = normalise_path(path);
        self
    }
}

impl Endpoint {
    /// Parse an endpoint string.
    ///
    /// Accepted forms: `host:port` and `tcp://host:port` (plain TCP),
    /// `tls://host:port`, `unix:///path/to.sock`, and
    /// `ws://host[:port][/path]` / `wss://host[:port][/path]`. IPv6 hosts
    /// are written in brackets.
    pub fn parse(input: &str) -> Result<Self, EndpointError> {
        let input = input.trim();
        let invalid = |reason: String| EndpointError {
            input: input.to_owned(),
            reason,
        };
        let Some((scheme, rest)) = input.split_once("://") else {
            let (host, port) = split_host_port(input, None).map_err(invalid)?;
            return Ok(Endpoint::tcp(host, port));
        };
        match scheme.to_ascii_lowercase().as_str() {
            "tcp" => {
                let (host, port) = split_host_port(rest, None).map_err(invalid)?;
                Ok(Endpoint::tcp(host, port))
            }
            "tls" => {
                let (host, port) = split_host_port(rest, None).map_err(invalid)?;
                let tls = Some(TlsOptions::new(host.clone()));
                Ok(Endpoint::Tcp(TcpTransport { host, port, tls }))
            }
            "unix" => {
                if rest.is_empty() {
                    return Err(invalid("missing socket path".into()));
                }
                Ok(Endpoint::Unix(UnixTransport { path: rest.into() }))
            }
            secure @ ("ws" | "wss") => {
                let secure = secure == "wss";
                let (authority, path) = match rest.find('/') {
                    Some(idx) => rest.split_at(idx),
                    None => (rest, "/"),
                };
                let default_port = if secure { DEFAULT_WSS_PORT } else { DEFAULT_WS_PORT };
                let (host, port) =
                    split_host_port(authority, Some(default_port)).map_err(invalid)?;
                let tls = secure.then(|| TlsOptions::new(host.clone()));
                Ok(Endpoint::WebSocket(WebSocketTransport {
                    host,
                    port,
                    path: normalise_path(path),
                    tls,
                }))
            }
            other => Err(invalid(format!(
                "unsupported scheme '{other}'. Valid options are: tcp, tls, unix, ws, wss"
            ))),
        }
    }

    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Endpoint::Tcp(TcpTransport {
            host: host.into(),
            port,
            tls: None,
        })
    }

    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Endpoint::Unix(UnixTransport { path: path.into() })
    }

    pub fn is_websocket(&self) -> bool {
        matches!(self, Endpoint::WebSocket(_))
    }

    /// TLS options in effect, if any.
    pub fn tls(&self) -> Option<&TlsOptions> {
        match self {
            Endpoint::Tcp(tcp) => tcp.tls.as_ref(),
            Endpoint::WebSocket(ws) => ws.tls.as_ref(),
            Endpoint::Unix(_) => None,
        }
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp(tcp) => {
                let scheme = if tcp.tls.is_some() { "tls" } else { "tcp" };
                write!(f, "{scheme}://{}:{}", bracket_host(&tcp.host), tcp.port)
            }
            Endpoint::Unix(unix) => write!(f, "unix://{}", unix.path.display()),
            Endpoint::WebSocket(ws) => f.write_str(&ws.url()),
        }
    }
}

fn bracket_host(host: &str) -> String {
    if host.contains(':') {
        format!("[{host}]")
    } else {
        host.to_owned()
    }
}

fn normalise_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}

fn split_host_port(authority: &str, default_port: Option<u16>) -> Result<(String, u16), String> {
    let (host, port) = if let Some(rest) = authority.strip_prefix('[') {
        let (host, after) = rest
            .split_once(']')
            .ok_or_else(|| "unterminated IPv6 literal".to_owned())?;
        let port = match after {
            "" => None,
            other => Some(
                other
                    .strip_prefix(':')
                    .ok_or_else(|| "expected ':' after IPv6 literal".to_owned())?,
            ),
        };
        (host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    if host.is_empty() {
        return Err("missing host".into());
    }
    let port = match port {
        Some(port) => port
            .parse::<u16>()
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| format!("invalid port '{port}'"))?,
        None => default_port.ok_or_else(|| "missing port".to_owned())?,
    };
    Ok((host.to_owned(), port))
}
