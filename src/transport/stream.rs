//! Byte-stream sockets shared by the framed and websocket channels.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

use native_tls::TlsStream;

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use super::endpoint::{TlsOptions, UnixTransport};

/// Active socket connection state.
#[derive(Debug)]
pub(crate) enum StreamSocket {
    PlainTcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl StreamSocket {
    pub(crate) fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            StreamSocket::PlainTcp(stream) => stream.set_write_timeout(timeout),
            StreamSocket::Tls(stream) => stream.get_ref().set_write_timeout(timeout),
            #[cfg(unix)]
            StreamSocket::Unix(stream) => stream.set_write_timeout(timeout),
        }
    }

    pub(crate) fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match self {
            StreamSocket::PlainTcp(stream) => stream.set_read_timeout(timeout),
            StreamSocket::Tls(stream) => stream.get_ref().set_read_timeout(timeout),
            #[cfg(unix)]
            StreamSocket::Unix(stream) => stream.set_read_timeout(timeout),
        }
    }

    /// Best-effort teardown; errors are irrelevant once we are leaving.
    pub(crate) fn shutdown(&mut self) {
        match self {
            StreamSocket::PlainTcp(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            StreamSocket::Tls(stream) => {
                let _ = stream.shutdown();
                let _ = stream.get_ref().shutdown(Shutdown::Both);
            }
            #[cfg(unix)]
            StreamSocket::Unix(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

impl Read for StreamSocket {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            StreamSocket::PlainTcp(stream) => stream.read(buf),
            StreamSocket::Tls(stream) => stream.read(buf),
            #[cfg(unix)]
            StreamSocket::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for StreamSocket {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            StreamSocket::PlainTcp(stream) => stream.write(buf),
            StreamSocket::Tls(stream) => stream.write(buf),
            #[cfg(unix)]
            StreamSocket::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            StreamSocket::PlainTcp(stream) => stream.flush(),
            StreamSocket::Tls(stream) => stream.flush(),
            #[cfg(unix)]
            StreamSocket::Unix(stream) => stream.flush(),
        }
    }
}

/// Connect to the first resolved address that accepts within `timeout`,
/// reporting the last failure otherwise.
pub(crate) fn connect_tcp(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nonblocking(false)?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses resolved for {host}:{port}"),
        )
    }))
}

/// Open a TCP stream and wrap it in TLS when requested. The handshake is
/// bounded by `timeout`.
pub(crate) fn open_tcp(
    host: &str,
    port: u16,
    tls: Option<&TlsOptions>,
    timeout: Duration,
) -> io::Result<StreamSocket> {
    let stream = connect_tcp(host, port, timeout)?;
    let Some(tls) = tls else {
        return Ok(StreamSocket::PlainTcp(stream));
    };
    let connector = tls.connector()?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    let stream = connector
        .connect(&tls.domain, stream)
        .map_err(|err| match err {
            native_tls::HandshakeError::WouldBlock(_) => {
                io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out")
            }
            native_tls::HandshakeError::Failure(err) => io::Error::other(err),
        })?;
    let tcp_ref = stream.get_ref();
    tcp_ref.set_read_timeout(None)?;
    tcp_ref.set_write_timeout(None)?;
    Ok(StreamSocket::Tls(Box::new(stream)))
}

pub(crate) fn open_unix(config: &UnixTransport) -> io::Result<StreamSocket> {
    #[cfg(unix)]
    {
        let stream = UnixStream::connect(&config.path)?;
        Ok(StreamSocket::Unix(stream))
    }
    #[cfg(not(unix))]
    {
        let _ = config;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix domain sockets are not supported on this platform",
        ))
    }
}
