//! TLS and DTLS on top of asynchronous sockets and streams.
//!
//! Record protection and the handshake itself are done by OpenSSL. The
//! adapters here only sequence the engine against transport readiness: bytes
//! the engine produces are written to the wrapped transport, bytes the
//! transport delivers are fed to the engine.

use std::fmt;
use std::time::Duration;

use crate::socket::SocketType;

/// How often a DTLS handshake in progress is driven again.
pub(crate) const HANDSHAKE_POLL: Duration = Duration::from_millis(500);

mod io_buf;

mod engine;

mod session;

mod adapter;
pub use adapter::SslAdapter;

mod stream_adapter;
pub use stream_adapter::SslStreamAdapter;

/// Protocol flavour of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// TLS over a reliable stream.
    #[default]
    Tls,
    /// DTLS over datagrams.
    Dtls,
}

impl SslMode {
    /// The transport type this mode runs over.
    pub fn socket_type(&self) -> SocketType {
        match self {
            SslMode::Tls => SocketType::Stream,
            SslMode::Dtls => SocketType::Datagram,
        }
    }

    pub(crate) fn for_socket_type(kind: SocketType) -> SslMode {
        match kind {
            SocketType::Stream => SslMode::Tls,
            SocketType::Datagram => SslMode::Dtls,
        }
    }
}

impl fmt::Display for SslMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SslMode::Tls => write!(f, "TLS"),
            SslMode::Dtls => write!(f, "DTLS"),
        }
    }
}

/// Which side of the handshake an adapter plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslRole {
    #[default]
    Client,
    Server,
}

/// Handshake progress of an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslState {
    /// SSL not started; data passes through in the clear.
    #[default]
    None,
    /// SSL started, waiting for the transport to connect.
    Wait,
    /// Handshake in flight.
    Connecting,
    Connected,
    /// Handshake or record layer failure.
    Error,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_picks_transport() {
        assert_eq!(SslMode::Tls.socket_type(), SocketType::Stream);
        assert_eq!(SslMode::Dtls.socket_type(), SocketType::Datagram);
        assert_eq!(SslMode::for_socket_type(SocketType::Datagram), SslMode::Dtls);
        assert_eq!(SslMode::Dtls.to_string(), "DTLS");
    }
}
