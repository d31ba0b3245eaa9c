use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::SocketError;
use crate::signal::Signal;

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }

    /// The "any" address of this family with port 0.
    ///
    /// Binding to it requests an ephemeral local port.
    pub fn any(&self) -> SocketAddr {
        let ip: IpAddr = match self {
            AddressFamily::V4 => Ipv4Addr::UNSPECIFIED.into(),
            AddressFamily::V6 => Ipv6Addr::UNSPECIFIED.into(),
        };
        SocketAddr::new(ip, 0)
    }
}

/// Transport type of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SocketType {
    /// Reliable, ordered byte stream (TCP-like).
    Stream,
    /// Unreliable datagrams (UDP-like).
    Datagram,
}

/// Connection state of a socket or adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnState {
    #[default]
    Closed,
    Connecting,
    Connected,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnState::Closed => write!(f, "closed"),
            ConnState::Connecting => write!(f, "connecting"),
            ConnState::Connected => write!(f, "connected"),
        }
    }
}

/// Readiness notifications of an [`AsyncSocket`].
///
/// `close` carries `None` for an orderly close and the error otherwise.
#[derive(Debug, Default)]
pub struct SocketSignals {
    pub connect: Signal<dyn AsyncSocket>,
    pub read: Signal<dyn AsyncSocket>,
    pub write: Signal<dyn AsyncSocket>,
    pub close: Signal<dyn AsyncSocket, Option<SocketError>>,
}

impl SocketSignals {
    pub fn disconnect_all(&self) {
        self.connect.disconnect_all();
        self.read.disconnect_all();
        self.write.disconnect_all();
        self.close.disconnect_all();
    }
}

/// A non-blocking, event driven socket.
///
/// No operation ever blocks. Readiness is reported exclusively through
/// [`signals`](AsyncSocket::signals); callers should only `accept()` or
/// `recv()` in response to a read signal. Failed operations also record
/// their error so it can be queried with [`last_error`](AsyncSocket::last_error).
pub trait AsyncSocket {
    fn bind(&self, addr: SocketAddr) -> Result<(), SocketError>;

    fn connect(&self, addr: SocketAddr) -> Result<(), SocketError>;

    fn listen(&self, backlog: usize) -> Result<(), SocketError>;

    /// Accept a pending connection on a listening socket.
    ///
    /// Returns [`SocketError::NoPendingConnection`] when nothing is queued.
    fn accept(&self) -> Result<(Box<dyn AsyncSocket>, SocketAddr), SocketError>;

    fn send(&self, buf: &[u8]) -> Result<usize, SocketError>;

    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, SocketError>;

    /// Read available data. `Ok(0)` on a stream socket means end of stream.
    fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError>;

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError>;

    /// Close the socket. Closing an already closed socket does nothing.
    fn close(&self) -> Result<(), SocketError>;

    fn state(&self) -> ConnState;

    fn local_address(&self) -> Option<SocketAddr>;

    fn remote_address(&self) -> Option<SocketAddr>;

    fn socket_type(&self) -> SocketType;

    fn last_error(&self) -> Option<SocketError>;

    fn signals(&self) -> &SocketSignals;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_address_requests_ephemeral_port() {
        let v4 = AddressFamily::V4.any();
        assert!(v4.ip().is_unspecified());
        assert_eq!(v4.port(), 0);
        assert_eq!(AddressFamily::of(&v4), AddressFamily::V4);

        let v6 = AddressFamily::V6.any();
        assert!(v6.is_ipv6());
        assert_eq!(AddressFamily::of(&v6), AddressFamily::V6);
    }
}
