//! Glue between an [`Engine`] and the transport it runs over.

use std::collections::VecDeque;

use super::engine::{Engine, HandshakeStatus};
use crate::error::SocketError;
use crate::socket::{AsyncSocket, SocketType};
use crate::stream::{Stream, StreamResult};

/// Outcome of a transport read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Io {
    Done(usize),
    Blocked,
    Eof,
    Failed,
}

/// The byte pipe under an adapter.
pub(crate) trait Transport {
    fn send_bytes(&self, data: &[u8]) -> Io;

    fn recv_bytes(&self, buf: &mut [u8]) -> Io;

    /// Whether one `send_bytes` carries one whole record.
    fn is_datagram(&self) -> bool;
}

/// An [`AsyncSocket`] as a byte pipe.
pub(crate) struct SocketTransport<'a>(pub &'a dyn AsyncSocket);

impl Transport for SocketTransport<'_> {
    fn send_bytes(&self, data: &[u8]) -> Io {
        match self.0.send(data) {
            Ok(n) => Io::Done(n),
            Err(SocketError::WouldBlock) => Io::Blocked,
            Err(_) => Io::Failed,
        }
    }

    fn recv_bytes(&self, buf: &mut [u8]) -> Io {
        match self.0.recv(buf) {
            Ok(0) if self.0.socket_type() == SocketType::Stream => Io::Eof,
            Ok(n) => Io::Done(n),
            Err(SocketError::WouldBlock) => Io::Blocked,
            Err(_) => Io::Failed,
        }
    }

    fn is_datagram(&self) -> bool {
        self.0.socket_type() == SocketType::Datagram
    }
}

/// A stream is treated as a byte pipe; stream adapters in DTLS mode rely on
/// the wrapped stream keeping write boundaries, as a socket stream over a
/// datagram socket does.
pub(crate) struct StreamTransport<'a> {
    pub stream: &'a dyn Stream,
    pub datagram: bool,
}

impl Transport for StreamTransport<'_> {
    fn send_bytes(&self, data: &[u8]) -> Io {
        match self.stream.write(data) {
            StreamResult::Success(n) => Io::Done(n),
            StreamResult::Blocked => Io::Blocked,
            StreamResult::Eos => Io::Eof,
            StreamResult::Error(_) => Io::Failed,
        }
    }

    fn recv_bytes(&self, buf: &mut [u8]) -> Io {
        match self.stream.read(buf) {
            StreamResult::Success(n) => Io::Done(n),
            StreamResult::Blocked => Io::Blocked,
            StreamResult::Eos => Io::Eof,
            StreamResult::Error(_) => Io::Failed,
        }
    }

    fn is_datagram(&self) -> bool {
        self.datagram
    }
}

/// An engine plus the records the transport has not accepted yet.
pub(crate) struct Session {
    pub engine: Engine,
    pending: VecDeque<Vec<u8>>,
    eof: bool,
}

impl Session {
    pub fn new(engine: Engine) -> Self {
        Session {
            engine,
            pending: VecDeque::new(),
            eof: false,
        }
    }

    /// Feed everything the transport has buffered into the engine. Returns
    /// true if any bytes were read.
    pub fn pull(&mut self, transport: &dyn Transport, chunk: usize) -> bool {
        let mut buf = vec![0u8; chunk];
        let mut any = false;
        loop {
            match transport.recv_bytes(&mut buf) {
                Io::Done(n) => {
                    trace!("Feeding {} bytes to engine", n);
                    self.engine.feed(&buf[..n]);
                    any = true;
                }
                Io::Eof => {
                    self.eof = true;
                    break;
                }
                Io::Blocked | Io::Failed => break,
            }
        }
        any
    }

    /// The transport reported end of stream.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Drive the handshake and send whatever it produced.
    pub fn handshake(&mut self, transport: &dyn Transport) -> HandshakeStatus {
        let status = self.engine.handshake();
        self.flush(transport);
        status
    }

    /// Send queued records. Returns true once nothing is left.
    pub fn flush(&mut self, transport: &dyn Transport) -> bool {
        while let Some(record) = self.engine.take_outgoing() {
            self.pending.push_back(record);
        }

        while let Some(front) = self.pending.front_mut() {
            match transport.send_bytes(front) {
                Io::Done(n) if n >= front.len() || transport.is_datagram() => {
                    self.pending.pop_front();
                }
                Io::Done(n) => {
                    front.drain(..n);
                    return false;
                }
                Io::Blocked => return false,
                Io::Eof | Io::Failed => {
                    debug!("Transport rejected {} queued records", self.pending.len());
                    self.pending.clear();
                    return true;
                }
            }
        }
        true
    }
}
