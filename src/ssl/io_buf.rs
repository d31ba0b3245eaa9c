use std::collections::VecDeque;
use std::io::{self, Read, Write};

use super::SslMode;

/// In-memory transport the OpenSSL stream reads from and writes to.
///
/// In DTLS mode every write is one datagram and every read consumes one
/// datagram. In TLS mode the buffers are plain byte queues.
pub(crate) struct IoBuffer {
    datagram: bool,
    incoming: VecDeque<Vec<u8>>,
    outgoing: VecDeque<Vec<u8>>,
}

impl IoBuffer {
    pub fn new(mode: SslMode) -> Self {
        IoBuffer {
            datagram: mode == SslMode::Dtls,
            incoming: VecDeque::new(),
            outgoing: VecDeque::new(),
        }
    }

    pub fn push_incoming(&mut self, data: &[u8]) {
        if data.is_empty() && !self.datagram {
            return;
        }
        self.incoming.push_back(data.to_vec());
    }

    pub fn pop_outgoing(&mut self) -> Option<Vec<u8>> {
        self.outgoing.pop_front()
    }

    pub fn has_incoming(&self) -> bool {
        !self.incoming.is_empty()
    }
}

impl Read for IoBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(front) = self.incoming.front_mut() else {
            return Err(io::ErrorKind::WouldBlock.into());
        };

        if self.datagram {
            // A datagram that does not fit is truncated, as a UDP socket would.
            let n = front.len().min(buf.len());
            buf[..n].copy_from_slice(&front[..n]);
            self.incoming.pop_front();
            return Ok(n);
        }

        let n = front.len().min(buf.len());
        buf[..n].copy_from_slice(&front[..n]);
        front.drain(..n);
        if front.is_empty() {
            self.incoming.pop_front();
        }
        Ok(n)
    }
}

impl Write for IoBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.outgoing.back_mut() {
            Some(last) if !self.datagram => last.extend_from_slice(buf),
            _ => self.outgoing.push_back(buf.to_vec()),
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_reads_are_partial() {
        let mut io = IoBuffer::new(SslMode::Tls);
        io.push_incoming(b"hello");
        io.push_incoming(b"world");

        let mut buf = [0u8; 3];
        assert_eq!(io.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(io.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(io.read(&mut buf).unwrap(), 3);

        io.write_all(b"ab").unwrap();
        io.write_all(b"cd").unwrap();
        assert_eq!(io.pop_outgoing().unwrap(), b"abcd");
    }

    #[test]
    fn datagram_boundaries_are_kept() {
        let mut io = IoBuffer::new(SslMode::Dtls);
        io.push_incoming(b"one");
        io.push_incoming(b"two");

        let mut buf = [0u8; 16];
        assert_eq!(io.read(&mut buf).unwrap(), 3);
        assert_eq!(io.read(&mut buf).unwrap(), 3);
        let err = io.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        io.write_all(b"ab").unwrap();
        io.write_all(b"cd").unwrap();
        assert_eq!(io.pop_outgoing().unwrap(), b"ab");
        assert_eq!(io.pop_outgoing().unwrap(), b"cd");
    }
}
