//! Transport agnostic byte streams.

use std::fmt;
use std::rc::{Rc, Weak};

use bitflags::bitflags;

use crate::error::{SocketError, StreamError};
use crate::signal::Signal;
use crate::socket::{AsyncSocket, ConnState, SocketType};

/// Lifecycle of a [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Closed,
    Opening,
    Open,
}

/// Outcome of a stream read or write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamResult<T> {
    /// Data was transferred. A read may return fewer bytes than requested.
    Success(T),
    /// Nothing can be transferred right now; wait for the matching event.
    Blocked,
    /// End of stream.
    Eos,
    Error(StreamError),
}

impl<T> StreamResult<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, StreamResult::Success(_))
    }

    pub fn ok(self) -> Option<T> {
        match self {
            StreamResult::Success(v) => Some(v),
            _ => None,
        }
    }
}

bitflags! {
    /// OR-combinable stream event flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct StreamEvents: u8 {
        /// The stream finished opening.
        const OPEN = 0b0001;
        const READ = 0b0010;
        const WRITE = 0b0100;
        /// The stream closed, with an error if it was not orderly.
        const CLOSE = 0b1000;
    }
}

/// Signal raised by a stream: the event flags plus an error for `CLOSE`.
pub type StreamSignal = Signal<dyn Stream, (StreamEvents, Option<StreamError>)>;

/// A byte oriented, non-blocking stream.
pub trait Stream {
    fn state(&self) -> StreamState;

    fn read(&self, buf: &mut [u8]) -> StreamResult<usize>;

    fn write(&self, data: &[u8]) -> StreamResult<usize>;

    /// Close the stream. Closing twice does nothing.
    fn close(&self);

    fn signals(&self) -> &StreamSignal;
}

/// A [`Stream`] over an [`AsyncSocket`].
///
/// The stream owns the socket. Socket readiness is translated to stream
/// events: connect becomes `OPEN | READ | WRITE`, read `READ`, write `WRITE`
/// and close `CLOSE`.
pub struct SocketStream {
    shared: Rc<SocketStreamShared>,
}

struct SocketStreamShared {
    socket: Box<dyn AsyncSocket>,
    signal: StreamSignal,
}

impl SocketStream {
    pub fn new(socket: Box<dyn AsyncSocket>) -> Self {
        let shared = Rc::new(SocketStreamShared {
            socket,
            signal: Signal::new(),
        });

        let signals = shared.socket.signals();

        let weak = Rc::downgrade(&shared);
        signals.connect.connect(move |_, ()| {
            notify(
                &weak,
                StreamEvents::OPEN | StreamEvents::READ | StreamEvents::WRITE,
                None,
            )
        });

        let weak = Rc::downgrade(&shared);
        signals.read.connect(move |_, ()| {
            notify(&weak, StreamEvents::READ, None)
        });

        let weak = Rc::downgrade(&shared);
        signals.write.connect(move |_, ()| {
            notify(&weak, StreamEvents::WRITE, None)
        });

        let weak = Rc::downgrade(&shared);
        signals.close.connect(move |_, err| {
            notify(&weak, StreamEvents::CLOSE, err.map(StreamError::Socket))
        });

        SocketStream { shared }
    }

    pub fn socket(&self) -> &dyn AsyncSocket {
        &*self.shared.socket
    }
}

fn notify(
    weak: &Weak<SocketStreamShared>,
    events: StreamEvents,
    err: Option<StreamError>,
) {
    if let Some(shared) = weak.upgrade() {
        let stream = SocketStream { shared };
        stream.shared.signal.emit(&stream, (events, err));
    }
}

impl Stream for SocketStream {
    fn state(&self) -> StreamState {
        match self.shared.socket.state() {
            ConnState::Connected => StreamState::Open,
            ConnState::Connecting => StreamState::Opening,
            ConnState::Closed => StreamState::Closed,
        }
    }

    fn read(&self, buf: &mut [u8]) -> StreamResult<usize> {
        let socket = &self.shared.socket;
        match socket.recv(buf) {
            Ok(0) if !buf.is_empty() && socket.socket_type() == SocketType::Stream => {
                StreamResult::Eos
            }
            Ok(n) => StreamResult::Success(n),
            Err(SocketError::WouldBlock) => StreamResult::Blocked,
            Err(e) => StreamResult::Error(e.into()),
        }
    }

    fn write(&self, data: &[u8]) -> StreamResult<usize> {
        match self.shared.socket.send(data) {
            Ok(n) => StreamResult::Success(n),
            Err(SocketError::WouldBlock) => StreamResult::Blocked,
            Err(e) => StreamResult::Error(e.into()),
        }
    }

    fn close(&self) {
        let _ = self.shared.socket.close();
    }

    fn signals(&self) -> &StreamSignal {
        &self.shared.signal
    }
}

impl fmt::Debug for SocketStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketStream")
            .field("state", &self.state())
            .field("local", &self.shared.socket.local_address())
            .finish()
    }
}
