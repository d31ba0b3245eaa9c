//! Pluggable socket servers.
//!
//! A socket server creates sockets it knows how to drive and provides the
//! blocking [`wait`](SocketServer::wait) / [`wake_up`](SocketServer::wake_up)
//! pair a [`Thread`](crate::Thread) loop is built on.

use std::task::Waker;

use crate::error::SocketError;
use crate::event::Timeout;
use crate::socket::{AddressFamily, AsyncSocket, SocketType};

mod null;
pub use null::NullSocketServer;

mod virtual_net;
pub use virtual_net::{VirtualSocket, VirtualSocketServer};

pub trait SocketServer {
    /// Create a socket driven by this server.
    fn create_socket(
        &self,
        family: AddressFamily,
        kind: SocketType,
    ) -> Result<Box<dyn AsyncSocket>, SocketError>;

    /// Block the calling thread until `timeout` elapses or [`wake_up`] is
    /// called. When `process_io` is true the server may also return after
    /// dispatching I/O readiness; when false, sockets are ignored entirely.
    ///
    /// Returns false only if the server can no longer wait.
    ///
    /// [`wake_up`]: SocketServer::wake_up
    fn wait(&self, timeout: Timeout, process_io: bool) -> bool;

    /// Make the next, or the in-progress, `wait()` return promptly.
    fn wake_up(&self);

    /// A handle that calls [`wake_up`](SocketServer::wake_up) from any thread.
    fn waker(&self) -> Waker;
}
