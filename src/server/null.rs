use std::sync::Arc;
use std::task::Waker;

use super::SocketServer;
use crate::error::SocketError;
use crate::event::{Event, Timeout};
use crate::socket::{AddressFamily, AsyncSocket, SocketType};

/// Socket server without sockets.
///
/// `wait()` sleeps until `wake_up()` or the timeout, which makes this the
/// server of choice for threads that only process messages. It is `Send` and
/// `Sync`, so it may be woken from anywhere.
#[derive(Debug, Default)]
pub struct NullSocketServer {
    event: Arc<Event>,
}

impl NullSocketServer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SocketServer for NullSocketServer {
    fn create_socket(
        &self,
        _family: AddressFamily,
        _kind: SocketType,
    ) -> Result<Box<dyn AsyncSocket>, SocketError> {
        Err(SocketError::Unsupported)
    }

    fn wait(&self, timeout: Timeout, _process_io: bool) -> bool {
        self.event.wait(timeout);
        true
    }

    fn wake_up(&self) {
        self.event.set();
    }

    fn waker(&self) -> Waker {
        Waker::from(self.event.clone())
    }
}
