#![forbid(unsafe_code)]
#![warn(clippy::all)]
// #![deny(missing_docs)]

//! Event-driven sockets, streams and TLS/DTLS adapters.
//!
//! Every object in this crate, apart from [`MessageQueue`] and [`Event`],
//! belongs to one [`Thread`]. Sockets report progress through [`Signal`]s;
//! a [`SocketServer`] blocks the thread until work arrives or it is woken.
//!
//! [`SslAdapter`] layers TLS or DTLS over any [`AsyncSocket`] in the client
//! role. [`SslStreamAdapter`] does the same over a [`Stream`], in either role,
//! with peer authentication by pinned certificate digest.

#[macro_use]
extern crate log;

mod config;
pub use config::{NetworkConfig, NetworkConfigBuilder, SslConfig, SslConfigBuilder};

mod error;
pub use error::{SocketError, SslError, StreamError, ThreadError};

mod event;
pub use event::{Event, Timeout};

mod identity;
pub use identity::{format_fingerprint, DigestAlgorithm, PeerCertificateDigest, SslIdentity};

pub(crate) mod rng;

pub mod server;
pub use server::{NullSocketServer, SocketServer, VirtualSocket, VirtualSocketServer};

mod signal;
pub use signal::{Signal, SlotId};

mod socket;
pub use socket::{AddressFamily, AsyncSocket, ConnState, SocketSignals, SocketType};

pub mod ssl;
pub use ssl::{SslAdapter, SslMode, SslRole, SslState, SslStreamAdapter};

mod stream;
pub use stream::{SocketStream, Stream, StreamEvents, StreamResult, StreamSignal, StreamState};

mod thread;
pub use thread::{Message, MessageHandler, MessageQueue, Thread, ThreadHandle};
