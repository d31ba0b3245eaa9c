use std::io;

use thiserror::Error;

use crate::identity::DigestAlgorithm;

/// Errors reported by asynchronous sockets.
///
/// Every socket also remembers the last error it reported, see
/// [`AsyncSocket::last_error`](crate::AsyncSocket::last_error).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SocketError {
    #[error("Operation would block")]
    WouldBlock,

    #[error("Socket is not connected")]
    NotConnected,

    #[error("Socket is already connected")]
    AlreadyConnected,

    #[error("Operation not valid in the current socket state")]
    InvalidState,

    #[error("Address already in use")]
    AddressInUse,

    #[error("Address not available")]
    AddressNotAvailable,

    #[error("Connection refused")]
    ConnectionRefused,

    #[error("Connection reset by peer")]
    ConnectionReset,

    #[error("No pending connection to accept")]
    NoPendingConnection,

    #[error("Operation not supported by this socket")]
    Unsupported,

    #[error("Socket server is gone")]
    NetworkDown,

    #[error("SSL handshake or record layer failure")]
    Ssl,
}

impl SocketError {
    /// Errno-like numeric code, stable across releases.
    pub fn code(&self) -> i32 {
        match self {
            SocketError::WouldBlock => 11,
            SocketError::NotConnected => 107,
            SocketError::AlreadyConnected => 106,
            SocketError::InvalidState => 22,
            SocketError::AddressInUse => 98,
            SocketError::AddressNotAvailable => 99,
            SocketError::ConnectionRefused => 111,
            SocketError::ConnectionReset => 104,
            SocketError::NoPendingConnection => 11,
            SocketError::Unsupported => 95,
            SocketError::NetworkDown => 100,
            SocketError::Ssl => 1000,
        }
    }
}

/// Errors reported by [`Stream`](crate::Stream) implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Stream is not open")]
    NotOpen,

    #[error("Stream is closed")]
    Closed,

    #[error("{0}")]
    Socket(#[from] SocketError),

    #[error("SSL handshake or record layer failure")]
    Ssl,
}

/// Errors from the SSL engine and its configuration.
#[derive(Debug, Error)]
pub enum SslError {
    #[error("{0}")]
    Engine(#[from] openssl::error::ErrorStack),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Record layer error: {0}")]
    Record(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Digest for {algorithm} must be {expected} bytes, got {got}")]
    InvalidDigest {
        algorithm: DigestAlgorithm,
        expected: usize,
        got: usize,
    },

    #[error("Unknown digest algorithm {0}")]
    UnknownDigest(String),

    #[error("SSL already started")]
    AlreadyStarted,

    #[error("SSL not started")]
    NotStarted,

    #[error("Server role requires an identity")]
    MissingIdentity,

    #[error("{0}")]
    Socket(#[from] SocketError),
}

/// Errors from [`Thread`](crate::Thread) and [`MessageQueue`](crate::MessageQueue).
#[derive(Debug, Error)]
pub enum ThreadError {
    #[error("Thread has been stopped")]
    Stopped,

    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] io::Error),
}
