use std::cell::RefCell;
use std::fmt;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Instant;

use super::engine::{Engine, EngineConfig, EngineRead, HandshakeStatus, Verify};
use super::session::{Session, SocketTransport};
use super::{SslMode, SslRole, SslState, HANDSHAKE_POLL};
use crate::config::SslConfig;
use crate::error::{SocketError, SslError};
use crate::event::saturating_deadline;
use crate::socket::{AsyncSocket, ConnState, SocketSignals, SocketType};

/// Client side TLS/DTLS over an [`AsyncSocket`].
///
/// The adapter owns the wrapped socket and exposes the same socket contract.
/// Call [`start_ssl`](SslAdapter::start_ssl) and then `connect()`; once the
/// transport connects the handshake runs, and the adapter raises its own
/// connect signal when it completes.
///
/// A failed handshake raises the close signal with [`SocketError::Ssl`] but
/// leaves the wrapped socket open. The subscriber is expected to `close()`
/// the adapter in response.
pub struct SslAdapter {
    shared: Rc<Shared>,
}

struct Shared {
    transport: Box<dyn AsyncSocket>,
    signals: SocketSignals,
    config: Arc<SslConfig>,
    inner: RefCell<Inner>,
}

struct Inner {
    mode: SslMode,
    ignore_bad_cert: bool,
    hostname: Option<String>,
    restartable: bool,
    state: SslState,
    session: Option<Session>,
    last_error: Option<SocketError>,
}

impl SslAdapter {
    pub fn new(socket: Box<dyn AsyncSocket>) -> Self {
        Self::with_config(socket, Arc::new(SslConfig::default()))
    }

    pub fn with_config(socket: Box<dyn AsyncSocket>, config: Arc<SslConfig>) -> Self {
        let mode = SslMode::for_socket_type(socket.socket_type());
        let shared = Rc::new(Shared {
            transport: socket,
            signals: SocketSignals::default(),
            config,
            inner: RefCell::new(Inner {
                mode,
                ignore_bad_cert: false,
                hostname: None,
                restartable: false,
                state: SslState::None,
                session: None,
                last_error: None,
            }),
        });

        let signals = shared.transport.signals();

        let weak = Rc::downgrade(&shared);
        signals
            .connect
            .connect(move |_, ()| with(&weak, |a| a.on_connect()));

        let weak = Rc::downgrade(&shared);
        signals
            .read
            .connect(move |_, ()| with(&weak, |a| a.on_read()));

        let weak = Rc::downgrade(&shared);
        signals
            .write
            .connect(move |_, ()| with(&weak, |a| a.on_write()));

        let weak = Rc::downgrade(&shared);
        signals
            .close
            .connect(move |_, err| with(&weak, |a| a.on_close(err)));

        SslAdapter { shared }
    }

    /// Set TLS or DTLS. Defaults to the mode matching the wrapped socket.
    pub fn set_mode(&self, mode: SslMode) -> Result<(), SslError> {
        let mut inner = self.shared.inner.borrow_mut();
        if inner.state != SslState::None {
            return Err(SslError::AlreadyStarted);
        }
        inner.mode = mode;
        Ok(())
    }

    /// Accept any server certificate.
    ///
    /// Only meant for tests against self-signed servers.
    pub fn set_ignore_bad_cert(&self, ignore: bool) {
        self.shared.inner.borrow_mut().ignore_bad_cert = ignore;
    }

    pub fn ignore_bad_cert(&self) -> bool {
        self.shared.inner.borrow().ignore_bad_cert
    }

    /// Arm the adapter. The handshake starts as soon as the transport is
    /// connected, immediately if it already is.
    ///
    /// `hostname` is sent as SNI and checked against the server certificate.
    /// A `restartable` adapter may be connected again after `close()`.
    pub fn start_ssl(&self, hostname: &str, restartable: bool) -> Result<(), SslError> {
        {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.state != SslState::None {
                return Err(SslError::AlreadyStarted);
            }
            if inner.mode.socket_type() != self.shared.transport.socket_type() {
                return Err(SslError::Socket(SocketError::Unsupported));
            }
            inner.hostname = (!hostname.is_empty()).then(|| hostname.to_string());
            inner.restartable = restartable;
            inner.state = SslState::Wait;
        }

        if self.shared.transport.state() == ConnState::Connected {
            self.begin_ssl()?;
        }
        Ok(())
    }

    pub fn ssl_state(&self) -> SslState {
        self.shared.inner.borrow().state
    }

    /// When [`handle_timeout`](Self::handle_timeout) should next be called.
    ///
    /// Only a DTLS handshake in progress needs it: OpenSSL resends a lost
    /// flight when it is driven after its own retransmit timer expired.
    pub fn poll_timeout(&self, now: Instant) -> Option<Instant> {
        let inner = self.shared.inner.borrow();
        (inner.mode == SslMode::Dtls && inner.state == SslState::Connecting)
            .then(|| saturating_deadline(now, HANDSHAKE_POLL))
    }

    /// Drive a pending handshake, resending anything OpenSSL deems lost.
    pub fn handle_timeout(&self) {
        if self.ssl_state() == SslState::Connecting {
            self.continue_ssl();
        }
    }

    pub fn mode(&self) -> SslMode {
        self.shared.inner.borrow().mode
    }

    /// The wrapped socket.
    pub fn transport(&self) -> &dyn AsyncSocket {
        &*self.shared.transport
    }

    fn begin_ssl(&self) -> Result<(), SslError> {
        let engine = {
            let inner = self.shared.inner.borrow();
            let verify = if inner.ignore_bad_cert {
                Verify::None
            } else {
                Verify::Chain(inner.hostname.clone())
            };
            Engine::new(&EngineConfig {
                mode: inner.mode,
                role: SslRole::Client,
                identity: None,
                server_name: inner.hostname.as_deref(),
                verify,
                ssl: &self.shared.config,
            })
        };

        let engine = match engine {
            Ok(e) => e,
            Err(e) => {
                warn!("Failed to create SSL engine: {}", e);
                self.fail();
                return Err(e);
            }
        };

        {
            let mut inner = self.shared.inner.borrow_mut();
            debug!(
                "Starting {} handshake with {:?}",
                inner.mode,
                self.shared.transport.remote_address()
            );
            inner.session = Some(Session::new(engine));
            inner.state = SslState::Connecting;
        }

        // Anything the peer sent before we were ready.
        self.pull();
        self.continue_ssl();
        Ok(())
    }

    fn continue_ssl(&self) {
        let status = {
            let mut inner = self.shared.inner.borrow_mut();
            let Some(session) = inner.session.as_mut() else {
                return;
            };
            session.handshake(&SocketTransport(&*self.shared.transport))
        };

        match status {
            HandshakeStatus::InProgress => {}
            HandshakeStatus::Complete => {
                let readable = {
                    let mut inner = self.shared.inner.borrow_mut();
                    inner.state = SslState::Connected;
                    inner
                        .session
                        .as_mut()
                        .map_or(false, |s| s.engine.has_pending_input() && s.engine.readable())
                };
                debug!("Handshake complete");
                self.shared.signals.connect.emit(self, ());
                if readable && self.ssl_state() == SslState::Connected {
                    self.shared.signals.read.emit(self, ());
                }
            }
            HandshakeStatus::Failed(reason) => {
                warn!("Handshake failed: {}", reason);
                self.fail();
            }
        }
    }

    /// Enter the error state and tell subscribers. The transport stays open.
    fn fail(&self) {
        {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.state == SslState::Error {
                return;
            }
            inner.state = SslState::Error;
            inner.last_error = Some(SocketError::Ssl);
        }
        self.shared.signals.close.emit(self, Some(SocketError::Ssl));
    }

    fn on_connect(&self) {
        let state = self.ssl_state();
        trace!("Transport connected in {:?}", state);
        match state {
            SslState::None => self.shared.signals.connect.emit(self, ()),
            SslState::Wait => {
                // A failure is reported through the close signal.
                let _ = self.begin_ssl();
            }
            _ => {}
        }
    }

    fn on_read(&self) {
        match self.ssl_state() {
            SslState::None => self.shared.signals.read.emit(self, ()),
            SslState::Connecting => {
                let eof = self.pull();
                if eof {
                    self.fail();
                } else {
                    self.continue_ssl();
                }
            }
            SslState::Connected => {
                if self.pull_readable() {
                    self.shared.signals.read.emit(self, ());
                }
            }
            SslState::Wait | SslState::Error => {}
        }
    }

    /// Pull transport bytes and report whether a `recv` would return
    /// data or end of stream.
    fn pull_readable(&self) -> bool {
        let chunk = self.shared.config.read_chunk();
        let transport = SocketTransport(&*self.shared.transport);
        let mut inner = self.shared.inner.borrow_mut();
        let Some(session) = inner.session.as_mut() else {
            return false;
        };
        session.pull(&transport, chunk);
        let readable = session.engine.readable();
        // Post-handshake messages may want a reply.
        session.flush(&transport);
        readable || session.is_eof()
    }

    fn on_write(&self) {
        let state = self.ssl_state();
        if state == SslState::None {
            self.shared.signals.write.emit(self, ());
            return;
        }

        let flushed = {
            let mut inner = self.shared.inner.borrow_mut();
            match inner.session.as_mut() {
                Some(session) => session.flush(&SocketTransport(&*self.shared.transport)),
                None => true,
            }
        };

        if flushed && state == SslState::Connected {
            self.shared.signals.write.emit(self, ());
        }
    }

    fn on_close(&self, err: Option<SocketError>) {
        {
            let mut inner = self.shared.inner.borrow_mut();
            inner.session = None;
            if inner.state != SslState::None {
                inner.state = if inner.restartable {
                    SslState::Wait
                } else {
                    SslState::None
                };
            }
            if err.is_some() {
                inner.last_error = err;
            }
        }
        debug!("Transport closed: {:?}", err);
        self.shared.signals.close.emit(self, err);
    }

    /// Move transport bytes into the engine. Returns true on end of stream.
    fn pull(&self) -> bool {
        let chunk = self.shared.config.read_chunk();
        let mut inner = self.shared.inner.borrow_mut();
        let Some(session) = inner.session.as_mut() else {
            return false;
        };
        session.pull(&SocketTransport(&*self.shared.transport), chunk);
        session.is_eof()
    }

    fn set_error<T>(&self, err: SocketError) -> Result<T, SocketError> {
        self.shared.inner.borrow_mut().last_error = Some(err);
        Err(err)
    }
}

fn with(weak: &Weak<Shared>, f: impl FnOnce(&SslAdapter)) {
    if let Some(shared) = weak.upgrade() {
        f(&SslAdapter { shared });
    }
}

impl AsyncSocket for SslAdapter {
    fn bind(&self, addr: SocketAddr) -> Result<(), SocketError> {
        self.shared.transport.bind(addr)
    }

    fn connect(&self, addr: SocketAddr) -> Result<(), SocketError> {
        self.shared.transport.connect(addr)?;

        // Datagram sockets connect without a connect event.
        let start_now = self.ssl_state() == SslState::Wait
            && self.shared.transport.state() == ConnState::Connected;
        if start_now && self.begin_ssl().is_err() {
            return self.set_error(SocketError::Ssl);
        }
        Ok(())
    }

    fn listen(&self, _backlog: usize) -> Result<(), SocketError> {
        self.set_error(SocketError::Unsupported)
    }

    fn accept(&self) -> Result<(Box<dyn AsyncSocket>, SocketAddr), SocketError> {
        self.set_error(SocketError::Unsupported)
    }

    fn send(&self, buf: &[u8]) -> Result<usize, SocketError> {
        let state = self.ssl_state();
        match state {
            SslState::None => return self.shared.transport.send(buf),
            SslState::Wait | SslState::Connecting => {
                return self.set_error(SocketError::WouldBlock)
            }
            SslState::Error => return self.set_error(SocketError::Ssl),
            SslState::Connected => {}
        }

        let result = {
            let mut inner = self.shared.inner.borrow_mut();
            let transport = SocketTransport(&*self.shared.transport);
            match inner.session.as_mut() {
                None => Err(SocketError::NotConnected),
                Some(session) => {
                    // Do not pile records on a transport that is not
                    // draining. Retrying the backlog arms its write signal.
                    if !session.flush(&transport) {
                        Err(SocketError::WouldBlock)
                    } else {
                        match session.engine.write(buf) {
                            Ok(n) => {
                                session.flush(&transport);
                                Ok(n)
                            }
                            Err(e) => {
                                warn!("Send failed: {}", e);
                                Err(SocketError::Ssl)
                            }
                        }
                    }
                }
            }
        };

        result.or_else(|e| self.set_error(e))
    }

    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, SocketError> {
        if self.ssl_state() == SslState::None {
            return self.shared.transport.send_to(buf, addr);
        }
        if self.shared.transport.remote_address() != Some(addr) {
            return self.set_error(SocketError::InvalidState);
        }
        self.send(buf)
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        match self.ssl_state() {
            SslState::None => return self.shared.transport.recv(buf),
            SslState::Wait | SslState::Connecting => {
                return self.set_error(SocketError::WouldBlock)
            }
            SslState::Error => return self.set_error(SocketError::Ssl),
            SslState::Connected => {}
        }

        let read = {
            let mut inner = self.shared.inner.borrow_mut();
            inner.session.as_mut().map(|session| {
                let read = session.engine.read(buf);
                // Reading may produce records, e.g. a key update response.
                session.flush(&SocketTransport(&*self.shared.transport));
                (read, session.is_eof())
            })
        };

        match read {
            None => self.set_error(SocketError::NotConnected),
            Some((EngineRead::Data(n), _)) => Ok(n),
            Some((EngineRead::WantRead, true)) | Some((EngineRead::Closed, _)) => Ok(0),
            Some((EngineRead::WantRead, false)) => self.set_error(SocketError::WouldBlock),
            Some((EngineRead::Failed(reason), _)) => {
                warn!("Receive failed: {}", reason);
                self.set_error(SocketError::Ssl)
            }
        }
    }

    fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        if self.ssl_state() == SslState::None {
            return self.shared.transport.recv_from(buf);
        }
        let n = self.recv(buf)?;
        let from = self
            .shared
            .transport
            .remote_address()
            .ok_or(SocketError::NotConnected)?;
        Ok((n, from))
    }

    fn close(&self) -> Result<(), SocketError> {
        {
            let mut inner = self.shared.inner.borrow_mut();
            if let Some(mut session) = inner.session.take() {
                if inner.state == SslState::Connected {
                    session.engine.shutdown();
                    session.flush(&SocketTransport(&*self.shared.transport));
                }
            }
            if inner.state != SslState::None {
                inner.state = if inner.restartable {
                    SslState::Wait
                } else {
                    SslState::None
                };
            }
        }
        self.shared.transport.close()
    }

    fn state(&self) -> ConnState {
        let transport = self.shared.transport.state();
        match self.ssl_state() {
            SslState::Wait | SslState::Connecting if transport != ConnState::Closed => {
                ConnState::Connecting
            }
            _ => transport,
        }
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.shared.transport.local_address()
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.shared.transport.remote_address()
    }

    fn socket_type(&self) -> SocketType {
        self.shared.transport.socket_type()
    }

    fn last_error(&self) -> Option<SocketError> {
        self.shared
            .inner
            .borrow()
            .last_error
            .or_else(|| self.shared.transport.last_error())
    }

    fn signals(&self) -> &SocketSignals {
        &self.shared.signals
    }
}

impl fmt::Debug for SslAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.borrow();
        f.debug_struct("SslAdapter")
            .field("mode", &inner.mode)
            .field("state", &inner.state)
            .field("hostname", &inner.hostname)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::VirtualSocketServer;
    use crate::socket::AddressFamily;

    #[test]
    fn start_twice_is_rejected() {
        let ss = VirtualSocketServer::new();
        let socket = ss.create_virtual_socket(AddressFamily::V4, SocketType::Stream);
        let adapter = SslAdapter::new(Box::new(socket));

        assert_eq!(adapter.mode(), SslMode::Tls);
        adapter.start_ssl("example.com", false).unwrap();
        assert_eq!(adapter.ssl_state(), SslState::Wait);
        assert!(matches!(
            adapter.start_ssl("example.com", false),
            Err(SslError::AlreadyStarted)
        ));
        assert!(matches!(
            adapter.set_mode(SslMode::Dtls),
            Err(SslError::AlreadyStarted)
        ));
    }

    #[test]
    fn mode_must_match_transport() {
        let ss = VirtualSocketServer::new();
        let socket = ss.create_virtual_socket(AddressFamily::V4, SocketType::Stream);
        let adapter = SslAdapter::new(Box::new(socket));
        adapter.set_mode(SslMode::Dtls).unwrap();
        assert!(adapter.start_ssl("example.com", false).is_err());
        assert_eq!(adapter.ssl_state(), SslState::None);
    }

    #[test]
    fn io_before_handshake_would_block() {
        let ss = VirtualSocketServer::new();
        let socket = ss.create_virtual_socket(AddressFamily::V4, SocketType::Stream);
        let adapter = SslAdapter::new(Box::new(socket));
        adapter.start_ssl("example.com", false).unwrap();

        assert_eq!(adapter.send(b"x"), Err(SocketError::WouldBlock));
        let mut buf = [0u8; 4];
        assert_eq!(adapter.recv(&mut buf), Err(SocketError::WouldBlock));
        assert_eq!(adapter.last_error(), Some(SocketError::WouldBlock));
        assert!(matches!(adapter.accept(), Err(SocketError::Unsupported)));
    }

    #[test]
    fn close_is_idempotent() {
        let ss = VirtualSocketServer::new();
        let socket = ss.create_virtual_socket(AddressFamily::V4, SocketType::Stream);
        let adapter = SslAdapter::new(Box::new(socket));
        adapter.start_ssl("example.com", true).unwrap();
        adapter.connect("127.0.0.1:4000".parse().unwrap()).unwrap();
        assert_eq!(adapter.state(), ConnState::Connecting);

        adapter.close().unwrap();
        assert_eq!(adapter.state(), ConnState::Closed);
        assert_eq!(adapter.ssl_state(), SslState::Wait);

        adapter.close().unwrap();
        assert_eq!(adapter.state(), ConnState::Closed);
        assert_eq!(adapter.ssl_state(), SslState::Wait);
    }

    #[test]
    fn dtls_handshake_asks_for_timer() {
        let ss = VirtualSocketServer::new();
        let now = Instant::now();

        let tls = SslAdapter::new(Box::new(
            ss.create_virtual_socket(AddressFamily::V4, SocketType::Stream),
        ));
        tls.start_ssl("example.com", false).unwrap();
        assert_eq!(tls.poll_timeout(now), None);

        // Nobody answers on the far side.
        let socket = ss.create_virtual_socket(AddressFamily::V4, SocketType::Datagram);
        socket.connect("127.0.0.1:9".parse().unwrap()).unwrap();
        let dtls = SslAdapter::new(Box::new(socket));
        assert_eq!(dtls.mode(), SslMode::Dtls);
        assert_eq!(dtls.poll_timeout(now), None);

        dtls.start_ssl("example.com", false).unwrap();
        assert_eq!(dtls.ssl_state(), SslState::Connecting);
        assert_eq!(dtls.poll_timeout(now), Some(now + HANDSHAKE_POLL));
        dtls.handle_timeout();
        assert_eq!(dtls.ssl_state(), SslState::Connecting);

        dtls.close().unwrap();
        assert_eq!(dtls.poll_timeout(now), None);
    }
}
