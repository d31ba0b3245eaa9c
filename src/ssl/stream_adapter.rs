use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use super::engine::{Engine, EngineConfig, EngineRead, HandshakeStatus, Verify};
use super::session::{Session, StreamTransport};
use super::{SslMode, SslRole, SslState, HANDSHAKE_POLL};
use crate::config::SslConfig;
use crate::error::{SslError, StreamError};
use crate::event::saturating_deadline;
use crate::identity::{DigestAlgorithm, PeerCertificateDigest, SslIdentity};
use crate::signal::Signal;
use crate::stream::{Stream, StreamEvents, StreamResult, StreamSignal, StreamState};

/// TLS/DTLS over a [`Stream`], in either role.
///
/// Peer to peer use authenticates the other side by a pinned certificate
/// digest instead of a certificate chain:
///
/// ```no_run
/// # use std::sync::Arc;
/// # use rtcio::{DigestAlgorithm, SslIdentity, SslStreamAdapter, Stream};
/// # fn run(stream: Box<dyn Stream>, peer_digest: &[u8]) -> Result<(), rtcio::SslError> {
/// let identity = Arc::new(SslIdentity::generate("example.com")?);
///
/// let adapter = SslStreamAdapter::new(stream);
/// adapter.set_server_role()?;
/// adapter.set_identity(identity)?;
/// adapter.set_peer_certificate_digest(DigestAlgorithm::Sha256, peer_digest)?;
/// adapter.start_ssl_with_peer()?;
/// # Ok(())
/// # }
/// ```
///
/// Writing before the handshake completes fails with
/// [`StreamError::NotOpen`]; reading reports [`StreamResult::Blocked`].
pub struct SslStreamAdapter {
    shared: Rc<Shared>,
}

struct Shared {
    stream: Box<dyn Stream>,
    signal: StreamSignal,
    config: Arc<SslConfig>,
    inner: RefCell<Inner>,
}

struct Inner {
    mode: SslMode,
    role: SslRole,
    identity: Option<Arc<SslIdentity>>,
    peer_digest: Option<PeerCertificateDigest>,
    client_auth: bool,
    /// Set when started with a server name instead of a peer digest.
    server_name: Option<String>,
    state: SslState,
    session: Option<Session>,
}

impl SslStreamAdapter {
    pub fn new(stream: Box<dyn Stream>) -> Self {
        Self::with_config(stream, Arc::new(SslConfig::default()))
    }

    pub fn with_config(stream: Box<dyn Stream>, config: Arc<SslConfig>) -> Self {
        let shared = Rc::new(Shared {
            stream,
            signal: Signal::new(),
            config,
            inner: RefCell::new(Inner {
                mode: SslMode::Tls,
                role: SslRole::Client,
                identity: None,
                peer_digest: None,
                client_auth: true,
                server_name: None,
                state: SslState::None,
                session: None,
            }),
        });

        let weak = Rc::downgrade(&shared);
        shared
            .stream
            .signals()
            .connect(move |_, (events, err)| {
                if let Some(shared) = weak.upgrade() {
                    SslStreamAdapter { shared }.on_event(events, err);
                }
            });

        SslStreamAdapter { shared }
    }

    /// Set TLS or DTLS. Defaults to TLS.
    pub fn set_mode(&self, mode: SslMode) -> Result<(), SslError> {
        self.configure(|inner| inner.mode = mode)
    }

    /// Play the server side of the handshake. Requires an identity.
    pub fn set_server_role(&self) -> Result<(), SslError> {
        self.configure(|inner| inner.role = SslRole::Server)
    }

    pub fn role(&self) -> SslRole {
        self.shared.inner.borrow().role
    }

    /// The certificate and key to present. Shared, never copied.
    pub fn set_identity(&self, identity: Arc<SslIdentity>) -> Result<(), SslError> {
        self.configure(|inner| inner.identity = Some(identity))
    }

    /// Pin the certificate the peer must present.
    pub fn set_peer_certificate_digest(
        &self,
        algorithm: DigestAlgorithm,
        digest: &[u8],
    ) -> Result<(), SslError> {
        let pinned = PeerCertificateDigest::new(algorithm, digest)?;
        self.configure(|inner| inner.peer_digest = Some(pinned))
    }

    /// Whether a server asks the client for a certificate.
    ///
    /// Defaults to true. With it disabled a pinned digest is not checked on
    /// the server side, since the client presents no certificate.
    pub fn set_client_auth_enabled(&self, enabled: bool) -> Result<(), SslError> {
        self.configure(|inner| inner.client_auth = enabled)
    }

    pub fn client_auth_enabled(&self) -> bool {
        self.shared.inner.borrow().client_auth
    }

    /// Start a peer to peer handshake, verified by the pinned digest.
    pub fn start_ssl_with_peer(&self) -> Result<(), SslError> {
        self.start(None)
    }

    /// Start a client handshake that validates the server certificate
    /// against the system roots and `server_name`.
    pub fn start_ssl_with_server(&self, server_name: &str) -> Result<(), SslError> {
        if self.role() == SslRole::Server {
            return Err(SslError::Handshake(
                "server name validation needs the client role".into(),
            ));
        }
        self.start(Some(server_name.to_string()))
    }

    pub fn ssl_state(&self) -> SslState {
        self.shared.inner.borrow().state
    }

    /// When [`handle_timeout`](Self::handle_timeout) should next be called.
    ///
    /// Only a DTLS handshake in progress needs it, so that a lost flight
    /// is resent.
    pub fn poll_timeout(&self, now: Instant) -> Option<Instant> {
        let inner = self.shared.inner.borrow();
        (inner.mode == SslMode::Dtls && inner.state == SslState::Connecting)
            .then(|| saturating_deadline(now, HANDSHAKE_POLL))
    }

    /// Drive a pending handshake.
    pub fn handle_timeout(&self) {
        if self.ssl_state() == SslState::Connecting {
            self.continue_ssl();
        }
    }

    /// Digest of the certificate the peer presented, once connected.
    pub fn peer_certificate_digest(&self, algorithm: DigestAlgorithm) -> Option<Vec<u8>> {
        let inner = self.shared.inner.borrow();
        if inner.state != SslState::Connected {
            return None;
        }
        inner
            .session
            .as_ref()
            .and_then(|s| s.engine.peer_certificate_digest(algorithm))
    }

    /// The wrapped stream.
    pub fn stream(&self) -> &dyn Stream {
        &*self.shared.stream
    }

    fn configure(&self, f: impl FnOnce(&mut Inner)) -> Result<(), SslError> {
        let mut inner = self.shared.inner.borrow_mut();
        if inner.state != SslState::None {
            warn!("Adapter already started, ignoring configuration change");
            return Err(SslError::AlreadyStarted);
        }
        f(&mut inner);
        Ok(())
    }

    fn start(&self, server_name: Option<String>) -> Result<(), SslError> {
        {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.state != SslState::None {
                return Err(SslError::AlreadyStarted);
            }
            if inner.role == SslRole::Server && inner.identity.is_none() {
                return Err(SslError::MissingIdentity);
            }
            inner.server_name = server_name;
            inner.state = SslState::Wait;
        }

        if self.shared.stream.state() == StreamState::Open {
            self.begin_ssl()?;
        }
        Ok(())
    }

    fn verify_policy(inner: &Inner) -> Verify {
        match inner.role {
            SslRole::Server if !inner.client_auth => Verify::None,
            SslRole::Server => match &inner.peer_digest {
                Some(d) => Verify::Digest(d.clone()),
                None => Verify::AnyCert,
            },
            SslRole::Client => match (&inner.peer_digest, &inner.server_name) {
                (Some(d), _) => Verify::Digest(d.clone()),
                (None, Some(name)) => Verify::Chain(Some(name.clone())),
                (None, None) => {
                    warn!("No peer digest set, accepting any certificate");
                    Verify::AnyCert
                }
            },
        }
    }

    fn transport(&self) -> StreamTransport<'_> {
        let mode = self.shared.inner.borrow().mode;
        StreamTransport {
            stream: &*self.shared.stream,
            datagram: mode == SslMode::Dtls,
        }
    }

    fn begin_ssl(&self) -> Result<(), SslError> {
        let engine = {
            let inner = self.shared.inner.borrow();
            Engine::new(&EngineConfig {
                mode: inner.mode,
                role: inner.role,
                identity: inner.identity.as_ref(),
                server_name: inner.server_name.as_deref(),
                verify: Self::verify_policy(&inner),
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
            debug!("Starting {} handshake as {:?}", inner.mode, inner.role);
            inner.session = Some(Session::new(engine));
            inner.state = SslState::Connecting;
        }

        self.pull();
        self.continue_ssl();
        Ok(())
    }

    fn continue_ssl(&self) {
        let transport = self.transport();
        let status = {
            let mut inner = self.shared.inner.borrow_mut();
            let Some(session) = inner.session.as_mut() else {
                return;
            };
            session.handshake(&transport)
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
                let mut events = StreamEvents::OPEN | StreamEvents::WRITE;
                if readable {
                    events |= StreamEvents::READ;
                }
                self.emit(events, None);
            }
            HandshakeStatus::Failed(reason) => {
                warn!("Handshake failed: {}", reason);
                self.fail();
            }
        }
    }

    fn fail(&self) {
        {
            let mut inner = self.shared.inner.borrow_mut();
            if inner.state == SslState::Error {
                return;
            }
            inner.state = SslState::Error;
        }
        self.emit(StreamEvents::CLOSE, Some(StreamError::Ssl));
    }

    fn emit(&self, events: StreamEvents, err: Option<StreamError>) {
        self.shared.signal.emit(self, (events, err));
    }

    /// Pull stream bytes and report whether a `read` would return data or
    /// end of stream.
    fn pull_readable(&self) -> bool {
        let chunk = self.shared.config.read_chunk();
        let transport = self.transport();
        let mut inner = self.shared.inner.borrow_mut();
        let Some(session) = inner.session.as_mut() else {
            return false;
        };
        session.pull(&transport, chunk);
        let readable = session.engine.readable();
        session.flush(&transport);
        readable || session.is_eof()
    }

    /// Move stream bytes into the engine. Returns true on end of stream.
    fn pull(&self) -> bool {
        let chunk = self.shared.config.read_chunk();
        let transport = self.transport();
        let mut inner = self.shared.inner.borrow_mut();
        let Some(session) = inner.session.as_mut() else {
            return false;
        };
        session.pull(&transport, chunk);
        session.is_eof()
    }

    fn on_event(&self, events: StreamEvents, err: Option<StreamError>) {
        let state = self.ssl_state();
        trace!("Stream event {:?} in {:?}", events, state);

        if state == SslState::None {
            self.emit(events, err);
            return;
        }

        if events.contains(StreamEvents::OPEN) && state == SslState::Wait {
            // A failure is reported through the close event.
            let _ = self.begin_ssl();
        }

        if events.contains(StreamEvents::READ) {
            match self.ssl_state() {
                SslState::Connecting => {
                    if self.pull() {
                        self.fail();
                    } else {
                        self.continue_ssl();
                    }
                }
                SslState::Connected => {
                    if self.pull_readable() {
                        self.emit(StreamEvents::READ, None);
                    }
                }
                _ => {}
            }
        }

        if events.contains(StreamEvents::WRITE) {
            let transport = self.transport();
            let flushed = {
                let mut inner = self.shared.inner.borrow_mut();
                match inner.session.as_mut() {
                    Some(session) => session.flush(&transport),
                    None => true,
                }
            };
            if flushed && self.ssl_state() == SslState::Connected {
                self.emit(StreamEvents::WRITE, None);
            }
        }

        if events.contains(StreamEvents::CLOSE) {
            {
                let mut inner = self.shared.inner.borrow_mut();
                inner.session = None;
                inner.state = SslState::None;
            }
            debug!("Stream closed: {:?}", err);
            self.emit(StreamEvents::CLOSE, err);
        }
    }
}

impl Stream for SslStreamAdapter {
    fn state(&self) -> StreamState {
        match self.ssl_state() {
            SslState::None => self.shared.stream.state(),
            SslState::Wait | SslState::Connecting => StreamState::Opening,
            SslState::Connected => StreamState::Open,
            SslState::Error => StreamState::Closed,
        }
    }

    fn read(&self, buf: &mut [u8]) -> StreamResult<usize> {
        match self.ssl_state() {
            SslState::None => return self.shared.stream.read(buf),
            SslState::Wait | SslState::Connecting => return StreamResult::Blocked,
            SslState::Error => return StreamResult::Error(StreamError::Ssl),
            SslState::Connected => {}
        }

        let transport = self.transport();
        let read = {
            let mut inner = self.shared.inner.borrow_mut();
            inner.session.as_mut().map(|session| {
                let read = session.engine.read(buf);
                session.flush(&transport);
                (read, session.is_eof())
            })
        };

        match read {
            None => StreamResult::Error(StreamError::Closed),
            Some((EngineRead::Data(n), _)) => StreamResult::Success(n),
            Some((EngineRead::WantRead, true)) | Some((EngineRead::Closed, _)) => StreamResult::Eos,
            Some((EngineRead::WantRead, false)) => StreamResult::Blocked,
            Some((EngineRead::Failed(reason), _)) => {
                warn!("Read failed: {}", reason);
                StreamResult::Error(StreamError::Ssl)
            }
        }
    }

    fn write(&self, data: &[u8]) -> StreamResult<usize> {
        match self.ssl_state() {
            SslState::None => return self.shared.stream.write(data),
            SslState::Wait | SslState::Connecting => {
                return StreamResult::Error(StreamError::NotOpen)
            }
            SslState::Error => return StreamResult::Error(StreamError::Ssl),
            SslState::Connected => {}
        }

        let transport = self.transport();
        let mut inner = self.shared.inner.borrow_mut();
        let Some(session) = inner.session.as_mut() else {
            return StreamResult::Error(StreamError::Closed);
        };
        // Retrying the backlog re-arms the stream's write event.
        if !session.flush(&transport) {
            return StreamResult::Blocked;
        }
        match session.engine.write(data) {
            Ok(n) => {
                session.flush(&transport);
                StreamResult::Success(n)
            }
            Err(e) => {
                warn!("Write failed: {}", e);
                StreamResult::Error(StreamError::Ssl)
            }
        }
    }

    fn close(&self) {
        let transport = self.transport();
        {
            let mut inner = self.shared.inner.borrow_mut();
            if let Some(mut session) = inner.session.take() {
                if inner.state == SslState::Connected {
                    session.engine.shutdown();
                    session.flush(&transport);
                }
            }
            inner.state = SslState::None;
        }
        self.shared.stream.close();
    }

    fn signals(&self) -> &StreamSignal {
        &self.shared.signal
    }
}

impl fmt::Debug for SslStreamAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.borrow();
        f.debug_struct("SslStreamAdapter")
            .field("mode", &inner.mode)
            .field("role", &inner.role)
            .field("state", &inner.state)
            .field("client_auth", &inner.client_auth)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::VirtualSocketServer;
    use crate::socket::{AddressFamily, AsyncSocket, SocketType};
    use crate::stream::SocketStream;

    fn unconnected_stream(ss: &VirtualSocketServer) -> Box<dyn Stream> {
        let socket = ss.create_virtual_socket(AddressFamily::V4, SocketType::Stream);
        Box::new(SocketStream::new(Box::new(socket)))
    }

    #[test]
    fn server_role_needs_identity() {
        let ss = VirtualSocketServer::new();
        let adapter = SslStreamAdapter::new(unconnected_stream(&ss));
        adapter.set_server_role().unwrap();
        assert!(matches!(
            adapter.start_ssl_with_peer(),
            Err(SslError::MissingIdentity)
        ));
        assert_eq!(adapter.ssl_state(), SslState::None);
    }

    #[test]
    fn digest_length_is_validated() {
        let ss = VirtualSocketServer::new();
        let adapter = SslStreamAdapter::new(unconnected_stream(&ss));
        assert!(adapter
            .set_peer_certificate_digest(DigestAlgorithm::Sha1, &[0u8; 19])
            .is_err());
        adapter
            .set_peer_certificate_digest(DigestAlgorithm::Sha1, &[0u8; 20])
            .unwrap();
    }

    #[test]
    fn write_before_open_is_not_open() {
        let ss = VirtualSocketServer::new();
        let adapter = SslStreamAdapter::new(unconnected_stream(&ss));
        adapter.set_server_role().unwrap();
        adapter
            .set_identity(Arc::new(SslIdentity::generate("example.com").unwrap()))
            .unwrap();
        adapter.start_ssl_with_peer().unwrap();

        assert_eq!(adapter.ssl_state(), SslState::Wait);
        assert_eq!(adapter.state(), StreamState::Opening);
        assert_eq!(
            adapter.write(b"early"),
            StreamResult::Error(StreamError::NotOpen)
        );
        let mut buf = [0u8; 8];
        assert_eq!(adapter.read(&mut buf), StreamResult::Blocked);
        assert!(matches!(
            adapter.set_mode(SslMode::Dtls),
            Err(SslError::AlreadyStarted)
        ));
    }

    #[test]
    fn configuration_after_start_is_rejected() {
        let ss = VirtualSocketServer::new();
        let adapter = SslStreamAdapter::new(unconnected_stream(&ss));
        adapter.start_ssl_with_peer().unwrap();

        assert!(matches!(
            adapter.set_server_role(),
            Err(SslError::AlreadyStarted)
        ));
        assert_eq!(adapter.role(), SslRole::Client);
        let identity = Arc::new(SslIdentity::generate("example.com").unwrap());
        assert!(matches!(
            adapter.set_identity(identity),
            Err(SslError::AlreadyStarted)
        ));
        assert!(matches!(
            adapter.set_client_auth_enabled(false),
            Err(SslError::AlreadyStarted)
        ));
        assert!(adapter.client_auth_enabled());
        assert!(matches!(
            adapter.set_peer_certificate_digest(DigestAlgorithm::Sha1, &[0u8; 20]),
            Err(SslError::AlreadyStarted)
        ));
    }

    #[test]
    fn handshake_timer_only_for_dtls() {
        let ss = VirtualSocketServer::new();
        let now = Instant::now();

        let tls = SslStreamAdapter::new(unconnected_stream(&ss));
        tls.start_ssl_with_peer().unwrap();
        assert_eq!(tls.poll_timeout(now), None);

        // Not open yet, so the handshake has not begun.
        let dtls = SslStreamAdapter::new(unconnected_stream(&ss));
        dtls.set_mode(SslMode::Dtls).unwrap();
        dtls.start_ssl_with_peer().unwrap();
        assert_eq!(dtls.ssl_state(), SslState::Wait);
        assert_eq!(dtls.poll_timeout(now), None);
        dtls.handle_timeout();
        assert_eq!(dtls.ssl_state(), SslState::Wait);

        // A client whose hello goes unanswered keeps asking for the timer.
        let socket = ss.create_virtual_socket(AddressFamily::V4, SocketType::Datagram);
        socket.connect("127.0.0.1:9".parse().unwrap()).unwrap();
        let client = SslStreamAdapter::new(Box::new(SocketStream::new(Box::new(socket))));
        client.set_mode(SslMode::Dtls).unwrap();
        client.start_ssl_with_peer().unwrap();
        assert_eq!(client.ssl_state(), SslState::Connecting);
        let due = client.poll_timeout(now).unwrap();
        assert_eq!(due - now, HANDSHAKE_POLL);
        client.handle_timeout();
        assert_eq!(client.ssl_state(), SslState::Connecting);
    }

    #[test]
    fn close_twice() {
        let ss = VirtualSocketServer::new();
        let adapter = SslStreamAdapter::new(unconnected_stream(&ss));
        adapter.close();
        adapter.close();
        assert_eq!(adapter.state(), StreamState::Closed);
        assert_eq!(adapter.ssl_state(), SslState::None);
    }

    #[test]
    fn start_with_server_requires_client_role() {
        let ss = VirtualSocketServer::new();
        let adapter = SslStreamAdapter::new(unconnected_stream(&ss));
        adapter.set_server_role().unwrap();
        assert!(adapter.start_ssl_with_server("example.com").is_err());
    }
}
