//! OpenSSL session over an in-memory buffer.

use std::sync::Arc;

use openssl::dh::Dh;
use openssl::pkey::PKey;
use openssl::ssl::{
    ErrorCode, Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions, SslStream,
    SslVerifyMode,
};
use openssl::x509::{X509StoreContextRef, X509VerifyResult, X509};

use super::io_buf::IoBuffer;
use super::{SslMode, SslRole};
use crate::config::SslConfig;
use crate::error::SslError;
use crate::identity::{DigestAlgorithm, PeerCertificateDigest, SslIdentity};

/// How the peer certificate is checked.
#[derive(Debug, Clone)]
pub(crate) enum Verify {
    /// Do not ask for or check a peer certificate.
    None,
    /// Ask for a certificate and accept whatever is presented.
    AnyCert,
    /// Validate the chain against the system roots and, if given, the host name.
    Chain(Option<String>),
    /// Accept only a leaf certificate with this digest.
    Digest(PeerCertificateDigest),
}

pub(crate) struct EngineConfig<'a> {
    pub mode: SslMode,
    pub role: SslRole,
    pub identity: Option<&'a Arc<SslIdentity>>,
    pub server_name: Option<&'a str>,
    pub verify: Verify,
    pub ssl: &'a SslConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HandshakeStatus {
    InProgress,
    Complete,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum EngineRead {
    Data(usize),
    WantRead,
    /// The peer sent close_notify.
    Closed,
    Failed(String),
}

pub(crate) struct Engine {
    tls: SslStream<IoBuffer>,
    complete: bool,
}

impl Engine {
    pub fn new(config: &EngineConfig<'_>) -> Result<Engine, SslError> {
        let ctx = create_context(config)?;
        let mut ssl = Ssl::new(&ctx)?;

        if config.mode == SslMode::Dtls {
            ssl.set_mtu(config.ssl.mtu() as u32)?;
        }

        match config.role {
            SslRole::Client => {
                if let Some(name) = config.server_name {
                    ssl.set_hostname(name)?;
                }
                if let Verify::Chain(Some(host)) = &config.verify {
                    ssl.param_mut().set_host(host)?;
                }
                ssl.set_connect_state();
            }
            SslRole::Server => ssl.set_accept_state(),
        }

        let tls = SslStream::new(ssl, IoBuffer::new(config.mode))?;
        debug!("Created {} {:?} engine", config.mode, config.role);

        Ok(Engine {
            tls,
            complete: false,
        })
    }

    /// Queue bytes received from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.tls.get_mut().push_incoming(data);
    }

    /// Next chunk (TLS) or datagram (DTLS) to send on the transport.
    pub fn take_outgoing(&mut self) -> Option<Vec<u8>> {
        self.tls.get_mut().pop_outgoing()
    }

    pub fn handshake(&mut self) -> HandshakeStatus {
        if self.complete {
            return HandshakeStatus::Complete;
        }
        match self.tls.do_handshake() {
            Ok(()) => {
                self.complete = true;
                HandshakeStatus::Complete
            }
            Err(e) if would_block(e.code()) => HandshakeStatus::InProgress,
            Err(e) => HandshakeStatus::Failed(self.describe(&e)),
        }
    }

    pub fn read(&mut self, buf: &mut [u8]) -> EngineRead {
        if buf.is_empty() {
            return EngineRead::Data(0);
        }
        match self.tls.ssl_read(buf) {
            Ok(0) => EngineRead::Closed,
            Ok(n) => EngineRead::Data(n),
            Err(e) if would_block(e.code()) => EngineRead::WantRead,
            Err(e) if e.code() == ErrorCode::ZERO_RETURN => EngineRead::Closed,
            Err(e) => EngineRead::Failed(self.describe(&e)),
        }
    }

    /// Encrypt `data`. The records are picked up with [`take_outgoing`].
    ///
    /// [`take_outgoing`]: Engine::take_outgoing
    pub fn write(&mut self, data: &[u8]) -> Result<usize, SslError> {
        if data.is_empty() {
            return Ok(0);
        }
        self.tls
            .ssl_write(data)
            .map_err(|e| SslError::Record(self.describe(&e)))
    }

    /// Queue a close_notify alert.
    pub fn shutdown(&mut self) {
        if let Err(e) = self.tls.shutdown() {
            trace!("Shutdown: {}", e);
        }
    }

    /// Whether decrypted or undecrypted input is still buffered.
    pub fn has_pending_input(&self) -> bool {
        self.tls.ssl().pending() > 0 || self.tls.get_ref().has_incoming()
    }

    /// Whether a `read` would return something other than `WantRead`.
    ///
    /// Processes buffered records, so handshake messages such as session
    /// tickets are consumed without surfacing as application data.
    pub fn readable(&mut self) -> bool {
        if self.tls.ssl().pending() > 0 {
            return true;
        }
        let mut peek = [0u8; 1];
        match self.tls.ssl_peek(&mut peek) {
            Ok(_) => true,
            Err(e) => !would_block(e.code()),
        }
    }

    pub fn peer_certificate_digest(&self, algorithm: DigestAlgorithm) -> Option<Vec<u8>> {
        let cert = self.tls.ssl().peer_certificate()?;
        let der = cert.to_der().ok()?;
        Some(algorithm.digest(&der))
    }

    fn describe(&self, e: &openssl::ssl::Error) -> String {
        let verify = self.tls.ssl().verify_result();
        if verify != X509VerifyResult::OK {
            return format!("{} ({})", e, verify.error_string());
        }
        e.to_string()
    }
}

fn would_block(code: ErrorCode) -> bool {
    code == ErrorCode::WANT_READ || code == ErrorCode::WANT_WRITE
}

fn create_context(config: &EngineConfig<'_>) -> Result<SslContext, SslError> {
    let method = match config.mode {
        SslMode::Tls => SslMethod::tls(),
        SslMode::Dtls => SslMethod::dtls(),
    };
    let mut ctx = SslContextBuilder::new(method)?;

    match config.mode {
        SslMode::Tls => {
            if let Some(list) = config.ssl.tls_cipher_list() {
                ctx.set_cipher_list(list)?;
            }
        }
        SslMode::Dtls => {
            ctx.set_cipher_list(config.ssl.dtls_cipher_list())?;
            let mut options = SslOptions::empty();
            options.insert(SslOptions::SINGLE_ECDH_USE);
            options.insert(SslOptions::NO_DTLSV1);
            ctx.set_options(options);
        }
    }

    // Enable DHE cipher suites by setting temporary DH parameters
    if let Ok(dh) = Dh::get_2048_256() {
        ctx.set_tmp_dh(dh.as_ref())?;
    }

    match config.identity {
        Some(identity) => {
            let x509 = X509::from_der(identity.certificate_der())?;
            let pkey = PKey::private_key_from_pkcs8(identity.private_key_der())?;
            ctx.set_certificate(&x509)?;
            ctx.set_private_key(&pkey)?;
            ctx.check_private_key()?;
        }
        None if config.role == SslRole::Server => return Err(SslError::MissingIdentity),
        None => {}
    }

    let mut require = SslVerifyMode::PEER;
    if config.role == SslRole::Server {
        require.insert(SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    }

    match &config.verify {
        Verify::None => {
            if config.role == SslRole::Client {
                warn!("Peer certificate will not be verified");
            }
            ctx.set_verify(SslVerifyMode::NONE);
        }
        Verify::AnyCert => {
            ctx.set_verify_callback(require, |_ok, _ctx| true);
        }
        Verify::Chain(_) => {
            ctx.set_default_verify_paths()?;
            ctx.set_verify(require);
        }
        Verify::Digest(expected) => {
            let expected = expected.clone();
            ctx.set_verify_callback(require, move |_ok, store| check_digest(&expected, store));
        }
    }

    Ok(ctx.build())
}

/// Only the leaf is pinned; chain errors above it are ignored.
fn check_digest(expected: &PeerCertificateDigest, store: &mut X509StoreContextRef) -> bool {
    if store.error_depth() != 0 {
        return true;
    }
    let Some(der) = store.current_cert().and_then(|c| c.to_der().ok()) else {
        return false;
    };
    let ok = expected.matches(&der);
    if !ok {
        warn!("Peer certificate does not match pinned {:?}", expected);
    }
    ok
}
