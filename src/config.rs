use std::time::Duration;

// Restrict DTLS to ephemeral (EC)DH with AES-GCM or AES-256.
const DTLS_CIPHERS: &str = "ECDHE+AESGCM:DHE+AESGCM:ECDHE+AES256:DHE+AES256";

/// SSL adapter configuration.
#[derive(Debug, Clone)]
pub struct SslConfig {
    mtu: usize,
    tls_cipher_list: Option<String>,
    dtls_cipher_list: String,
    read_chunk: usize,
}

impl SslConfig {
    /// Create a new configuration builder.
    pub fn builder() -> SslConfigBuilder {
        SslConfigBuilder {
            mtu: 1150,
            tls_cipher_list: None,
            dtls_cipher_list: DTLS_CIPHERS.to_string(),
            read_chunk: 16 * 1024,
        }
    }

    /// Max transmission unit.
    ///
    /// The largest DTLS datagrams the engine will produce.
    #[inline(always)]
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// OpenSSL cipher list for TLS. `None` keeps the library default.
    #[inline(always)]
    pub fn tls_cipher_list(&self) -> Option<&str> {
        self.tls_cipher_list.as_deref()
    }

    /// OpenSSL cipher list for DTLS.
    #[inline(always)]
    pub fn dtls_cipher_list(&self) -> &str {
        &self.dtls_cipher_list
    }

    /// Bytes pulled from the wrapped transport per read.
    #[inline(always)]
    pub fn read_chunk(&self) -> usize {
        self.read_chunk
    }
}

impl Default for SslConfig {
    fn default() -> Self {
        SslConfig::builder().build()
    }
}

/// Builder for [`SslConfig`].
pub struct SslConfigBuilder {
    mtu: usize,
    tls_cipher_list: Option<String>,
    dtls_cipher_list: String,
    read_chunk: usize,
}

impl SslConfigBuilder {
    /// Set the max transmission unit (MTU) for DTLS.
    ///
    /// Defaults to 1150.
    pub fn mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    /// Set the OpenSSL cipher list used in TLS mode.
    pub fn tls_cipher_list(mut self, list: impl Into<String>) -> Self {
        self.tls_cipher_list = Some(list.into());
        self
    }

    /// Set the OpenSSL cipher list used in DTLS mode.
    ///
    /// Defaults to ECDHE/DHE with AES-GCM or AES-256.
    pub fn dtls_cipher_list(mut self, list: impl Into<String>) -> Self {
        self.dtls_cipher_list = list.into();
        self
    }

    /// Set how many bytes are pulled from the transport per read.
    ///
    /// Defaults to 16 KiB. Must hold a full datagram in DTLS mode.
    pub fn read_chunk(mut self, bytes: usize) -> Self {
        self.read_chunk = bytes.max(1);
        self
    }

    pub fn build(self) -> SslConfig {
        SslConfig {
            mtu: self.mtu,
            tls_cipher_list: self.tls_cipher_list,
            dtls_cipher_list: self.dtls_cipher_list,
            read_chunk: self.read_chunk,
        }
    }
}

/// Virtual network configuration.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    delay: Duration,
    recv_buffer: usize,
    first_port: u16,
    drop_probability: f64,
    rng_seed: Option<u64>,
}

impl NetworkConfig {
    /// Create a new configuration builder.
    pub fn builder() -> NetworkConfigBuilder {
        NetworkConfigBuilder {
            delay: Duration::ZERO,
            recv_buffer: 64 * 1024,
            first_port: 49152,
            drop_probability: 0.0,
            rng_seed: None,
        }
    }

    /// Simulated one-way latency of every delivery.
    #[inline(always)]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Receive buffer capacity of stream sockets.
    ///
    /// Senders see `WouldBlock` once the peer holds this many unread bytes.
    #[inline(always)]
    pub fn recv_buffer(&self) -> usize {
        self.recv_buffer
    }

    /// First port handed out for ephemeral binds.
    #[inline(always)]
    pub fn first_port(&self) -> u16 {
        self.first_port
    }

    /// Probability in `[0, 1]` that a datagram is lost.
    ///
    /// A DTLS handshake only recovers from loss if its adapter's
    /// `handle_timeout` is called when `poll_timeout` says so.
    #[inline(always)]
    pub fn drop_probability(&self) -> f64 {
        self.drop_probability
    }

    /// Seed for the loss simulation. `None` is non-deterministic.
    #[inline(always)]
    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig::builder().build()
    }
}

/// Builder for [`NetworkConfig`].
pub struct NetworkConfigBuilder {
    delay: Duration,
    recv_buffer: usize,
    first_port: u16,
    drop_probability: f64,
    rng_seed: Option<u64>,
}

impl NetworkConfigBuilder {
    /// Set the one-way latency.
    ///
    /// Defaults to zero.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Set the stream receive buffer capacity.
    ///
    /// Defaults to 64 KiB.
    pub fn recv_buffer(mut self, bytes: usize) -> Self {
        self.recv_buffer = bytes.max(1);
        self
    }

    /// Set the first ephemeral port.
    ///
    /// Defaults to 49152.
    pub fn first_port(mut self, port: u16) -> Self {
        self.first_port = port.max(1);
        self
    }

    /// Set the datagram loss probability, clamped to `[0, 1]`.
    ///
    /// Defaults to 0.
    pub fn drop_probability(mut self, p: f64) -> Self {
        self.drop_probability = p.clamp(0.0, 1.0);
        self
    }

    /// Seed the loss simulation for reproducible runs.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    pub fn build(self) -> NetworkConfig {
        NetworkConfig {
            delay: self.delay,
            recv_buffer: self.recv_buffer,
            first_port: self.first_port,
            drop_probability: self.drop_probability,
            rng_seed: self.rng_seed,
        }
    }
}
