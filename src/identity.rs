//! Certificate identities and certificate digests.
//!
//! An [`SslIdentity`] is a key pair plus a self-signed certificate. It is
//! immutable once created and shared between adapters as `Arc<SslIdentity>`.

use std::fmt;
use std::str::FromStr;

use rcgen::{
    Certificate as RcgenCertificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    PKCS_ECDSA_P256_SHA256,
};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use zeroize::Zeroizing;

use crate::error::SslError;

/// Hash used for certificate digests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DigestAlgorithm {
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    /// Output length in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// Hash `data` with this algorithm.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            DigestAlgorithm::Sha1 => Sha1::digest(data).to_vec(),
            DigestAlgorithm::Sha256 => Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => Sha512::digest(data).to_vec(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "sha-1",
            DigestAlgorithm::Sha256 => "sha-256",
            DigestAlgorithm::Sha384 => "sha-384",
            DigestAlgorithm::Sha512 => "sha-512",
        }
    }
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DigestAlgorithm {
    type Err = SslError;

    /// Parses the names used in SDP fingerprints, e.g. `sha-256`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha-1" | "sha1" => Ok(DigestAlgorithm::Sha1),
            "sha-256" | "sha256" => Ok(DigestAlgorithm::Sha256),
            "sha-384" | "sha384" => Ok(DigestAlgorithm::Sha384),
            "sha-512" | "sha512" => Ok(DigestAlgorithm::Sha512),
            _ => Err(SslError::UnknownDigest(s.to_string())),
        }
    }
}

/// Expected digest of a peer certificate.
#[derive(Clone, PartialEq, Eq)]
pub struct PeerCertificateDigest {
    algorithm: DigestAlgorithm,
    value: Vec<u8>,
}

impl PeerCertificateDigest {
    /// Fails if `value` is not exactly as long as the algorithm's output.
    pub fn new(algorithm: DigestAlgorithm, value: &[u8]) -> Result<Self, SslError> {
        if value.len() != algorithm.len() {
            return Err(SslError::InvalidDigest {
                algorithm,
                expected: algorithm.len(),
                got: value.len(),
            });
        }
        Ok(PeerCertificateDigest {
            algorithm,
            value: value.to_vec(),
        })
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// True if the DER encoded certificate hashes to this digest.
    pub fn matches(&self, cert_der: &[u8]) -> bool {
        self.algorithm.digest(cert_der) == self.value
    }
}

impl fmt::Debug for PeerCertificateDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.algorithm, format_fingerprint(&self.value))
    }
}

/// A private key with its self-signed certificate.
pub struct SslIdentity {
    certificate: Vec<u8>,
    private_key: Zeroizing<Vec<u8>>,
    common_name: String,
}

impl SslIdentity {
    /// Generate an ECDSA P-256 key and a certificate for `common_name`,
    /// valid for one year.
    pub fn generate(common_name: &str) -> Result<SslIdentity, SslError> {
        let key_pair = KeyPair::generate(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| SslError::Identity(e.to_string()))?;

        let mut params = CertificateParams::new(vec![common_name.to_string()]);

        let mut distinguished_name = DistinguishedName::new();
        distinguished_name.push(DnType::CommonName, common_name.to_string());
        params.distinguished_name = distinguished_name;
        params.is_ca = IsCa::NoCa;
        params.key_pair = Some(key_pair);

        // Backdate a day to tolerate clock skew between peers.
        let now = time::OffsetDateTime::now_utc();
        params.not_before = now - time::Duration::days(1);
        params.not_after = now + time::Duration::days(365);

        let cert =
            RcgenCertificate::from_params(params).map_err(|e| SslError::Identity(e.to_string()))?;
        let certificate = cert
            .serialize_der()
            .map_err(|e| SslError::Identity(e.to_string()))?;
        let private_key = Zeroizing::new(cert.serialize_private_key_der());

        debug!("Generated identity for {}", common_name);

        Ok(SslIdentity {
            certificate,
            private_key,
            common_name: common_name.to_string(),
        })
    }

    /// Wrap an existing DER certificate and PKCS#8 private key.
    pub fn from_der(
        common_name: &str,
        certificate: Vec<u8>,
        private_key: Vec<u8>,
    ) -> Result<SslIdentity, SslError> {
        if certificate.is_empty() || private_key.is_empty() {
            return Err(SslError::Identity("empty certificate or key".into()));
        }
        Ok(SslIdentity {
            certificate,
            private_key: Zeroizing::new(private_key),
            common_name: common_name.to_string(),
        })
    }

    pub fn common_name(&self) -> &str {
        &self.common_name
    }

    #[inline(always)]
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate
    }

    #[inline(always)]
    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key
    }

    /// Digest of the DER encoded certificate.
    pub fn digest(&self, algorithm: DigestAlgorithm) -> Vec<u8> {
        algorithm.digest(&self.certificate)
    }

    /// SHA-256 fingerprint of the certificate.
    pub fn fingerprint(&self) -> Vec<u8> {
        self.digest(DigestAlgorithm::Sha256)
    }

    /// The fingerprint as uppercase hex pairs separated by colons.
    pub fn fingerprint_str(&self) -> String {
        format_fingerprint(&self.fingerprint())
    }
}

impl fmt::Debug for SslIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslIdentity")
            .field("common_name", &self.common_name)
            .field("certificate", &self.certificate.len())
            .finish()
    }
}

/// Format a fingerprint as a colon-separated hex string, e.g. "AF:12:F6".
pub fn format_fingerprint(fingerprint: &[u8]) -> String {
    fingerprint
        .iter()
        .map(|byte| format!("{:02X}", byte))
        .collect::<Vec<String>>()
        .join(":")
}
