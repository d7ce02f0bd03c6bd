//! TLS credential resolution.
//!
//! Server credentials are read from PEM files once per launch and validated
//! eagerly, so a bad certificate or key fails the launch of the endpoint that
//! needs it instead of the first handshake. Client credentials are used by the
//! gateway to dial the RPC endpoint and either trust the server's own
//! certificate or skip verification entirely.

use crate::error::{Error, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::path::Path;
use std::sync::Arc;

/// ALPN protocols offered by the gateway's HTTPS listener.
pub(crate) const HTTP_ALPN: &[&[u8]] = &[b"h2", b"http/1.1"];

/// Installs `ring` as the process-wide rustls provider unless one is set.
pub(crate) fn ensure_crypto_provider() {
    if CryptoProvider::get_default().is_none() {
        // Another thread may win the race; either way a provider is set.
        let _ = rustls::crypto::ring::default_provider().install_default();
    }
}

/// Certificate chain and private key loaded from disk.
pub struct ServerCredentials {
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl core::fmt::Debug for ServerCredentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ServerCredentials")
            .field("certs", &self.certs.len())
            .finish_non_exhaustive()
    }
}

impl ServerCredentials {
    /// The parsed certificate chain, leaf first.
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    /// Identity for the tonic server.
    pub(crate) fn identity(&self) -> tonic::transport::Identity {
        tonic::transport::Identity::from_pem(&self.cert_pem, &self.key_pem)
    }

    /// A rustls server config for the HTTPS gateway.
    pub(crate) fn server_config(&self, alpn: &[&[u8]]) -> Result<ServerConfig> {
        ensure_crypto_provider();
        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| Error::tls(format!("certificate and key do not match: {e}")))?;
        config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
        Ok(config)
    }
}

/// Reads and validates a PEM certificate chain and private key.
///
/// No caching: every launch reads the files again.
///
/// # Errors
///
/// Returns [`Error::TlsLoadFailure`] if either file cannot be read, contains
/// no usable PEM block, or the key does not belong to the certificate.
pub fn resolve_server_credentials(cert_file: &Path, key_file: &Path) -> Result<ServerCredentials> {
    let cert_pem = std::fs::read(cert_file).map_err(|e| {
        Error::tls(format!(
            "failed to read certificate file {}: {e}",
            cert_file.display()
        ))
    })?;
    let key_pem = std::fs::read(key_file)
        .map_err(|e| Error::tls(format!("failed to read key file {}: {e}", key_file.display())))?;

    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<core::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::tls(format!(
                "failed to parse certificate file {}: {e}",
                cert_file.display()
            ))
        })?;
    if certs.is_empty() {
        return Err(Error::tls(format!(
            "no certificates found in {}",
            cert_file.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| Error::tls(format!("failed to parse key file {}: {e}", key_file.display())))?
        .ok_or_else(|| Error::tls(format!("no private key found in {}", key_file.display())))?;

    let credentials = ServerCredentials {
        cert_pem,
        key_pem,
        certs,
        key,
    };
    // Building once proves the pair is usable before any socket is bound.
    credentials.server_config(HTTP_ALPN)?;
    Ok(credentials)
}

/// Client-side TLS settings used for the gateway's dial to the RPC endpoint.
#[derive(Clone)]
pub struct ClientCredentials {
    config: Arc<ClientConfig>,
    skip_verify: bool,
}

impl core::fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClientCredentials")
            .field("skip_verify", &self.skip_verify)
            .finish_non_exhaustive()
    }
}

impl ClientCredentials {
    pub fn skips_verification(&self) -> bool {
        self.skip_verify
    }

    pub(crate) fn config(&self) -> Arc<ClientConfig> {
        Arc::clone(&self.config)
    }
}

/// Builds client credentials for dialing a TLS RPC endpoint.
///
/// With `skip_verify` the server certificate chain and host name are not
/// checked. Otherwise the `trusted` certificates (normally the RPC endpoint's
/// own chain) form the root store.
///
/// # Errors
///
/// Returns [`Error::TlsLoadFailure`] if a trusted certificate is rejected by
/// the root store, or if no root is left to verify against.
pub fn resolve_client_credentials(
    skip_verify: bool,
    trusted: &[CertificateDer<'static>],
) -> Result<ClientCredentials> {
    ensure_crypto_provider();

    let mut config = if skip_verify {
        let provider = CryptoProvider::get_default()
            .cloned()
            .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider)))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        for cert in trusted {
            roots
                .add(cert.clone())
                .map_err(|e| Error::tls(format!("untrusted certificate: {e}")))?;
        }
        if roots.is_empty() {
            return Err(Error::tls("no trusted certificates to verify the RPC endpoint"));
        }
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    config.alpn_protocols = vec![b"h2".to_vec()];

    Ok(ClientCredentials {
        config: Arc::new(config),
        skip_verify,
    })
}

/// Parses the name presented for SNI and checked against the certificate.
pub(crate) fn server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_owned())
        .map_err(|e| Error::invalid(format!("invalid TLS server name {name:?}: {e}")))
}

/// Accepts any server certificate; handshake signatures are still checked.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> core::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> core::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> core::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
