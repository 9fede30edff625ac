//! TLS trust configuration and the pinning certificate verifier.
//!
//! A presented server chain is trusted when any of:
//!
//! - the pin store has skip-check enabled
//! - the pin store is non-empty and one of the presented keys is pinned
//! - the pin store is empty and the chain verifies against the configured
//!   CA roots (see [`TlsOptions::set_ca_file`])
//!
//! A non-empty pin store with no matching key rejects the chain even if a CA
//! would accept it. With neither pins nor CA roots nothing is trusted.
//! Handshake signatures are always verified.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use pitaya_core::{Fingerprint, PinError, PinStore, pinning::read_certificates};
use rustls::{
    CertificateError, DigitallySignedStruct, Error as TlsError, RootCertStore, SignatureScheme,
    client::{
        WebPkiServerVerifier,
        danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    },
    crypto::{CryptoProvider, ring},
    pki_types::{CertificateDer, ServerName, UnixTime},
};
use tracing::{debug, warn};

use crate::error::ClientError;

/// Trust anchors for TLS connections.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    ca_file: Option<PathBuf>,
    roots: Vec<CertificateDer<'static>>,
}

impl TlsOptions {
    /// No CA roots.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust the certificates in `path` (PEM or DER) as CA roots.
    ///
    /// Replaces roots loaded by an earlier call.
    ///
    /// # Errors
    ///
    /// - `PinError::NoSuchFile` if `path` does not exist
    /// - `PinError::CorruptCertificate` if it holds no certificate
    pub fn set_ca_file(&mut self, path: impl AsRef<Path>) -> Result<(), PinError> {
        let path = path.as_ref();
        let certs = read_certificates(path)?;
        for der in &certs {
            Fingerprint::from_certificate_der(der).map_err(|reason| {
                PinError::CorruptCertificate { path: path.to_path_buf(), reason }
            })?;
        }

        self.roots = certs.into_iter().map(CertificateDer::from).collect();
        self.ca_file = Some(path.to_path_buf());
        debug!(path = %path.display(), roots = self.roots.len(), "loaded CA file");
        Ok(())
    }

    /// Path of the configured CA file.
    pub fn ca_file(&self) -> Option<&Path> {
        self.ca_file.as_deref()
    }

    /// Build the rustls client configuration consulting `pins`.
    pub(crate) fn client_config(&self, pins: PinStore) -> Result<rustls::ClientConfig, ClientError> {
        let provider = Arc::new(ring::default_provider());
        let verifier = PinningVerifier::new(pins, &self.roots, provider.clone())?;

        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| ClientError::Tls(e.to_string()))?
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();

        Ok(config)
    }
}

/// Certificate verifier enforcing the pin store, falling back to CA roots.
#[derive(Debug)]
pub(crate) struct PinningVerifier {
    pins: PinStore,
    webpki: Option<Arc<WebPkiServerVerifier>>,
    provider: Arc<CryptoProvider>,
}

impl PinningVerifier {
    fn new(
        pins: PinStore,
        roots: &[CertificateDer<'static>],
        provider: Arc<CryptoProvider>,
    ) -> Result<Self, ClientError> {
        let webpki = if roots.is_empty() {
            None
        } else {
            let mut store = RootCertStore::empty();
            let (added, ignored) = store.add_parsable_certificates(roots.iter().cloned());
            if ignored > 0 {
                warn!(added, ignored, "some CA certificates were not usable as roots");
            }
            let verifier =
                WebPkiServerVerifier::builder_with_provider(Arc::new(store), provider.clone())
                    .build()
                    .map_err(|e| ClientError::Tls(e.to_string()))?;
            Some(verifier)
        };

        Ok(Self { pins, webpki, provider })
    }
}

impl ServerCertVerifier for PinningVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        if self.pins.is_skip_check() {
            debug!("pin check skipped");
            return Ok(ServerCertVerified::assertion());
        }

        if !self.pins.is_empty() {
            let chain =
                std::iter::once(&**end_entity).chain(intermediates.iter().map(|cert| &**cert));
            return match self.pins.validate_chain(chain) {
                Ok(()) => Ok(ServerCertVerified::assertion()),
                Err(error) => {
                    warn!(%error, "pin validation failed");
                    Err(TlsError::General(error.to_string()))
                },
            };
        }

        match &self.webpki {
            Some(webpki) => webpki
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .inspect_err(|error| warn!(%error, "certificate rejected by CA roots")),
            None => {
                warn!("no pinned keys and no CA roots; rejecting server certificate");
                Err(TlsError::InvalidCertificate(CertificateError::UnknownIssuer))
            },
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
