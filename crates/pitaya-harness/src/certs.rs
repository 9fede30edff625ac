//! Self-signed server identities.
//!
//! Every identity writes its certificate to a private temp directory in both
//! PEM and DER form, so tests can exercise the pin store and CA loading
//! through real files.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use pitaya_core::Fingerprint;
use rustls::{
    crypto::ring,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer},
};
use tempfile::TempDir;

use crate::HarnessError;

/// Names covered by [`ServerIdentity::localhost`].
pub const LOCALHOST_NAMES: [&str; 2] = ["localhost", "127.0.0.1"];

/// Certificate and key for a test TLS endpoint.
#[derive(Debug)]
pub struct ServerIdentity {
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
    pem_path: PathBuf,
    der_path: PathBuf,
    _dir: TempDir,
}

impl ServerIdentity {
    /// Identity valid for `localhost` and `127.0.0.1`.
    pub fn localhost() -> Result<Self, HarnessError> {
        Self::for_names(&LOCALHOST_NAMES)
    }

    /// Identity valid for `names` (DNS names or IP literals).
    pub fn for_names(names: &[&str]) -> Result<Self, HarnessError> {
        let names: Vec<String> = names.iter().map(ToString::to_string).collect();
        let certified = rcgen::generate_simple_self_signed(names)
            .map_err(|e| HarnessError::Certificate(e.to_string()))?;

        let dir = tempfile::tempdir()?;
        let pem_path = dir.path().join("server.pem");
        let der_path = dir.path().join("server.der");
        std::fs::write(&pem_path, certified.cert.pem())?;
        std::fs::write(&der_path, certified.cert.der())?;

        Ok(Self {
            cert_der: certified.cert.der().to_vec(),
            key_der: certified.key_pair.serialize_der(),
            pem_path,
            der_path,
            _dir: dir,
        })
    }

    /// DER certificate.
    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    /// Path of the PEM certificate.
    pub fn pem_path(&self) -> &Path {
        &self.pem_path
    }

    /// Path of the DER certificate.
    pub fn der_path(&self) -> &Path {
        &self.der_path
    }

    /// Fingerprint of the certificate's public key.
    pub fn fingerprint(&self) -> Result<Fingerprint, HarnessError> {
        Fingerprint::from_certificate_der(&self.cert_der).map_err(HarnessError::Certificate)
    }

    pub(crate) fn server_config(&self) -> Result<Arc<rustls::ServerConfig>, HarnessError> {
        let chain = vec![CertificateDer::from(self.cert_der.clone())];
        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(self.key_der.clone()));

        let config = rustls::ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_safe_default_protocol_versions()
            .map_err(|e| HarnessError::Tls(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| HarnessError::Tls(e.to_string()))?;

        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_and_der_files_hold_the_same_key() {
        let identity = ServerIdentity::localhost().unwrap();

        let pem = std::fs::read_to_string(identity.pem_path()).unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(std::fs::read(identity.der_path()).unwrap(), identity.cert_der());
        assert!(identity.server_config().is_ok());
    }

    #[test]
    fn identities_have_distinct_keys() {
        let a = ServerIdentity::localhost().unwrap();
        let b = ServerIdentity::localhost().unwrap();
        assert_ne!(a.fingerprint().unwrap(), b.fingerprint().unwrap());
    }
}
