//! Certificate public-key pinning.
//!
//! A pin is the SHA-256 digest of a certificate's DER-encoded
//! SubjectPublicKeyInfo. Pinning the key rather than the certificate keeps
//! pins valid across certificate renewals that reuse the key.
//!
//! # Validation rule
//!
//! A presented chain is accepted if any of:
//!
//! - skip-check is enabled on the store
//! - the store is empty
//! - at least one presented certificate's key is pinned
//!
//! # Sharing
//!
//! [`PinStore`] is a cheaply clonable handle. Clients receive the store they
//! should consult at init; tests that need isolation build their own store
//! instead of mutating a process global. [`PinStore::skip_check_scope`]
//! overrides enforcement until the returned guard is dropped. Concurrent
//! toggling of the same store from several threads is last-writer-wins and
//! remains the caller's responsibility.

use std::{
    collections::HashSet,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};

use sha2::{Digest, Sha256};

use crate::error::PinError;

/// SHA-256 fingerprint of a SubjectPublicKeyInfo.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    /// Fingerprint of a DER-encoded SubjectPublicKeyInfo.
    pub fn from_spki_der(spki: &[u8]) -> Self {
        Self(Sha256::digest(spki).into())
    }

    /// Fingerprint of the key in a DER-encoded X.509 certificate.
    ///
    /// Returns the parser diagnostic on failure.
    pub fn from_certificate_der(der: &[u8]) -> Result<Self, String> {
        let (_, cert) = x509_parser::parse_x509_certificate(der).map_err(|e| e.to_string())?;
        Ok(Self::from_spki_der(cert.public_key().raw))
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("sha256:")?;
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Read every certificate in a PEM or DER file.
///
/// PEM is detected by its armor; anything else is treated as a single DER
/// certificate. Returns raw DER blobs.
///
/// # Errors
///
/// - `PinError::NoSuchFile` if `path` does not exist
/// - `PinError::CorruptCertificate` if PEM armor is malformed or holds no
///   certificate
/// - `PinError::Io` for other read failures
pub fn read_certificates(path: &Path) -> Result<Vec<Vec<u8>>, PinError> {
    let bytes = fs::read(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => PinError::NoSuchFile { path: path.to_path_buf() },
        _ => PinError::Io { path: path.to_path_buf(), reason: e.to_string() },
    })?;

    let corrupt = |reason: String| PinError::CorruptCertificate { path: path.to_path_buf(), reason };

    if !is_pem(&bytes) {
        if bytes.is_empty() {
            return Err(corrupt("empty file".to_string()));
        }
        return Ok(vec![bytes]);
    }

    let certs = rustls_pemfile::certs(&mut &bytes[..])
        .map(|cert| cert.map(|der| der.as_ref().to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| corrupt(e.to_string()))?;

    if certs.is_empty() {
        return Err(corrupt("no certificate in PEM file".to_string()));
    }

    Ok(certs)
}

fn is_pem(bytes: &[u8]) -> bool {
    const ARMOR: &[u8] = b"-----BEGIN";
    bytes.windows(ARMOR.len()).any(|w| w == ARMOR)
}

#[derive(Debug, Default)]
struct PinSet {
    keys: HashSet<Fingerprint>,
    skip_check: bool,
}

/// Set of pinned keys plus the skip-check override.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct PinStore {
    inner: Arc<RwLock<PinSet>>,
}

impl PinStore {
    /// Empty store with enforcement enabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the public key of the first certificate in `path`.
    ///
    /// Adding a key that is already pinned is a no-op.
    ///
    /// # Errors
    ///
    /// - `PinError::NoSuchFile` if `path` does not exist
    /// - `PinError::CorruptCertificate` if the file cannot be parsed
    pub fn add_pinned_key(&self, path: impl AsRef<Path>) -> Result<Fingerprint, PinError> {
        let path = path.as_ref();
        let certs = read_certificates(path)?;

        let first = certs.first().ok_or_else(|| PinError::CorruptCertificate {
            path: path.to_path_buf(),
            reason: "no certificate".to_string(),
        })?;

        let fingerprint = Fingerprint::from_certificate_der(first).map_err(|reason| {
            PinError::CorruptCertificate { path: PathBuf::from(path), reason }
        })?;

        if self.add_fingerprint(fingerprint) {
            tracing::debug!(path = %path.display(), %fingerprint, "pinned public key");
        }

        Ok(fingerprint)
    }

    /// Pin a fingerprint directly. Returns false if it was already pinned.
    pub fn add_fingerprint(&self, fingerprint: Fingerprint) -> bool {
        self.write().keys.insert(fingerprint)
    }

    /// Remove every pinned key. Never fails.
    pub fn clear_pinned_keys(&self) {
        self.write().keys.clear();
    }

    /// Number of distinct pinned keys.
    pub fn len(&self) -> usize {
        self.read().keys.len()
    }

    /// Whether no key is pinned.
    pub fn is_empty(&self) -> bool {
        self.read().keys.is_empty()
    }

    /// Enable or disable the skip-check override.
    ///
    /// Prefer [`PinStore::skip_check_scope`], which restores the previous
    /// value automatically.
    pub fn skip_check(&self, enabled: bool) {
        self.write().skip_check = enabled;
    }

    /// Whether validation is currently bypassed.
    pub fn is_skip_check(&self) -> bool {
        self.read().skip_check
    }

    /// Override skip-check until the returned guard is dropped.
    #[must_use = "the override ends when the guard is dropped"]
    pub fn skip_check_scope(&self, enabled: bool) -> SkipCheckGuard {
        let previous = {
            let mut set = self.write();
            std::mem::replace(&mut set.skip_check, enabled)
        };
        SkipCheckGuard { store: self.clone(), previous }
    }

    /// Validate a single presented key.
    pub fn validate(&self, presented: &Fingerprint) -> Result<(), PinError> {
        let set = self.read();
        if set.skip_check || set.keys.is_empty() || set.keys.contains(presented) {
            Ok(())
        } else {
            Err(PinError::Mismatch { presented: *presented })
        }
    }

    /// Validate a presented certificate chain (end-entity first).
    ///
    /// Certificates that fail to parse are skipped; if none match, the
    /// mismatch reports the end-entity key.
    ///
    /// # Errors
    ///
    /// - `PinError::Mismatch` if enforcement applies and no key matches
    /// - `PinError::CorruptCertificate` if the end-entity cannot be parsed
    ///   while enforcement applies
    pub fn validate_chain<'a>(
        &self,
        chain: impl IntoIterator<Item = &'a [u8]>,
    ) -> Result<(), PinError> {
        let set = self.read();
        if set.skip_check || set.keys.is_empty() {
            return Ok(());
        }

        let mut end_entity = None;
        for (index, der) in chain.into_iter().enumerate() {
            match Fingerprint::from_certificate_der(der) {
                Ok(fingerprint) if set.keys.contains(&fingerprint) => return Ok(()),
                Ok(fingerprint) if index == 0 => end_entity = Some(fingerprint),
                Ok(_) => {},
                Err(reason) if index == 0 => {
                    return Err(PinError::CorruptCertificate {
                        path: PathBuf::from("<peer>"),
                        reason,
                    });
                },
                Err(_) => {},
            }
        }

        let presented = end_entity.unwrap_or(Fingerprint([0; 32]));
        tracing::warn!(%presented, pinned = set.keys.len(), "peer key not pinned");
        Err(PinError::Mismatch { presented })
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PinSet> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PinSet> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Restores the previous skip-check value on drop.
#[derive(Debug)]
pub struct SkipCheckGuard {
    store: PinStore,
    previous: bool,
}

impl Drop for SkipCheckGuard {
    fn drop(&mut self) {
        self.store.skip_check(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    struct Fixture {
        _dir: tempfile::TempDir,
        pem: PathBuf,
        der: PathBuf,
        spki: Vec<u8>,
        cert_der: Vec<u8>,
    }

    fn fixture(name: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let certified = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();

        let pem = dir.path().join(format!("{name}.crt"));
        fs::write(&pem, certified.cert.pem()).unwrap();

        let der = dir.path().join(format!("{name}.der"));
        fs::write(&der, certified.cert.der().as_ref()).unwrap();

        Fixture {
            pem,
            der,
            spki: certified.key_pair.public_key_der(),
            cert_der: certified.cert.der().to_vec(),
            _dir: dir,
        }
    }

    #[test]
    fn fingerprint_covers_public_key_info() {
        let fx = fixture("localhost");
        let from_cert = Fingerprint::from_certificate_der(&fx.cert_der).unwrap();
        assert_eq!(from_cert, Fingerprint::from_spki_der(&fx.spki));
    }

    #[test]
    fn pem_and_der_files_pin_the_same_key() {
        let fx = fixture("localhost");
        let store = PinStore::new();

        let a = store.add_pinned_key(&fx.pem).unwrap();
        let b = store.add_pinned_key(&fx.der).unwrap();

        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn missing_file_is_distinct_from_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = PinStore::new();

        let missing = dir.path().join("asoijdoaisjdisajd");
        assert!(matches!(store.add_pinned_key(&missing), Err(PinError::NoSuchFile { .. })));

        let corrupt = dir.path().join("corrupt-ca.crt");
        let mut file = fs::File::create(&corrupt).unwrap();
        file.write_all(b"-----BEGIN CERTIFICATE-----\nnot base64 at all\n-----END CERTIFICATE-----\n")
            .unwrap();
        assert!(matches!(
            store.add_pinned_key(&corrupt),
            Err(PinError::CorruptCertificate { .. })
        ));

        let garbage = dir.path().join("garbage.der");
        fs::write(&garbage, [0x30, 0x03, 0x02, 0x01]).unwrap();
        assert!(matches!(
            store.add_pinned_key(&garbage),
            Err(PinError::CorruptCertificate { .. })
        ));

        assert!(store.is_empty());
    }

    #[test]
    fn empty_store_accepts_any_key() {
        let fx = fixture("server");
        let store = PinStore::new();
        assert_eq!(store.validate_chain([fx.cert_der.as_slice()]), Ok(()));
    }

    #[test]
    fn non_empty_store_rejects_unpinned_key() {
        let pinned = fixture("ca");
        let peer = fixture("server");
        let store = PinStore::new();
        store.add_pinned_key(&pinned.pem).unwrap();

        let result = store.validate_chain([peer.cert_der.as_slice()]);
        assert_eq!(
            result,
            Err(PinError::Mismatch { presented: Fingerprint::from_spki_der(&peer.spki) })
        );
    }

    #[test]
    fn any_matching_certificate_in_chain_is_enough() {
        let leaf = fixture("leaf");
        let intermediate = fixture("intermediate");
        let store = PinStore::new();
        store.add_pinned_key(&intermediate.pem).unwrap();

        let chain = [leaf.cert_der.as_slice(), intermediate.cert_der.as_slice()];
        assert_eq!(store.validate_chain(chain), Ok(()));
    }

    #[test]
    fn clear_restores_accept_all() {
        let pinned = fixture("ca");
        let peer = fixture("server");
        let store = PinStore::new();
        store.add_pinned_key(&pinned.pem).unwrap();
        assert!(store.validate_chain([peer.cert_der.as_slice()]).is_err());

        store.clear_pinned_keys();
        store.clear_pinned_keys();

        assert!(store.is_empty());
        assert_eq!(store.validate_chain([peer.cert_der.as_slice()]), Ok(()));
    }

    #[test]
    fn skip_check_scope_restores_enforcement() {
        let pinned = fixture("ca");
        let peer = Fingerprint::from_spki_der(&fixture("server").spki);
        let store = PinStore::new();
        store.add_pinned_key(&pinned.pem).unwrap();

        {
            let _guard = store.skip_check_scope(true);
            assert!(store.is_skip_check());
            assert_eq!(store.validate(&peer), Ok(()));
        }

        assert!(!store.is_skip_check());
        assert!(store.validate(&peer).is_err());
    }

    #[test]
    fn clones_share_pins() {
        let fx = fixture("ca");
        let store = PinStore::new();
        let handle = store.clone();

        handle.add_pinned_key(&fx.pem).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn fingerprint_display_is_hex() {
        let fp = Fingerprint([0xAB; 32]);
        let text = fp.to_string();
        assert!(text.starts_with("sha256:abab"));
        assert_eq!(text.len(), "sha256:".len() + 64);
    }
}
