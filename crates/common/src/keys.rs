//! Persistent WireGuard keys
//!
//! One private key per resource, stored base64 in `<dir>/<hex token>` with
//! owner-only permissions. A key is created once and never rotated or
//! overwritten.

use crate::nibble::Nibble;
use crate::{Error, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use rand::RngCore;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;
use x25519_dalek::{PublicKey, StaticSecret};

/// WireGuard private key
#[derive(Clone, PartialEq, Eq)]
pub struct WgPrivateKey([u8; 32]);

impl WgPrivateKey {
    /// Generate a new random key, clamped as WireGuard expects
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        bytes[0] &= 248;
        bytes[31] &= 127;
        bytes[31] |= 64;
        Self(bytes)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Key(format!("invalid key encoding: {}", e)))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::Key("Invalid key length".to_string()))?;
        Ok(Self(bytes))
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Base64 public key
    pub fn public_key(&self) -> String {
        let secret = StaticSecret::from(self.0);
        STANDARD.encode(PublicKey::from(&secret).as_bytes())
    }
}

impl std::fmt::Debug for WgPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WgPrivateKey")
            .field("public_key", &self.public_key())
            .finish()
    }
}

/// Directory of per-resource private keys
#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Key file of the resource identified by `nibble`
    pub fn path_for(&self, nibble: &Nibble) -> PathBuf {
        self.dir.join(nibble.hex())
    }

    /// Load the key of a resource, if one was stored
    pub fn load(&self, nibble: &Nibble) -> Result<Option<WgPrivateKey>> {
        let path = self.path_for(nibble);
        match std::fs::read_to_string(&path) {
            Ok(content) => WgPrivateKey::from_base64(&content)
                .map(Some)
                .map_err(|e| Error::Key(format!("{}: {}", path.display(), e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Load the key of a resource, generating and persisting one on first use
    pub fn load_or_generate(&self, nibble: &Nibble) -> Result<WgPrivateKey> {
        if let Some(key) = self.load(nibble)? {
            return Ok(key);
        }

        std::fs::create_dir_all(&self.dir)?;
        let key = WgPrivateKey::generate();
        let path = self.path_for(nibble);

        let mut file = tempfile::NamedTempFile::new_in(&self.dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o600))?;
        }
        file.write_all(key.to_base64().as_bytes())?;
        file.as_file().sync_all()?;

        match file.persist_noclobber(&path) {
            Ok(_) => {
                info!(path = %path.display(), public_key = %key.public_key(), "Generated WireGuard key");
                Ok(key)
            }
            // lost a race with another writer; theirs wins
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => self
                .load(nibble)?
                .ok_or_else(|| Error::Key(format!("{} vanished after creation", path.display()))),
            Err(e) => Err(e.error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nibble() -> Nibble {
        Nibble::parse("2001:db8:1::/64", 1).unwrap()
    }

    #[test]
    fn test_keypair_encoding() {
        let key = WgPrivateKey::generate();
        let encoded = key.to_base64();
        assert_eq!(encoded.len(), 44);
        assert_eq!(WgPrivateKey::from_base64(&encoded).unwrap(), key);
        assert_ne!(key.public_key(), encoded);
    }

    #[test]
    fn test_generate_once_then_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path().join("keys"));

        let first = store.load_or_generate(&nibble()).unwrap();
        let second = store.load_or_generate(&nibble()).unwrap();
        assert_eq!(first, second);
        assert!(store.path_for(&nibble()).ends_with("2db8"));
    }

    #[test]
    fn test_existing_key_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let existing = WgPrivateKey::generate();
        std::fs::write(store.path_for(&nibble()), existing.to_base64()).unwrap();

        let loaded = store.load_or_generate(&nibble()).unwrap();
        assert_eq!(loaded, existing);
    }

    #[test]
    fn test_corrupt_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        std::fs::write(store.path_for(&nibble()), "garbage").unwrap();

        assert!(matches!(store.load_or_generate(&nibble()), Err(Error::Key(_))));
        assert_eq!(
            std::fs::read_to_string(store.path_for(&nibble())).unwrap(),
            "garbage"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        store.load_or_generate(&nibble()).unwrap();

        let mode = std::fs::metadata(store.path_for(&nibble())).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
