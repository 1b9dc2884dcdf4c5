//! Master key storage and at-rest sealing of private key material

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};
use thiserror::Error;
use zeroize::Zeroizing;

const KEY_FILE_NAME: &str = "master.key";

#[cfg(any(target_os = "macos", target_os = "windows"))]
const KEYRING_SERVICE: &str = "clipmesh";

/// Secret store errors
#[derive(Debug, Error)]
pub enum SecretError {
    /// Key file IO failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Key file exists but cannot be trusted
    #[error("Invalid key file: {0}")]
    InvalidKey(String),

    /// Platform credential vault failure
    #[error("Keyring error: {0}")]
    Keyring(String),

    /// Sealed blob could not be opened with the current master key
    #[error("Unseal failed: sealed data is corrupt or the master key changed")]
    Unseal,

    /// Sealing failed
    #[error("Seal failed: {0}")]
    Seal(String),
}

/// Capability that yields the 32-byte master key protecting identity material
pub trait SecretStore: Send + Sync {
    /// Return the master key, generating and persisting it on first use
    fn master_key(&self) -> Result<Zeroizing<[u8; 32]>, SecretError>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

/// Which [`SecretStore`] implementation to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecretBackend {
    /// Platform keyring on macOS/Windows, key file elsewhere
    #[default]
    Auto,
    /// Platform credential vault
    Keyring,
    /// Key file with owner-only permissions
    File,
    /// Process-local key, lost on exit
    Memory,
}

impl SecretBackend {
    /// Build the configured store. `dir` holds the key file for the file backend.
    pub fn build(self, dir: &Path, account: &str) -> Result<Box<dyn SecretStore>, SecretError> {
        match self {
            SecretBackend::Auto => {
                #[cfg(any(target_os = "macos", target_os = "windows"))]
                {
                    Ok(Box::new(KeyringSecretStore::new(account)))
                }
                #[cfg(not(any(target_os = "macos", target_os = "windows")))]
                {
                    let _ = account;
                    Ok(Box::new(FileSecretStore::new(dir.join(KEY_FILE_NAME))))
                }
            }
            SecretBackend::Keyring => {
                #[cfg(any(target_os = "macos", target_os = "windows"))]
                {
                    Ok(Box::new(KeyringSecretStore::new(account)))
                }
                #[cfg(not(any(target_os = "macos", target_os = "windows")))]
                {
                    let _ = account;
                    Err(SecretError::Keyring(
                        "no platform keyring on this operating system".to_string(),
                    ))
                }
            }
            SecretBackend::File => Ok(Box::new(FileSecretStore::new(dir.join(KEY_FILE_NAME)))),
            SecretBackend::Memory => Ok(Box::new(MemorySecretStore::new())),
        }
    }
}

/// Master key kept in a file readable only by the owner
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    /// Store the key at `path`
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn load_from_file(path: &Path) -> Result<[u8; 32], SecretError> {
        // Check file permissions on Unix systems
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(path)?;
            let mode = metadata.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(SecretError::InvalidKey(format!(
                    "insecure permissions {:o}",
                    mode
                )));
            }
        }

        let data = Zeroizing::new(fs::read(path)?);
        if data.len() != 32 {
            return Err(SecretError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                data.len()
            )));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&data);
        Ok(key)
    }

    fn save_to_file(path: &Path, key: &[u8; 32]) -> Result<(), SecretError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = fs::metadata(parent)?.permissions();
                perms.set_mode(0o700);
                fs::set_permissions(parent, perms)?;
            }
        }

        fs::write(path, key)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        tracing::info!("Master key saved to {:?}", path);
        Ok(())
    }
}

impl SecretStore for FileSecretStore {
    fn master_key(&self) -> Result<Zeroizing<[u8; 32]>, SecretError> {
        if self.path.exists() {
            // An unreadable key file is never silently replaced
            return Self::load_from_file(&self.path).map(Zeroizing::new);
        }

        let key = Zeroizing::new(rand::random::<[u8; 32]>());
        Self::save_to_file(&self.path, &key)?;
        Ok(key)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Master key held only in process memory
#[derive(Debug, Default)]
pub struct MemorySecretStore {
    key: Mutex<Option<[u8; 32]>>,
}

impl MemorySecretStore {
    /// Create an empty store; the key is generated on first request
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with a known key
    pub fn with_key(key: [u8; 32]) -> Self {
        Self {
            key: Mutex::new(Some(key)),
        }
    }
}

impl SecretStore for MemorySecretStore {
    fn master_key(&self) -> Result<Zeroizing<[u8; 32]>, SecretError> {
        let mut guard = self
            .key
            .lock()
            .map_err(|_| SecretError::InvalidKey("memory store poisoned".to_string()))?;
        let key = *guard.get_or_insert_with(rand::random::<[u8; 32]>);
        Ok(Zeroizing::new(key))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Master key kept in the platform credential vault
#[cfg(any(target_os = "macos", target_os = "windows"))]
#[derive(Debug, Clone)]
pub struct KeyringSecretStore {
    account: String,
}

#[cfg(any(target_os = "macos", target_os = "windows"))]
impl KeyringSecretStore {
    /// Use the vault entry for `account`
    pub fn new(account: &str) -> Self {
        Self {
            account: account.to_string(),
        }
    }
}

#[cfg(any(target_os = "macos", target_os = "windows"))]
impl SecretStore for KeyringSecretStore {
    fn master_key(&self) -> Result<Zeroizing<[u8; 32]>, SecretError> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, &self.account)
            .map_err(|e| SecretError::Keyring(e.to_string()))?;

        match entry.get_password() {
            Ok(encoded) => {
                let bytes = Zeroizing::new(
                    hex::decode(encoded.trim())
                        .map_err(|e| SecretError::InvalidKey(e.to_string()))?,
                );
                if bytes.len() != 32 {
                    return Err(SecretError::InvalidKey(format!(
                        "expected 32 bytes, got {}",
                        bytes.len()
                    )));
                }
                let mut key = Zeroizing::new([0u8; 32]);
                key.copy_from_slice(&bytes);
                Ok(key)
            }
            Err(keyring::Error::NoEntry) => {
                let key = Zeroizing::new(rand::random::<[u8; 32]>());
                let encoded = Zeroizing::new(hex::encode(key.as_ref()));
                entry
                    .set_password(&encoded)
                    .map_err(|e| SecretError::Keyring(e.to_string()))?;
                tracing::info!("Master key stored in platform keyring");
                Ok(key)
            }
            Err(e) => Err(SecretError::Keyring(e.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        "keyring"
    }
}

/// AES-256-GCM ciphertext plus nonce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlob {
    /// The encrypted payload
    pub ciphertext: Vec<u8>,
    /// The nonce used for encryption
    pub nonce: Vec<u8>,
}

/// Seals and opens private material under the master key
pub struct Sealer {
    cipher: Aes256Gcm,
}

impl std::fmt::Debug for Sealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sealer").finish_non_exhaustive()
    }
}

impl Sealer {
    /// Build a sealer from the store's master key
    pub fn from_store(store: &dyn SecretStore) -> Result<Self, SecretError> {
        let key = store.master_key()?;
        Self::new(&key)
    }

    /// Build a sealer from raw key bytes
    pub fn new(key: &[u8; 32]) -> Result<Self, SecretError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| SecretError::Seal(e.to_string()))?;
        Ok(Self { cipher })
    }

    /// Encrypt `plaintext` under a fresh nonce
    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedBlob, SecretError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| SecretError::Seal(e.to_string()))?;

        Ok(SealedBlob {
            ciphertext,
            nonce: nonce.to_vec(),
        })
    }

    /// Decrypt a blob sealed with the same master key
    pub fn open(&self, sealed: &SealedBlob) -> Result<Zeroizing<Vec<u8>>, SecretError> {
        if sealed.nonce.len() != 12 {
            return Err(SecretError::Unseal);
        }
        let nonce = Nonce::from_slice(&sealed.nonce);
        self.cipher
            .decrypt(nonce, sealed.ciphertext.as_ref())
            .map(Zeroizing::new)
            .map_err(|_| SecretError::Unseal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_seal_open_roundtrip() {
        let sealer = Sealer::from_store(&MemorySecretStore::new()).unwrap();
        let sealed = sealer.seal(b"identity secret").unwrap();

        assert_ne!(sealed.ciphertext, b"identity secret".to_vec());
        assert_eq!(&sealer.open(&sealed).unwrap()[..], b"identity secret");
    }

    #[test]
    fn test_open_with_other_key_fails() {
        let a = Sealer::new(&[1u8; 32]).unwrap();
        let b = Sealer::new(&[2u8; 32]).unwrap();
        let sealed = a.seal(b"payload").unwrap();

        assert!(matches!(b.open(&sealed), Err(SecretError::Unseal)));
    }

    #[test]
    fn test_memory_store_is_stable() {
        let store = MemorySecretStore::new();
        assert_eq!(*store.master_key().unwrap(), *store.master_key().unwrap());
    }

    #[test]
    fn test_file_store_persists_key() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keys").join(KEY_FILE_NAME);

        let first = *FileSecretStore::new(path.clone()).master_key().unwrap();
        let second = *FileSecretStore::new(path.clone()).master_key().unwrap();
        assert_eq!(first, second);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_file_store_rejects_open_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(KEY_FILE_NAME);
        fs::write(&path, [7u8; 32]).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        let result = FileSecretStore::new(path).master_key();
        assert!(matches!(result, Err(SecretError::InvalidKey(_))));
    }
}
