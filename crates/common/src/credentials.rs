//! Web UI passphrase and API key storage
//!
//! Both secrets live in the Flint config file. New passphrase hashes are
//! always bcrypt; 64-character hex SHA-256 hashes from older installs still
//! verify until the passphrase is next set.

use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use tracing::{debug, info};

use crate::{Error, FlintConfig, Result};

/// bcrypt work factor for new passphrase hashes
pub const BCRYPT_COST: u32 = 12;

/// Minimum passphrase length accepted by `set_passphrase`
pub const MIN_PASSPHRASE_LEN: usize = 8;

/// Random bytes in a generated API key (hex encoded to 64 chars)
const API_KEY_BYTES: usize = 32;

#[derive(Clone, Default)]
struct Credentials {
    passphrase_hash: String,
    api_key: String,
}

/// Credential store backed by the config file at `path`
pub struct CredentialStore {
    path: PathBuf,
    inner: RwLock<Credentials>,
}

impl CredentialStore {
    /// Build a store from an already loaded config
    pub fn from_config(path: impl Into<PathBuf>, config: &FlintConfig) -> Self {
        Self {
            path: path.into(),
            inner: RwLock::new(Credentials {
                passphrase_hash: config.security.passphrase_hash.clone(),
                api_key: config.api_key.clone(),
            }),
        }
    }

    /// Load credentials from the config file at `path`
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = FlintConfig::load_file(&path)?;
        Ok(Self::from_config(path, &config))
    }

    /// Config file the credentials are persisted to
    pub fn config_path(&self) -> &Path {
        &self.path
    }

    /// Current API key (empty if none has been generated yet)
    pub fn api_key(&self) -> String {
        self.inner.read().api_key.clone()
    }

    pub fn has_passphrase(&self) -> bool {
        !self.inner.read().passphrase_hash.is_empty()
    }

    /// Return the API key, generating and persisting one on first use.
    pub fn ensure_api_key(&self) -> Result<String> {
        {
            let inner = self.inner.read();
            if !inner.api_key.is_empty() {
                return Ok(inner.api_key.clone());
            }
        }

        let key = generate_api_key()?;
        let mut updated = self.inner.read().clone();
        updated.api_key = key.clone();
        self.persist(&updated)?;
        *self.inner.write() = updated;
        info!("Generated new API key");
        Ok(key)
    }

    /// Check a candidate passphrase against the stored hash.
    pub fn verify_passphrase(&self, candidate: &str) -> bool {
        let stored = self.inner.read().passphrase_hash.clone();
        verify_hash(&stored, candidate)
    }

    /// Hash and persist a new passphrase, replacing any legacy hash.
    pub fn set_passphrase(&self, candidate: &str) -> Result<()> {
        let hash = hash_passphrase(candidate)?;
        let mut updated = self.inner.read().clone();
        updated.passphrase_hash = hash;
        self.persist(&updated)?;
        *self.inner.write() = updated;
        info!("Web UI passphrase updated");
        Ok(())
    }

    /// Constant-time comparison of a presented key against the stored one.
    pub fn compare_api_key(&self, presented: &str) -> bool {
        let inner = self.inner.read();
        if inner.api_key.is_empty() {
            return false;
        }
        constant_time_eq(presented, &inner.api_key)
    }

    /// Write `updated` to disk. Callers swap it into memory only after this
    /// succeeds.
    fn persist(&self, updated: &Credentials) -> Result<()> {
        // Re-read so unrelated settings in the file survive
        let mut config = FlintConfig::load_file(&self.path)?;
        config.api_key = updated.api_key.clone();
        config.security.passphrase_hash = updated.passphrase_hash.clone();
        config.save(&self.path)
    }
}

/// Generate a 64 hex char API key from the OS CSPRNG.
pub fn generate_api_key() -> Result<String> {
    random_hex(API_KEY_BYTES)
}

/// Hex encode `len` bytes from the OS CSPRNG. There is no fallback source.
pub fn random_hex(len: usize) -> Result<String> {
    let mut bytes = vec![0u8; len];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| Error::Randomness(e.to_string()))?;
    Ok(hex::encode(bytes))
}

/// bcrypt a passphrase at `BCRYPT_COST`.
pub fn hash_passphrase(passphrase: &str) -> Result<String> {
    if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(Error::WeakPassphrase {
            min: MIN_PASSPHRASE_LEN,
        });
    }
    let hash = bcrypt::hash(passphrase, BCRYPT_COST)?;
    debug!(hash_length = hash.len(), "Passphrase hashed");
    Ok(hash)
}

/// Verify `candidate` against a stored bcrypt or legacy SHA-256 hash.
pub fn verify_hash(stored: &str, candidate: &str) -> bool {
    if candidate.is_empty() || stored.is_empty() {
        return false;
    }

    if is_legacy_hash(stored) {
        let digest = hex::encode(Sha256::digest(candidate.as_bytes()));
        return digest == stored;
    }

    bcrypt::verify(candidate, stored).unwrap_or(false)
}

fn is_legacy_hash(stored: &str) -> bool {
    stored.len() == 64 && stored.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Constant-time string equality
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}
