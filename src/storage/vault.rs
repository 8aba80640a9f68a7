//! Local vault using the sled embedded database
//!
//! Values are sealed with AES-256-GCM before they touch disk; the key
//! comes from the sidecar keyfile (see `crypto::keys`). The vault holds
//! an exclusive lock on its directory for the lifetime of the process.

use sled::Db;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::encryption::{self, EncryptionError};
use crate::crypto::keys::VAULT_KEY_LEN;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("encryption error: {0}")]
    Encryption(#[from] EncryptionError),
}

/// The storage capability the stream handlers depend on.
pub trait BlobStore: Send + Sync {
    fn store(&self, key: &[u8], data: &[u8]) -> Result<(), VaultError>;
    fn get(&self, key: &[u8]) -> Result<Vec<u8>, VaultError>;
    fn has(&self, key: &[u8]) -> Result<bool, VaultError>;
}

pub struct Vault {
    db: Db,
    key: Zeroizing<[u8; VAULT_KEY_LEN]>,
}

impl Vault {
    /// Open (or create) the vault at `path`.
    ///
    /// Fails if another process holds the sled lock on the directory.
    pub fn open(path: impl AsRef<Path>, key: [u8; VAULT_KEY_LEN]) -> Result<Self, VaultError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            key: Zeroizing::new(key),
        })
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), VaultError> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of blobs held locally.
    pub fn len(&self) -> usize {
        self.db.len()
    }

    pub fn is_empty(&self) -> bool {
        self.db.is_empty()
    }
}

impl BlobStore for Vault {
    fn store(&self, key: &[u8], data: &[u8]) -> Result<(), VaultError> {
        let sealed = encryption::seal(&self.key, data)?;
        self.db.insert(key, sealed)?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Vec<u8>, VaultError> {
        let sealed = self
            .db
            .get(key)?
            .ok_or_else(|| VaultError::NotFound(String::from_utf8_lossy(key).into_owned()))?;
        Ok(encryption::open(&self.key, &sealed)?)
    }

    fn has(&self, key: &[u8]) -> Result<bool, VaultError> {
        Ok(self.db.contains_key(key)?)
    }
}
