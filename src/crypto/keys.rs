//! Vault key management
//!
//! The vault's 32-byte symmetric key lives in a sidecar file next to the
//! vault directory. If the file exists it is loaded and its length
//! verified; otherwise a fresh key is generated with the OS RNG and
//! written with owner-only permissions. A key of any other length is
//! fatal at init.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use thiserror::Error;

/// Required key length for AES-256.
pub const VAULT_KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum KeyError {
    #[error("key file io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid key length in {path}: expected {VAULT_KEY_LEN} bytes, got {len}")]
    InvalidLength { path: String, len: usize },
}

/// Load the key at `path`, or generate and persist a new one.
pub fn load_or_generate(path: impl AsRef<Path>) -> Result<[u8; VAULT_KEY_LEN], KeyError> {
    let path = path.as_ref();

    if path.exists() {
        let data = fs::read(path)?;
        let len = data.len();
        let key: [u8; VAULT_KEY_LEN] =
            data.try_into().map_err(|_| KeyError::InvalidLength {
                path: path.display().to_string(),
                len,
            })?;
        return Ok(key);
    }

    let mut key = [0u8; VAULT_KEY_LEN];
    OsRng.fill_bytes(&mut key);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(path, key)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_then_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.key");

        let generated = load_or_generate(&path).unwrap();
        let reloaded = load_or_generate(&path).unwrap();

        assert_eq!(generated, reloaded);
    }

    #[test]
    fn test_owner_only_permissions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.key");

        load_or_generate(&path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_wrong_length_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vault.key");
        fs::write(&path, [0u8; 16]).unwrap();

        let err = load_or_generate(&path).unwrap_err();
        assert!(matches!(err, KeyError::InvalidLength { len: 16, .. }));
    }
}
