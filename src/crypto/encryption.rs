//! Authenticated at-rest encryption using AES-256-GCM
//!
//! Output format: nonce (12 bytes) || ciphertext || tag (16 bytes).
//! Nonces are random; a per-node vault stays far below the GCM
//! random-nonce message bound.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use thiserror::Error;

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed - data may be corrupted or key incorrect")]
    DecryptionFailed,
    #[error("invalid ciphertext format")]
    InvalidFormat,
}

/// Seal data under a 32-byte key.
pub fn seal(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| EncryptionError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    result.extend_from_slice(&nonce);
    result.extend_from_slice(&ciphertext);

    Ok(result)
}

/// Open data sealed with `seal`.
pub fn open(key: &[u8; 32], sealed: &[u8]) -> Result<Vec<u8>, EncryptionError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(EncryptionError::InvalidFormat);
    }

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));

    let nonce = Nonce::from_slice(&sealed[..NONCE_LEN]);
    let ciphertext = &sealed[NONCE_LEN..];

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| EncryptionError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [9u8; 32];
        let plaintext = b"Hello, World!";

        let sealed = seal(&key, plaintext).unwrap();
        let opened = open(&key, &sealed).unwrap();

        assert_eq!(plaintext.as_slice(), opened.as_slice());
    }

    #[test]
    fn test_ciphertext_hides_plaintext() {
        let key = [1u8; 32];
        let plaintext = b"a perfectly ordinary secret blob";

        let sealed = seal(&key, plaintext).unwrap();
        assert!(!sealed
            .windows(plaintext.len())
            .any(|w| w == plaintext.as_slice()));
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal(&[2u8; 32], b"secret").unwrap();
        let result = open(&[3u8; 32], &sealed);
        assert!(matches!(result, Err(EncryptionError::DecryptionFailed)));
    }

    #[test]
    fn test_truncated_input_rejected() {
        let result = open(&[0u8; 32], &[0u8; 10]);
        assert!(matches!(result, Err(EncryptionError::InvalidFormat)));
    }
}
