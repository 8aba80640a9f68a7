//! Wallet keypairs and transaction signatures
//!
//! ECDSA over P-256. An address is the hex SHA-256 of the public key's
//! fixed-width X || Y coordinates; signatures travel as "R|S" hex with
//! 32-byte scalars. Private keys are SEC1 "EC PRIVATE KEY" PEM files
//! with owner-only permissions.

use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::LineEnding;
use p256::SecretKey;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("wallet file io error: {0}")]
    Io(#[from] io::Error),
    #[error("wallet key error: {0}")]
    Key(String),
}

pub struct Wallet {
    secret: SecretKey,
    signing: SigningKey,
}

impl Wallet {
    /// Generate a fresh P-256 keypair.
    pub fn generate() -> Self {
        let secret = SecretKey::random(&mut OsRng);
        let signing = SigningKey::from(&secret);
        Self { secret, signing }
    }

    /// Load a wallet from a SEC1 PEM file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, WalletError> {
        let pem = fs::read_to_string(path)?;
        let secret =
            SecretKey::from_sec1_pem(&pem).map_err(|e| WalletError::Key(e.to_string()))?;
        let signing = SigningKey::from(&secret);
        Ok(Self { secret, signing })
    }

    /// Persist the private key as SEC1 PEM, mode 0600.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), WalletError> {
        let path = path.as_ref();
        let pem = self
            .secret
            .to_sec1_pem(LineEnding::LF)
            .map_err(|e| WalletError::Key(e.to_string()))?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, pem.as_bytes())?;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    /// Load the wallet at `path`, creating and persisting one if absent.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, WalletError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load(path)
        } else {
            let wallet = Self::generate();
            wallet.save(path)?;
            Ok(wallet)
        }
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        *self.signing.verifying_key()
    }

    /// Public address: hex SHA-256 of X || Y.
    pub fn address(&self) -> String {
        address_of(&self.verifying_key())
    }

    /// Hex-encoded SEC1 uncompressed public key, carried on signed
    /// transactions so verifiers can bind the signature to the address.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key().to_encoded_point(false).as_bytes())
    }

    /// Sign a message (typically a transaction id), returning "R|S" hex.
    pub fn sign(&self, message: &[u8]) -> String {
        let signature: Signature = self.signing.sign(message);
        let (r, s) = signature.split_bytes();
        format!("{}|{}", hex::encode(r), hex::encode(s))
    }
}

/// Derive the address of a verifying key.
pub fn address_of(key: &VerifyingKey) -> String {
    let point = key.to_encoded_point(false);
    let mut hasher = Sha256::new();
    hasher.update(point.x().map(|x| x.as_slice()).unwrap_or_default());
    hasher.update(point.y().map(|y| y.as_slice()).unwrap_or_default());
    hex::encode(hasher.finalize())
}

/// Derive the address of a hex SEC1 public key; `None` if it does not
/// parse as a P-256 point.
pub fn address_of_hex(pubkey_hex: &str) -> Option<String> {
    let bytes = hex::decode(pubkey_hex).ok()?;
    let key = VerifyingKey::from_sec1_bytes(&bytes).ok()?;
    Some(address_of(&key))
}

/// Verify an "R|S" hex signature over `message` with a hex SEC1 public key.
pub fn verify(pubkey_hex: &str, message: &[u8], signature: &str) -> bool {
    let Ok(key_bytes) = hex::decode(pubkey_hex) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_sec1_bytes(&key_bytes) else {
        return false;
    };

    let Some((r_hex, s_hex)) = signature.split_once('|') else {
        return false;
    };
    let (Ok(r), Ok(s)) = (hex::decode(r_hex), hex::decode(s_hex)) else {
        return false;
    };
    let (Ok(r), Ok(s)) = (<[u8; 32]>::try_from(r), <[u8; 32]>::try_from(s)) else {
        return false;
    };
    let Ok(sig) = Signature::from_scalars(r, s) else {
        return false;
    };

    key.verify(message, &sig).is_ok()
}

/// Wallet file path for a node bound to `port` (0 = the default wallet).
pub fn wallet_path(data_dir: impl AsRef<Path>, port: u16) -> PathBuf {
    let name = if port == 0 {
        "wallet_default.dat".to_string()
    } else {
        format!("wallet_{port}.dat")
    };
    data_dir.as_ref().join(name)
}
