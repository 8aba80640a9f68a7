//! Cryptography module
//!
//! Wallet keypairs and signatures, vault key management, and at-rest
//! sealing of stored blobs.

pub mod encryption;
pub mod keys;
pub mod wallet;

pub use encryption::{open, seal, EncryptionError};
pub use keys::{load_or_generate, KeyError, VAULT_KEY_LEN};
pub use wallet::{Wallet, WalletError};
