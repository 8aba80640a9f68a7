//! Storage module for local shard persistence
//!
//! An encrypted-at-rest sled vault behind the `BlobStore` capability.

pub mod vault;

pub use vault::{BlobStore, Vault, VaultError};
