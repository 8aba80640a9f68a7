//! Blob processing module
//!
//! Erasure coding for distributing blobs across peers.

pub mod erasure;

pub use erasure::{encode, reconstruct, shard_key, ErasureError, DATA_SHARDS, TOTAL_SHARDS};
