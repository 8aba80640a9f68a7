//! peergrid - a peer-to-peer grid of homogeneous nodes
//!
//! Every node can offer any subset of three services:
//! - Erasure-coded, encrypted-at-rest storage of opaque blobs, located
//!   through a Kademlia DHT and moved over framed streams
//! - Sandboxed WebAssembly execution, paid for with the grid's internal
//!   currency and gated on the chain's transaction index
//! - A minimal proof-of-work blockchain that mints, transfers, and
//!   looks up those payments, propagated over gossip

pub mod api;
pub mod chain;
pub mod crypto;
pub mod files;
pub mod network;
pub mod pipeline;
pub mod shutdown;
pub mod storage;
pub mod vm;

pub use chain::{Block, Blockchain, ChainError, Transaction};
pub use crypto::{Wallet, WalletError};
pub use files::{ErasureError, DATA_SHARDS, TOTAL_SHARDS};
pub use network::{Client, NodeConfig, NodeError, NodeEvent, NodeServices};
pub use pipeline::{download_blob, run_job, upload_blob, PipelineError, UploadReport};
pub use shutdown::Shutdown;
pub use storage::{BlobStore, Vault, VaultError};
pub use vm::{JobRunner, Sandbox, VmError};
