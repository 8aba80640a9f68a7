//! End-to-end pipelines
//!
//! The storage pipeline distributes and reassembles erasure-coded
//! shards; the compute pipeline gates jobs on chain payments and routes
//! them to providers. Both are plain library flows shared by the CLI and
//! the HTTP gateway.

pub mod compute;
pub mod download;
pub mod upload;

use thiserror::Error;

use crate::files::ErasureError;
use crate::network::NodeError;
use crate::storage::VaultError;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Erasure(#[from] ErasureError),
    #[error(transparent)]
    Vault(#[from] VaultError),
    #[error(transparent)]
    Net(#[from] NodeError),
    #[error("no destinations available for shards")]
    NoDestinations,
    #[error("no compute providers found")]
    NoComputeProviders,
}

pub use compute::{execute_job, run_job, verify_payment};
pub use download::download_blob;
pub use upload::{upload_blob, UploadReport};
