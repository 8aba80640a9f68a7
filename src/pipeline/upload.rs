//! Upload pipeline: shard a blob and spread it across the grid
//!
//! Destinations are the local vault (when one is attached) plus the
//! currently connected peers in a deterministic order; shard `i` goes to
//! destination `i % n`. Individual shard failures are logged and
//! absorbed by the (10,4) redundancy; the upload itself always runs to
//! completion.

use libp2p::PeerId;
use tracing::{debug, warn};

use super::PipelineError;
use crate::files::erasure::{self, shard_key};
use crate::network::Client;
use crate::storage::BlobStore;

#[derive(Debug, Clone, Copy)]
pub struct UploadReport {
    pub total_shards: usize,
    pub stored_shards: usize,
    pub original_size: usize,
}

enum Destination {
    Local,
    Peer(PeerId),
}

pub async fn upload_blob(
    client: &Client,
    vault: Option<&dyn BlobStore>,
    name: &str,
    data: &[u8],
) -> Result<UploadReport, PipelineError> {
    let shards = erasure::encode(data)?;

    let mut peers = client.connected_peers().await?;
    peers.sort_unstable();

    let mut destinations = Vec::with_capacity(peers.len() + 1);
    if vault.is_some() {
        destinations.push(Destination::Local);
    }
    destinations.extend(peers.into_iter().map(Destination::Peer));
    if destinations.is_empty() {
        return Err(PipelineError::NoDestinations);
    }

    let mut stored = 0usize;
    for (i, shard) in shards.iter().enumerate() {
        let key = shard_key(name, i);
        match &destinations[i % destinations.len()] {
            Destination::Local => {
                let Some(vault) = vault else { continue };
                match vault.store(key.as_bytes(), shard) {
                    Ok(()) => {
                        stored += 1;
                        debug!(key = %key, "shard stored locally");
                        let announce_client = client.clone();
                        let announce_key = key.clone();
                        tokio::spawn(async move {
                            if let Err(e) = announce_client.announce(&announce_key).await {
                                warn!(key = %announce_key, "announce failed: {e}");
                            }
                        });
                    }
                    Err(e) => warn!(key = %key, "local shard store failed: {e}"),
                }
            }
            Destination::Peer(peer) => {
                match client
                    .store(*peer, key.clone().into_bytes(), shard.clone())
                    .await
                {
                    Ok(()) => {
                        stored += 1;
                        debug!(key = %key, %peer, "shard stored remotely");
                    }
                    Err(e) => warn!(key = %key, %peer, "shard store failed: {e}"),
                }
            }
        }
    }

    Ok(UploadReport {
        total_shards: shards.len(),
        stored_shards: stored,
        original_size: data.len(),
    })
}
