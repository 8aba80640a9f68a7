//! Download pipeline: locate shards and reconstruct the blob
//!
//! Each shard is looked up in the local vault first, then through DHT
//! providers over the Retrieve protocol. The loop stops as soon as ten
//! shards are in hand; reconstruction strips padding using the
//! caller-supplied original size.

use tracing::{debug, warn};

use super::PipelineError;
use crate::files::erasure::{self, shard_key, DATA_SHARDS, TOTAL_SHARDS};
use crate::network::Client;
use crate::storage::BlobStore;

pub async fn download_blob(
    client: &Client,
    vault: Option<&dyn BlobStore>,
    name: &str,
    original_size: usize,
) -> Result<Vec<u8>, PipelineError> {
    let mut shards: Vec<Option<Vec<u8>>> = vec![None; TOTAL_SHARDS];
    let mut present = 0usize;

    for (i, slot) in shards.iter_mut().enumerate() {
        if present >= DATA_SHARDS {
            break;
        }
        let key = shard_key(name, i);

        if let Some(vault) = vault {
            if let Ok(data) = vault.get(key.as_bytes()) {
                debug!(key = %key, "shard found in local vault");
                *slot = Some(data);
                present += 1;
                continue;
            }
        }

        let providers = match client.find_providers(&key).await {
            Ok(providers) => providers,
            Err(e) => {
                warn!(key = %key, "provider lookup failed: {e}");
                continue;
            }
        };
        if providers.is_empty() {
            debug!(key = %key, "no providers");
            continue;
        }

        for peer in providers {
            if peer == client.local_peer_id() {
                continue;
            }
            match client.retrieve(peer, key.clone().into_bytes()).await {
                Ok(data) => {
                    debug!(key = %key, %peer, "shard fetched");
                    *slot = Some(data);
                    present += 1;
                    break;
                }
                Err(e) => debug!(key = %key, %peer, "shard fetch failed: {e}"),
            }
        }
    }

    Ok(erasure::reconstruct(&mut shards, original_size)?)
}
