//! Reed-Solomon erasure coding for fault tolerance
//!
//! Blobs are split into 10 data shards plus 4 parity shards; any 10 of
//! the 14 reconstruct the original. The caller records the original
//! length and supplies it at reconstruction time to strip padding.

use reed_solomon_erasure::galois_8::ReedSolomon;
use thiserror::Error;

/// Number of data shards (k)
pub const DATA_SHARDS: usize = 10;
/// Number of parity shards (m)
pub const PARITY_SHARDS: usize = 4;
/// Total shards per blob (k + m)
pub const TOTAL_SHARDS: usize = DATA_SHARDS + PARITY_SHARDS;

#[derive(Error, Debug)]
pub enum ErasureError {
    #[error("not enough shards to reconstruct (have {have}, need {need})")]
    InsufficientShards { have: usize, need: usize },
    #[error("shards failed verification after repair")]
    CorruptShards,
    #[error("codec error: {0}")]
    Codec(String),
}

/// DHT / vault key for shard `index` of blob `name`.
pub fn shard_key(name: &str, index: usize) -> String {
    format!("{name}-shard-{index}")
}

fn codec() -> Result<ReedSolomon, ErasureError> {
    ReedSolomon::new(DATA_SHARDS, PARITY_SHARDS).map_err(|e| ErasureError::Codec(e.to_string()))
}

/// Encode data into 14 equal-length shards.
///
/// The last data shard is zero-padded; `reconstruct` truncates back to
/// the original length.
pub fn encode(data: &[u8]) -> Result<Vec<Vec<u8>>, ErasureError> {
    let shard_len = std::cmp::max(1, (data.len() + DATA_SHARDS - 1) / DATA_SHARDS);
    let mut shards = vec![vec![0u8; shard_len]; TOTAL_SHARDS];
    for (i, chunk) in data.chunks(shard_len).enumerate() {
        shards[i][..chunk.len()].copy_from_slice(chunk);
    }

    codec()?
        .encode(&mut shards)
        .map_err(|e| ErasureError::Codec(e.to_string()))?;

    Ok(shards)
}

/// Rebuild the original blob from at least 10 of the 14 shards.
///
/// Missing shards must be `None`. Shards are verified, repaired in place
/// if necessary, and re-verified; a set that still fails verification
/// after repair is rejected as corrupt.
pub fn reconstruct(
    shards: &mut Vec<Option<Vec<u8>>>,
    original_size: usize,
) -> Result<Vec<u8>, ErasureError> {
    if shards.len() != TOTAL_SHARDS {
        return Err(ErasureError::Codec(format!(
            "expected {TOTAL_SHARDS} shard slots, got {}",
            shards.len()
        )));
    }

    let have = shards.iter().filter(|s| s.is_some()).count();
    if have < DATA_SHARDS {
        return Err(ErasureError::InsufficientShards {
            have,
            need: DATA_SHARDS,
        });
    }

    let rs = codec()?;

    let verified = have == TOTAL_SHARDS && {
        let refs: Vec<&[u8]> = shards.iter().flat_map(|s| s.as_deref()).collect();
        rs.verify(&refs).unwrap_or(false)
    };

    if !verified {
        rs.reconstruct(shards).map_err(|e| match e {
            reed_solomon_erasure::Error::TooFewShardsPresent => ErasureError::InsufficientShards {
                have,
                need: DATA_SHARDS,
            },
            other => ErasureError::Codec(other.to_string()),
        })?;

        let refs: Vec<&[u8]> = shards.iter().flat_map(|s| s.as_deref()).collect();
        if !rs.verify(&refs).unwrap_or(false) {
            return Err(ErasureError::CorruptShards);
        }
    }

    let mut out = Vec::with_capacity(original_size);
    for shard in shards.iter().take(DATA_SHARDS) {
        match shard {
            Some(bytes) => out.extend_from_slice(bytes),
            None => return Err(ErasureError::CorruptShards),
        }
    }
    out.truncate(original_size);

    Ok(out)
}
