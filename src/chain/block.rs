//! Blocks and proof of work
//!
//! A block hash covers index, timestamp, the concatenated transaction
//! ids, the parent hash, and the nonce. Mining is a sequential nonce
//! search that polls the shutdown token every iteration.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::tx::{unix_now, Transaction};
use crate::shutdown::Shutdown;

/// Parent-hash sentinel of the genesis block.
pub const GENESIS_PREV_HASH: &str = "0";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Height, 0 for genesis
    pub index: u64,
    /// Seconds since epoch at creation
    pub timestamp: i64,
    /// Ordered transactions
    pub transactions: Vec<Transaction>,
    /// Hex hash of the parent block, "0" for genesis
    pub prev_hash: String,
    /// Hex hash of this block
    pub hash: String,
    /// Proof-of-work nonce
    pub nonce: u64,
}

impl Block {
    /// New unmined block; the hash is a placeholder until `mine` runs.
    pub fn new(transactions: Vec<Transaction>, prev_hash: String, index: u64) -> Self {
        let mut block = Self {
            index,
            timestamp: unix_now(),
            transactions,
            prev_hash,
            hash: String::new(),
            nonce: 0,
        };
        block.hash = block.compute_hash();
        block
    }

    pub fn genesis(coinbase: Transaction) -> Self {
        Self::new(vec![coinbase], GENESIS_PREV_HASH.to_string(), 0)
    }

    /// Hash over index || timestamp || tx ids || prev_hash || nonce.
    pub fn compute_hash(&self) -> String {
        let mut tx_data = String::new();
        for tx in &self.transactions {
            tx_data.push_str(&tx.id);
        }
        let record = format!(
            "{}{}{}{}{}",
            self.index, self.timestamp, tx_data, self.prev_hash, self.nonce
        );
        hex::encode(Sha256::digest(record.as_bytes()))
    }

    /// Whether the hash carries the required zero prefix.
    pub fn meets_difficulty(&self, difficulty: usize) -> bool {
        self.hash.len() >= difficulty && self.hash.as_bytes()[..difficulty].iter().all(|&b| b == b'0')
    }

    /// Sequential proof-of-work search. Returns `false` if the shutdown
    /// token fired before a valid nonce was found; the cancellation check
    /// runs once per nonce.
    #[must_use]
    pub fn mine(&mut self, difficulty: usize, shutdown: &Shutdown) -> bool {
        loop {
            if shutdown.is_cancelled() {
                return false;
            }
            if self.meets_difficulty(difficulty) {
                return true;
            }
            self.nonce += 1;
            self.hash = self.compute_hash();
        }
    }

    /// Deterministic binary encoding used for persistence and gossip.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
