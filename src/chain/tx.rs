//! Transactions
//!
//! A transaction's id is the hex SHA-256 of its semantic fields; the
//! signature is ECDSA over the id, accompanied by the sender's public
//! key so verifiers can bind it to the `from` address. Coinbase
//! transactions use the `SYSTEM` sentinel sender and skip verification.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::wallet::{self, Wallet};

/// Sentinel sender for minting transactions.
pub const COINBASE_SENDER: &str = "SYSTEM";
/// Fixed id of the genesis premine transaction.
pub const GENESIS_COINBASE_ID: &str = "GENESIS_COINBASE";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Sender address
    pub from: String,
    /// Recipient address
    pub to: String,
    /// Value transferred
    pub amount: u64,
    /// Seconds since epoch at creation
    pub timestamp: i64,
    /// Hex SHA-256 of from || to || amount || timestamp
    pub id: String,
    /// Hex SEC1 public key of the sender (empty for coinbase)
    #[serde(default)]
    pub pubkey: String,
    /// "R|S" hex ECDSA signature over the id (empty for coinbase)
    #[serde(default)]
    pub signature: String,
}

impl Transaction {
    /// Build and sign a transfer from `wallet` to `to`.
    pub fn new_signed(wallet: &Wallet, to: &str, amount: u64) -> Self {
        let mut tx = Self {
            from: wallet.address(),
            to: to.to_string(),
            amount,
            timestamp: unix_now(),
            id: String::new(),
            pubkey: wallet.public_key_hex(),
            signature: String::new(),
        };
        tx.id = tx.compute_id();
        tx.signature = wallet.sign(tx.id.as_bytes());
        tx
    }

    /// Build a minting transaction from the `SYSTEM` sentinel.
    pub fn coinbase(to: &str, amount: u64, timestamp: i64, id: impl Into<String>) -> Self {
        Self {
            from: COINBASE_SENDER.to_string(),
            to: to.to_string(),
            amount,
            timestamp,
            id: id.into(),
            pubkey: String::new(),
            signature: String::new(),
        }
    }

    /// Recompute the id from the semantic fields.
    pub fn compute_id(&self) -> String {
        let record = format!("{}{}{}{}", self.from, self.to, self.amount, self.timestamp);
        hex::encode(Sha256::digest(record.as_bytes()))
    }

    pub fn is_coinbase(&self) -> bool {
        self.from == COINBASE_SENDER
    }

    /// Full verification: id integrity, public key bound to the sender
    /// address, and a valid ECDSA signature over the id.
    pub fn verify(&self) -> bool {
        if self.is_coinbase() {
            return true;
        }
        if self.signature.is_empty() || self.pubkey.is_empty() {
            return false;
        }
        if self.id != self.compute_id() {
            return false;
        }
        match wallet::address_of_hex(&self.pubkey) {
            Some(address) if address == self.from => {}
            _ => return false,
        }
        wallet::verify(&self.pubkey, self.id.as_bytes(), &self.signature)
    }
}

pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub fn unix_now_nanos() -> i128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i128)
        .unwrap_or(0)
}
