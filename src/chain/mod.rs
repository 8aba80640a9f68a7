//! Blockchain module
//!
//! Transactions, blocks, proof-of-work mining, persistence, balance
//! replay, and the transaction index used for payment verification.

pub mod block;
pub mod store;
pub mod tx;

pub use block::{Block, GENESIS_PREV_HASH};
pub use store::{
    Blockchain, ChainError, BLOCK_REWARD, DEFAULT_DIFFICULTY, GENESIS_PREMINE,
};
pub use tx::{Transaction, COINBASE_SENDER, GENESIS_COINBASE_ID};
