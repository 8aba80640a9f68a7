//! P2P networking layer
//!
//! Uses libp2p for peer-to-peer communication with:
//! - Kademlia DHT for capability discovery and shard location
//! - Length-prefixed framed streams for Store, Retrieve, and Compute
//! - Gossipsub for block propagation
//! - Noise for encryption, Yamux for multiplexing, TCP + QUIC transports

pub mod behaviour;
pub mod client;
pub mod node;
pub mod protocol;

pub use behaviour::{provider_key, BLOCK_TOPIC, COMPUTE_CAPABILITY, DHT_TIMEOUT};
pub use client::Client;
pub use node::{
    build_node, split_peer_addr, EventLoop, NodeConfig, NodeError, NodeEvent, NodeServices,
};
pub use protocol::{
    ComputeRequest, ComputeResponse, RetrieveRequest, RetrieveResponse, StoreRequest,
    StoreResponse, FREE_PASS_TX_ID, MIN_COMPUTE_FEE, STREAM_TIMEOUT,
};
