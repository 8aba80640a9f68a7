//! Combined network behaviour
//!
//! Kademlia for capability and shard discovery, three request-response
//! protocols for the framed streams, gossipsub for block propagation,
//! identify/ping for peer bookkeeping, and UPnP port mapping plus a
//! relay service for NAT'd peers.

use libp2p::identity::Keypair;
use libp2p::request_response::{self, ProtocolSupport};
use libp2p::swarm::NetworkBehaviour;
use libp2p::{gossipsub, identify, kad, ping, relay, upnp, PeerId, StreamProtocol};
use sha2::{Digest, Sha256};
use std::time::Duration;

use super::protocol::{
    ComputeCodec, RetrieveCodec, StoreCodec, COMPUTE_PROTOCOL, RETRIEVE_PROTOCOL, STORE_PROTOCOL,
    STREAM_TIMEOUT,
};

/// Gossip topic carrying binary-encoded blocks.
pub const BLOCK_TOPIC: &str = "/blockchain/blocks/1.0.0";

/// Well-known provider key advertised by compute-capable nodes.
pub const COMPUTE_CAPABILITY: &str = "compute-node";

const KAD_PROTOCOL: StreamProtocol = StreamProtocol::new("/decentralized-net/kad/1.0.0");
const IDENTIFY_PROTOCOL: &str = "/decentralized-net/id/1.0.0";

/// Deadline on DHT announce and provider lookups.
pub const DHT_TIMEOUT: Duration = Duration::from_secs(10);

/// DHT keys are content identifiers: the SHA-256 of the logical key.
pub fn provider_key(key: &str) -> kad::RecordKey {
    let digest = Sha256::digest(key.as_bytes());
    kad::RecordKey::new(&digest.as_slice())
}

#[derive(NetworkBehaviour)]
pub struct NodeBehaviour {
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    pub store: request_response::Behaviour<StoreCodec>,
    pub retrieve: request_response::Behaviour<RetrieveCodec>,
    pub compute: request_response::Behaviour<ComputeCodec>,
    pub gossipsub: gossipsub::Behaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub upnp: upnp::tokio::Behaviour,
    pub relay: relay::Behaviour,
}

impl NodeBehaviour {
    /// Assemble the behaviour. `serve_compute` controls whether the
    /// compute protocol accepts inbound jobs; outbound is always
    /// available so lightweight clients can submit work.
    pub fn new(
        keypair: &Keypair,
        serve_compute: bool,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let local_peer_id = PeerId::from(keypair.public());

        let mut kad_config = kad::Config::default();
        kad_config.set_protocol_names(vec![KAD_PROTOCOL]);
        kad_config.set_query_timeout(DHT_TIMEOUT);
        let kad_store = kad::store::MemoryStore::new(local_peer_id);
        let mut kademlia = kad::Behaviour::with_config(local_peer_id, kad_store, kad_config);
        kademlia.set_mode(Some(kad::Mode::Server));

        let rr_config = request_response::Config::default().with_request_timeout(STREAM_TIMEOUT);
        let store = request_response::Behaviour::new(
            [(STORE_PROTOCOL, ProtocolSupport::Full)],
            rr_config.clone(),
        );
        let retrieve = request_response::Behaviour::new(
            [(RETRIEVE_PROTOCOL, ProtocolSupport::Full)],
            rr_config.clone(),
        );
        let compute_support = if serve_compute {
            ProtocolSupport::Full
        } else {
            ProtocolSupport::Outbound
        };
        let compute =
            request_response::Behaviour::new([(COMPUTE_PROTOCOL, compute_support)], rr_config);

        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .validation_mode(gossipsub::ValidationMode::Strict)
            .max_transmit_size(2 * 1024 * 1024)
            .build()?;
        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossipsub_config,
        )?;

        let identify = identify::Behaviour::new(identify::Config::new(
            IDENTIFY_PROTOCOL.to_string(),
            keypair.public(),
        ));

        let ping = ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(30)));

        let upnp = upnp::tokio::Behaviour::default();
        let relay = relay::Behaviour::new(local_peer_id, relay::Config::default());

        Ok(Self {
            kademlia,
            store,
            retrieve,
            compute,
            gossipsub,
            identify,
            ping,
            upnp,
            relay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_key_is_content_hash() {
        let key = provider_key("compute-node");
        let expected = Sha256::digest(b"compute-node");
        assert_eq!(key.to_vec(), expected.as_slice());
        assert_eq!(provider_key("compute-node"), provider_key("compute-node"));
        assert_ne!(provider_key("a"), provider_key("b"));
    }
}
