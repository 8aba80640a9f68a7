//! Client handle for the network event loop
//!
//! A cloneable handle that turns swarm operations into awaitable calls.
//! Commands cross an mpsc channel into the event loop; replies come back
//! on oneshot channels. DHT operations carry their own 10-second
//! deadline; stream requests are bounded by the protocol timeout.

use libp2p::{Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use super::behaviour::DHT_TIMEOUT;
use super::node::NodeError;
use crate::chain::Block;

#[derive(Debug)]
pub enum Command {
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    Announce {
        key: String,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    FindProviders {
        key: String,
        reply: oneshot::Sender<Result<Vec<PeerId>, NodeError>>,
    },
    Store {
        peer: PeerId,
        key: Vec<u8>,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    Retrieve {
        peer: PeerId,
        key: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, NodeError>>,
    },
    Compute {
        peer: PeerId,
        tx_id: String,
        wasm: Vec<u8>,
        input: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<u8>, NodeError>>,
    },
    PublishBlock {
        block: Box<Block>,
        reply: oneshot::Sender<Result<(), NodeError>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
}

#[derive(Clone)]
pub struct Client {
    sender: mpsc::Sender<Command>,
    local_peer_id: PeerId,
}

impl Client {
    pub(super) fn new(sender: mpsc::Sender<Command>, local_peer_id: PeerId) -> Self {
        Self {
            sender,
            local_peer_id,
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Dial a `/p2p/`-suffixed multiaddress and wait for the connection.
    pub async fn dial(&self, addr: Multiaddr) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Dial { addr, reply }).await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)?
    }

    /// Advertise this peer as a provider of `key` on the DHT.
    pub async fn announce(&self, key: &str) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Announce {
            key: key.to_string(),
            reply,
        })
        .await?;
        timeout(DHT_TIMEOUT, rx)
            .await
            .map_err(|_| NodeError::Timeout)?
            .map_err(|_| NodeError::ChannelClosed)?
    }

    /// Look up providers of `key`; an empty result is not an error.
    pub async fn find_providers(&self, key: &str) -> Result<Vec<PeerId>, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::FindProviders {
            key: key.to_string(),
            reply,
        })
        .await?;
        timeout(DHT_TIMEOUT, rx)
            .await
            .map_err(|_| NodeError::Timeout)?
            .map_err(|_| NodeError::ChannelClosed)?
    }

    /// Ship a key/data pair to a peer over the Store protocol.
    pub async fn store(&self, peer: PeerId, key: Vec<u8>, data: Vec<u8>) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Store {
            peer,
            key,
            data,
            reply,
        })
        .await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)?
    }

    /// Fetch the blob stored under `key` from a peer.
    pub async fn retrieve(&self, peer: PeerId, key: Vec<u8>) -> Result<Vec<u8>, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Retrieve { peer, key, reply }).await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)?
    }

    /// Submit a compute job to a peer and wait for its output.
    pub async fn compute(
        &self,
        peer: PeerId,
        tx_id: String,
        wasm: Vec<u8>,
        input: Vec<u8>,
    ) -> Result<Vec<u8>, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Compute {
            peer,
            tx_id,
            wasm,
            input,
            reply,
        })
        .await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)?
    }

    /// Broadcast a mined block on the gossip topic (best effort).
    pub async fn publish_block(&self, block: Block) -> Result<(), NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::PublishBlock {
            block: Box::new(block),
            reply,
        })
        .await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)?
    }

    pub async fn connected_peers(&self) -> Result<Vec<PeerId>, NodeError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::ConnectedPeers { reply }).await?;
        rx.await.map_err(|_| NodeError::ChannelClosed)
    }

    async fn send(&self, command: Command) -> Result<(), NodeError> {
        self.sender
            .send(command)
            .await
            .map_err(|_| NodeError::ChannelClosed)
    }
}
