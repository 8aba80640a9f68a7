//! P2P node: swarm assembly and event loop
//!
//! One host per process owns an ed25519 identity and listens on TCP and
//! QUIC on the same port. The event loop owns the swarm; everything else
//! talks to it through the `Client` handle. Inbound Store and Retrieve
//! requests are served inline against the vault; Compute jobs run on the
//! blocking pool and their results re-enter the loop over a channel so
//! the swarm never stalls on a job.

use futures::StreamExt;
use libp2p::multiaddr::Protocol;
use libp2p::request_response::{self, OutboundRequestId, ResponseChannel};
use libp2p::swarm::SwarmEvent;
use libp2p::{gossipsub, identify, identity, kad, noise, tcp, yamux, Multiaddr, PeerId, Swarm};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::behaviour::{provider_key, NodeBehaviour, NodeBehaviourEvent, BLOCK_TOPIC};
use super::client::{Client, Command};
use super::protocol::{
    ComputeRequest, ComputeResponse, RetrieveRequest, RetrieveResponse, StoreRequest,
    StoreResponse,
};
use crate::chain::{Block, Blockchain};
use crate::pipeline::compute::execute_job;
use crate::shutdown::Shutdown;
use crate::storage::{BlobStore, VaultError};
use crate::vm::JobRunner;

/// Cap on providers returned by a DHT lookup.
const MAX_PROVIDERS: usize = 10;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("dial error: {0}")]
    Dial(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("peer reported store failure")]
    StoreRejected,
    #[error("blob not found on peer")]
    NotFound,
    #[error("payment rejected: {0}")]
    PaymentRejected(String),
    #[error("operation timed out")]
    Timeout,
    #[error("node event loop unavailable")]
    ChannelClosed,
    #[error("publish failed: {0}")]
    Publish(String),
}

/// Node configuration
#[derive(Clone, Debug, Default)]
pub struct NodeConfig {
    /// Port to listen on (0 for random)
    pub listen_port: u16,
    /// Bootstrap peers, as `/p2p/`-suffixed multiaddresses
    pub bootstrap: Vec<Multiaddr>,
    /// Whether inbound compute jobs are accepted
    pub serve_compute: bool,
}

/// Capabilities wired into the stream handlers. A lightweight client
/// carries none of them.
#[derive(Default)]
pub struct NodeServices {
    pub vault: Option<Arc<dyn BlobStore>>,
    pub chain: Option<Arc<Blockchain>>,
    pub runner: Option<Arc<dyn JobRunner>>,
}

/// Events surfaced to the application
#[derive(Debug, Clone)]
pub enum NodeEvent {
    Listening { address: Multiaddr },
    PeerConnected { peer_id: PeerId },
    PeerDisconnected { peer_id: PeerId },
    ShardStored { key: String },
    BlockAccepted { hash: String, height: u64 },
}

struct ProviderQuery {
    providers: HashSet<PeerId>,
    reply: oneshot::Sender<Result<Vec<PeerId>, NodeError>>,
}

/// Build the host and return its client handle, the event loop to spawn,
/// and the application event stream.
pub async fn build_node(
    config: NodeConfig,
    services: NodeServices,
    shutdown: Shutdown,
) -> Result<(Client, EventLoop, mpsc::Receiver<NodeEvent>), NodeError> {
    let keypair = identity::Keypair::generate_ed25519();
    let local_peer_id = PeerId::from(keypair.public());
    info!(peer_id = %local_peer_id, "local peer identity generated");

    let serve_compute = config.serve_compute;
    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| NodeError::Transport(e.to_string()))?
        .with_quic()
        .with_behaviour(|key| NodeBehaviour::new(key, serve_compute))
        .map_err(|e| NodeError::Transport(e.to_string()))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(Duration::from_secs(60)))
        .build();

    let tcp_addr: Multiaddr = format!("/ip4/0.0.0.0/tcp/{}", config.listen_port)
        .parse()
        .map_err(|e: libp2p::multiaddr::Error| NodeError::Transport(e.to_string()))?;
    let quic_addr: Multiaddr = format!("/ip4/0.0.0.0/udp/{}/quic-v1", config.listen_port)
        .parse()
        .map_err(|e: libp2p::multiaddr::Error| NodeError::Transport(e.to_string()))?;
    swarm
        .listen_on(tcp_addr)
        .map_err(|e| NodeError::Transport(e.to_string()))?;
    swarm
        .listen_on(quic_addr)
        .map_err(|e| NodeError::Transport(e.to_string()))?;

    swarm
        .behaviour_mut()
        .gossipsub
        .subscribe(&gossipsub::IdentTopic::new(BLOCK_TOPIC))
        .map_err(|e| NodeError::Transport(e.to_string()))?;

    for addr in &config.bootstrap {
        match split_peer_addr(addr) {
            Ok((peer_id, base)) => {
                swarm.behaviour_mut().kademlia.add_address(&peer_id, base);
                if let Err(e) = swarm.dial(addr.clone()) {
                    warn!(%addr, "bootstrap dial failed: {e}");
                }
            }
            Err(reason) => warn!(%addr, "invalid bootstrap address: {reason}"),
        }
    }
    if !config.bootstrap.is_empty() {
        let _ = swarm.behaviour_mut().kademlia.bootstrap();
    }

    let (command_tx, command_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(100);
    let (compute_results_tx, compute_results_rx) = mpsc::channel(16);

    let event_loop = EventLoop {
        swarm,
        services,
        command_rx,
        event_tx,
        shutdown,
        local_peer_id,
        pending_dial: HashMap::new(),
        pending_announce: HashMap::new(),
        pending_providers: HashMap::new(),
        pending_store: HashMap::new(),
        pending_retrieve: HashMap::new(),
        pending_compute: HashMap::new(),
        compute_results_tx,
        compute_results_rx,
    };

    Ok((Client::new(command_tx, local_peer_id), event_loop, event_rx))
}

/// Split a dial string into its peer id and transport address.
pub fn split_peer_addr(addr: &Multiaddr) -> Result<(PeerId, Multiaddr), String> {
    let mut base = addr.clone();
    match base.pop() {
        Some(Protocol::P2p(peer_id)) => Ok((peer_id, base)),
        _ => Err("address must end with /p2p/<peer-id>".to_string()),
    }
}

pub struct EventLoop {
    swarm: Swarm<NodeBehaviour>,
    services: NodeServices,
    command_rx: mpsc::Receiver<Command>,
    event_tx: mpsc::Sender<NodeEvent>,
    shutdown: Shutdown,
    local_peer_id: PeerId,
    pending_dial: HashMap<PeerId, oneshot::Sender<Result<(), NodeError>>>,
    /// `None` marks fire-and-forget announcements.
    pending_announce: HashMap<kad::QueryId, Option<oneshot::Sender<Result<(), NodeError>>>>,
    pending_providers: HashMap<kad::QueryId, ProviderQuery>,
    pending_store: HashMap<OutboundRequestId, oneshot::Sender<Result<(), NodeError>>>,
    pending_retrieve: HashMap<OutboundRequestId, oneshot::Sender<Result<Vec<u8>, NodeError>>>,
    pending_compute: HashMap<OutboundRequestId, oneshot::Sender<Result<Vec<u8>, NodeError>>>,
    compute_results_tx: mpsc::Sender<(ResponseChannel<ComputeResponse>, ComputeResponse)>,
    compute_results_rx: mpsc::Receiver<(ResponseChannel<ComputeResponse>, ComputeResponse)>,
}

impl EventLoop {
    /// Drive the swarm until the shutdown token fires.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("network event loop shutting down");
                    break;
                }
                event = self.swarm.select_next_some() => self.handle_swarm_event(event),
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some((channel, response)) = self.compute_results_rx.recv() => {
                    self.send_compute_response(channel, response);
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Dial { addr, reply } => match split_peer_addr(&addr) {
                Ok((peer_id, base)) => {
                    if self.swarm.is_connected(&peer_id) {
                        let _ = reply.send(Ok(()));
                        return;
                    }
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, base);
                    match self.swarm.dial(addr) {
                        Ok(()) => {
                            self.pending_dial.insert(peer_id, reply);
                        }
                        Err(e) => {
                            let _ = reply.send(Err(NodeError::Dial(e.to_string())));
                        }
                    }
                }
                Err(reason) => {
                    let _ = reply.send(Err(NodeError::Dial(reason)));
                }
            },
            Command::Announce { key, reply } => {
                match self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .start_providing(provider_key(&key))
                {
                    Ok(query_id) => {
                        self.pending_announce.insert(query_id, Some(reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(NodeError::Request(e.to_string())));
                    }
                }
            }
            Command::FindProviders { key, reply } => {
                let query_id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(provider_key(&key));
                self.pending_providers.insert(
                    query_id,
                    ProviderQuery {
                        providers: HashSet::new(),
                        reply,
                    },
                );
            }
            Command::Store {
                peer,
                key,
                data,
                reply,
            } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .store
                    .send_request(&peer, StoreRequest { key, data });
                self.pending_store.insert(request_id, reply);
            }
            Command::Retrieve { peer, key, reply } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .retrieve
                    .send_request(&peer, RetrieveRequest { key });
                self.pending_retrieve.insert(request_id, reply);
            }
            Command::Compute {
                peer,
                tx_id,
                wasm,
                input,
                reply,
            } => {
                let request_id = self
                    .swarm
                    .behaviour_mut()
                    .compute
                    .send_request(&peer, ComputeRequest { tx_id, wasm, input });
                self.pending_compute.insert(request_id, reply);
            }
            Command::PublishBlock { block, reply } => {
                let result = match block.to_bytes() {
                    Ok(bytes) => self
                        .swarm
                        .behaviour_mut()
                        .gossipsub
                        .publish(gossipsub::IdentTopic::new(BLOCK_TOPIC), bytes)
                        .map(|_| ())
                        .map_err(|e| NodeError::Publish(e.to_string())),
                    Err(e) => Err(NodeError::Publish(e.to_string())),
                };
                let _ = reply.send(result);
            }
            Command::ConnectedPeers { reply } => {
                let peers = self.swarm.connected_peers().cloned().collect();
                let _ = reply.send(peers);
            }
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<NodeBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "listening");
                let _ = self.event_tx.try_send(NodeEvent::Listening { address });
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                info!(%peer_id, "peer connected");
                if let Some(reply) = self.pending_dial.remove(&peer_id) {
                    let _ = reply.send(Ok(()));
                }
                let _ = self.event_tx.try_send(NodeEvent::PeerConnected { peer_id });
            }
            SwarmEvent::ConnectionClosed { peer_id, .. } => {
                debug!(%peer_id, "peer disconnected");
                let _ = self
                    .event_tx
                    .try_send(NodeEvent::PeerDisconnected { peer_id });
            }
            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                if let Some(reply) = peer_id.and_then(|p| self.pending_dial.remove(&p)) {
                    let _ = reply.send(Err(NodeError::Dial(error.to_string())));
                }
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: NodeBehaviourEvent) {
        match event {
            NodeBehaviourEvent::Kademlia(event) => self.handle_kad_event(event),
            NodeBehaviourEvent::Store(event) => self.handle_store_event(event),
            NodeBehaviourEvent::Retrieve(event) => self.handle_retrieve_event(event),
            NodeBehaviourEvent::Compute(event) => self.handle_compute_event(event),
            NodeBehaviourEvent::Gossipsub(event) => self.handle_gossip_event(event),
            NodeBehaviourEvent::Identify(event) => {
                if let identify::Event::Received { peer_id, info, .. } = event {
                    debug!(%peer_id, protocols = ?info.protocols, "identified peer");
                    for addr in info.listen_addrs {
                        self.swarm
                            .behaviour_mut()
                            .kademlia
                            .add_address(&peer_id, addr);
                    }
                }
            }
            NodeBehaviourEvent::Ping(_)
            | NodeBehaviourEvent::Upnp(_)
            | NodeBehaviourEvent::Relay(_) => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::RoutingUpdated { peer, .. } => {
                debug!(%peer, "kademlia routing updated");
            }
            kad::Event::OutboundQueryProgressed { id, result, .. } => match result {
                kad::QueryResult::StartProviding(result) => {
                    if let Some(slot) = self.pending_announce.remove(&id) {
                        let mapped = result
                            .map(|_| ())
                            .map_err(|e| NodeError::Request(e.to_string()));
                        match slot {
                            Some(reply) => {
                                let _ = reply.send(mapped);
                            }
                            None => {
                                if let Err(e) = mapped {
                                    debug!("background announce failed: {e}");
                                }
                            }
                        }
                    }
                }
                kad::QueryResult::GetProviders(Ok(kad::GetProvidersOk::FoundProviders {
                    providers,
                    ..
                })) => {
                    if let Some(query) = self.pending_providers.get_mut(&id) {
                        query.providers.extend(providers);
                        if query.providers.len() >= MAX_PROVIDERS {
                            if let Some(mut active) =
                                self.swarm.behaviour_mut().kademlia.query_mut(&id)
                            {
                                active.finish();
                            }
                        }
                    }
                }
                kad::QueryResult::GetProviders(Ok(
                    kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. },
                )) => {
                    if let Some(query) = self.pending_providers.remove(&id) {
                        let _ = query
                            .reply
                            .send(Ok(query.providers.into_iter().collect()));
                    }
                }
                kad::QueryResult::GetProviders(Err(e)) => {
                    debug!("provider lookup ended: {e}");
                    if let Some(query) = self.pending_providers.remove(&id) {
                        // Partial results still count; empty is not an error.
                        let _ = query
                            .reply
                            .send(Ok(query.providers.into_iter().collect()));
                    }
                }
                _ => {}
            },
            _ => {}
        }
    }

    fn handle_store_event(&mut self, event: request_response::Event<StoreRequest, StoreResponse>) {
        match event {
            request_response::Event::Message { message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => self.handle_store_request(request, channel),
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_store.remove(&request_id) {
                        let result = match response {
                            StoreResponse::Stored => Ok(()),
                            StoreResponse::Failed => Err(NodeError::StoreRejected),
                        };
                        let _ = reply.send(result);
                    }
                }
            },
            request_response::Event::OutboundFailure {
                request_id, error, ..
            } => {
                if let Some(reply) = self.pending_store.remove(&request_id) {
                    let _ = reply.send(Err(NodeError::Request(error.to_string())));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                warn!(%peer, "inbound store stream failed: {error}");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn handle_store_request(
        &mut self,
        request: StoreRequest,
        channel: ResponseChannel<StoreResponse>,
    ) {
        let vault = self.services.vault.clone();
        let response = match vault {
            Some(vault) => match vault.store(&request.key, &request.data) {
                Ok(()) => {
                    let key = String::from_utf8_lossy(&request.key).into_owned();
                    debug!(key = %key, bytes = request.data.len(), "stored shard from peer");
                    self.announce_in_background(&key);
                    let _ = self.event_tx.try_send(NodeEvent::ShardStored { key });
                    StoreResponse::Stored
                }
                Err(e) => {
                    warn!("vault store failed: {e}");
                    StoreResponse::Failed
                }
            },
            None => StoreResponse::Failed,
        };
        if self
            .swarm
            .behaviour_mut()
            .store
            .send_response(channel, response)
            .is_err()
        {
            debug!("store acknowledgement dropped: stream closed");
        }
    }

    fn handle_retrieve_event(
        &mut self,
        event: request_response::Event<RetrieveRequest, RetrieveResponse>,
    ) {
        match event {
            request_response::Event::Message { message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let response = match &self.services.vault {
                        Some(vault) => match vault.get(&request.key) {
                            Ok(data) => RetrieveResponse::Found(data),
                            Err(VaultError::NotFound(key)) => {
                                debug!(key = %key, "requested shard not held");
                                RetrieveResponse::NotFound
                            }
                            Err(e) => {
                                warn!("vault read failed: {e}");
                                RetrieveResponse::NotFound
                            }
                        },
                        None => RetrieveResponse::NotFound,
                    };
                    if self
                        .swarm
                        .behaviour_mut()
                        .retrieve
                        .send_response(channel, response)
                        .is_err()
                    {
                        debug!("retrieve response dropped: stream closed");
                    }
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_retrieve.remove(&request_id) {
                        let result = match response {
                            RetrieveResponse::Found(data) => Ok(data),
                            RetrieveResponse::NotFound => Err(NodeError::NotFound),
                        };
                        let _ = reply.send(result);
                    }
                }
            },
            request_response::Event::OutboundFailure {
                request_id, error, ..
            } => {
                if let Some(reply) = self.pending_retrieve.remove(&request_id) {
                    let _ = reply.send(Err(NodeError::Request(error.to_string())));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                warn!(%peer, "inbound retrieve stream failed: {error}");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn handle_compute_event(
        &mut self,
        event: request_response::Event<ComputeRequest, ComputeResponse>,
    ) {
        match event {
            request_response::Event::Message { peer, message } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    info!(%peer, wasm_bytes = request.wasm.len(), "received compute job");
                    self.handle_compute_request(request, channel);
                }
                request_response::Message::Response {
                    request_id,
                    response,
                } => {
                    if let Some(reply) = self.pending_compute.remove(&request_id) {
                        let result = match response {
                            ComputeResponse::Completed(output) => Ok(output),
                            ComputeResponse::Rejected(reason) => {
                                Err(NodeError::PaymentRejected(reason))
                            }
                        };
                        let _ = reply.send(result);
                    }
                }
            },
            request_response::Event::OutboundFailure {
                request_id, error, ..
            } => {
                if let Some(reply) = self.pending_compute.remove(&request_id) {
                    let _ = reply.send(Err(NodeError::Request(error.to_string())));
                }
            }
            request_response::Event::InboundFailure { peer, error, .. } => {
                warn!(%peer, "inbound compute stream failed: {error}");
            }
            request_response::Event::ResponseSent { .. } => {}
        }
    }

    fn handle_compute_request(
        &mut self,
        request: ComputeRequest,
        channel: ResponseChannel<ComputeResponse>,
    ) {
        let Some(runner) = self.services.runner.clone() else {
            self.send_compute_response(
                channel,
                ComputeResponse::Rejected("compute disabled on this node".to_string()),
            );
            return;
        };
        let chain = self.services.chain.clone();
        let results = self.compute_results_tx.clone();
        tokio::task::spawn_blocking(move || {
            let response = execute_job(chain.as_deref(), runner.as_ref(), &request);
            if results.blocking_send((channel, response)).is_err() {
                warn!("compute result dropped: event loop gone");
            }
        });
    }

    fn send_compute_response(
        &mut self,
        channel: ResponseChannel<ComputeResponse>,
        response: ComputeResponse,
    ) {
        if self
            .swarm
            .behaviour_mut()
            .compute
            .send_response(channel, response)
            .is_err()
        {
            debug!("compute response dropped: stream closed");
        }
    }

    fn handle_gossip_event(&mut self, event: gossipsub::Event) {
        let gossipsub::Event::Message { message, .. } = event else {
            return;
        };
        if message.source == Some(self.local_peer_id) {
            return;
        }

        let block = match Block::from_bytes(&message.data) {
            Ok(block) => block,
            Err(e) => {
                debug!("undecodable gossiped block: {e}");
                return;
            }
        };

        let Some(chain) = &self.services.chain else {
            return;
        };
        match chain.process_block(&block) {
            Ok(()) => {
                info!(height = block.index, hash = %block.hash, "accepted gossiped block");
                let _ = self.event_tx.try_send(NodeEvent::BlockAccepted {
                    hash: block.hash,
                    height: block.index,
                });
            }
            Err(e) => {
                debug!(hash = %block.hash, "rejected gossiped block: {e}");
            }
        }
    }

    fn announce_in_background(&mut self, key: &str) {
        match self
            .swarm
            .behaviour_mut()
            .kademlia
            .start_providing(provider_key(key))
        {
            Ok(query_id) => {
                self.pending_announce.insert(query_id, None);
            }
            Err(e) => warn!(key, "announce failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_peer_addr() {
        let peer_id = PeerId::random();
        let addr: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{peer_id}")
            .parse()
            .unwrap();

        let (parsed_peer, base) = split_peer_addr(&addr).unwrap();
        assert_eq!(parsed_peer, peer_id);
        assert_eq!(base, "/ip4/127.0.0.1/tcp/4001".parse::<Multiaddr>().unwrap());
    }

    #[test]
    fn test_split_peer_addr_requires_peer_id() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert!(split_peer_addr(&addr).is_err());
    }
}
