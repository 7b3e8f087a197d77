//! Seam between the engine and the link layer.
//!
//! The engine never touches hardware: it hands prepared transmits to a
//! [`LinkTransport`] and receives chunks and control messages through an
//! [`InboundHandle`]. [`LoopbackFabric`] wires engines together in-process.

use std::sync::Arc;

use async_trait::async_trait;
use bag_protocol::{
    AuthTag, ControlMessage, HandshakeExpectation, HandshakeFrame, HandshakeType,
    LINK_SECRET_SIZE, PROTOCOL_VERSION,
};
use bytes::Bytes;
use dashmap::DashMap;
use rand::RngCore;
use tracing as log;

use crate::{
    crypto_key::ChunkNonce,
    error::{MeshError, MeshResult},
    node::{NodeId, Topology},
};

/// One encrypted chunk on the wire.
#[derive(Debug, Clone)]
pub struct ChunkFrame {
    pub buffer_id: u64,
    pub generation: u64,
    pub offset: u64,
    pub origin: NodeId,
    pub via: Option<NodeId>,
    pub payload: Bytes,
    pub tag: AuthTag,
    pub nonce: ChunkNonce,
}

#[derive(Debug, Clone)]
pub struct TxSubmission {
    pub dest: NodeId,
    pub frame: ChunkFrame,
}

/// A chunk as seen by the receiving node; `from` is the link it arrived on.
#[derive(Debug, Clone)]
pub struct RxDelivery {
    pub from: NodeId,
    pub frame: ChunkFrame,
}

#[async_trait]
pub trait LinkTransport: Send + Sync {
    /// Resolves once the transmit has completed on the link.
    async fn submit_tx(&self, tx: TxSubmission) -> MeshResult<()>;

    async fn send_control(&self, to: NodeId, message: ControlMessage) -> MeshResult<()>;
}

/// Entry point link layers use to hand traffic to an engine.
#[derive(Debug, Clone)]
pub struct InboundHandle {
    node: NodeId,
    rx: async_channel::Sender<RxDelivery>,
    control: async_channel::Sender<(NodeId, Bytes)>,
}

impl InboundHandle {
    pub(crate) fn new(
        node: NodeId,
        rx: async_channel::Sender<RxDelivery>,
        control: async_channel::Sender<(NodeId, Bytes)>,
    ) -> Self {
        Self { node, rx, control }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Receive-complete for one chunk.
    pub async fn deliver_rx(&self, delivery: RxDelivery) -> MeshResult<()> {
        self.rx.send(delivery).await.map_err(|_| MeshError::ShutDown)
    }

    /// Non-blocking variant for callers that must not wait on backpressure.
    pub fn try_deliver_rx(&self, delivery: RxDelivery) -> MeshResult<()> {
        self.rx.try_send(delivery).map_err(|e| match e {
            async_channel::TrySendError::Full(_) => MeshError::ChannelFull("rx"),
            async_channel::TrySendError::Closed(_) => MeshError::ShutDown,
        })
    }

    /// Encoded control message from `from`.
    pub async fn deliver_control(&self, from: NodeId, message: Bytes) -> MeshResult<()> {
        self.control
            .send((from, message))
            .await
            .map_err(|_| MeshError::ShutDown)
    }
}

/// In-process link layer connecting engines along a [`Topology`].
pub struct LoopbackFabric {
    topology: Topology,
    secret: [u8; LINK_SECRET_SIZE],
    chassis_id: u64,
    handles: DashMap<NodeId, InboundHandle>,
}

impl LoopbackFabric {
    pub fn new(topology: Topology) -> Arc<Self> {
        let mut secret = [0u8; LINK_SECRET_SIZE];
        rand::rng().fill_bytes(&mut secret);
        Arc::new(Self {
            topology,
            secret,
            chassis_id: rand::rng().next_u64(),
            handles: DashMap::new(),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Transport the engine of `node` sends through.
    pub fn port(self: &Arc<Self>, node: NodeId) -> Arc<LoopbackPort> {
        Arc::new(LoopbackPort {
            node,
            fabric: Arc::clone(self),
        })
    }

    /// Brings up every link between `handle`'s node and the nodes already
    /// attached, running the handshake in both directions.
    pub fn attach(&self, handle: InboundHandle) -> MeshResult<()> {
        let node = handle.node();
        for peer in self.topology.neighbors(node).iter() {
            if self.handles.contains_key(&peer) {
                self.handshake(node, peer, HandshakeType::Hello)?;
                self.handshake(peer, node, HandshakeType::HelloAck)?;
                log::debug!(%node, %peer, "Loopback link up");
            }
        }
        self.handles.insert(node, handle);
        Ok(())
    }

    pub fn detach(&self, node: NodeId) {
        self.handles.remove(&node);
    }

    fn handshake(&self, from: NodeId, to: NodeId, message_type: HandshakeType) -> MeshResult<()> {
        let body = self.chassis_id.to_be_bytes();
        let wire = HandshakeFrame::new(message_type, from.rank() as u32, body.to_vec())?
            .encode(&self.secret);
        let received = HandshakeFrame::decode(&wire, &self.secret)?;
        received.accept(&HandshakeExpectation {
            version: PROTOCOL_VERSION,
            message_type,
            sender_rank: from.rank() as u32,
            body_len: body.len(),
        })?;
        log::trace!(%from, %to, ?message_type, "Handshake accepted");
        Ok(())
    }

    fn handle(&self, node: NodeId) -> MeshResult<InboundHandle> {
        self.handles
            .get(&node)
            .map(|h| h.value().clone())
            .ok_or_else(|| MeshError::Transport(format!("{} is not attached", node)))
    }
}

pub struct LoopbackPort {
    node: NodeId,
    fabric: Arc<LoopbackFabric>,
}

#[async_trait]
impl LinkTransport for LoopbackPort {
    async fn submit_tx(&self, tx: TxSubmission) -> MeshResult<()> {
        if !self.fabric.topology.is_linked(self.node, tx.dest) {
            return Err(MeshError::NoLink(self.node, tx.dest));
        }
        let handle = self.fabric.handle(tx.dest)?;
        handle
            .deliver_rx(RxDelivery {
                from: self.node,
                frame: tx.frame,
            })
            .await
    }

    async fn send_control(&self, to: NodeId, message: ControlMessage) -> MeshResult<()> {
        let handle = self.fabric.handle(to)?;
        handle.deliver_control(self.node, message.encode()).await
    }
}
