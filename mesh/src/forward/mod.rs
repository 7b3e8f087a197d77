//! Multi-hop forwarding.
//!
//! Completion producers (receive, decrypt, transmit) push [`ForwardEvent`]s
//! into a lock-free [`RingQueue`]; the single [`Forwarder`] task drains it,
//! advances the affected chains and hands ready transmits to the TX worker.

pub mod action;
pub mod chain;
pub mod election;

use std::{sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::sync::{watch, Notify};
use tracing as log;

pub use self::{
    action::{ForwardAction, ForwardState},
    chain::{ChainConfig, Delivery, ForwardChain, ForwardElement, ForwardGroup, ForwardTx},
    election::Election,
};
use crate::{
    error::{MeshError, MeshResult},
    metrics::MeshMetrics,
    node::{NodeId, MAX_NODES},
    ring_queue::{Rejected, RingConsumer, RingQueue},
    transport::ChunkFrame,
};

/// Nodes one forwarded chunk may involve: the relay plus its carry partners.
pub const FORWARD_NODE_COUNT: usize = MAX_NODES;

const QUEUE_FULL_BACKOFF: Duration = Duration::from_micros(200);

#[derive(Debug, Clone)]
pub enum ForwardEvent {
    RxComplete {
        frame: ChunkFrame,
    },
    RxFlowComplete {
        buffer_id: u64,
        origin: NodeId,
        generation: u64,
        offset: u64,
    },
    TxComplete {
        buffer_id: u64,
        origin: NodeId,
        generation: u64,
        offset: u64,
        link: NodeId,
    },
}

impl ForwardEvent {
    fn chain_key(&self) -> (u64, NodeId) {
        match self {
            ForwardEvent::RxComplete { frame } => (frame.buffer_id, frame.origin),
            ForwardEvent::RxFlowComplete {
                buffer_id, origin, ..
            }
            | ForwardEvent::TxComplete {
                buffer_id, origin, ..
            } => (*buffer_id, *origin),
        }
    }
}

pub struct Forwarder {
    queue: Arc<RingQueue<ForwardEvent>>,
    wake: Notify,
    chains: DashMap<(u64, NodeId), Arc<ForwardChain>>,
    metrics: Arc<MeshMetrics>,
}

impl Forwarder {
    pub fn new(metrics: Arc<MeshMetrics>) -> MeshResult<(Arc<Self>, RingConsumer<ForwardEvent>)> {
        let queue = Arc::new(RingQueue::new());
        let consumer = queue
            .consumer()
            .ok_or_else(|| MeshError::Config("forward queue consumer already taken".into()))?;
        Ok((
            Arc::new(Self {
                queue,
                wake: Notify::new(),
                chains: DashMap::new(),
                metrics,
            }),
            consumer,
        ))
    }

    pub fn register_chain(&self, chain: Arc<ForwardChain>) {
        self.chains
            .insert((chain.buffer_id(), chain.origin()), chain);
    }

    pub fn chains_for(&self, buffer_id: u64) -> Vec<Arc<ForwardChain>> {
        self.chains
            .iter()
            .filter(|entry| entry.key().0 == buffer_id)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn chain(&self, buffer_id: u64, origin: NodeId) -> Option<Arc<ForwardChain>> {
        self.chains
            .get(&(buffer_id, origin))
            .map(|c| Arc::clone(c.value()))
    }

    /// Stops and drops every chain of `buffer_id`.
    pub fn remove_buffer(&self, buffer_id: u64) {
        self.chains.retain(|key, chain| {
            if key.0 == buffer_id {
                chain.stop();
                false
            } else {
                true
            }
        });
    }

    /// Makes the loop re-run parked events and pump every chain.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Never blocks; a full queue hands the event back.
    pub fn try_submit(&self, event: ForwardEvent) -> Result<(), Rejected<ForwardEvent>> {
        let result = self.queue.try_enqueue(event);
        match &result {
            Ok(()) => {}
            Err(rejected) if matches!(rejected.error, MeshError::QueueFull) => {
                self.metrics.record_queue_full();
            }
            Err(rejected) => {
                log::error!(error = %rejected.error, "Forward queue invariant broken");
            }
        }
        self.wake.notify_one();
        result
    }

    /// Retries while the queue is full.
    pub async fn submit(&self, mut event: ForwardEvent) -> MeshResult<()> {
        loop {
            match self.try_submit(event) {
                Ok(()) => return Ok(()),
                Err(Rejected {
                    item,
                    error: MeshError::QueueFull,
                }) => {
                    log::warn!("Forward queue full, backing off");
                    event = item;
                    tokio::time::sleep(QUEUE_FULL_BACKOFF).await;
                }
                Err(rejected) => return Err(rejected.error),
            }
        }
    }

    /// Forwarder loop; exits when `shutdown` changes or `tx_out` closes.
    pub async fn run(
        self: Arc<Self>,
        mut consumer: RingConsumer<ForwardEvent>,
        tx_out: async_channel::Sender<ForwardTx>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("Forwarder started");
        let mut parked: Vec<ForwardEvent> = Vec::new();
        let mut ready: Vec<ForwardTx> = Vec::new();
        loop {
            self.process(&mut consumer, &mut parked, &mut ready);
            for tx in ready.drain(..) {
                if tx_out.send(tx).await.is_err() {
                    log::info!("TX channel closed, forwarder exiting");
                    return;
                }
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = shutdown.changed() => {
                    log::info!("Forwarder received shutdown signal");
                    break;
                }
            }
        }
        log::info!("Forwarder stopped");
    }

    /// Applies queued events, retries parked ones and pumps every chain.
    pub fn process(
        &self,
        consumer: &mut RingConsumer<ForwardEvent>,
        parked: &mut Vec<ForwardEvent>,
        ready: &mut Vec<ForwardTx>,
    ) {
        let retry = std::mem::take(parked);
        for event in retry.into_iter().chain(consumer.drain()) {
            self.apply(event, parked);
        }
        for entry in self.chains.iter() {
            let chain = entry.value();
            let before = ready.len();
            if let Err(e) = chain.pump(ready) {
                ready.truncate(before);
                chain.abort(&e);
            }
        }
    }

    fn apply(&self, event: ForwardEvent, parked: &mut Vec<ForwardEvent>) {
        let (buffer_id, origin) = event.chain_key();
        let Some(chain) = self.chain(buffer_id, origin) else {
            log::debug!(buffer_id, %origin, "Dropping forward event without a chain");
            return;
        };
        let result = match &event {
            ForwardEvent::RxComplete { frame } => chain.mark_rx_complete(frame.clone()),
            ForwardEvent::RxFlowComplete {
                generation, offset, ..
            } => chain.flow_rx_complete(*generation, *offset),
            ForwardEvent::TxComplete {
                generation,
                offset,
                link,
                ..
            } => chain.tx_complete(*generation, *offset, *link),
        };
        match result {
            Ok(Delivery::Accepted) | Ok(Delivery::Ignored) => {}
            Ok(Delivery::Early) => parked.push(event),
            Ok(Delivery::Stale) => {
                log::debug!(buffer_id, %origin, "Dropping stale forward event");
            }
            Err(e) => chain.abort(&e),
        }
    }
}
