//! Top-level orchestrator of one node's data plane.
//!
//! The engine owns the buffer registry, the crypto key table and a fixed set
//! of workers:
//! - `crypto_workers` encrypt/decrypt workers sharing one job channel
//! - one RX worker admitting chunks handed in through the [`InboundHandle`]
//! - one TX worker submitting own and relayed transmits to the [`LinkTransport`]
//! - one forwarder draining the forward event ring
//! - one control worker applying peers' announcements and barrier messages

mod workers;

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use bag_protocol::{ControlCommand, ControlMessage, MAX_COMMANDS_PER_MESSAGE};
use bytes::Bytes;
use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use tokio::{runtime::Handle, sync::watch, task::JoinHandle};
use tracing::{self as log, Instrument};

use self::workers::CryptoJob;
use crate::{
    buffer_state::{Announcement, BufferPhase, BufferSpec, BufferState},
    config::MeshConfig,
    crypto_key::{CryptoKeyState, CryptoKeyStateArray, KeyFlags},
    error::{MeshError, MeshResult},
    forward::{ChainConfig, ForwardChain, Forwarder},
    metrics::{MeshMetrics, MetricsSnapshot},
    node::{NodeId, NodeMask, Topology, MAX_NODES},
    signal::WaitSignal,
    transport::{InboundHandle, LinkTransport, RxDelivery, TxSubmission},
};

pub struct MeshEngine {
    config: MeshConfig,
    local: NodeId,
    topology: Topology,
    transport: Arc<dyn LinkTransport>,
    keys: CryptoKeyStateArray,
    buffers: DashMap<u64, Arc<BufferState>>,
    pending_announcements: Mutex<HashMap<u64, Vec<Announcement>>>,
    forwarder: Arc<Forwarder>,
    metrics: Arc<MeshMetrics>,
    crypto_jobs: async_channel::Sender<CryptoJob>,
    own_tx: async_channel::Sender<TxSubmission>,
    inbound: InboundHandle,
    control_sequence: AtomicU64,
    sync_generation: AtomicU64,
    peer_generations: [AtomicU64; MAX_NODES],
    sync_signal: WaitSignal,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for MeshEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshEngine")
            .field("local", &self.local)
            .field("buffers", &self.buffers.len())
            .field("keys", &self.keys.len())
            .finish_non_exhaustive()
    }
}

fn spawn_worker<F>(runtime: &Handle, local: NodeId, worker: &'static str, task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let span = tracing::info_span!("mesh_worker", node = local.rank(), worker);
    runtime.spawn(task.instrument(span))
}

impl MeshEngine {
    /// Spawns the worker set on the current tokio runtime.
    pub fn start(
        config: MeshConfig,
        local: NodeId,
        topology: Topology,
        transport: Arc<dyn LinkTransport>,
    ) -> MeshResult<Arc<Self>> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|_| MeshError::Config("mesh engine must start inside a tokio runtime".into()))?;

        let metrics = Arc::new(MeshMetrics::new());
        let (forwarder, forward_events) = Forwarder::new(Arc::clone(&metrics))?;
        let capacity = config.channel_capacity;
        let (crypto_jobs, crypto_rx) = async_channel::bounded(capacity);
        let (own_tx, own_rx) = async_channel::bounded(capacity);
        let (forward_tx, forward_rx) = async_channel::bounded(capacity);
        let (rx_tx, rx_rx) = async_channel::bounded(capacity);
        let (control_tx, control_rx) = async_channel::bounded(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let engine = Arc::new(Self {
            keys: CryptoKeyStateArray::from_config(&config),
            local,
            topology,
            transport,
            buffers: DashMap::new(),
            pending_announcements: Mutex::new(HashMap::new()),
            forwarder: Arc::clone(&forwarder),
            metrics,
            crypto_jobs,
            own_tx,
            inbound: InboundHandle::new(local, rx_tx, control_tx),
            control_sequence: AtomicU64::new(0),
            sync_generation: AtomicU64::new(0),
            peer_generations: std::array::from_fn(|_| AtomicU64::new(0)),
            sync_signal: WaitSignal::new(),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            config,
        });

        let mut workers = Vec::with_capacity(engine.config.crypto_workers + 4);
        for id in 0..engine.config.crypto_workers {
            workers.push(spawn_worker(
                &runtime,
                local,
                "crypto",
                Arc::clone(&engine).crypto_worker(id, crypto_rx.clone(), shutdown_rx.clone()),
            ));
        }
        workers.push(spawn_worker(
            &runtime,
            local,
            "rx",
            Arc::clone(&engine).rx_worker(rx_rx, shutdown_rx.clone()),
        ));
        workers.push(spawn_worker(
            &runtime,
            local,
            "tx",
            Arc::clone(&engine).tx_worker(own_rx, forward_rx, shutdown_rx.clone()),
        ));
        workers.push(spawn_worker(
            &runtime,
            local,
            "forwarder",
            forwarder.run(forward_events, forward_tx, shutdown_rx.clone()),
        ));
        workers.push(spawn_worker(
            &runtime,
            local,
            "control",
            Arc::clone(&engine).control_worker(control_rx, shutdown_rx),
        ));
        *engine.workers.lock() = workers;

        log::info!(
            node = %local,
            crypto_workers = engine.config.crypto_workers,
            "Mesh engine started"
        );
        Ok(engine)
    }

    /// Signals every worker to stop and waits for them to exit.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        log::info!(node = %self.local, "Mesh engine shutting down");
        for buffer in self.buffer_snapshot() {
            buffer.interrupt();
        }
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                log::warn!(node = %self.local, error = %e, "Worker ended abnormally");
            }
        }
        log::info!(node = %self.local, "Mesh engine stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Handle a link layer uses to deliver chunks and control messages here.
    pub fn inbound_handle(&self) -> InboundHandle {
        self.inbound.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn generations_completed(&self, buffer_id: u64) -> u64 {
        self.buffer(buffer_id)
            .map(|b| b.completed_generations())
            .unwrap_or(0)
    }

    pub fn forwarder(&self) -> &Arc<Forwarder> {
        &self.forwarder
    }

    // Buffers

    pub fn buffer(&self, id: u64) -> Option<Arc<BufferState>> {
        self.buffers.get(&id).map(|b| Arc::clone(b.value()))
    }

    fn require(&self, id: u64) -> MeshResult<Arc<BufferState>> {
        self.buffer(id).ok_or(MeshError::UnknownBuffer(id))
    }

    fn buffer_snapshot(&self) -> Vec<Arc<BufferState>> {
        self.buffers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Registration and deregistration of one id must not race each other.
    pub fn register_buffer(&self, spec: BufferSpec) -> MeshResult<Arc<BufferState>> {
        let id = spec.id;
        let buffer = Arc::new(BufferState::new(spec, self.local, &self.topology)?);
        let mut pending = self.pending_announcements.lock();
        match self.buffers.entry(id) {
            Entry::Occupied(_) => return Err(MeshError::BufferExists(id)),
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&buffer));
            }
        }
        let parked = pending.remove(&id).unwrap_or_default();
        drop(pending);
        for announcement in &parked {
            buffer.announce(*announcement);
        }
        log::info!(
            buffer_id = id,
            size = buffer.geometry().size(),
            participants = %buffer.spec().participants,
            parked = parked.len(),
            "Buffer registered"
        );
        Ok(buffer)
    }

    /// Freezes the buffer, stops its forwarding and wakes every waiter.
    pub fn deregister_buffer(&self, id: u64) -> MeshResult<()> {
        let (_, buffer) = self
            .buffers
            .remove(&id)
            .ok_or(MeshError::UnknownBuffer(id))?;
        buffer.hold();
        self.forwarder.remove_buffer(id);
        buffer
            .signal()
            .abort(format!("buffer {} deregistered", id));
        self.pending_announcements.lock().remove(&id);
        self.metrics.forget_buffer(id);
        log::info!(buffer_id = id, "Buffer deregistered");
        Ok(())
    }

    // Assignments

    fn chain_config(&self, spec: &BufferSpec) -> ChainConfig {
        ChainConfig {
            group_chunks: self.config.forward_group_chunks,
            tx_window: self.config.forward_tx_window,
            max_iterations: spec.max_reads,
        }
    }

    /// Creates outbound assignments and forward chains, then announces the new
    /// assignments to their destinations. Never waits on peers.
    pub async fn assign_outbound(&self, id: u64) -> MeshResult<usize> {
        let buffer = self.require(id)?;
        let created = buffer.create_outbound()?;

        let forwards: Vec<_> = buffer.plan().forwards().collect();
        for (origin, to) in forwards {
            if self.forwarder.chain(id, origin).is_some() {
                continue;
            }
            let offsets: Vec<u64> = buffer.chunk_offsets_of(origin).collect();
            let chain = ForwardChain::new(
                id,
                origin,
                self.local,
                to,
                &offsets,
                self.chain_config(buffer.spec()),
                Arc::clone(buffer.signal()),
            )?;
            self.forwarder.register_chain(Arc::new(chain));
            log::debug!(buffer_id = id, %origin, %to, "Forward chain created");
        }

        let mut per_dest: BTreeMap<NodeId, Vec<ControlCommand>> = BTreeMap::new();
        for assignment in &created {
            let links = assignment.links();
            let command = if assignment.origin == self.local {
                ControlCommand::TxAssignment {
                    buffer_id: id,
                    origin: self.local.rank(),
                    offset: assignment.offset,
                    size: assignment.size,
                    dest_mask: links.bits(),
                }
            } else {
                ControlCommand::TxForward {
                    buffer_id: id,
                    origin: assignment.origin.rank(),
                    via: self.local.rank(),
                    offset: assignment.offset,
                    size: assignment.size,
                    dest_mask: links.bits(),
                }
            };
            for dest in links.iter() {
                per_dest.entry(dest).or_default().push(command);
            }
        }
        for (dest, commands) in per_dest {
            for batch in commands.chunks(MAX_COMMANDS_PER_MESSAGE) {
                self.send_control(dest, batch.to_vec()).await?;
            }
        }
        log::info!(buffer_id = id, created = created.len(), "Outbound assignments created");
        Ok(created.len())
    }

    /// Fails with `PeerNotReady` while a sender has not announced its side.
    pub fn assign_inbound(&self, id: u64) -> MeshResult<usize> {
        self.require(id)?.create_inbound()
    }

    /// Outbound assignments, then inbound ones with bounded exponential backoff.
    pub async fn prepare_buffer(&self, id: u64) -> MeshResult<()> {
        self.assign_outbound(id).await?;
        let retry = self.config.inbound_retry;
        let mut attempt = 0;
        loop {
            match self.assign_inbound(id) {
                Ok(count) => {
                    log::info!(buffer_id = id, inbound = count, attempt, "Buffer prepared");
                    return Ok(());
                }
                Err(e @ MeshError::PeerNotReady { .. }) if attempt + 1 < retry.max_attempts => {
                    let delay = retry.delay_for(attempt);
                    log::debug!(buffer_id = id, attempt, ?delay, error = %e, "Inbound assignments pending");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        log::warn!(buffer_id = id, attempts = attempt + 1, error = %e, "Giving up on inbound assignments");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn send_control(&self, to: NodeId, commands: Vec<ControlCommand>) -> MeshResult<()> {
        let sequence = self.control_sequence.fetch_add(1, Ordering::Relaxed);
        let message = ControlMessage::new(self.local.rank(), sequence, commands)?;
        self.transport.send_control(to, message).await
    }

    // Keys

    pub fn set_key(&self, mask: NodeMask, key: &[u8], flags: KeyFlags) -> MeshResult<()> {
        self.keys.set_key(mask, key, flags)
    }

    pub fn remove_key(&self, mask: NodeMask) -> bool {
        self.keys.remove_key(mask)
    }

    /// The key currently installed for `mask`.
    pub fn key(&self, mask: NodeMask) -> MeshResult<Arc<CryptoKeyState>> {
        self.keys.get(mask)
    }

    // Data

    pub fn write_block(&self, id: u64, data: &[u8]) -> MeshResult<()> {
        self.require(id)?.write(data)
    }

    pub fn read(&self, id: u64, offset: u64, len: u64) -> MeshResult<Bytes> {
        self.require(id)?.read(offset, len)
    }

    // Generations

    /// Starts the next generation of `id` and queues encryption of the local
    /// block. Returns the generation number.
    ///
    /// A generation stalled on an exhausted key is resumed instead once a new
    /// key is installed, and its number is returned again.
    pub async fn start_generation(&self, id: u64) -> MeshResult<u64> {
        let buffer = self.require(id)?;
        match buffer.phase() {
            BufferPhase::InFlight if buffer.stalled().is_some() => {
                return self.resume_generation(&buffer).await;
            }
            BufferPhase::InFlight => return Err(MeshError::GenerationInFlight(id)),
            BufferPhase::Exhausted => return Err(MeshError::UseAfterCompletion(id)),
            BufferPhase::Failed => buffer.signal().check()?,
            BufferPhase::Idle | BufferPhase::Complete => {}
        }
        if !buffer.assignments_complete() {
            return Err(MeshError::AssignmentsIncomplete(id));
        }
        let key = self.keys.get(buffer.spec().participants)?;
        key.touch()?;
        let (generation, replay) = match self.begin_generation(&buffer).await {
            Ok(started) => started,
            Err(e) => {
                key.untouch();
                return Err(e);
            }
        };
        for delivery in replay {
            self.process_delivery(&buffer, delivery).await?;
        }
        self.queue_encrypts(&buffer, generation).await?;
        Ok(generation)
    }

    async fn begin_generation(
        &self,
        buffer: &Arc<BufferState>,
    ) -> MeshResult<(u64, Vec<RxDelivery>)> {
        let id = buffer.id();
        let chains = self.forwarder.chains_for(id);
        buffer
            .signal()
            .wait_until("forward chains to drain", self.config.wait_timeout(), || {
                Ok(chains.iter().all(|chain| chain.is_idle()))
            })
            .await?;
        let next = buffer.generation() + 1;
        for chain in &chains {
            if !chain.rearm(next)? {
                log::debug!(buffer_id = id, origin = %chain.origin(), "Forward chain finished");
            }
        }
        if !chains.is_empty() {
            self.forwarder.wake();
        }
        buffer.start_generation()
    }

    async fn resume_generation(&self, buffer: &Arc<BufferState>) -> MeshResult<u64> {
        let mask = buffer.spec().participants;
        if let Some(reason) = self.keys.get(mask)?.exhaustion() {
            return Err(MeshError::KeyExhausted {
                mask: mask.bits(),
                reason,
            });
        }
        let generation = buffer.resume_generation()?;
        self.queue_encrypts(buffer, generation).await?;
        Ok(generation)
    }

    /// Queues sealing of every chunk of the local block not yet sealed for
    /// `generation`.
    async fn queue_encrypts(&self, buffer: &Arc<BufferState>, generation: u64) -> MeshResult<()> {
        if buffer.plan().broadcast_links().is_empty() {
            return Ok(());
        }
        for offset in buffer.chunk_offsets_of(self.local) {
            if buffer.is_sealed(offset, generation) {
                continue;
            }
            self.crypto_jobs
                .send(CryptoJob::Encrypt {
                    buffer: Arc::clone(buffer),
                    generation,
                    offset,
                })
                .await
                .map_err(|_| MeshError::ShutDown)?;
        }
        Ok(())
    }

    pub async fn wait_all_received(&self, id: u64) -> MeshResult<()> {
        self.require(id)?
            .wait_all_received(self.config.wait_timeout())
            .await
    }

    pub async fn wait_generation(&self, id: u64, generation: u64) -> MeshResult<()> {
        self.require(id)?
            .wait_generation(generation, self.config.wait_timeout())
            .await
    }

    /// Starts the next generation and waits until it completes locally.
    pub async fn run_generation(&self, id: u64) -> MeshResult<u64> {
        let generation = self.start_generation(id).await?;
        self.wait_generation(id, generation).await?;
        Ok(generation)
    }

    /// Generation barrier across `participants`.
    ///
    /// Waits for every in-flight local generation to complete, announces the
    /// next barrier generation to each peer and returns once all of them have
    /// announced it too.
    pub async fn synchronize(&self, participants: NodeMask) -> MeshResult<u64> {
        let timeout = self.config.wait_timeout();
        for buffer in self.buffer_snapshot() {
            if buffer.phase() == BufferPhase::InFlight {
                buffer.wait_generation(buffer.generation(), timeout).await?;
            }
        }

        let generation = self.sync_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let peers = participants.without(self.local);
        for peer in peers.iter() {
            self.send_control(
                peer,
                vec![ControlCommand::StartGeneration {
                    rank: self.local.rank(),
                    generation,
                }],
            )
            .await?;
        }
        self.sync_signal
            .wait_until("peer generation barrier", timeout, || {
                Ok(peers
                    .iter()
                    .all(|peer| self.peer_generation(peer) >= generation))
            })
            .await?;
        log::debug!(node = %self.local, generation, %participants, "Synchronized");
        Ok(generation)
    }

    /// Highest barrier generation `peer` has announced.
    pub fn peer_generation(&self, peer: NodeId) -> u64 {
        self.peer_generations[peer.index()].load(Ordering::Acquire)
    }

    // Cancellation

    pub fn interrupt(&self, id: u64) -> MeshResult<()> {
        self.require(id)?.interrupt();
        Ok(())
    }

    pub fn clear_interrupt(&self, id: u64) -> MeshResult<()> {
        self.require(id)?.clear_interrupt();
        Ok(())
    }
}
