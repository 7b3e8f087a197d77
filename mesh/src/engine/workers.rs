//! Worker loops of the engine.
//!
//! Every worker owns the receiving end of one channel and exits when the
//! shutdown watch flips or its channel closes. Errors raised while handling a
//! single item never escape the loop: they fail the affected buffer instead.

use std::sync::{atomic::Ordering, Arc};

use bag_protocol::{ControlCommand, ControlMessage};
use bytes::Bytes;
use tokio::sync::watch;
use tracing as log;

use super::MeshEngine;
use crate::{
    assignment::AssignmentPeer,
    buffer_state::{Admission, Announcement, BufferState, ChunkReady},
    cipher::{open_chunk, seal_chunk, ChunkContext},
    error::{MeshError, MeshResult},
    forward::{ForwardEvent, ForwardTx},
    node::{NodeId, NodeMask},
    transport::{ChunkFrame, RxDelivery, TxSubmission},
};

pub(crate) enum CryptoJob {
    /// Seal one chunk of the local block for `generation`.
    Encrypt {
        buffer: Arc<BufferState>,
        generation: u64,
        offset: u64,
    },
    Decrypt {
        buffer: Arc<BufferState>,
        delivery: RxDelivery,
    },
}

impl MeshEngine {
    pub(super) async fn crypto_worker(
        self: Arc<Self>,
        id: usize,
        jobs: async_channel::Receiver<CryptoJob>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!(id, "Crypto worker started");
        loop {
            tokio::select! {
                job = jobs.recv() => {
                    let Ok(job) = job else { break };
                    self.run_crypto_job(job).await;
                }
                _ = shutdown.changed() => {
                    log::info!(id, "Crypto worker received shutdown signal");
                    break;
                }
            }
        }
        log::info!(id, "Crypto worker stopped");
    }

    async fn run_crypto_job(&self, job: CryptoJob) {
        let (buffer, result) = match job {
            CryptoJob::Encrypt {
                buffer,
                generation,
                offset,
            } => {
                let result = self.encrypt(&buffer, generation, offset).await;
                (buffer, result)
            }
            CryptoJob::Decrypt { buffer, delivery } => {
                let result = self.decrypt(&buffer, delivery).await;
                (buffer, result)
            }
        };
        if let Err(e) = result {
            self.fail_buffer(&buffer, &e);
        }
    }

    async fn encrypt(
        &self,
        buffer: &Arc<BufferState>,
        generation: u64,
        offset: u64,
    ) -> MeshResult<()> {
        if buffer.generation() != generation || buffer.is_sealed(offset, generation) {
            log::debug!(buffer_id = buffer.id(), generation, offset, "Skipping stale encrypt");
            return Ok(());
        }
        // Resolved per job so that work queued before a rotation seals with the new key.
        let key = self.keys.get(buffer.spec().participants)?;
        let plaintext = buffer.chunk(offset)?;
        let context = ChunkContext {
            buffer_id: buffer.id(),
            generation,
            offset,
        };
        let sealed = seal_chunk(&key, self.local, context, &plaintext)?;
        if !buffer.mark_sealed(offset, generation) {
            log::debug!(buffer_id = buffer.id(), generation, offset, "Chunk already sealed");
            return Ok(());
        }
        self.metrics.record_encrypted();

        if let ChunkReady::Transmit { links } = buffer.on_chunk_ready(offset, sealed.tag)? {
            let frame = ChunkFrame {
                buffer_id: buffer.id(),
                generation,
                offset,
                origin: self.local,
                via: None,
                payload: sealed.payload,
                tag: sealed.tag,
                nonce: sealed.nonce,
            };
            for dest in links.iter() {
                self.own_tx
                    .send(TxSubmission {
                        dest,
                        frame: frame.clone(),
                    })
                    .await
                    .map_err(|_| MeshError::ShutDown)?;
            }
        }
        Ok(())
    }

    async fn decrypt(&self, buffer: &Arc<BufferState>, delivery: RxDelivery) -> MeshResult<()> {
        let relayed = self.relays(&delivery);
        let RxDelivery { from, frame } = delivery;
        let (_, assignment) = buffer.inbound().find(frame.offset).ok_or_else(|| {
            MeshError::InvalidAssignment(format!(
                "no inbound assignment at offset {}",
                frame.offset
            ))
        })?;
        if assignment.origin != frame.origin || assignment.peer != AssignmentPeer::Source(from) {
            return Err(MeshError::InvalidAssignment(format!(
                "chunk at offset {} from {} (origin {}) does not match {:?}",
                frame.offset, from, frame.origin, assignment
            )));
        }

        let key = self.keys.get(buffer.spec().participants)?;
        let context = ChunkContext {
            buffer_id: frame.buffer_id,
            generation: frame.generation,
            offset: frame.offset,
        };
        let plaintext = open_chunk(
            &key,
            frame.origin,
            context,
            &frame.payload,
            &frame.tag,
            frame.nonce,
        )
        .inspect_err(|e| {
            if matches!(e, MeshError::AuthFailed { .. }) {
                self.metrics.record_auth_failure();
            }
        })?;
        self.metrics.record_decrypted();

        buffer.store_chunk(frame.offset, plaintext)?;
        let ready = buffer.on_chunk_ready(frame.offset, frame.tag)?;
        log::debug!(
            buffer_id = frame.buffer_id,
            generation = frame.generation,
            offset = frame.offset,
            origin = %frame.origin,
            "Chunk received"
        );
        if relayed {
            self.forwarder
                .submit(ForwardEvent::RxFlowComplete {
                    buffer_id: frame.buffer_id,
                    origin: frame.origin,
                    generation: frame.generation,
                    offset: frame.offset,
                })
                .await?;
        }
        if let ChunkReady::Received {
            generation_complete: true,
        } = ready
        {
            self.metrics.record_generation_complete(buffer.id());
        }
        Ok(())
    }

    /// True when the local node relays this chunk onwards.
    fn relays(&self, delivery: &RxDelivery) -> bool {
        let frame = &delivery.frame;
        frame.via.is_none()
            && delivery.from == frame.origin
            && self
                .forwarder
                .chain(frame.buffer_id, frame.origin)
                .is_some()
    }

    pub(super) async fn rx_worker(
        self: Arc<Self>,
        deliveries: async_channel::Receiver<RxDelivery>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("RX worker started");
        loop {
            tokio::select! {
                delivery = deliveries.recv() => {
                    let Ok(delivery) = delivery else { break };
                    self.receive(delivery).await;
                }
                _ = shutdown.changed() => {
                    log::info!("RX worker received shutdown signal");
                    break;
                }
            }
        }
        log::info!("RX worker stopped");
    }

    async fn receive(&self, delivery: RxDelivery) {
        let buffer_id = delivery.frame.buffer_id;
        let Some(buffer) = self.buffer(buffer_id) else {
            log::warn!(buffer_id, from = %delivery.from, "Dropping chunk for unknown buffer");
            return;
        };
        match buffer.admit_rx(delivery) {
            (Admission::Process, Some(delivery)) => {
                if let Err(e) = self.process_delivery(&buffer, delivery).await {
                    self.fail_buffer(&buffer, &e);
                }
            }
            (Admission::Deferred, _) => self.metrics.record_deferred(),
            (Admission::Stale, _) | (Admission::Process, None) => {
                log::debug!(buffer_id, "Dropping chunk of a finished generation");
                self.metrics.record_stale();
            }
        }
    }

    /// Hands an admitted chunk to the forwarder (when relayed here) and queues
    /// its decryption.
    pub(super) async fn process_delivery(
        &self,
        buffer: &Arc<BufferState>,
        delivery: RxDelivery,
    ) -> MeshResult<()> {
        if self.relays(&delivery) {
            self.forwarder
                .submit(ForwardEvent::RxComplete {
                    frame: delivery.frame.clone(),
                })
                .await?;
        }
        self.crypto_jobs
            .send(CryptoJob::Decrypt {
                buffer: Arc::clone(buffer),
                delivery,
            })
            .await
            .map_err(|_| MeshError::ShutDown)
    }

    pub(super) async fn tx_worker(
        self: Arc<Self>,
        own: async_channel::Receiver<TxSubmission>,
        forwarded: async_channel::Receiver<ForwardTx>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("TX worker started");
        loop {
            tokio::select! {
                Ok(tx) = forwarded.recv() => self.transmit(tx.frame, tx.link, true).await,
                Ok(tx) = own.recv() => self.transmit(tx.frame, tx.dest, false).await,
                _ = shutdown.changed() => {
                    log::info!("TX worker received shutdown signal");
                    break;
                }
                else => break,
            }
        }
        log::info!("TX worker stopped");
    }

    async fn transmit(&self, frame: ChunkFrame, dest: NodeId, forwarded: bool) {
        let (buffer_id, generation, offset, origin, tag) = (
            frame.buffer_id,
            frame.generation,
            frame.offset,
            frame.origin,
            frame.tag,
        );
        if let Err(e) = self.transport.submit_tx(TxSubmission { dest, frame }).await {
            self.metrics.record_transmit_error();
            log::warn!(buffer_id, offset, %dest, error = %e, "Transmit failed");
            if let Some(buffer) = self.buffer(buffer_id) {
                self.fail_buffer(&buffer, &e);
            }
            return;
        }
        self.metrics.record_transmitted(forwarded);

        if forwarded {
            let event = ForwardEvent::TxComplete {
                buffer_id,
                origin,
                generation,
                offset,
                link: dest,
            };
            if let Err(e) = self.forwarder.submit(event).await {
                log::error!(buffer_id, offset, error = %e, "Lost forward completion");
            }
        }

        let Some(buffer) = self.buffer(buffer_id) else {
            log::debug!(buffer_id, "Transmit completed for a deregistered buffer");
            return;
        };
        match buffer.on_tx_complete(offset, dest, tag) {
            Ok(true) => self.metrics.record_generation_complete(buffer_id),
            Ok(false) => {}
            Err(e) => self.fail_buffer(&buffer, &e),
        }
    }

    pub(super) async fn control_worker(
        self: Arc<Self>,
        messages: async_channel::Receiver<(NodeId, Bytes)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        log::info!("Control worker started");
        loop {
            tokio::select! {
                message = messages.recv() => {
                    let Ok((from, raw)) = message else { break };
                    self.handle_control(from, &raw);
                }
                _ = shutdown.changed() => {
                    log::info!("Control worker received shutdown signal");
                    break;
                }
            }
        }
        log::info!("Control worker stopped");
    }

    fn handle_control(&self, from: NodeId, raw: &[u8]) {
        let message = match ControlMessage::decode(raw) {
            Ok(message) => message,
            Err(e) => {
                log::warn!(%from, error = %e, "Dropping malformed control message");
                return;
            }
        };
        if message.sender != from.rank() {
            log::warn!(%from, sender = message.sender, "Control message sender mismatch");
            return;
        }
        log::debug!(
            %from,
            sequence = message.sequence,
            commands = message.commands.len(),
            "Control message"
        );
        for command in message.commands {
            if let Err(e) = self.apply_control(command) {
                log::warn!(%from, ?command, error = %e, "Rejected control command");
            }
        }
    }

    fn apply_control(&self, command: ControlCommand) -> MeshResult<()> {
        match command {
            ControlCommand::TxAssignment {
                buffer_id,
                origin,
                offset,
                size,
                dest_mask,
            } => {
                if NodeMask::from_bits(dest_mask).contains(self.local) {
                    self.record_announcement(
                        buffer_id,
                        Announcement {
                            origin: NodeId::new(origin)?,
                            via: None,
                            offset,
                            size,
                        },
                    );
                }
            }
            ControlCommand::TxForward {
                buffer_id,
                origin,
                via,
                offset,
                size,
                dest_mask,
            } => {
                if NodeMask::from_bits(dest_mask).contains(self.local) {
                    self.record_announcement(
                        buffer_id,
                        Announcement {
                            origin: NodeId::new(origin)?,
                            via: Some(NodeId::new(via)?),
                            offset,
                            size,
                        },
                    );
                }
            }
            ControlCommand::StartGeneration { rank, generation } => {
                let peer = NodeId::new(rank)?;
                self.peer_generations[peer.index()].fetch_max(generation, Ordering::AcqRel);
                self.sync_signal.notify();
            }
            other => log::debug!(command = ?other, "Ignoring control command"),
        }
        Ok(())
    }

    /// Announcements may arrive before the buffer is registered locally; those
    /// are parked and applied at registration.
    fn record_announcement(&self, buffer_id: u64, announcement: Announcement) {
        let mut pending = self.pending_announcements.lock();
        match self.buffer(buffer_id) {
            Some(buffer) => buffer.announce(announcement),
            None => pending.entry(buffer_id).or_default().push(announcement),
        }
    }

    /// Fails `buffer` and stops its forward chains. Shutdown is not a failure.
    fn fail_buffer(&self, buffer: &BufferState, cause: &MeshError) {
        if matches!(cause, MeshError::ShutDown) {
            log::debug!(buffer_id = buffer.id(), "Dropping work during shutdown");
            return;
        }
        if cause.is_resource_exhausted() && buffer.stall(cause) {
            return;
        }
        buffer.abort(cause);
        for chain in self.forwarder.chains_for(buffer.id()) {
            chain.stop();
        }
    }
}
