//! One shared buffer across many generations.
//!
//! The receive path consults only atomics to admit a chunk. The deferred-delivery
//! mutex is taken when a chunk belongs to a generation this node has not started
//! yet, and by `start_generation` itself, so a delivery racing a generation start
//! is either processed or parked, never lost.

use std::{
    collections::BTreeMap,
    ops::Range,
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::{ArcSwap, ArcSwapOption};
use bag_protocol::AuthTag;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing as log;

use crate::{
    assignment::{Assignment, AssignmentMap, AssignmentPeer, Direction},
    error::{ExhaustionReason, MeshError, MeshResult},
    geometry::BufferGeometry,
    node::{NodeId, NodeMask, Topology},
    plan::SyncPlan,
    signal::WaitSignal,
    transport::RxDelivery,
};

/// What the control layer registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSpec {
    pub id: u64,
    pub geometry: BufferGeometry,
    pub participants: NodeMask,
    /// Section the local node's partition owns
    pub section: u32,
    /// Generations before the buffer terminates, 0 to repeat indefinitely
    pub max_reads: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BufferPhase {
    Idle = 0,
    InFlight = 1,
    Complete = 2,
    Exhausted = 3,
    Failed = 4,
}

impl BufferPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => BufferPhase::InFlight,
            2 => BufferPhase::Complete,
            3 => BufferPhase::Exhausted,
            4 => BufferPhase::Failed,
            _ => BufferPhase::Idle,
        }
    }
}

/// A peer's notice that it will transmit `[offset, offset + size)` to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub origin: NodeId,
    /// Relay the chunk passes through, `None` when sent by its origin
    pub via: Option<NodeId>,
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Process,
    /// Parked until the local node starts that generation.
    Deferred,
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkReady {
    /// A chunk of the local block is sealed and must go out on `links`.
    Transmit { links: NodeMask },
    Received { generation_complete: bool },
}

/// A generation whose encryption stopped on an exhausted key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stall {
    pub generation: u64,
    pub mask: u32,
    pub reason: ExhaustionReason,
}

impl Stall {
    pub fn error(&self) -> MeshError {
        MeshError::KeyExhausted {
            mask: self.mask,
            reason: self.reason,
        }
    }
}

pub struct BufferState {
    spec: BufferSpec,
    local: NodeId,
    plan: SyncPlan,
    inbound: AssignmentMap,
    outbound: AssignmentMap,
    signal: Arc<WaitSignal>,
    generation: AtomicU64,
    phase: AtomicU8,
    remaining_reads: AtomicU64,
    chunks: Box<[ArcSwap<Bytes>]>,
    /// Last generation each chunk of the local block was sealed for
    sealed: Box<[AtomicU64]>,
    stall: ArcSwapOption<Stall>,
    announcements: Mutex<BTreeMap<u64, Announcement>>,
    deferred: Mutex<Vec<RxDelivery>>,
}

impl std::fmt::Debug for BufferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferState")
            .field("id", &self.spec.id)
            .field("local", &self.local)
            .field("generation", &self.generation())
            .field("phase", &self.phase())
            .field("inbound", &self.inbound)
            .field("outbound", &self.outbound)
            .finish_non_exhaustive()
    }
}

impl BufferState {
    pub fn new(spec: BufferSpec, local: NodeId, topology: &Topology) -> MeshResult<Self> {
        spec.geometry.validate()?;
        if spec.section >= spec.geometry.sections {
            return Err(MeshError::InvalidGeometry(format!(
                "section {} outside {} sections",
                spec.section, spec.geometry.sections
            )));
        }
        let plan = SyncPlan::broadcast_and_gather(
            &spec.geometry,
            local,
            spec.participants,
            topology,
            spec.section,
        )?;
        let total_chunks = (spec.geometry.size() / spec.geometry.chunk_size) as usize;
        let chunk_size = spec.geometry.chunk_size as usize;
        let zero = Bytes::from(vec![0u8; chunk_size]);
        let chunks = (0..total_chunks)
            .map(|_| ArcSwap::from_pointee(zero.clone()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let signal = Arc::new(WaitSignal::new());

        Ok(Self {
            local,
            plan,
            inbound: AssignmentMap::new(spec.id, Direction::In, Arc::clone(&signal)),
            outbound: AssignmentMap::new(spec.id, Direction::Out, Arc::clone(&signal)),
            signal,
            generation: AtomicU64::new(0),
            phase: AtomicU8::new(BufferPhase::Idle as u8),
            remaining_reads: AtomicU64::new(spec.max_reads),
            chunks,
            sealed: (0..spec.geometry.chunks_per_block())
                .map(|_| AtomicU64::new(0))
                .collect(),
            stall: ArcSwapOption::empty(),
            announcements: Mutex::new(BTreeMap::new()),
            deferred: Mutex::new(Vec::new()),
            spec,
        })
    }

    pub fn id(&self) -> u64 {
        self.spec.id
    }

    pub fn spec(&self) -> &BufferSpec {
        &self.spec
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    pub fn plan(&self) -> &SyncPlan {
        &self.plan
    }

    pub fn geometry(&self) -> &BufferGeometry {
        &self.spec.geometry
    }

    pub fn inbound(&self) -> &AssignmentMap {
        &self.inbound
    }

    pub fn outbound(&self) -> &AssignmentMap {
        &self.outbound
    }

    pub fn signal(&self) -> &Arc<WaitSignal> {
        &self.signal
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// An abort raised through the shared signal (by a forward chain, or on
    /// deregistration) also counts as failure.
    pub fn phase(&self) -> BufferPhase {
        if self.signal.abort_reason().is_some() {
            return BufferPhase::Failed;
        }
        BufferPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn remaining_reads(&self) -> Option<u64> {
        (self.spec.max_reads > 0).then(|| self.remaining_reads.load(Ordering::Acquire))
    }

    pub fn own_block(&self) -> Range<u64> {
        self.spec.geometry.block_range(self.spec.section, self.local)
    }

    pub fn is_own_offset(&self, offset: u64) -> bool {
        self.own_block().contains(&offset)
    }

    /// Offsets of the chunks `origin` contributes in the local section.
    pub fn chunk_offsets_of(&self, origin: NodeId) -> impl Iterator<Item = u64> {
        self.spec.geometry.chunk_offsets(self.spec.section, origin)
    }

    fn outbound_expected(&self) -> usize {
        let chunks = self.spec.geometry.chunks_per_block();
        let own = if self.plan.broadcast_links().is_empty() {
            0
        } else {
            chunks
        };
        own + self.plan.forwards().count() * chunks
    }

    /// Creates the outbound assignments the plan calls for and returns the ones
    /// that did not exist before.
    pub fn create_outbound(&self) -> MeshResult<Vec<Assignment>> {
        let size = self.spec.geometry.chunk_size;
        let mut created = Vec::new();
        let links = self.plan.broadcast_links();
        let mut targets: Vec<(NodeId, NodeMask)> = Vec::new();
        if !links.is_empty() {
            targets.push((self.local, links));
        }
        targets.extend(self.plan.forwards());

        for (origin, links) in targets {
            for offset in self.chunk_offsets_of(origin) {
                if self.outbound.index_of(offset).is_some() {
                    continue;
                }
                let index =
                    self.outbound
                        .create(offset, size, origin, AssignmentPeer::Links(links))?;
                if let Some(assignment) = self.outbound.get(index) {
                    created.push(assignment);
                }
            }
        }
        Ok(created)
    }

    /// Records a peer's outbound notice for a chunk headed to this node.
    pub fn announce(&self, announcement: Announcement) {
        self.announcements
            .lock()
            .insert(announcement.offset, announcement);
    }

    /// Creates every inbound assignment whose sender has announced it.
    /// Returns `PeerNotReady` while some are still unannounced.
    pub fn create_inbound(&self) -> MeshResult<usize> {
        let size = self.spec.geometry.chunk_size;
        let mut pending = 0;
        let gathers: Vec<_> = self.plan.gathers().collect();
        for (origin, via) in gathers {
            let source = via.unwrap_or(origin);
            for offset in self.chunk_offsets_of(origin) {
                if self.inbound.index_of(offset).is_some() {
                    continue;
                }
                let announced = self.announcements.lock().get(&offset).copied();
                match announced {
                    Some(a) if a.origin == origin && a.via == via && a.size == size => {
                        self.inbound
                            .create(offset, size, origin, AssignmentPeer::Source(source))?;
                    }
                    Some(a) => {
                        return Err(MeshError::InvalidAssignment(format!(
                            "announcement {:?} does not match route {} via {:?}",
                            a, origin, via
                        )))
                    }
                    None => pending += 1,
                }
            }
        }
        if pending > 0 {
            return Err(MeshError::PeerNotReady {
                buffer_id: self.spec.id,
                pending,
            });
        }
        Ok(self.inbound.len())
    }

    pub fn assignments_complete(&self) -> bool {
        self.inbound.len() == self.plan.expected_reads()
            && self.outbound.len() == self.outbound_expected()
    }

    /// Overwrites the local block. Refused while a generation is in flight.
    pub fn write(&self, data: &[u8]) -> MeshResult<()> {
        match self.phase() {
            BufferPhase::InFlight => return Err(MeshError::GenerationInFlight(self.spec.id)),
            BufferPhase::Exhausted => return Err(MeshError::UseAfterCompletion(self.spec.id)),
            BufferPhase::Failed => return Err(self.aborted_error()),
            BufferPhase::Idle | BufferPhase::Complete => {}
        }
        let block = self.own_block();
        if data.len() as u64 != block.end - block.start {
            return Err(MeshError::InvalidGeometry(format!(
                "write of {} bytes into a {}-byte block",
                data.len(),
                block.end - block.start
            )));
        }
        let data = Bytes::copy_from_slice(data);
        let chunk_size = self.spec.geometry.chunk_size as usize;
        for (i, offset) in self.chunk_offsets_of(self.local).enumerate() {
            let chunk = data.slice(i * chunk_size..(i + 1) * chunk_size);
            self.chunks[self.chunk_slot(offset)].store(Arc::new(chunk));
        }
        Ok(())
    }

    /// Copies `len` bytes at `offset`. Refused while a generation is in flight
    /// and once the buffer has terminated.
    pub fn read(&self, offset: u64, len: u64) -> MeshResult<Bytes> {
        match self.phase() {
            BufferPhase::InFlight => return Err(MeshError::GenerationInFlight(self.spec.id)),
            BufferPhase::Exhausted => return Err(MeshError::UseAfterCompletion(self.spec.id)),
            BufferPhase::Failed => return Err(self.aborted_error()),
            BufferPhase::Idle | BufferPhase::Complete => {}
        }
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= self.spec.geometry.size())
            .ok_or_else(|| {
                MeshError::InvalidGeometry(format!("read [{}, +{}) outside buffer", offset, len))
            })?;
        if len == 0 {
            return Ok(Bytes::new());
        }
        let chunk_size = self.spec.geometry.chunk_size;
        let first = offset / chunk_size;
        if len <= chunk_size - offset % chunk_size {
            let chunk = self.chunks[first as usize].load_full();
            let start = (offset % chunk_size) as usize;
            return Ok(chunk.slice(start..start + len as usize));
        }
        let mut out = BytesMut::with_capacity(len as usize);
        let mut cursor = offset;
        while cursor < end {
            let chunk = self.chunks[(cursor / chunk_size) as usize].load_full();
            let start = (cursor % chunk_size) as usize;
            let take = ((chunk_size - start as u64).min(end - cursor)) as usize;
            out.extend_from_slice(&chunk[start..start + take]);
            cursor += take as u64;
        }
        Ok(out.freeze())
    }

    fn chunk_slot(&self, offset: u64) -> usize {
        (offset / self.spec.geometry.chunk_size) as usize
    }

    /// Plaintext of the chunk at `offset`.
    pub fn chunk(&self, offset: u64) -> MeshResult<Bytes> {
        self.spec.geometry.chunk_range(offset)?;
        Ok(Bytes::clone(&self.chunks[self.chunk_slot(offset)].load()))
    }

    /// Stores a decrypted inbound chunk.
    pub fn store_chunk(&self, offset: u64, plaintext: Bytes) -> MeshResult<()> {
        let range = self.spec.geometry.chunk_range(offset)?;
        if plaintext.len() as u64 != range.end - range.start {
            return Err(MeshError::InvalidGeometry(format!(
                "chunk of {} bytes at offset {}",
                plaintext.len(),
                offset
            )));
        }
        self.chunks[self.chunk_slot(offset)].store(Arc::new(plaintext));
        Ok(())
    }

    fn aborted_error(&self) -> MeshError {
        MeshError::BufferAborted(
            self.signal
                .abort_reason()
                .map(|r| r.to_string())
                .unwrap_or_default(),
        )
    }

    /// Advances to the next generation and returns it with the deliveries that
    /// were parked for it.
    pub fn start_generation(&self) -> MeshResult<(u64, Vec<RxDelivery>)> {
        match self.phase() {
            BufferPhase::InFlight => return Err(MeshError::GenerationInFlight(self.spec.id)),
            BufferPhase::Exhausted => {
                log::error!(buffer_id = self.spec.id, "Generation start after termination");
                return Err(MeshError::UseAfterCompletion(self.spec.id));
            }
            BufferPhase::Failed => return Err(self.aborted_error()),
            BufferPhase::Idle | BufferPhase::Complete => {}
        }
        if !self.assignments_complete() {
            return Err(MeshError::AssignmentsIncomplete(self.spec.id));
        }

        let mut deferred = self.deferred.lock();
        self.stall.store(None);
        self.inbound.reset();
        self.outbound.reset();
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.phase
            .store(BufferPhase::InFlight as u8, Ordering::Release);

        let parked = std::mem::take(&mut *deferred);
        let (replay, later): (Vec<_>, Vec<_>) = parked
            .into_iter()
            .filter(|d| d.frame.generation >= generation)
            .partition(|d| d.frame.generation == generation);
        *deferred = later;
        drop(deferred);

        log::info!(
            buffer_id = self.spec.id,
            generation,
            replayed = replay.len(),
            "Generation started"
        );
        self.try_complete();
        Ok((generation, replay))
    }

    /// Decides what to do with a chunk of `generation` that just arrived.
    pub fn admit_rx(&self, delivery: RxDelivery) -> (Admission, Option<RxDelivery>) {
        let generation = delivery.frame.generation;
        let current = self.generation();
        if generation == current && self.phase() == BufferPhase::InFlight {
            return (Admission::Process, Some(delivery));
        }
        if generation < current {
            return (Admission::Stale, None);
        }

        let mut deferred = self.deferred.lock();
        let current = self.generation();
        if generation == current && self.phase() == BufferPhase::InFlight {
            (Admission::Process, Some(delivery))
        } else if generation > current {
            log::debug!(
                buffer_id = self.spec.id,
                generation,
                current,
                offset = delivery.frame.offset,
                "Parking chunk for a generation not started yet"
            );
            deferred.push(delivery);
            (Admission::Deferred, None)
        } else {
            (Admission::Stale, None)
        }
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.lock().len()
    }

    /// Called once a chunk is sealed (local block) or verified (inbound).
    pub fn on_chunk_ready(&self, offset: u64, tag: AuthTag) -> MeshResult<ChunkReady> {
        if self.is_own_offset(offset) {
            return Ok(ChunkReady::Transmit {
                links: self.plan.broadcast_links(),
            });
        }
        let (index, _) = self.inbound.find(offset).ok_or_else(|| {
            MeshError::InvalidAssignment(format!("no inbound assignment at offset {}", offset))
        })?;
        if let Err(e) = self.inbound.mark_ready(index, tag) {
            if e.is_fatal() {
                self.abort(&e);
            }
            return Err(e);
        }
        Ok(ChunkReady::Received {
            generation_complete: self.try_complete(),
        })
    }

    /// Called when the transmit of `offset` on `link` completed. Returns true
    /// when this completed the generation.
    pub fn on_tx_complete(&self, offset: u64, link: NodeId, tag: AuthTag) -> MeshResult<bool> {
        let (index, _) = self.outbound.find(offset).ok_or_else(|| {
            MeshError::InvalidAssignment(format!("no outbound assignment at offset {}", offset))
        })?;
        if self.outbound.mark_link_complete(index, link)? {
            if let Err(e) = self.outbound.mark_ready(index, tag) {
                if e.is_fatal() {
                    self.abort(&e);
                }
                return Err(e);
            }
        }
        Ok(self.try_complete())
    }

    pub fn all_received(&self) -> bool {
        self.inbound.all_ready()
    }

    pub fn all_sent(&self) -> bool {
        self.outbound.all_ready()
    }

    /// Moves an in-flight generation to complete once both maps are ready.
    pub fn try_complete(&self) -> bool {
        if !(self.all_received() && self.all_sent()) {
            return false;
        }
        if self
            .phase
            .compare_exchange(
                BufferPhase::InFlight as u8,
                BufferPhase::Complete as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        let generation = self.generation();
        if self.spec.max_reads > 0 {
            let remaining = self.remaining_reads.fetch_sub(1, Ordering::AcqRel) - 1;
            if remaining == 0 {
                self.phase
                    .store(BufferPhase::Exhausted as u8, Ordering::Release);
                log::info!(
                    buffer_id = self.spec.id,
                    generation,
                    "Buffer reached its read limit"
                );
            }
        }
        log::info!(buffer_id = self.spec.id, generation, "Generation complete");
        self.signal.notify();
        true
    }

    pub fn is_generation_complete(&self, generation: u64) -> bool {
        let current = self.generation();
        current > generation
            || (current == generation
                && matches!(
                    self.phase(),
                    BufferPhase::Complete | BufferPhase::Exhausted
                ))
    }

    /// Generations this buffer has finished so far.
    pub fn completed_generations(&self) -> u64 {
        let generation = self.generation();
        if self.is_generation_complete(generation) {
            generation
        } else {
            generation.saturating_sub(1)
        }
    }

    /// Records that the current generation cannot finish sealing the local
    /// block until a new key is installed. Returns false for causes that are
    /// not key exhaustion.
    pub fn stall(&self, cause: &MeshError) -> bool {
        let MeshError::KeyExhausted { mask, reason } = *cause else {
            return false;
        };
        let generation = self.generation();
        let previous = self.stall.swap(Some(Arc::new(Stall {
            generation,
            mask,
            reason,
        })));
        if previous.is_none() {
            log::warn!(
                buffer_id = self.spec.id,
                generation,
                error = %cause,
                "Generation stalled until the key is rotated"
            );
        }
        self.signal.notify();
        true
    }

    /// The stall of the current generation, if any.
    pub fn stalled(&self) -> Option<Stall> {
        self.stall
            .load()
            .as_deref()
            .copied()
            .filter(|stall| stall.generation == self.generation())
    }

    /// Picks a stalled generation back up. Returns its number.
    pub fn resume_generation(&self) -> MeshResult<u64> {
        if self.phase() != BufferPhase::InFlight || self.stalled().is_none() {
            return Err(MeshError::GenerationInFlight(self.spec.id));
        }
        self.stall.store(None);
        let generation = self.generation();
        log::info!(buffer_id = self.spec.id, generation, "Generation resumed");
        Ok(generation)
    }

    fn own_chunk_index(&self, offset: u64) -> Option<usize> {
        self.is_own_offset(offset)
            .then(|| ((offset - self.own_block().start) / self.spec.geometry.chunk_size) as usize)
    }

    /// Claims the chunk at `offset` of the local block as sealed for
    /// `generation`. False if it already was.
    pub fn mark_sealed(&self, offset: u64, generation: u64) -> bool {
        self.own_chunk_index(offset)
            .and_then(|index| self.sealed.get(index))
            .is_some_and(|slot| slot.fetch_max(generation, Ordering::AcqRel) < generation)
    }

    pub fn is_sealed(&self, offset: u64, generation: u64) -> bool {
        self.own_chunk_index(offset)
            .and_then(|index| self.sealed.get(index))
            .is_some_and(|slot| slot.load(Ordering::Acquire) >= generation)
    }

    pub async fn wait_all_received(&self, timeout: Duration) -> MeshResult<()> {
        self.signal
            .wait_until("inbound chunks", timeout, || Ok(self.all_received()))
            .await
    }

    pub async fn wait_generation(&self, generation: u64, timeout: Duration) -> MeshResult<()> {
        self.signal
            .wait_until("generation completion", timeout, || {
                if self.is_generation_complete(generation) {
                    return Ok(true);
                }
                match self.stalled() {
                    Some(stall) if stall.generation == generation => Err(stall.error()),
                    _ => Ok(false),
                }
            })
            .await
    }

    pub fn interrupt(&self) {
        log::info!(buffer_id = self.spec.id, "Buffer interrupted");
        self.signal.interrupt();
    }

    pub fn clear_interrupt(&self) {
        self.signal.clear_interrupt();
    }

    /// Freezes both maps against further completions.
    pub fn hold(&self) {
        self.inbound.hold();
        self.outbound.hold();
    }

    pub fn release(&self) {
        self.inbound.release();
        self.outbound.release();
    }

    /// Stops all processing of this buffer after an invariant violation.
    pub fn abort(&self, cause: &MeshError) {
        self.phase.store(BufferPhase::Failed as u8, Ordering::Release);
        if self.signal.abort(cause.to_string()) {
            log::error!(buffer_id = self.spec.id, error = %cause, "Buffer aborted");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crypto_key::ChunkNonce, transport::ChunkFrame};

    fn n(rank: u8) -> NodeId {
        NodeId::new(rank).unwrap()
    }

    fn spec(max_reads: u64) -> BufferSpec {
        BufferSpec {
            id: 5,
            geometry: BufferGeometry::new(1, 2, 32, 16).unwrap(),
            participants: NodeMask::first_n(2),
            section: 0,
            max_reads,
        }
    }

    fn state(local: u8, max_reads: u64) -> BufferState {
        BufferState::new(spec(max_reads), n(local), &Topology::full(NodeMask::first_n(2)))
            .unwrap()
    }

    fn announce_all(buffer: &BufferState, origin: u8) {
        for offset in buffer.chunk_offsets_of(n(origin)).collect::<Vec<_>>() {
            buffer.announce(Announcement {
                origin: n(origin),
                via: None,
                offset,
                size: 16,
            });
        }
    }

    fn prepared(local: u8, max_reads: u64) -> BufferState {
        let buffer = state(local, max_reads);
        buffer.create_outbound().unwrap();
        announce_all(&buffer, 1 - local);
        buffer.create_inbound().unwrap();
        buffer
    }

    fn delivery(generation: u64, offset: u64) -> RxDelivery {
        RxDelivery {
            from: n(1),
            frame: ChunkFrame {
                buffer_id: 5,
                generation,
                offset,
                origin: n(1),
                via: None,
                payload: Bytes::from_static(&[0u8; 16]),
                tag: AuthTag::ZERO,
                nonce: ChunkNonce {
                    prefix: [1; 8],
                    counter: 0,
                },
            },
        }
    }

    /// Runs one full generation on node 0 without a transport.
    fn complete_generation(buffer: &BufferState) -> bool {
        let mut complete = false;
        for offset in [0, 16] {
            complete |= buffer.on_tx_complete(offset, n(1), AuthTag::ZERO).unwrap();
        }
        for offset in [32, 48] {
            if let ChunkReady::Received {
                generation_complete,
            } = buffer.on_chunk_ready(offset, AuthTag::from([offset as u8; 16])).unwrap()
            {
                complete |= generation_complete;
            }
        }
        complete
    }

    #[test]
    fn test_inbound_waits_for_announcements() {
        let buffer = state(0, 0);
        buffer.create_outbound().unwrap();
        assert!(matches!(
            buffer.create_inbound(),
            Err(MeshError::PeerNotReady { pending: 2, .. })
        ));
        buffer.announce(Announcement {
            origin: n(1),
            via: None,
            offset: 32,
            size: 16,
        });
        assert!(matches!(
            buffer.create_inbound(),
            Err(MeshError::PeerNotReady { pending: 1, .. })
        ));
        assert!(matches!(
            buffer.start_generation(),
            Err(MeshError::AssignmentsIncomplete(5))
        ));
        announce_all(&buffer, 1);
        assert_eq!(buffer.create_inbound().unwrap(), 2);
        assert!(buffer.assignments_complete());
    }

    #[test]
    fn test_generation_lifecycle() {
        let buffer = prepared(0, 0);
        buffer.write(&[0xFF; 32]).unwrap();
        let (generation, replay) = buffer.start_generation().unwrap();
        assert_eq!(generation, 1);
        assert!(replay.is_empty());
        assert!(matches!(
            buffer.write(&[0; 32]),
            Err(MeshError::GenerationInFlight(5))
        ));
        assert!(matches!(
            buffer.on_chunk_ready(0, AuthTag::ZERO).unwrap(),
            ChunkReady::Transmit { links } if links == NodeMask::single(n(1))
        ));
        assert!(complete_generation(&buffer));
        assert_eq!(buffer.phase(), BufferPhase::Complete);
        assert!(buffer.is_generation_complete(1));
        assert_eq!(buffer.inbound().tag(1), Some(AuthTag::from([48; 16])));
        assert_eq!(&buffer.read(0, 32).unwrap()[..], &[0xFF; 32][..]);

        let (generation, _) = buffer.start_generation().unwrap();
        assert_eq!(generation, 2);
        assert!(!buffer.all_received());
    }

    #[test]
    fn test_bounded_reads_terminate() {
        let buffer = prepared(0, 1);
        buffer.start_generation().unwrap();
        assert!(complete_generation(&buffer));
        assert_eq!(buffer.phase(), BufferPhase::Exhausted);
        assert_eq!(buffer.remaining_reads(), Some(0));
        assert!(matches!(
            buffer.start_generation(),
            Err(MeshError::UseAfterCompletion(5))
        ));
        assert!(matches!(
            buffer.write(&[0; 32]),
            Err(MeshError::UseAfterCompletion(5))
        ));
        assert!(matches!(
            buffer.read(32, 16),
            Err(MeshError::UseAfterCompletion(5))
        ));
        assert!(matches!(
            buffer.read(64, 0),
            Err(MeshError::UseAfterCompletion(5))
        ));
    }

    #[test]
    fn test_admission_defers_future_generations() {
        let buffer = prepared(0, 0);
        assert_eq!(buffer.admit_rx(delivery(1, 32)).0, Admission::Deferred);
        assert_eq!(buffer.admit_rx(delivery(2, 48)).0, Admission::Deferred);
        assert_eq!(buffer.deferred_len(), 2);

        let (generation, replay) = buffer.start_generation().unwrap();
        assert_eq!(generation, 1);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].frame.offset, 32);
        assert_eq!(buffer.deferred_len(), 1);

        assert_eq!(buffer.admit_rx(delivery(1, 48)).0, Admission::Process);
        assert_eq!(buffer.admit_rx(delivery(0, 48)).0, Admission::Stale);
    }

    #[test]
    fn test_double_ready_aborts_buffer() {
        let buffer = prepared(0, 0);
        buffer.start_generation().unwrap();
        buffer.on_chunk_ready(32, AuthTag::ZERO).unwrap();
        assert!(matches!(
            buffer.on_chunk_ready(32, AuthTag::ZERO),
            Err(MeshError::DoubleReady { offset: 32 })
        ));
        assert_eq!(buffer.phase(), BufferPhase::Failed);
        assert!(matches!(buffer.signal().check(), Err(MeshError::BufferAborted(_))));
        assert!(matches!(
            buffer.start_generation(),
            Err(MeshError::BufferAborted(_))
        ));
    }

    #[test]
    fn test_read_spanning_chunks() {
        let buffer = prepared(1, 0);
        let block: Vec<u8> = (0..32u8).collect();
        buffer.write(&block).unwrap();
        assert_eq!(&buffer.read(40, 16).unwrap()[..], &block[8..24]);
        assert_eq!(&buffer.read(36, 4).unwrap()[..], &block[4..8]);
        assert!(buffer.read(60, 8).is_err());
        assert!(buffer.write(&[0; 31]).is_err());
    }

    #[test]
    fn test_read_at_buffer_end() {
        let buffer = prepared(1, 0);
        let block: Vec<u8> = (0..32u8).collect();
        buffer.write(&block).unwrap();
        let size = buffer.geometry().size();
        assert!(buffer.read(size, 0).unwrap().is_empty());
        assert_eq!(&buffer.read(size - 1, 1).unwrap()[..], &block[31..]);
        assert_eq!(&buffer.chunk(48).unwrap()[..], &block[16..]);
        assert!(matches!(
            buffer.read(size, 1),
            Err(MeshError::InvalidGeometry(_))
        ));
        assert!(matches!(
            buffer.read(size + 1, 0),
            Err(MeshError::InvalidGeometry(_))
        ));
    }

    #[tokio::test]
    async fn test_key_exhaustion_stalls_generation() {
        let buffer = prepared(0, 0);
        let exhausted = MeshError::KeyExhausted {
            mask: 0b11,
            reason: ExhaustionReason::Nonces,
        };
        assert!(!buffer.stall(&MeshError::Interrupted));
        buffer.start_generation().unwrap();
        assert!(buffer.mark_sealed(0, 1));
        assert!(!buffer.mark_sealed(0, 1));
        assert!(!buffer.mark_sealed(32, 1));
        assert!(buffer.stall(&exhausted));
        assert_eq!(buffer.phase(), BufferPhase::InFlight);
        assert!(matches!(
            buffer.wait_generation(1, Duration::from_secs(30)).await,
            Err(MeshError::KeyExhausted {
                reason: ExhaustionReason::Nonces,
                ..
            })
        ));

        assert_eq!(buffer.resume_generation().unwrap(), 1);
        assert!(buffer.stalled().is_none());
        assert!(matches!(
            buffer.resume_generation(),
            Err(MeshError::GenerationInFlight(5))
        ));
        assert!(buffer.is_sealed(0, 1));
        assert!(!buffer.is_sealed(16, 1));
        assert!(complete_generation(&buffer));
        buffer.wait_generation(1, Duration::from_secs(1)).await.unwrap();
        assert!(!buffer.is_sealed(0, 2));
    }

    #[tokio::test]
    async fn test_interrupted_wait() {
        let buffer = Arc::new(prepared(0, 0));
        buffer.start_generation().unwrap();
        let waiter = {
            let buffer = Arc::clone(&buffer);
            tokio::spawn(async move { buffer.wait_all_received(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        buffer.interrupt();
        assert!(matches!(waiter.await.unwrap(), Err(MeshError::Interrupted)));
        buffer.clear_interrupt();
    }
}
