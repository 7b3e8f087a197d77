//! Assignments bind byte ranges of a buffer to links and a direction.
//!
//! Bindings change rarely (buffer setup) and are published through an
//! `ArcSwap`, so lookups on the completion path never lock. Per-assignment
//! readiness lives in a preallocated slot table indexed by assignment index.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use arc_swap::ArcSwap;
use bag_protocol::AuthTag;
use parking_lot::Mutex;
use tracing as log;

use crate::{
    error::{MeshError, MeshResult},
    geometry::MAX_ASSIGNMENT_COUNT,
    node::{NodeId, NodeMask, MAX_NODES},
    signal::WaitSignal,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignmentPeer {
    /// Outbound: every link the range is transmitted on.
    Links(NodeMask),
    /// Inbound: the one link the range arrives from.
    Source(NodeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub offset: u64,
    pub size: u64,
    /// Node whose block the range belongs to.
    pub origin: NodeId,
    pub direction: Direction,
    pub peer: AssignmentPeer,
}

impl Assignment {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    pub fn links(&self) -> NodeMask {
        match self.peer {
            AssignmentPeer::Links(mask) => mask,
            AssignmentPeer::Source(node) => NodeMask::single(node),
        }
    }
}

#[derive(Debug, Default)]
struct Bindings {
    assignments: Vec<Assignment>,
    by_offset: BTreeMap<u64, usize>,
    by_node: Vec<Vec<usize>>,
}

const EMPTY: u8 = 0;
const WRITING: u8 = 1;
const READY: u8 = 2;

#[derive(Debug, Default)]
struct ReadySlot {
    state: AtomicU8,
    tag_hi: AtomicU64,
    tag_lo: AtomicU64,
    links_done: AtomicU32,
}

impl ReadySlot {
    fn clear(&self) {
        self.links_done.store(0, Ordering::Release);
        self.tag_hi.store(0, Ordering::Relaxed);
        self.tag_lo.store(0, Ordering::Relaxed);
        self.state.store(EMPTY, Ordering::Release);
    }
}

pub struct AssignmentMap {
    buffer_id: u64,
    direction: Direction,
    bindings: ArcSwap<Bindings>,
    create_lock: Mutex<()>,
    slots: Box<[ReadySlot]>,
    ready_count: AtomicUsize,
    held: AtomicBool,
    signal: Arc<WaitSignal>,
}

impl std::fmt::Debug for AssignmentMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssignmentMap")
            .field("buffer_id", &self.buffer_id)
            .field("direction", &self.direction)
            .field("len", &self.len())
            .field("ready", &self.ready_count())
            .field("held", &self.is_held())
            .finish()
    }
}

impl AssignmentMap {
    pub fn new(buffer_id: u64, direction: Direction, signal: Arc<WaitSignal>) -> Self {
        let slots = (0..MAX_ASSIGNMENT_COUNT)
            .map(|_| ReadySlot::default())
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            buffer_id,
            direction,
            bindings: ArcSwap::from_pointee(Bindings {
                by_node: vec![Vec::new(); MAX_NODES],
                ..Default::default()
            }),
            create_lock: Mutex::new(()),
            slots,
            ready_count: AtomicUsize::new(0),
            held: AtomicBool::new(false),
            signal,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Binds `[offset, offset + size)`. Never consults peers.
    pub fn create(
        &self,
        offset: u64,
        size: u64,
        origin: NodeId,
        peer: AssignmentPeer,
    ) -> MeshResult<usize> {
        match (self.direction, peer) {
            (Direction::Out, AssignmentPeer::Links(mask)) if !mask.is_empty() => {}
            (Direction::In, AssignmentPeer::Source(_)) => {}
            _ => {
                return Err(MeshError::InvalidAssignment(format!(
                    "{:?} assignment cannot bind {:?}",
                    self.direction, peer
                )))
            }
        }
        if size == 0 {
            return Err(MeshError::InvalidAssignment(format!(
                "empty assignment at offset {}",
                offset
            )));
        }
        let end = offset
            .checked_add(size)
            .ok_or_else(|| MeshError::InvalidAssignment("range overflows".into()))?;

        let _guard = self.create_lock.lock();
        let current = self.bindings.load();

        if current.by_offset.contains_key(&offset) {
            return Err(MeshError::DuplicateAssignment { offset });
        }
        let before = current.by_offset.range(..offset).next_back();
        let after = current.by_offset.range(offset..).next();
        let overlaps_before =
            before.is_some_and(|(_, &i)| current.assignments[i].end() > offset);
        let overlaps_after = after.is_some_and(|(&next, _)| next < end);
        if overlaps_before || overlaps_after {
            return Err(MeshError::OverlappingAssignment { offset, end });
        }
        if current.assignments.len() >= MAX_ASSIGNMENT_COUNT {
            return Err(MeshError::MapFull(MAX_ASSIGNMENT_COUNT));
        }

        let index = current.assignments.len();
        let assignment = Assignment {
            offset,
            size,
            origin,
            direction: self.direction,
            peer,
        };
        let mut next = Bindings {
            assignments: current.assignments.clone(),
            by_offset: current.by_offset.clone(),
            by_node: current.by_node.clone(),
        };
        next.assignments.push(assignment);
        next.by_offset.insert(offset, index);
        for node in assignment.links().iter() {
            next.by_node[node.index()].push(index);
        }
        self.slots[index].clear();
        self.bindings.store(Arc::new(next));

        log::debug!(
            buffer_id = self.buffer_id,
            direction = ?self.direction,
            offset,
            size,
            "Created assignment"
        );
        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.bindings.load().assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<Assignment> {
        self.bindings.load().assignments.get(index).copied()
    }

    pub fn index_of(&self, offset: u64) -> Option<usize> {
        self.bindings.load().by_offset.get(&offset).copied()
    }

    pub fn find(&self, offset: u64) -> Option<(usize, Assignment)> {
        let bindings = self.bindings.load();
        let index = *bindings.by_offset.get(&offset)?;
        Some((index, bindings.assignments[index]))
    }

    /// Assignments in creation order.
    pub fn assignments(&self) -> Vec<Assignment> {
        self.bindings.load().assignments.clone()
    }

    /// Indices of the assignments `node` is a source or sink for.
    pub fn for_node(&self, node: NodeId) -> Vec<usize> {
        self.bindings.load().by_node[node.index()].clone()
    }

    pub fn is_ready(&self, index: usize) -> bool {
        index < self.len() && self.slots[index].state.load(Ordering::Acquire) == READY
    }

    pub fn ready_count(&self) -> usize {
        self.ready_count.load(Ordering::Acquire)
    }

    pub fn all_ready(&self) -> bool {
        self.ready_count() == self.len()
    }

    pub fn tag(&self, index: usize) -> Option<AuthTag> {
        if !self.is_ready(index) {
            return None;
        }
        let slot = &self.slots[index];
        Some(AuthTag::from_words(
            slot.tag_hi.load(Ordering::Acquire),
            slot.tag_lo.load(Ordering::Acquire),
        ))
    }

    /// Stores the tag and flips readiness, at most once per generation.
    /// Returns true when every assignment of the map is ready.
    pub fn mark_ready(&self, index: usize, tag: AuthTag) -> MeshResult<bool> {
        let assignment = self.get(index).ok_or_else(|| {
            MeshError::InvalidAssignment(format!("no assignment at index {}", index))
        })?;
        if self.is_held() {
            return Err(MeshError::MapHeld);
        }
        let slot = &self.slots[index];
        if slot
            .state
            .compare_exchange(EMPTY, WRITING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::error!(
                buffer_id = self.buffer_id,
                offset = assignment.offset,
                "Assignment marked ready twice"
            );
            return Err(MeshError::DoubleReady {
                offset: assignment.offset,
            });
        }
        let (hi, lo) = tag.to_words();
        slot.tag_hi.store(hi, Ordering::Relaxed);
        slot.tag_lo.store(lo, Ordering::Relaxed);
        slot.state.store(READY, Ordering::Release);

        let ready = self.ready_count.fetch_add(1, Ordering::AcqRel) + 1;
        self.signal.notify();
        Ok(ready == self.len())
    }

    /// Records that the outbound transmit on `link` finished. Returns true for
    /// the call that completes the last link.
    pub fn mark_link_complete(&self, index: usize, link: NodeId) -> MeshResult<bool> {
        let assignment = self.get(index).ok_or_else(|| {
            MeshError::InvalidAssignment(format!("no assignment at index {}", index))
        })?;
        let links = assignment.links();
        if self.direction != Direction::Out || !links.contains(link) {
            return Err(MeshError::InvalidAssignment(format!(
                "{} is not an outbound link of offset {}",
                link, assignment.offset
            )));
        }
        let bit = NodeMask::single(link).bits();
        let before = self.slots[index].links_done.fetch_or(bit, Ordering::AcqRel);
        let after = before | bit;
        Ok(before != links.bits() && after == links.bits())
    }

    /// Freezes the map against new completions.
    pub fn hold(&self) {
        self.held.store(true, Ordering::Release);
        self.signal.notify();
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::Release);
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }

    /// Clears readiness and tags for the next generation; bindings stay.
    pub fn reset(&self) {
        let len = self.len();
        for slot in &self.slots[..len] {
            slot.clear();
        }
        self.ready_count.store(0, Ordering::Release);
    }

    pub async fn wait_ready(&self, index: usize, timeout: Duration) -> MeshResult<()> {
        self.signal
            .wait_until("assignment readiness", timeout, || Ok(self.is_ready(index)))
            .await
    }

    pub async fn wait_all(&self, timeout: Duration) -> MeshResult<()> {
        self.signal
            .wait_until("all assignments ready", timeout, || Ok(self.all_ready()))
            .await
    }
}
