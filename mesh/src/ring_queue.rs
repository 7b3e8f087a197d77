//! Bounded lock-free queue handing forwarding events from completion
//! producers to the forwarder.
//!
//! Producers reserve capacity with a counter, claim a slot index with a
//! `fetch_add` on `head`, and publish by swapping a pointer into a slot that
//! must be null. The single consumer swaps the tail slot back to null, so
//! every boxed item is owned by exactly one side at any time.

use std::{
    ptr,
    sync::{
        atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering},
        Arc,
    },
};

use crate::error::MeshError;

pub const RING_CAPACITY: usize = 0xFF;
const RING_SLOTS: usize = RING_CAPACITY + 1;
const RING_MASK: usize = RING_CAPACITY;

/// An item the queue refused, handed back for the caller to retry or report.
#[derive(Debug)]
pub struct Rejected<T> {
    pub item: T,
    pub error: MeshError,
}

pub struct RingQueue<T> {
    slots: Box<[AtomicPtr<T>]>,
    head: AtomicUsize,
    tail: AtomicUsize,
    count: AtomicUsize,
    consumer_taken: AtomicBool,
}

// Items move between threads through the slots; the queue itself holds no
// references into them.
unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

impl<T> Default for RingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RingQueue<T> {
    pub fn new() -> Self {
        let slots = (0..RING_SLOTS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            consumer_taken: AtomicBool::new(false),
        }
    }

    pub fn capacity(&self) -> usize {
        RING_CAPACITY
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire).min(RING_CAPACITY)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Never blocks. A full queue hands the item back with `QueueFull`.
    pub fn try_enqueue(&self, item: T) -> Result<(), Rejected<T>> {
        let reserved = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if reserved > RING_CAPACITY {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return Err(Rejected {
                item,
                error: MeshError::QueueFull,
            });
        }

        let index = self.head.fetch_add(1, Ordering::AcqRel) & RING_MASK;
        let raw = Box::into_raw(Box::new(item));
        match self.slots[index].compare_exchange(
            ptr::null_mut(),
            raw,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(()),
            Err(_) => {
                self.count.fetch_sub(1, Ordering::AcqRel);
                // SAFETY: `raw` came from `Box::into_raw` above and was never published.
                let item = *unsafe { Box::from_raw(raw) };
                Err(Rejected {
                    item,
                    error: MeshError::RingDoubleWrite { index },
                })
            }
        }
    }

    /// Hands out the consumer side once.
    pub fn consumer(self: &Arc<Self>) -> Option<RingConsumer<T>> {
        if self
            .consumer_taken
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(RingConsumer {
                queue: Arc::clone(self),
            })
        } else {
            None
        }
    }

    fn dequeue(&self) -> Option<T> {
        let index = self.tail.load(Ordering::Acquire) & RING_MASK;
        let raw = self.slots[index].swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            return None;
        }
        self.tail.fetch_add(1, Ordering::AcqRel);
        self.count.fetch_sub(1, Ordering::AcqRel);
        // SAFETY: a non-null slot holds a pointer from `Box::into_raw` that the
        // swap above removed, so this is its only owner.
        Some(*unsafe { Box::from_raw(raw) })
    }
}

impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        for slot in self.slots.iter() {
            let raw = slot.swap(ptr::null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                // SAFETY: every published pointer came from `Box::into_raw` and
                // `&mut self` rules out concurrent consumers.
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }
}

/// The single consumer of a [`RingQueue`].
pub struct RingConsumer<T> {
    queue: Arc<RingQueue<T>>,
}

impl<T> RingConsumer<T> {
    /// `None` when the tail slot is empty, including while a producer that
    /// reserved it has not published yet.
    pub fn dequeue(&mut self) -> Option<T> {
        self.queue.dequeue()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.dequeue())
    }
}
