//! Data-plane counters.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Counters for one engine.
#[derive(Debug, Default)]
pub struct MeshMetrics {
    // Crypto
    chunks_encrypted: AtomicU64,
    chunks_decrypted: AtomicU64,
    auth_failures: AtomicU64,

    // Links
    chunks_transmitted: AtomicU64,
    chunks_forwarded: AtomicU64,
    transmit_errors: AtomicU64,
    stale_chunks: AtomicU64,
    deferred_chunks: AtomicU64,

    // Backpressure
    queue_full_rejections: AtomicU64,

    // Generations per buffer
    generations: DashMap<u64, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub chunks_encrypted: u64,
    pub chunks_decrypted: u64,
    pub auth_failures: u64,
    pub chunks_transmitted: u64,
    pub chunks_forwarded: u64,
    pub transmit_errors: u64,
    pub stale_chunks: u64,
    pub deferred_chunks: u64,
    pub queue_full_rejections: u64,
    pub generations_completed: u64,
}

impl MeshMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_encrypted(&self) {
        self.chunks_encrypted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decrypted(&self) {
        self.chunks_decrypted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// A transmit completed; `forwarded` when it relayed another node's chunk.
    pub fn record_transmitted(&self, forwarded: bool) {
        self.chunks_transmitted.fetch_add(1, Ordering::Relaxed);
        if forwarded {
            self.chunks_forwarded.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_transmit_error(&self) {
        self.transmit_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deferred(&self) {
        self.deferred_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_queue_full(&self) {
        self.queue_full_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_generation_complete(&self, buffer_id: u64) {
        *self.generations.entry(buffer_id).or_insert(0) += 1;
    }

    pub fn generations_for(&self, buffer_id: u64) -> u64 {
        self.generations.get(&buffer_id).map(|g| *g).unwrap_or(0)
    }

    pub fn forget_buffer(&self, buffer_id: u64) {
        self.generations.remove(&buffer_id);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            chunks_encrypted: self.chunks_encrypted.load(Ordering::Relaxed),
            chunks_decrypted: self.chunks_decrypted.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            chunks_transmitted: self.chunks_transmitted.load(Ordering::Relaxed),
            chunks_forwarded: self.chunks_forwarded.load(Ordering::Relaxed),
            transmit_errors: self.transmit_errors.load(Ordering::Relaxed),
            stale_chunks: self.stale_chunks.load(Ordering::Relaxed),
            deferred_chunks: self.deferred_chunks.load(Ordering::Relaxed),
            queue_full_rejections: self.queue_full_rejections.load(Ordering::Relaxed),
            generations_completed: self.generations.iter().map(|e| *e.value()).sum(),
        }
    }
}
