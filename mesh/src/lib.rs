//! Broadcast-and-gather buffer synchronization over a small wired mesh
//!
//! This crate provides the data plane that keeps one shared buffer in sync across up to
//! 32 nodes, generation after generation:
//! - Geometry and routing: sections, blocks and chunks, with one-hop relays where two
//!   nodes are not wired directly
//! - Assignment maps binding chunk ranges to links, with per-generation readiness and tags
//! - Per-chunk AES-GCM with per-node nonce prefixes and forced key rotation
//! - A lock-free forwarding state machine relaying chunks without staging whole blocks
//! - The engine tying these together behind an async link-transport seam

pub mod assignment;
pub mod buffer_state;
pub mod cipher;
pub mod config;
pub mod crypto_key;
pub mod engine;
pub mod error;
pub mod forward;
pub mod geometry;
pub mod metrics;
pub mod node;
pub mod plan;
pub mod ring_queue;
pub mod signal;
pub mod transport;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use assignment::{Assignment, AssignmentMap, AssignmentPeer, Direction};
pub use buffer_state::{BufferPhase, BufferSpec, BufferState};
pub use config::{MeshConfig, RetryConfig};
pub use crypto_key::{CryptoKeyState, CryptoKeyStateArray, KeyFlags, KeyLimits};
pub use engine::MeshEngine;
pub use error::{ExhaustionReason, MeshError, MeshResult};
pub use forward::{ForwardChain, ForwardEvent, ForwardState, Forwarder};
pub use geometry::BufferGeometry;
pub use metrics::{MeshMetrics, MetricsSnapshot};
pub use node::{NodeId, NodeMask, Topology, MAX_NODES};
pub use plan::{PlanStep, SyncPlan};
pub use ring_queue::RingQueue;
pub use transport::{
    ChunkFrame, InboundHandle, LinkTransport, LoopbackFabric, RxDelivery, TxSubmission,
};
