//! Mesh error types.
//!
//! Every variant falls into one of three classes:
//! - retryable: the caller may try again later
//! - resource exhaustion: the caller must act (install a new key, free assignments)
//! - fatal: an invariant was broken; the affected buffer is aborted

use std::time::Duration;

use bag_protocol::ProtocolError;
use thiserror::Error;

use crate::{forward::ForwardState, node::NodeId};

pub type MeshResult<T> = Result<T, MeshError>;

/// Why a crypto key may no longer be used for encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustionReason {
    Buffers,
    Time,
    Nonces,
}

impl std::fmt::Display for ExhaustionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExhaustionReason::Buffers => write!(f, "buffer ceiling reached"),
            ExhaustionReason::Time => write!(f, "key lifetime elapsed"),
            ExhaustionReason::Nonces => write!(f, "nonce counter exhausted"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MeshError {
    // Retryable
    #[error("Peer has not announced outbound assignments for {pending} chunk(s) of buffer {buffer_id}, retry later")]
    PeerNotReady { buffer_id: u64, pending: usize },

    #[error("Forward queue is full")]
    QueueFull,

    #[error("Engine channel is full: {0}")]
    ChannelFull(&'static str),

    #[error("Buffer {0} has a generation in flight")]
    GenerationInFlight(u64),

    // Resource exhaustion
    #[error("Crypto key for mask {mask:#x} exhausted: {reason}")]
    KeyExhausted {
        mask: u32,
        reason: ExhaustionReason,
    },

    #[error("Assignment map full ({0} assignments)")]
    MapFull(usize),

    // Fatal invariant violations
    #[error("Duplicate assignment at offset {offset}")]
    DuplicateAssignment { offset: u64 },

    #[error("Assignment [{offset}, {end}) overlaps an existing assignment")]
    OverlappingAssignment { offset: u64, end: u64 },

    #[error("Assignment at offset {offset} marked ready twice in one generation")]
    DoubleReady { offset: u64 },

    #[error("Ring queue slot {index} written twice")]
    RingDoubleWrite { index: usize },

    #[error("Buffer {0} used after its bounded read count was exhausted")]
    UseAfterCompletion(u64),

    #[error("Crypto key table full ({0} masks)")]
    KeyTableFull(usize),

    #[error("Authentication failed for buffer {buffer_id} at offset {offset}")]
    AuthFailed { buffer_id: u64, offset: u64 },

    #[error("Invalid forward transition {from:?} -> {to:?}")]
    InvalidTransition { from: ForwardState, to: ForwardState },

    // Waits
    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: &'static str, after: Duration },

    #[error("Wait interrupted")]
    Interrupted,

    #[error("Buffer processing aborted: {0}")]
    BufferAborted(String),

    // Usage and configuration
    #[error("Unknown buffer {0}")]
    UnknownBuffer(u64),

    #[error("Buffer {0} already registered")]
    BufferExists(u64),

    #[error("No crypto key installed for mask {0:#x}")]
    KeyNotInstalled(u32),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Invalid node rank {0}")]
    InvalidNode(u32),

    #[error("Invalid assignment: {0}")]
    InvalidAssignment(String),

    #[error("{dest} is unreachable from {origin} within one hop")]
    Unreachable { origin: NodeId, dest: NodeId },

    #[error("Inbound assignments for buffer {0} are incomplete")]
    AssignmentsIncomplete(u64),

    #[error("Assignment map is held")]
    MapHeld,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("No link between {0} and {1}")]
    NoLink(NodeId, NodeId),

    #[error("Engine is shut down")]
    ShutDown,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl MeshError {
    /// The caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::PeerNotReady { .. }
                | MeshError::QueueFull
                | MeshError::ChannelFull(_)
                | MeshError::GenerationInFlight(_)
        )
    }

    /// Recoverable once the caller installs a new key or frees capacity.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(self, MeshError::KeyExhausted { .. } | MeshError::MapFull(_))
    }

    /// Continuing after these risks silent data corruption.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MeshError::DuplicateAssignment { .. }
                | MeshError::OverlappingAssignment { .. }
                | MeshError::DoubleReady { .. }
                | MeshError::RingDoubleWrite { .. }
                | MeshError::UseAfterCompletion(_)
                | MeshError::KeyTableFull(_)
                | MeshError::AuthFailed { .. }
                | MeshError::InvalidTransition { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taxonomy_is_disjoint() {
        let samples = [
            MeshError::PeerNotReady {
                buffer_id: 1,
                pending: 2,
            },
            MeshError::QueueFull,
            MeshError::KeyExhausted {
                mask: 0b11,
                reason: ExhaustionReason::Buffers,
            },
            MeshError::MapFull(512),
            MeshError::DuplicateAssignment { offset: 0 },
            MeshError::DoubleReady { offset: 0 },
            MeshError::RingDoubleWrite { index: 3 },
            MeshError::UseAfterCompletion(1),
            MeshError::Interrupted,
        ];
        for err in &samples {
            let classes = [
                err.is_retryable(),
                err.is_resource_exhausted(),
                err.is_fatal(),
            ];
            assert!(classes.iter().filter(|c| **c).count() <= 1, "{err}");
        }
    }

    #[test]
    fn test_timeout_distinct_from_interrupt() {
        let timeout = MeshError::Timeout {
            what: "inbound chunks",
            after: Duration::from_secs(30),
        };
        assert!(!matches!(timeout, MeshError::Interrupted));
        assert_eq!(
            timeout.to_string(),
            "Timed out after 30s waiting for inbound chunks"
        );
        assert!(!timeout.is_fatal() && !timeout.is_retryable());
    }
}
