//! Relay state for one chunk on one outbound link.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::{
    error::{MeshError, MeshResult},
    node::NodeId,
};

/// States in the order an action passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ForwardState {
    WaitingForRxStart = 0,
    ForwardStartTxPrepare = 1,
    ForwardWaitingPrepare = 2,
    WaitingPreviousTxComplete = 3,
    WaitingForTxFree = 4,
    ForwardTxReadyToFlow = 5,
    ForwardWaitingTxFlowComplete = 6,
    WaitingForRxFlow = 7,
    /// Terminal for the generation; recycled by rearm.
    ForwardPrepareOrComplete = 8,
}

impl ForwardState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ForwardState::ForwardStartTxPrepare,
            2 => ForwardState::ForwardWaitingPrepare,
            3 => ForwardState::WaitingPreviousTxComplete,
            4 => ForwardState::WaitingForTxFree,
            5 => ForwardState::ForwardTxReadyToFlow,
            6 => ForwardState::ForwardWaitingTxFlowComplete,
            7 => ForwardState::WaitingForRxFlow,
            8 => ForwardState::ForwardPrepareOrComplete,
            _ => ForwardState::WaitingForRxStart,
        }
    }

    pub fn can_transition_to(self, next: ForwardState) -> bool {
        use ForwardState::*;
        matches!(
            (self, next),
            (WaitingForRxStart, ForwardStartTxPrepare)
                | (ForwardStartTxPrepare, ForwardWaitingPrepare)
                | (ForwardStartTxPrepare, WaitingPreviousTxComplete)
                | (ForwardWaitingPrepare, WaitingPreviousTxComplete)
                | (WaitingPreviousTxComplete, WaitingForTxFree)
                | (WaitingForTxFree, ForwardTxReadyToFlow)
                | (ForwardTxReadyToFlow, ForwardWaitingTxFlowComplete)
                | (ForwardWaitingTxFlowComplete, WaitingForRxFlow)
                | (WaitingForRxFlow, ForwardPrepareOrComplete)
                | (ForwardPrepareOrComplete, WaitingForRxStart)
        )
    }

    /// Received but not yet retired.
    pub fn is_in_flight(self) -> bool {
        !matches!(
            self,
            ForwardState::WaitingForRxStart | ForwardState::ForwardPrepareOrComplete
        )
    }

    /// The transmit has been handed to the link.
    pub fn is_submitted(self) -> bool {
        self >= ForwardState::ForwardWaitingTxFlowComplete
    }
}

#[derive(Debug)]
pub struct ForwardAction {
    link: NodeId,
    state: AtomicU8,
}

impl ForwardAction {
    pub fn new(link: NodeId) -> Self {
        Self {
            link,
            state: AtomicU8::new(ForwardState::WaitingForRxStart as u8),
        }
    }

    pub fn link(&self) -> NodeId {
        self.link
    }

    pub fn state(&self) -> ForwardState {
        ForwardState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `from -> to`. Returns false if the action was not in `from`.
    pub fn advance(&self, from: ForwardState, to: ForwardState) -> MeshResult<bool> {
        if !from.can_transition_to(to) {
            return Err(MeshError::InvalidTransition { from, to });
        }
        Ok(self
            .state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    /// Like [`advance`](Self::advance) but treats being elsewhere as a broken invariant.
    pub fn expect(&self, from: ForwardState, to: ForwardState) -> MeshResult<()> {
        if self.advance(from, to)? {
            Ok(())
        } else {
            Err(MeshError::InvalidTransition {
                from: self.state(),
                to,
            })
        }
    }

    pub(crate) fn recycle(&self) {
        self.state
            .store(ForwardState::WaitingForRxStart as u8, Ordering::Release);
    }
}
