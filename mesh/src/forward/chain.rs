//! Chains of forward actions for one relayed block.
//!
//! A chain holds one element per chunk of the origin's block and, inside each
//! element, one action per outbound link. Elements and actions are allocated
//! when the chain is built and recycled by [`ForwardChain::rearm`] every
//! generation. Groups batch the preparation of consecutive elements.

use std::{
    ops::Range,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwapOption;
use tracing as log;

use super::{
    action::{ForwardAction, ForwardState},
    election::Election,
    FORWARD_NODE_COUNT,
};
use crate::{
    error::{MeshError, MeshResult},
    node::{NodeId, NodeMask, MAX_NODES},
    signal::WaitSignal,
    transport::ChunkFrame,
};

/// A transmit the forwarder hands to the TX worker.
#[derive(Debug, Clone)]
pub struct ForwardTx {
    pub origin: NodeId,
    pub link: NodeId,
    pub frame: ChunkFrame,
}

/// How a chain treated an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// For a generation the chain has already left.
    Stale,
    /// For a generation the chain has not been armed for yet.
    Early,
    /// The chain is stopped and the element had not started.
    Ignored,
}

#[derive(Debug)]
pub struct ForwardElement {
    offset: u64,
    actions: Box<[ForwardAction]>,
    carry: Election,
    rx_observed: AtomicU32,
    rx_flowed: AtomicBool,
    completions: AtomicU32,
    staged: ArcSwapOption<ChunkFrame>,
}

impl ForwardElement {
    fn new(offset: u64, links: NodeMask) -> Self {
        Self {
            offset,
            actions: links.iter().map(ForwardAction::new).collect(),
            carry: Election::new(),
            rx_observed: AtomicU32::new(0),
            rx_flowed: AtomicBool::new(false),
            completions: AtomicU32::new(0),
            staged: ArcSwapOption::empty(),
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn actions(&self) -> &[ForwardAction] {
        &self.actions
    }

    fn all_observed(&self) -> u32 {
        if self.actions.len() >= 32 {
            u32::MAX
        } else {
            (1u32 << self.actions.len()) - 1
        }
    }

    /// Every carry partner has seen the receive.
    pub fn rx_observed_by_all(&self) -> bool {
        self.rx_observed.load(Ordering::Acquire) == self.all_observed()
    }

    pub fn is_complete(&self) -> bool {
        self.completions.load(Ordering::Acquire) as usize == self.actions.len()
    }

    fn is_in_flight(&self) -> bool {
        self.actions.iter().any(|a| a.state().is_in_flight())
    }

    fn is_started(&self) -> bool {
        self.actions
            .iter()
            .any(|a| a.state() != ForwardState::WaitingForRxStart)
    }

    fn action_for(&self, link: NodeId) -> Option<&ForwardAction> {
        self.actions.iter().find(|a| a.link() == link)
    }

    fn recycle(&self) {
        for action in self.actions.iter() {
            action.recycle();
        }
        self.carry.rearm();
        self.rx_observed.store(0, Ordering::Release);
        self.rx_flowed.store(false, Ordering::Release);
        self.completions.store(0, Ordering::Release);
        self.staged.store(None);
    }
}

#[derive(Debug)]
pub struct ForwardGroup {
    elements: Range<usize>,
    prepared_generation: AtomicU64,
}

impl ForwardGroup {
    pub fn elements(&self) -> Range<usize> {
        self.elements.clone()
    }

    pub fn is_prepared_for(&self, generation: u64) -> bool {
        self.prepared_generation.load(Ordering::Acquire) == generation
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChainConfig {
    /// Elements per group, 0 for one group spanning the chain
    pub group_chunks: usize,
    /// Transmits in flight per link
    pub tx_window: u32,
    /// Generations to forward, 0 for unbounded
    pub max_iterations: u64,
}

#[derive(Debug)]
pub struct ForwardChain {
    buffer_id: u64,
    origin: NodeId,
    local: NodeId,
    links: NodeMask,
    elements: Box<[ForwardElement]>,
    groups: Box<[ForwardGroup]>,
    group_chunks: usize,
    generation: AtomicU64,
    iterations_left: AtomicU64,
    max_iterations: u64,
    stopped: AtomicBool,
    in_flight: [AtomicU32; MAX_NODES],
    tx_window: u32,
    carried: AtomicU64,
    groups_prepared: AtomicU64,
    signal: Arc<WaitSignal>,
}

impl ForwardChain {
    pub fn new(
        buffer_id: u64,
        origin: NodeId,
        local: NodeId,
        links: NodeMask,
        offsets: &[u64],
        config: ChainConfig,
        signal: Arc<WaitSignal>,
    ) -> MeshResult<Self> {
        if links.is_empty() || links.len() > FORWARD_NODE_COUNT - 1 {
            return Err(MeshError::InvalidAssignment(format!(
                "forward chain needs 1..={} links, got {}",
                FORWARD_NODE_COUNT - 1,
                links
            )));
        }
        if links.contains(origin) || links.contains(local) {
            return Err(MeshError::InvalidAssignment(format!(
                "forward links {} include {} or {}",
                links, origin, local
            )));
        }
        if offsets.is_empty() || offsets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MeshError::InvalidAssignment(
                "forward chain offsets must be non-empty and ascending".into(),
            ));
        }
        if config.tx_window == 0 {
            return Err(MeshError::Config("forward tx window must be > 0".into()));
        }

        let elements: Box<[ForwardElement]> = offsets
            .iter()
            .map(|offset| ForwardElement::new(*offset, links))
            .collect();
        let group_chunks = if config.group_chunks == 0 {
            elements.len()
        } else {
            config.group_chunks.min(elements.len())
        };
        let groups = (0..elements.len())
            .step_by(group_chunks)
            .map(|start| ForwardGroup {
                elements: start..(start + group_chunks).min(elements.len()),
                prepared_generation: AtomicU64::new(0),
            })
            .collect();

        Ok(Self {
            buffer_id,
            origin,
            local,
            links,
            elements,
            groups,
            group_chunks,
            generation: AtomicU64::new(0),
            iterations_left: AtomicU64::new(config.max_iterations),
            max_iterations: config.max_iterations,
            stopped: AtomicBool::new(false),
            in_flight: std::array::from_fn(|_| AtomicU32::new(0)),
            tx_window: config.tx_window,
            carried: AtomicU64::new(0),
            groups_prepared: AtomicU64::new(0),
            signal,
        })
    }

    pub fn buffer_id(&self) -> u64 {
        self.buffer_id
    }

    pub fn origin(&self) -> NodeId {
        self.origin
    }

    pub fn links(&self) -> NodeMask {
        self.links
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn elements(&self) -> &[ForwardElement] {
        &self.elements
    }

    pub fn groups(&self) -> &[ForwardGroup] {
        &self.groups
    }

    /// Chunks whose shared receive bookkeeping has been carried out.
    pub fn carried(&self) -> u64 {
        self.carried.load(Ordering::Acquire)
    }

    pub fn groups_prepared(&self) -> u64 {
        self.groups_prepared.load(Ordering::Acquire)
    }

    pub fn in_flight_on(&self, link: NodeId) -> u32 {
        self.in_flight[link.index()].load(Ordering::Acquire)
    }

    fn element_index(&self, offset: u64) -> MeshResult<usize> {
        self.elements
            .binary_search_by_key(&offset, |e| e.offset)
            .map_err(|_| {
                MeshError::InvalidAssignment(format!(
                    "offset {} is not forwarded for {}",
                    offset, self.origin
                ))
            })
    }

    fn classify(&self, generation: u64) -> Option<Delivery> {
        let current = self.generation();
        if generation < current {
            Some(Delivery::Stale)
        } else if generation > current {
            Some(Delivery::Early)
        } else {
            None
        }
    }

    /// True while neither stopped nor out of iterations.
    pub fn continue_forwarding(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
            && (self.max_iterations == 0 || self.iterations_left.load(Ordering::Acquire) > 0)
    }

    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            log::debug!(buffer_id = self.buffer_id, origin = %self.origin, "Forward chain stopped");
        }
        self.signal.notify();
    }

    /// Stops the chain and fails the buffer it relays for.
    pub fn abort(&self, cause: &MeshError) {
        self.stop();
        if self.signal.abort(cause.to_string()) {
            log::error!(
                buffer_id = self.buffer_id,
                origin = %self.origin,
                error = %cause,
                "Forwarding aborted"
            );
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// No element between receive and retirement.
    pub fn is_idle(&self) -> bool {
        !self.elements.iter().any(ForwardElement::is_in_flight)
    }

    /// Stopped (or out of iterations) with every in-flight element retired.
    pub fn is_finished(&self) -> bool {
        !self.continue_forwarding() && self.is_idle()
    }

    pub fn is_group_finished(&self, group: usize) -> bool {
        self.groups.get(group).is_some_and(|g| {
            self.elements[g.elements()]
                .iter()
                .all(ForwardElement::is_complete)
        })
    }

    pub fn is_generation_done(&self) -> bool {
        (0..self.groups.len()).all(|g| self.is_group_finished(g))
    }

    /// Recycles every element for `generation`. Returns false when the chain
    /// will not forward any more generations.
    pub fn rearm(&self, generation: u64) -> MeshResult<bool> {
        if !self.is_idle() {
            return Err(MeshError::GenerationInFlight(self.buffer_id));
        }
        let current = self.generation();
        if current != 0
            && generation == current
            && !self.elements.iter().any(ForwardElement::is_started)
        {
            // Armed already and untouched.
            return Ok(true);
        }
        if generation <= current {
            return Err(MeshError::InvalidAssignment(format!(
                "forward chain at generation {} cannot rearm for {}",
                current, generation
            )));
        }
        if !self.continue_forwarding() {
            return Ok(false);
        }
        if self.max_iterations > 0 {
            self.iterations_left.fetch_sub(1, Ordering::AcqRel);
        }
        for element in self.elements.iter() {
            element.recycle();
        }
        for link in self.links.iter() {
            self.in_flight[link.index()].store(0, Ordering::Release);
        }
        self.generation.store(generation, Ordering::Release);
        Ok(true)
    }

    /// Receive completed for the chunk at `offset`; every carry partner
    /// observes it.
    pub fn mark_rx_complete(&self, frame: ChunkFrame) -> MeshResult<Delivery> {
        let frame = Arc::new(frame);
        for link in self.links.iter() {
            match self.observe_rx(&frame, link)? {
                Delivery::Accepted => {}
                other => return Ok(other),
            }
        }
        Ok(Delivery::Accepted)
    }

    /// The partner relaying on `link` observed the receive of `frame`. The
    /// first partner to observe it stages the frame for all of them.
    pub fn observe_rx(&self, frame: &Arc<ChunkFrame>, link: NodeId) -> MeshResult<Delivery> {
        if let Some(delivery) = self.classify(frame.generation) {
            return Ok(delivery);
        }
        let element = &self.elements[self.element_index(frame.offset)?];
        if self.is_stopped() && !element.is_started() {
            return Ok(Delivery::Ignored);
        }
        let (slot, action) = element
            .actions
            .iter()
            .enumerate()
            .find(|(_, a)| a.link() == link)
            .ok_or(MeshError::NoLink(self.local, link))?;
        action.expect(
            ForwardState::WaitingForRxStart,
            ForwardState::ForwardStartTxPrepare,
        )?;
        // Staged before the observed bit, so a fully observed element always
        // has its frame.
        if element.carry.claim() {
            element.staged.store(Some(Arc::clone(frame)));
            self.carried.fetch_add(1, Ordering::AcqRel);
            log::trace!(
                buffer_id = self.buffer_id,
                offset = element.offset,
                %link,
                "Carrying shared receive"
            );
        }
        element.rx_observed.fetch_or(1 << slot, Ordering::AcqRel);
        Ok(Delivery::Accepted)
    }

    /// The local receive path finished with the chunk at `offset`.
    pub fn flow_rx_complete(&self, generation: u64, offset: u64) -> MeshResult<Delivery> {
        if let Some(delivery) = self.classify(generation) {
            return Ok(delivery);
        }
        let element = &self.elements[self.element_index(offset)?];
        element.rx_flowed.store(true, Ordering::Release);
        for action in element.actions.iter() {
            if action.advance(
                ForwardState::WaitingForRxFlow,
                ForwardState::ForwardPrepareOrComplete,
            )? {
                self.retire(element);
            }
        }
        Ok(Delivery::Accepted)
    }

    /// The relay transmit of `offset` on `link` completed.
    pub fn tx_complete(&self, generation: u64, offset: u64, link: NodeId) -> MeshResult<Delivery> {
        if let Some(delivery) = self.classify(generation) {
            return Ok(delivery);
        }
        let element = &self.elements[self.element_index(offset)?];
        let action = element.action_for(link).ok_or(MeshError::NoLink(self.local, link))?;
        action.expect(
            ForwardState::ForwardWaitingTxFlowComplete,
            ForwardState::WaitingForRxFlow,
        )?;
        self.in_flight[link.index()].fetch_sub(1, Ordering::AcqRel);
        if element.rx_flowed.load(Ordering::Acquire)
            && action.advance(
                ForwardState::WaitingForRxFlow,
                ForwardState::ForwardPrepareOrComplete,
            )?
        {
            self.retire(element);
        }
        Ok(Delivery::Accepted)
    }

    fn retire(&self, element: &ForwardElement) {
        let done = element.completions.fetch_add(1, Ordering::AcqRel) + 1;
        if done as usize == element.actions.len() {
            element.staged.store(None);
            if self.is_generation_done() || self.is_idle() {
                self.signal.notify();
            }
        }
    }

    fn prepare_group(&self, group: usize, generation: u64) {
        if let Some(g) = self.groups.get(group) {
            if g.prepared_generation.swap(generation, Ordering::AcqRel) != generation {
                self.groups_prepared.fetch_add(1, Ordering::AcqRel);
                log::trace!(
                    buffer_id = self.buffer_id,
                    origin = %self.origin,
                    group,
                    generation,
                    "Prepared forward group"
                );
            }
        }
    }

    /// Advances every action as far as it can go and collects the transmits
    /// that became ready.
    pub fn pump(&self, out: &mut Vec<ForwardTx>) -> MeshResult<usize> {
        let generation = self.generation();
        let before = out.len();
        for (index, element) in self.elements.iter().enumerate() {
            for (slot, action) in element.actions.iter().enumerate() {
                while self.step(generation, index, element, slot, action, out)? {}
            }
        }
        Ok(out.len() - before)
    }

    fn step(
        &self,
        generation: u64,
        index: usize,
        element: &ForwardElement,
        slot: usize,
        action: &ForwardAction,
        out: &mut Vec<ForwardTx>,
    ) -> MeshResult<bool> {
        use ForwardState::*;
        match action.state() {
            ForwardStartTxPrepare => {
                if !element.rx_observed_by_all() {
                    return Ok(false);
                }
                let group = index / self.group_chunks;
                if self.groups[group].is_prepared_for(generation) {
                    action.expect(ForwardStartTxPrepare, WaitingPreviousTxComplete)?;
                } else {
                    action.expect(ForwardStartTxPrepare, ForwardWaitingPrepare)?;
                    self.prepare_group(group, generation);
                    action.expect(ForwardWaitingPrepare, WaitingPreviousTxComplete)?;
                }
                // Get the next batch ready while this one is on the wire.
                self.prepare_group(group + 1, generation);
                Ok(true)
            }
            ForwardWaitingPrepare => {
                let group = index / self.group_chunks;
                self.prepare_group(group, generation);
                action.expect(ForwardWaitingPrepare, WaitingPreviousTxComplete)?;
                Ok(true)
            }
            WaitingPreviousTxComplete => {
                if index > 0 {
                    let previous = self.elements[index - 1].actions[slot].state();
                    let skipped = self.is_stopped() && previous == WaitingForRxStart;
                    if !previous.is_submitted() && !skipped {
                        return Ok(false);
                    }
                }
                action.expect(WaitingPreviousTxComplete, WaitingForTxFree)?;
                Ok(true)
            }
            WaitingForTxFree => {
                let counter = &self.in_flight[action.link().index()];
                if counter.load(Ordering::Acquire) >= self.tx_window {
                    return Ok(false);
                }
                counter.fetch_add(1, Ordering::AcqRel);
                action.expect(WaitingForTxFree, ForwardTxReadyToFlow)?;
                Ok(true)
            }
            ForwardTxReadyToFlow => {
                let staged = element.staged.load_full().ok_or_else(|| {
                    MeshError::InvalidAssignment(format!(
                        "no staged chunk at offset {}",
                        element.offset
                    ))
                })?;
                let mut frame = ChunkFrame::clone(&staged);
                frame.via = Some(self.local);
                out.push(ForwardTx {
                    origin: self.origin,
                    link: action.link(),
                    frame,
                });
                action.expect(ForwardTxReadyToFlow, ForwardWaitingTxFlowComplete)?;
                Ok(true)
            }
            WaitingForRxStart
            | ForwardWaitingTxFlowComplete
            | WaitingForRxFlow
            | ForwardPrepareOrComplete => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use bag_protocol::AuthTag;
    use bytes::Bytes;
    use proptest::prelude::*;

    use super::*;
    use crate::crypto_key::ChunkNonce;

    fn n(rank: u8) -> NodeId {
        NodeId::new(rank).unwrap()
    }

    fn chain(chunks: u64, links: NodeMask, config: ChainConfig) -> ForwardChain {
        let offsets: Vec<u64> = (0..chunks).map(|i| 1000 + i * 10).collect();
        ForwardChain::new(
            3,
            n(0),
            n(1),
            links,
            &offsets,
            config,
            Arc::new(WaitSignal::new()),
        )
        .unwrap()
    }

    fn config(tx_window: u32) -> ChainConfig {
        ChainConfig {
            group_chunks: 2,
            tx_window,
            max_iterations: 0,
        }
    }

    fn frame(generation: u64, offset: u64) -> ChunkFrame {
        ChunkFrame {
            buffer_id: 3,
            generation,
            offset,
            origin: n(0),
            via: None,
            payload: Bytes::from(vec![offset as u8; 4]),
            tag: AuthTag::from([offset as u8; 16]),
            nonce: ChunkNonce {
                prefix: [0; 8],
                counter: offset as u32,
            },
        }
    }

    /// Drives a full generation with in-order receives; returns the transmits in
    /// submission order.
    fn run_generation(chain: &ForwardChain, generation: u64) -> Vec<ForwardTx> {
        let mut sent = Vec::new();
        let offsets: Vec<u64> = chain.elements().iter().map(|e| e.offset()).collect();
        for offset in &offsets {
            chain.mark_rx_complete(frame(generation, *offset)).unwrap();
            chain.flow_rx_complete(generation, *offset).unwrap();
        }
        let mut rounds = 0;
        while !chain.is_generation_done() {
            let mut out = Vec::new();
            chain.pump(&mut out).unwrap();
            for tx in &out {
                chain
                    .tx_complete(generation, tx.frame.offset, tx.link)
                    .unwrap();
            }
            sent.extend(out);
            rounds += 1;
            assert!(rounds <= offsets.len() + 1, "chain did not make progress");
        }
        sent
    }

    #[test]
    fn test_chain_forwards_in_order_per_link() {
        let links = NodeMask::from_bits(0b1100);
        let chain = chain(5, links, config(2));
        assert!(chain.rearm(1).unwrap());
        let sent = run_generation(&chain, 1);
        assert_eq!(sent.len(), 10);
        for link in links.iter() {
            let offsets: Vec<u64> = sent
                .iter()
                .filter(|tx| tx.link == link)
                .map(|tx| tx.frame.offset)
                .collect();
            assert_eq!(offsets, vec![1000, 1010, 1020, 1030, 1040]);
        }
        assert!(sent.iter().all(|tx| tx.frame.via == Some(n(1))));
        assert_eq!(chain.carried(), 5);
        assert!(chain.is_idle());
        assert!(chain
            .elements()
            .iter()
            .all(|e| e.staged.load().is_none()));
    }

    #[test]
    fn test_window_limits_in_flight() {
        let chain = chain(4, NodeMask::single(n(2)), config(1));
        chain.rearm(1).unwrap();
        for i in 0..4 {
            chain.mark_rx_complete(frame(1, 1000 + i * 10)).unwrap();
        }
        let mut out = Vec::new();
        chain.pump(&mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(chain.in_flight_on(n(2)), 1);
        out.clear();
        chain.pump(&mut out).unwrap();
        assert!(out.is_empty());

        chain.tx_complete(1, 1000, n(2)).unwrap();
        chain.pump(&mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].frame.offset, 1010);
    }

    #[test]
    fn test_no_transmit_before_receive() {
        let chain = chain(3, NodeMask::from_bits(0b1100), config(4));
        chain.rearm(1).unwrap();
        chain.mark_rx_complete(frame(1, 1010)).unwrap();
        let mut out = Vec::new();
        chain.pump(&mut out).unwrap();
        // Chunk 1 waits for chunk 0 on every link.
        assert!(out.is_empty());
        assert_eq!(
            chain.elements()[1].actions()[0].state(),
            ForwardState::WaitingPreviousTxComplete
        );
        chain.mark_rx_complete(frame(1, 1000)).unwrap();
        chain.pump(&mut out).unwrap();
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn test_groups_prepared_eagerly() {
        let chain = chain(6, NodeMask::single(n(2)), config(8));
        chain.rearm(1).unwrap();
        assert_eq!(chain.groups().len(), 3);
        chain.mark_rx_complete(frame(1, 1000)).unwrap();
        let mut out = Vec::new();
        chain.pump(&mut out).unwrap();
        assert!(chain.groups()[0].is_prepared_for(1));
        assert!(chain.groups()[1].is_prepared_for(1));
        assert!(!chain.groups()[2].is_prepared_for(1));
        assert!(!chain.is_group_finished(0));
    }

    #[test]
    fn test_generation_filtering_and_rearm() {
        let chain = chain(2, NodeMask::single(n(2)), config(2));
        chain.rearm(1).unwrap();
        assert_eq!(chain.mark_rx_complete(frame(2, 1000)).unwrap(), Delivery::Early);
        assert_eq!(chain.mark_rx_complete(frame(0, 1000)).unwrap(), Delivery::Stale);

        chain.mark_rx_complete(frame(1, 1000)).unwrap();
        assert!(matches!(
            chain.rearm(2),
            Err(MeshError::GenerationInFlight(3))
        ));
        // A second receive of the same chunk breaks the state machine.
        assert!(matches!(
            chain.mark_rx_complete(frame(1, 1000)),
            Err(MeshError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_stop_finishes_in_flight_elements() {
        let chain = chain(3, NodeMask::single(n(2)), config(4));
        chain.rearm(1).unwrap();
        chain.mark_rx_complete(frame(1, 1000)).unwrap();
        chain.stop();
        assert!(!chain.continue_forwarding());
        assert!(!chain.is_finished());
        assert_eq!(
            chain.mark_rx_complete(frame(1, 1010)).unwrap(),
            Delivery::Ignored
        );

        let mut out = Vec::new();
        chain.pump(&mut out).unwrap();
        assert_eq!(out.len(), 1);
        chain.tx_complete(1, 1000, n(2)).unwrap();
        assert!(!chain.is_finished());
        chain.flow_rx_complete(1, 1000).unwrap();
        assert!(chain.is_finished());
        assert!(!chain.rearm(2).unwrap());
    }

    #[test]
    fn test_bounded_iterations() {
        let chain = chain(
            1,
            NodeMask::single(n(2)),
            ChainConfig {
                group_chunks: 0,
                tx_window: 1,
                max_iterations: 1,
            },
        );
        assert!(chain.rearm(1).unwrap());
        run_generation(&chain, 1);
        assert!(!chain.continue_forwarding());
        assert!(chain.is_finished());
        assert!(!chain.rearm(2).unwrap());
    }

    #[test]
    fn test_invalid_chains_rejected() {
        let signal = Arc::new(WaitSignal::new());
        let cfg = config(1);
        assert!(
            ForwardChain::new(1, n(0), n(1), NodeMask::EMPTY, &[0], cfg, signal.clone()).is_err()
        );
        assert!(ForwardChain::new(
            1,
            n(0),
            n(1),
            NodeMask::single(n(0)),
            &[0],
            cfg,
            signal.clone()
        )
        .is_err());
        assert!(
            ForwardChain::new(1, n(0), n(1), NodeMask::single(n(2)), &[8, 0], cfg, signal)
                .is_err()
        );
    }

    #[test]
    fn test_concurrent_partners_stage_once() {
        let links = NodeMask::from_bits(0b111100);
        let chain = Arc::new(chain(1, links, config(4)));
        chain.rearm(1).unwrap();
        let received = Arc::new(frame(1, 1000));
        let observers: Vec<_> = links
            .iter()
            .map(|link| {
                let chain = Arc::clone(&chain);
                let received = Arc::clone(&received);
                std::thread::spawn(move || chain.observe_rx(&received, link).unwrap())
            })
            .collect();
        for observer in observers {
            assert_eq!(observer.join().unwrap(), Delivery::Accepted);
        }
        assert_eq!(chain.carried(), 1);
        let element = &chain.elements()[0];
        assert!(element.rx_observed_by_all());
        assert!(element
            .staged
            .load_full()
            .is_some_and(|staged| Arc::ptr_eq(&staged, &received)));

        let mut out = Vec::new();
        chain.pump(&mut out).unwrap();
        assert_eq!(out.len(), 4);
        assert!(matches!(
            chain.observe_rx(&received, n(2)),
            Err(MeshError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_partial_observation_holds_transmits() {
        let chain = chain(1, NodeMask::from_bits(0b1100), config(4));
        chain.rearm(1).unwrap();
        let received = Arc::new(frame(1, 1000));
        chain.observe_rx(&received, n(3)).unwrap();
        let mut out = Vec::new();
        chain.pump(&mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(chain.carried(), 1);
        assert!(matches!(
            chain.observe_rx(&received, n(5)),
            Err(MeshError::NoLink(_, _))
        ));

        chain.observe_rx(&received, n(2)).unwrap();
        chain.pump(&mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(chain.carried(), 1);
    }

    proptest! {
        #[test]
        fn prop_forwarding_liveness(chunks in 1u64..24, link_bits in 1u32..0b1111, window in 1u32..4, group in 0usize..5) {
            // Links drawn from ranks 2..=5 so they never include origin 0 or relay 1.
            let links = NodeMask::from_bits(link_bits << 2);
            let chain = chain(chunks, links, ChainConfig { group_chunks: group, tx_window: window, max_iterations: 0 });
            for generation in 1..=2u64 {
                prop_assert!(chain.rearm(generation).unwrap());
                let sent = run_generation(&chain, generation);
                prop_assert_eq!(sent.len() as u64, chunks * links.len() as u64);
                for element in chain.elements() {
                    prop_assert!(element.actions().iter().all(|a| a.state() == ForwardState::ForwardPrepareOrComplete));
                    prop_assert!(element.rx_observed_by_all());
                }
            }
        }
    }
}
