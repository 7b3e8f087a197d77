//! Per-generation synchronization plan.
//!
//! Every node builds the plan from the same inputs, so routing decisions agree
//! across the mesh without negotiation: a block travels over the direct link
//! when one exists, otherwise through the lowest-ranked common neighbour.

use crate::{
    error::{MeshError, MeshResult},
    geometry::BufferGeometry,
    node::{NodeId, NodeMask, Topology},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanStep {
    /// Send every chunk of the local block over `links`.
    Broadcast { chunks: usize, links: NodeMask },
    /// Receive every chunk of `origin`'s block, relayed by `via` when set.
    Gather {
        origin: NodeId,
        via: Option<NodeId>,
        chunks: usize,
    },
    /// Relay `origin`'s chunks to nodes it cannot reach directly.
    Forward { origin: NodeId, to: NodeMask },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPlan {
    local: NodeId,
    section: u32,
    steps: Vec<PlanStep>,
}

impl SyncPlan {
    pub fn broadcast_and_gather(
        geometry: &BufferGeometry,
        local: NodeId,
        participants: NodeMask,
        topology: &Topology,
        section: u32,
    ) -> MeshResult<Self> {
        if !participants.contains(local) {
            return Err(MeshError::InvalidAssignment(format!(
                "{} is not a participant of {}",
                local, participants
            )));
        }
        if let Some(last) = participants.last() {
            if last.rank() as u32 >= geometry.nodes_per_section {
                return Err(MeshError::InvalidGeometry(format!(
                    "{} has no block in a {}-node section",
                    last, geometry.nodes_per_section
                )));
            }
        }

        let chunks = geometry.chunks_per_block();
        let mut steps = Vec::new();

        let direct = topology.neighbors(local).intersection(participants);
        if !direct.is_empty() {
            steps.push(PlanStep::Broadcast {
                chunks,
                links: direct,
            });
        }

        for origin in participants.without(local).iter() {
            let via = route(topology, origin, local, participants)?;
            steps.push(PlanStep::Gather {
                origin,
                via,
                chunks,
            });
        }

        for origin in direct.iter() {
            let to: NodeMask = participants
                .without(origin)
                .without(local)
                .iter()
                .filter(|dest| {
                    matches!(route(topology, origin, *dest, participants), Ok(Some(relay)) if relay == local)
                })
                .collect();
            if !to.is_empty() {
                steps.push(PlanStep::Forward { origin, to });
            }
        }

        Ok(Self {
            local,
            section,
            steps,
        })
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    pub fn section(&self) -> u32 {
        self.section
    }

    pub fn steps(&self) -> &[PlanStep] {
        &self.steps
    }

    /// Inbound chunks one generation delivers.
    pub fn expected_reads(&self) -> usize {
        self.steps
            .iter()
            .map(|step| match step {
                PlanStep::Gather { chunks, .. } => *chunks,
                _ => 0,
            })
            .sum()
    }

    /// Links the local block is sent over.
    pub fn broadcast_links(&self) -> NodeMask {
        self.steps
            .iter()
            .find_map(|step| match step {
                PlanStep::Broadcast { links, .. } => Some(*links),
                _ => None,
            })
            .unwrap_or(NodeMask::EMPTY)
    }

    /// Relay targets for `origin`'s block, empty when the local node does not relay it.
    pub fn forward_targets(&self, origin: NodeId) -> NodeMask {
        self.steps
            .iter()
            .find_map(|step| match step {
                PlanStep::Forward { origin: o, to } if *o == origin => Some(*to),
                _ => None,
            })
            .unwrap_or(NodeMask::EMPTY)
    }

    pub fn gathers(&self) -> impl Iterator<Item = (NodeId, Option<NodeId>)> + '_ {
        self.steps.iter().filter_map(|step| match step {
            PlanStep::Gather { origin, via, .. } => Some((*origin, *via)),
            _ => None,
        })
    }

    pub fn forwards(&self) -> impl Iterator<Item = (NodeId, NodeMask)> + '_ {
        self.steps.iter().filter_map(|step| match step {
            PlanStep::Forward { origin, to } => Some((*origin, *to)),
            _ => None,
        })
    }
}

/// `None` for a direct link, the relay otherwise.
pub fn route(
    topology: &Topology,
    origin: NodeId,
    dest: NodeId,
    participants: NodeMask,
) -> MeshResult<Option<NodeId>> {
    if topology.is_linked(origin, dest) {
        return Ok(None);
    }
    topology
        .relay_for(origin, dest, participants)
        .map(Some)
        .ok_or(MeshError::Unreachable { origin, dest })
}
