//! Node identity, node masks and the wiring between nodes.

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

pub const MAX_NODES: usize = 32;

/// A participant's rank within its section of the mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u8);

impl NodeId {
    pub fn new(rank: u8) -> MeshResult<Self> {
        if (rank as usize) < MAX_NODES {
            Ok(Self(rank))
        } else {
            Err(MeshError::InvalidNode(rank as u32))
        }
    }

    /// Caller guarantees `rank < MAX_NODES`.
    pub(crate) const fn from_rank(rank: u8) -> Self {
        Self(rank)
    }

    pub const fn rank(self) -> u8 {
        self.0
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Set of nodes as a 32-bit mask, bit `r` set for rank `r`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct NodeMask(u32);

impl NodeMask {
    pub const EMPTY: NodeMask = NodeMask(0);

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn single(node: NodeId) -> Self {
        Self(1 << node.0)
    }

    /// Ranks `0..n`.
    pub fn first_n(n: usize) -> Self {
        if n >= MAX_NODES {
            Self(u32::MAX)
        } else {
            Self((1u32 << n) - 1)
        }
    }

    pub const fn contains(self, node: NodeId) -> bool {
        self.0 & (1 << node.0) != 0
    }

    pub fn insert(&mut self, node: NodeId) {
        self.0 |= 1 << node.0;
    }

    pub fn remove(&mut self, node: NodeId) {
        self.0 &= !(1 << node.0);
    }

    pub const fn with(self, node: NodeId) -> Self {
        Self(self.0 | (1 << node.0))
    }

    pub const fn without(self, node: NodeId) -> Self {
        Self(self.0 & !(1 << node.0))
    }

    pub const fn union(self, other: NodeMask) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn intersection(self, other: NodeMask) -> Self {
        Self(self.0 & other.0)
    }

    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Highest rank in the mask.
    pub fn last(self) -> Option<NodeId> {
        if self.0 == 0 {
            None
        } else {
            Some(NodeId((31 - self.0.leading_zeros()) as u8))
        }
    }

    /// Ranks in ascending order.
    pub fn iter(self) -> impl Iterator<Item = NodeId> {
        let bits = self.0;
        (0..MAX_NODES as u8).filter(move |r| bits & (1 << r) != 0).map(NodeId)
    }
}

impl FromIterator<NodeId> for NodeMask {
    fn from_iter<I: IntoIterator<Item = NodeId>>(iter: I) -> Self {
        let mut mask = NodeMask::EMPTY;
        for node in iter {
            mask.insert(node);
        }
        mask
    }
}

impl std::fmt::Display for NodeMask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ranks: Vec<String> = self.iter().map(|n| n.rank().to_string()).collect();
        write!(f, "{{{}}}", ranks.join(","))
    }
}

/// Symmetric wiring between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    links: [NodeMask; MAX_NODES],
}

impl Default for Topology {
    fn default() -> Self {
        Self::empty()
    }
}

impl Topology {
    pub fn empty() -> Self {
        Self {
            links: [NodeMask::EMPTY; MAX_NODES],
        }
    }

    /// Every pair of nodes in `participants` is directly wired.
    pub fn full(participants: NodeMask) -> Self {
        let mut topology = Self::empty();
        for node in participants.iter() {
            topology.links[node.index()] = participants.without(node);
        }
        topology
    }

    /// Each node wired to its predecessor and successor in rank order.
    pub fn ring(participants: NodeMask) -> Self {
        let mut topology = Self::empty();
        let nodes: Vec<NodeId> = participants.iter().collect();
        if nodes.len() < 2 {
            return topology;
        }
        for (i, node) in nodes.iter().enumerate() {
            let next = nodes[(i + 1) % nodes.len()];
            topology.link(*node, next);
        }
        topology
    }

    pub fn from_links(links: &[(u8, u8)]) -> MeshResult<Self> {
        let mut topology = Self::empty();
        for &(a, b) in links {
            let (a, b) = (NodeId::new(a)?, NodeId::new(b)?);
            if a == b {
                return Err(MeshError::Config(format!("self link on {}", a)));
            }
            topology.link(a, b);
        }
        Ok(topology)
    }

    pub fn link(&mut self, a: NodeId, b: NodeId) {
        self.links[a.index()].insert(b);
        self.links[b.index()].insert(a);
    }

    pub fn neighbors(&self, node: NodeId) -> NodeMask {
        self.links[node.index()]
    }

    pub fn is_linked(&self, a: NodeId, b: NodeId) -> bool {
        self.links[a.index()].contains(b)
    }

    /// Lowest-ranked node in `within` wired to both `origin` and `dest`.
    pub fn relay_for(&self, origin: NodeId, dest: NodeId, within: NodeMask) -> Option<NodeId> {
        self.neighbors(origin)
            .intersection(self.neighbors(dest))
            .intersection(within)
            .iter()
            .next()
    }
}
