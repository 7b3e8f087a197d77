//! How a shared buffer splits into sections, blocks and chunks.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{
    error::{MeshError, MeshResult},
    node::{NodeId, MAX_NODES},
};

/// Assignments a single map may hold.
pub const MAX_ASSIGNMENT_COUNT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferGeometry {
    /// One section per network partition
    pub sections: u32,
    /// One block per node within a section
    pub nodes_per_section: u32,
    pub block_size: u64,
    /// Wire transfer granularity
    pub chunk_size: u64,
}

impl BufferGeometry {
    pub fn new(
        sections: u32,
        nodes_per_section: u32,
        block_size: u64,
        chunk_size: u64,
    ) -> MeshResult<Self> {
        let geometry = Self {
            sections,
            nodes_per_section,
            block_size,
            chunk_size,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    /// Single-section geometry from a total buffer size.
    pub fn for_buffer(size: u64, nodes: u32, chunk_size: u64) -> MeshResult<Self> {
        if nodes == 0 || size % nodes as u64 != 0 {
            return Err(MeshError::InvalidGeometry(format!(
                "buffer size {} does not split into {} blocks",
                size, nodes
            )));
        }
        Self::new(1, nodes, size / nodes as u64, chunk_size)
    }

    pub fn validate(&self) -> MeshResult<()> {
        if self.sections == 0
            || self.nodes_per_section == 0
            || self.block_size == 0
            || self.chunk_size == 0
        {
            return Err(MeshError::InvalidGeometry(format!(
                "all dimensions must be non-zero: {:?}",
                self
            )));
        }
        if self.nodes_per_section as usize > MAX_NODES {
            return Err(MeshError::InvalidGeometry(format!(
                "{} nodes per section exceeds {}",
                self.nodes_per_section, MAX_NODES
            )));
        }
        if self.block_size % self.chunk_size != 0 {
            return Err(MeshError::InvalidGeometry(format!(
                "block size {} is not a multiple of chunk size {}",
                self.block_size, self.chunk_size
            )));
        }
        let section_chunks = self.chunks_per_block() as u64 * self.nodes_per_section as u64;
        if section_chunks > MAX_ASSIGNMENT_COUNT as u64 {
            return Err(MeshError::InvalidGeometry(format!(
                "{} chunks per section exceeds {}",
                section_chunks, MAX_ASSIGNMENT_COUNT
            )));
        }
        self.sections
            .checked_mul(self.nodes_per_section)
            .and_then(|blocks| (blocks as u64).checked_mul(self.block_size))
            .ok_or_else(|| MeshError::InvalidGeometry("buffer size overflows".into()))?;
        Ok(())
    }

    pub fn section_size(&self) -> u64 {
        self.nodes_per_section as u64 * self.block_size
    }

    pub fn size(&self) -> u64 {
        self.sections as u64 * self.section_size()
    }

    pub fn chunks_per_block(&self) -> usize {
        (self.block_size / self.chunk_size) as usize
    }

    /// Index of a block across all sections.
    pub fn global_block(&self, section: u32, node: NodeId) -> u64 {
        section as u64 * self.nodes_per_section as u64 + node.rank() as u64
    }

    pub fn block_offset(&self, section: u32, node: NodeId) -> u64 {
        self.global_block(section, node) * self.block_size
    }

    pub fn block_range(&self, section: u32, node: NodeId) -> Range<u64> {
        let start = self.block_offset(section, node);
        start..start + self.block_size
    }

    /// Offsets of every chunk in one block, in chunk order.
    pub fn chunk_offsets(&self, section: u32, node: NodeId) -> impl Iterator<Item = u64> {
        let start = self.block_offset(section, node);
        let chunk_size = self.chunk_size;
        (0..self.chunks_per_block() as u64).map(move |i| start + i * chunk_size)
    }

    /// Byte range of the chunk starting at `offset`.
    pub fn chunk_range(&self, offset: u64) -> MeshResult<Range<u64>> {
        if offset % self.chunk_size != 0 || offset >= self.size() {
            return Err(MeshError::InvalidGeometry(format!(
                "offset {} is not a chunk boundary",
                offset
            )));
        }
        Ok(offset..offset + self.chunk_size)
    }

    /// Position of the chunk at `offset` within its block.
    pub fn chunk_index(&self, offset: u64) -> usize {
        ((offset % self.block_size) / self.chunk_size) as usize
    }

    /// Section and originating rank of the block containing `offset`.
    pub fn locate(&self, offset: u64) -> MeshResult<(u32, NodeId)> {
        if offset >= self.size() {
            return Err(MeshError::InvalidGeometry(format!(
                "offset {} beyond buffer size {}",
                offset,
                self.size()
            )));
        }
        let block = offset / self.block_size;
        let section = (block / self.nodes_per_section as u64) as u32;
        let rank = (block % self.nodes_per_section as u64) as u8;
        Ok((section, NodeId::from_rank(rank)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_two_node_geometry() {
        let geometry = BufferGeometry::for_buffer(4 * MIB, 2, MIB).unwrap();
        assert_eq!(geometry.block_size, 2 * MIB);
        assert_eq!(geometry.chunks_per_block(), 2);
        assert_eq!(geometry.size(), 4 * MIB);
        let node1 = NodeId::new(1).unwrap();
        assert_eq!(
            geometry.chunk_offsets(0, node1).collect::<Vec<_>>(),
            vec![2 * MIB, 3 * MIB]
        );
        assert_eq!(geometry.locate(3 * MIB).unwrap(), (0, node1));
        assert_eq!(geometry.chunk_index(3 * MIB), 1);
    }

    #[test]
    fn test_sections() {
        let geometry = BufferGeometry::new(2, 4, 64, 16).unwrap();
        let node2 = NodeId::new(2).unwrap();
        assert_eq!(geometry.section_size(), 256);
        assert_eq!(geometry.size(), 512);
        assert_eq!(geometry.global_block(1, node2), 6);
        assert_eq!(geometry.block_range(1, node2), 384..448);
        assert_eq!(geometry.locate(400).unwrap(), (1, node2));
    }

    #[test]
    fn test_invalid_geometry() {
        assert!(BufferGeometry::new(1, 2, 100, 30).is_err());
        assert!(BufferGeometry::new(0, 2, 64, 16).is_err());
        assert!(BufferGeometry::new(1, 33, 64, 16).is_err());
        assert!(BufferGeometry::new(1, 32, 4096, 1).is_err());
        assert!(BufferGeometry::for_buffer(10, 3, 1).is_err());
    }

    #[test]
    fn test_chunk_range_bounds() {
        let geometry = BufferGeometry::new(1, 2, 64, 16).unwrap();
        assert_eq!(geometry.chunk_range(16).unwrap(), 16..32);
        assert!(geometry.chunk_range(8).is_err());
        assert!(geometry.chunk_range(128).is_err());
    }
}
