//! Receiver-side work partitioning across parallel connections.
//!
//! With a single endpoint the session runs one forward connection over the
//! whole block range. With two, both connections request the full range but
//! traverse it from opposite ends; each decoded block is claimed by the
//! connection that produced it first, and the partitioner tells the other
//! connection to retire it. The two working ranges contract towards each
//! other and the session is done when every block has been claimed exactly
//! once. No further arbitration is needed: with unequal rates the
//! convergence point simply lands where each peer has contributed in
//! proportion.

use std::collections::HashSet;

use tracing::debug;

use crate::block::{BlockId, BlockRange};

/// Maximum number of parallel connections per session.
pub const MAX_CONNECTIONS: usize = 2;

/// What the session driver must do after a block lands.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionInstruction {
    /// Write the block to the output sink.
    Write { block_id: BlockId, data: Vec<u8> },
    /// Tell the given connection to retire the block from its range.
    Claim { connection: usize, block_id: BlockId },
    /// Every block has been obtained; tear the session down.
    Complete,
}

/// Session-level completion tracker.
///
/// The sole owner of the claimed-block set; connections report decoded
/// blocks and never touch each other's state.
#[derive(Debug)]
pub struct Partitioner {
    blocks_total: u64,
    connections: usize,
    acked: HashSet<BlockId>,
}

impl Partitioner {
    /// Creates a tracker for `blocks_total` blocks served over
    /// `connections` parallel connections (at most [`MAX_CONNECTIONS`]).
    pub fn new(blocks_total: u64, connections: usize) -> Self {
        debug_assert!((1..=MAX_CONNECTIONS).contains(&connections));
        Self {
            blocks_total,
            connections,
            acked: HashSet::new(),
        }
    }

    /// Initial (range, reverse) assignment per connection.
    pub fn assignments(&self) -> Vec<(BlockRange, bool)> {
        let full = BlockRange::full(self.blocks_total);
        (0..self.connections).map(|i| (full, i == 1)).collect()
    }

    /// Whether every block has been obtained.
    pub fn is_complete(&self) -> bool {
        self.acked.len() as u64 == self.blocks_total
    }

    /// Number of blocks obtained so far.
    pub fn acked_count(&self) -> u64 {
        self.acked.len() as u64
    }

    /// Records a block decoded on `connection`.
    ///
    /// The first connection to deliver a block claims it; duplicates from
    /// the overlap window are dropped without a second write.
    pub fn on_decoded(
        &mut self,
        connection: usize,
        block_id: BlockId,
        data: Vec<u8>,
    ) -> Vec<SessionInstruction> {
        let mut out = Vec::new();
        if block_id >= self.blocks_total || !self.acked.insert(block_id) {
            return out;
        }

        out.push(SessionInstruction::Write { block_id, data });
        for other in 0..self.connections {
            if other != connection {
                out.push(SessionInstruction::Claim { connection: other, block_id });
            }
        }

        if self.is_complete() {
            debug!(blocks = self.blocks_total, "all blocks obtained");
            out.push(SessionInstruction::Complete);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writes(instructions: &[SessionInstruction]) -> Vec<BlockId> {
        instructions
            .iter()
            .filter_map(|i| match i {
                SessionInstruction::Write { block_id, .. } => Some(*block_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_single_connection_assignment() {
        let partitioner = Partitioner::new(100, 1);
        assert_eq!(partitioner.assignments(), vec![(BlockRange::full(100), false)]);
    }

    #[test]
    fn test_dual_connection_assignment() {
        let partitioner = Partitioner::new(100, 2);
        let assignments = partitioner.assignments();
        assert_eq!(assignments.len(), 2);
        // Both cover the full range; only the direction differs.
        assert_eq!(assignments[0], (BlockRange::full(100), false));
        assert_eq!(assignments[1], (BlockRange::full(100), true));
    }

    #[test]
    fn test_decoded_block_claims_for_other_connection() {
        let mut partitioner = Partitioner::new(4, 2);
        let out = partitioner.on_decoded(0, 0, vec![1]);
        assert_eq!(
            out,
            vec![
                SessionInstruction::Write { block_id: 0, data: vec![1] },
                SessionInstruction::Claim { connection: 1, block_id: 0 },
            ]
        );
    }

    #[test]
    fn test_duplicate_delivery_writes_once() {
        let mut partitioner = Partitioner::new(4, 2);
        assert_eq!(writes(&partitioner.on_decoded(0, 2, vec![7])), vec![2]);
        // The other connection raced on the same block around convergence.
        assert!(partitioner.on_decoded(1, 2, vec![7]).is_empty());
        assert_eq!(partitioner.acked_count(), 1);
    }

    #[test]
    fn test_every_block_exactly_once_to_completion() {
        let mut partitioner = Partitioner::new(6, 2);
        let mut written = Vec::new();

        // Connection 0 works up from 0, connection 1 down from 5.
        for (conn, id) in [(0, 0), (1, 5), (0, 1), (1, 4), (0, 2), (1, 3)] {
            let out = partitioner.on_decoded(conn, id, vec![id as u8]);
            written.extend(writes(&out));
            let complete = out.iter().any(|i| *i == SessionInstruction::Complete);
            assert_eq!(complete, partitioner.is_complete());
        }

        written.sort_unstable();
        assert_eq!(written, vec![0, 1, 2, 3, 4, 5]);
        assert!(partitioner.is_complete());
    }

    #[test]
    fn test_empty_resource_is_immediately_complete() {
        let partitioner = Partitioner::new(0, 1);
        assert!(partitioner.is_complete());
    }

    #[test]
    fn test_out_of_range_block_ignored() {
        let mut partitioner = Partitioner::new(2, 1);
        assert!(partitioner.on_decoded(0, 9, vec![0]).is_empty());
        assert_eq!(partitioner.acked_count(), 0);
    }
}
