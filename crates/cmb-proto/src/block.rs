//! Block identifiers, ranges, and resource-to-block arithmetic.
//!
//! A resource is cut into fixed-size blocks numbered `0..N`. Blocks are the
//! unit of FEC coding, acknowledgement, and range negotiation. Ranges are
//! half-open `[start, end)` with `start <= end`; an empty range
//! (`start == end`) is meaningful on the wire as the opposite-range ACK.

use crate::fec::BLOCK_SIZE;

/// Identifies one block of a resource. Carried as 48 bits on the wire.
pub type BlockId = u64;

/// Largest value representable in the 48-bit wire field.
pub const MAX_BLOCK_ID: u64 = (1 << 48) - 1;

/// Number of blocks a resource of the given length occupies.
pub fn block_count(resource_length: u64) -> u64 {
    resource_length.div_ceil(BLOCK_SIZE)
}

/// Size in bytes of the given block, or `None` if the id is out of range.
///
/// All blocks are `BLOCK_SIZE` long except the last, which carries the
/// remainder of the resource.
pub fn block_size(resource_length: u64, block_id: BlockId) -> Option<u64> {
    let count = block_count(resource_length);
    if block_id >= count {
        return None;
    }
    if block_id + 1 < count {
        return Some(BLOCK_SIZE);
    }
    let tail = resource_length % BLOCK_SIZE;
    Some(if tail == 0 { BLOCK_SIZE } else { tail })
}

/// A half-open range of block ids, `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub start: BlockId,
    pub end: BlockId,
}

impl BlockRange {
    /// The full range of an `n`-block resource.
    pub fn full(block_count: u64) -> Self {
        BlockRange { start: 0, end: block_count }
    }

    /// An empty range positioned at `at`.
    pub fn empty_at(at: BlockId) -> Self {
        BlockRange { start: at, end: at }
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.start <= id && id < self.end
    }

    /// Clips this range to the intersection with `other`.
    ///
    /// Ranges only ever contract over the lifetime of a connection, so the
    /// intersection is the correct interpretation of every refresh or
    /// shrink. Returns `true` if either bound moved.
    pub fn clip_to(&mut self, other: BlockRange) -> bool {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        let changed = start != self.start || end != self.end;
        self.start = start;
        self.end = end.max(start);
        changed
    }

    /// Iterates block ids in transmission order.
    ///
    /// REVERSE is an iteration direction, not a separate scheduling path:
    /// the same range walked from the high end.
    pub fn iter_directed(&self, reverse: bool) -> impl Iterator<Item = BlockId> {
        let forward = (!reverse).then_some(self.start..self.end);
        let backward = reverse.then(|| (self.start..self.end).rev());
        forward.into_iter().flatten().chain(backward.into_iter().flatten())
    }
}

impl std::fmt::Display for BlockRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_count() {
        assert_eq!(block_count(0), 0);
        assert_eq!(block_count(1), 1);
        assert_eq!(block_count(BLOCK_SIZE), 1);
        assert_eq!(block_count(BLOCK_SIZE + 1), 2);
        assert_eq!(block_count(100 * BLOCK_SIZE), 100);
    }

    #[test]
    fn test_block_size_tail() {
        let len = 2 * BLOCK_SIZE + 100;
        assert_eq!(block_size(len, 0), Some(BLOCK_SIZE));
        assert_eq!(block_size(len, 1), Some(BLOCK_SIZE));
        assert_eq!(block_size(len, 2), Some(100));
        assert_eq!(block_size(len, 3), None);
    }

    #[test]
    fn test_block_size_exact_multiple() {
        let len = 3 * BLOCK_SIZE;
        assert_eq!(block_size(len, 2), Some(BLOCK_SIZE));
        assert_eq!(block_size(len, 3), None);
    }

    #[test]
    fn test_clip_only_shrinks() {
        let mut range = BlockRange { start: 10, end: 90 };
        assert!(range.clip_to(BlockRange { start: 0, end: 80 }));
        assert_eq!(range, BlockRange { start: 10, end: 80 });

        // A wider range is a no-op.
        assert!(!range.clip_to(BlockRange { start: 0, end: 100 }));
        assert_eq!(range, BlockRange { start: 10, end: 80 });
    }

    #[test]
    fn test_clip_disjoint_collapses() {
        let mut range = BlockRange { start: 10, end: 20 };
        range.clip_to(BlockRange { start: 40, end: 50 });
        assert!(range.is_empty());
    }

    #[test]
    fn test_directed_iteration() {
        let range = BlockRange { start: 3, end: 6 };
        let forward: Vec<_> = range.iter_directed(false).collect();
        let backward: Vec<_> = range.iter_directed(true).collect();
        assert_eq!(forward, vec![3, 4, 5]);
        assert_eq!(backward, vec![5, 4, 3]);
    }
}
