//! FEC block engine wrapping RaptorQ.
//!
//! Each block is coded independently: the sender holds one encoder per
//! in-flight block and derives an effectively unbounded stream of encoded
//! symbols from it, the receiver holds one decoder per in-flight block and
//! feeds it symbols in whatever order they arrive. A block decodes once any
//! sufficient subset of symbols (roughly the source count, with small
//! overhead) has been received, regardless of loss pattern.
//!
//! Symbols are deterministic: the same (block, sequence number) always
//! yields the same bytes, so overlap between two connections serving the
//! same block is harmless.

use raptorq::{Decoder, Encoder, EncodingPacket, ObjectTransmissionInformation};

use crate::sequence::SequenceNumber;

/// Size of one encoded symbol in bytes.
pub const SYMBOL_SIZE: u16 = 512;

/// Number of source symbols in a full block.
pub const SOURCE_SYMBOLS_PER_BLOCK: u64 = 100;

/// Size of one block in bytes.
pub const BLOCK_SIZE: u64 = SYMBOL_SIZE as u64 * SOURCE_SYMBOLS_PER_BLOCK;

/// Serialized size of the RaptorQ payload id prefixed to every symbol.
pub const PAYLOAD_ID_SIZE: usize = 4;

/// Number of source symbols needed to cover `block_len` bytes.
pub fn source_symbols(block_len: u64) -> u32 {
    block_len.div_ceil(SYMBOL_SIZE as u64) as u32
}

/// Encoder for one block.
///
/// Sequence numbers below the source-symbol count map to source packets;
/// everything above maps to repair packets, generated on demand.
pub struct BlockEncoder {
    encoder: Encoder,
    source: Vec<Vec<u8>>,
}

impl BlockEncoder {
    /// Creates an encoder over the block's source bytes.
    ///
    /// `block` must be non-empty; zero-length resources have zero blocks
    /// and never reach the codec.
    pub fn new(block: &[u8]) -> Self {
        debug_assert!(!block.is_empty());
        let encoder = Encoder::with_defaults(block, SYMBOL_SIZE);
        let source: Vec<Vec<u8>> = encoder
            .get_block_encoders()
            .first()
            .map(|b| b.source_packets().iter().map(|p| p.serialize()).collect())
            .unwrap_or_default();
        Self { encoder, source }
    }

    /// Number of source symbols for this block.
    pub fn source_symbols(&self) -> u32 {
        self.source.len() as u32
    }

    /// The encoded symbol for the given sequence number.
    pub fn symbol(&self, seq: SequenceNumber) -> Vec<u8> {
        let index = seq.value();
        if let Some(packet) = self.source.get(index as usize) {
            return packet.clone();
        }
        let repair_index = index - self.source.len() as u32;
        self.encoder
            .get_block_encoders()
            .first()
            .and_then(|b| b.repair_packets(repair_index, 1).into_iter().next())
            .map(|p| p.serialize())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for BlockEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockEncoder")
            .field("source_symbols", &self.source.len())
            .finish()
    }
}

/// Decoder for one block.
///
/// Created lazily on the first symbol for a block and dropped as soon as
/// the block decodes. Tolerates duplicates and arbitrary arrival order.
pub struct BlockDecoder {
    decoder: Decoder,
    block_len: u64,
    symbols_seen: u32,
    complete: bool,
}

impl BlockDecoder {
    /// Creates a decoder for a block of `block_len` source bytes.
    pub fn new(block_len: u64) -> Self {
        let oti = ObjectTransmissionInformation::with_defaults(block_len, SYMBOL_SIZE);
        Self {
            decoder: Decoder::new(oti),
            block_len,
            symbols_seen: 0,
            complete: false,
        }
    }

    /// Number of symbols fed so far, duplicates included.
    pub fn symbols_seen(&self) -> u32 {
        self.symbols_seen
    }

    /// Number of source symbols this block was cut into.
    pub fn symbols_needed(&self) -> u32 {
        source_symbols(self.block_len)
    }

    /// Whether the block has already been reconstructed.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Feeds one received symbol payload.
    ///
    /// Returns the reconstructed block bytes on the symbol that completes
    /// decoding, `None` otherwise. Payloads too short to carry a RaptorQ
    /// payload id are ignored.
    pub fn feed(&mut self, payload: &[u8]) -> Option<Vec<u8>> {
        if self.complete || payload.len() <= PAYLOAD_ID_SIZE {
            return None;
        }
        self.symbols_seen += 1;

        let packet = EncodingPacket::deserialize(payload);
        let mut data = self.decoder.decode(packet)?;
        data.truncate(self.block_len as usize);
        self.complete = true;
        Some(data)
    }
}

impl std::fmt::Debug for BlockDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDecoder")
            .field("block_len", &self.block_len)
            .field("symbols_seen", &self.symbols_seen)
            .field("complete", &self.complete)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_block(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn decode_all(decoder: &mut BlockDecoder, symbols: impl IntoIterator<Item = Vec<u8>>) -> Option<Vec<u8>> {
        for s in symbols {
            if let Some(data) = decoder.feed(&s) {
                return Some(data);
            }
        }
        None
    }

    #[test]
    fn test_source_symbols() {
        assert_eq!(source_symbols(1), 1);
        assert_eq!(source_symbols(SYMBOL_SIZE as u64), 1);
        assert_eq!(source_symbols(SYMBOL_SIZE as u64 + 1), 2);
        assert_eq!(source_symbols(BLOCK_SIZE), SOURCE_SYMBOLS_PER_BLOCK as u32);
    }

    #[test]
    fn test_roundtrip_full_block() {
        let block = test_block(BLOCK_SIZE as usize);
        let encoder = BlockEncoder::new(&block);
        assert_eq!(encoder.source_symbols(), SOURCE_SYMBOLS_PER_BLOCK as u32);

        let mut decoder = BlockDecoder::new(block.len() as u64);
        let symbols = (0..encoder.source_symbols()).map(|i| encoder.symbol(SequenceNumber::new(i)));
        let decoded = decode_all(&mut decoder, symbols).expect("all source symbols must decode");
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_roundtrip_short_block() {
        let block = test_block(700);
        let encoder = BlockEncoder::new(&block);
        assert_eq!(encoder.source_symbols(), 2);

        let mut decoder = BlockDecoder::new(block.len() as u64);
        let symbols = (0..encoder.source_symbols() + 2).map(|i| encoder.symbol(SequenceNumber::new(i)));
        let decoded = decode_all(&mut decoder, symbols).expect("short block must decode");
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_decode_from_repair_only() {
        let block = test_block(4 * SYMBOL_SIZE as usize);
        let encoder = BlockEncoder::new(&block);
        let k = encoder.source_symbols();

        // Skip every source symbol; repair symbols alone must suffice.
        let mut decoder = BlockDecoder::new(block.len() as u64);
        let symbols = (k..k + 2 * k + 8).map(|i| encoder.symbol(SequenceNumber::new(i)));
        let decoded = decode_all(&mut decoder, symbols).expect("repair symbols must decode");
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_decode_with_loss_and_reorder() {
        let block = test_block(BLOCK_SIZE as usize);
        let encoder = BlockEncoder::new(&block);
        let k = encoder.source_symbols();

        // Drop every third symbol and deliver the survivors back to front.
        let mut survivors: Vec<Vec<u8>> = (0..2 * k)
            .filter(|i| i % 3 != 0)
            .map(|i| encoder.symbol(SequenceNumber::new(i)))
            .collect();
        survivors.reverse();

        let mut decoder = BlockDecoder::new(block.len() as u64);
        let decoded = decode_all(&mut decoder, survivors).expect("must decode under 33% loss");
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_duplicates_are_harmless() {
        let block = test_block(3 * SYMBOL_SIZE as usize);
        let encoder = BlockEncoder::new(&block);
        let first = encoder.symbol(SequenceNumber::ZERO);

        let mut decoder = BlockDecoder::new(block.len() as u64);
        for _ in 0..10 {
            assert!(decoder.feed(&first).is_none());
        }
        let rest = (1..encoder.source_symbols() + 4).map(|i| encoder.symbol(SequenceNumber::new(i)));
        let decoded = decode_all(&mut decoder, rest).expect("duplicates must not poison decoding");
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_symbols_deterministic() {
        let block = test_block(2000);
        let a = BlockEncoder::new(&block);
        let b = BlockEncoder::new(&block);
        for i in 0..10 {
            let seq = SequenceNumber::new(i);
            assert_eq!(a.symbol(seq), b.symbol(seq));
        }
    }

    #[test]
    fn test_runt_payload_ignored() {
        let mut decoder = BlockDecoder::new(100);
        assert!(decoder.feed(&[1, 2, 3]).is_none());
        assert_eq!(decoder.symbols_seen(), 0);
    }
}
