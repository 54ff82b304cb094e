//! Wire codec for the seven CMB packet kinds.
//!
//! Every packet is a single UDP datagram opening with a 16-bit magic in
//! network order, followed by a fixed big-endian layout (Data additionally
//! carries a variable symbol payload). Frames with an unknown magic, a
//! short or oversized layout, or an inconsistent block range are rejected
//! here and silently dropped by callers.
//!
//! ```text
//! RequestResource  0xcb00  flags:8 ts:24 rate:32 start:48 hash:128 len:64 end:48
//! Data             0xcb01  block:48 ts:24 delay:16 seq:24 payload...
//! AckBlock         0xcb02  block:48
//! NackBlock        0xcb03  block:48 received:16
//! ShrinkRange      0xcb04  start:48 end:48
//! Error            0xcb05  code:16
//! Feedback         0xcb06  delay:16 ts:24 rate:32 loss:f32
//! ```

use crate::block::BlockRange;
use crate::error::WireError;
use crate::resource::ResourceId;
use crate::sequence::SequenceNumber;
use crate::timestamp::Timestamp;

pub const MAGIC_REQUEST_RESOURCE: u16 = 0xcb00;
pub const MAGIC_DATA: u16 = 0xcb01;
pub const MAGIC_ACK_BLOCK: u16 = 0xcb02;
pub const MAGIC_NACK_BLOCK: u16 = 0xcb03;
pub const MAGIC_SHRINK_RANGE: u16 = 0xcb04;
pub const MAGIC_ERROR: u16 = 0xcb05;
pub const MAGIC_FEEDBACK: u16 = 0xcb06;

/// Request flag: traverse blocks from the high-id end first.
pub const FLAG_REVERSE: u8 = 0x01;

/// Fixed Data header size including the magic. The symbol payload follows.
pub const DATA_HEADER_SIZE: usize = 16;

// ============================================================================
// Field reader / writer
// ============================================================================

struct WireReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> WireReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.data.len() - self.offset < n {
            return Err(WireError::Truncated {
                expected: self.offset + n,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.offset..self.offset + n];
        self.offset += n;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u24(&mut self) -> Result<u32, WireError> {
        let b = self.take(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u48(&mut self) -> Result<u64, WireError> {
        let b = self.take(6)?;
        Ok(u64::from_be_bytes([0, 0, b[0], b[1], b[2], b[3], b[4], b[5]]))
    }

    fn read_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_be_bytes(buf))
    }

    fn read_f32(&mut self) -> Result<f32, WireError> {
        let b = self.take(4)?;
        Ok(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_hash(&mut self) -> Result<[u8; 16], WireError> {
        let b = self.take(16)?;
        let mut buf = [0u8; 16];
        buf.copy_from_slice(b);
        Ok(buf)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.offset..];
        self.offset = self.data.len();
        slice
    }

    fn finish(self) -> Result<(), WireError> {
        let remaining = self.data.len() - self.offset;
        if remaining != 0 {
            return Err(WireError::TrailingBytes(remaining));
        }
        Ok(())
    }
}

struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    fn new(magic: u16) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&magic.to_be_bytes());
        Self { buf }
    }

    fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn write_u24(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes()[1..]);
    }

    fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn write_u48(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes()[2..]);
    }

    fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn write_f32(&mut self, v: f32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn write_raw(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

fn read_range(reader: &mut WireReader<'_>) -> Result<(u64, u64), WireError> {
    let start = reader.read_u48()?;
    let end = reader.read_u48()?;
    if start > end {
        return Err(WireError::InvalidRange { start, end });
    }
    Ok((start, end))
}

// ============================================================================
// Packet kinds
// ============================================================================

/// Opens or refreshes a connection; doubles as the keepalive and RTT probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestResource {
    /// Traverse the range from the high end first.
    pub reverse: bool,
    /// Receiver-clock send time of this request.
    pub timestamp: Timestamp,
    /// Target sending rate in bits per second.
    pub sending_rate: u32,
    /// The block range this connection should serve.
    pub block_range: BlockRange,
    /// Identity of the requested resource.
    pub resource_id: ResourceId,
}

impl RequestResource {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_u8(if self.reverse { FLAG_REVERSE } else { 0 });
        w.write_u24(self.timestamp.as_millis());
        w.write_u32(self.sending_rate);
        w.write_u48(self.block_range.start);
        w.write_raw(&self.resource_id.hash);
        w.write_u64(self.resource_id.length);
        w.write_u48(self.block_range.end);
    }

    fn read_fields(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        let flags = r.read_u8()?;
        let timestamp = Timestamp::from_millis(r.read_u24()? as u64);
        let sending_rate = r.read_u32()?;
        let start = r.read_u48()?;
        let hash = r.read_hash()?;
        let length = r.read_u64()?;
        let end = r.read_u48()?;
        if start > end {
            return Err(WireError::InvalidRange { start, end });
        }
        Ok(RequestResource {
            reverse: flags & FLAG_REVERSE != 0,
            timestamp,
            sending_rate,
            block_range: BlockRange { start, end },
            resource_id: ResourceId { hash, length },
        })
    }
}

/// One encoded FEC symbol for a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    pub block_id: u64,
    /// Sender-clock send time, echoed back in Feedback.
    pub timestamp: Timestamp,
    /// Milliseconds the sender held the last request before this send.
    pub delay_ms: u16,
    pub sequence: SequenceNumber,
    /// Serialized RaptorQ encoding packet.
    pub payload: Vec<u8>,
}

impl Data {
    fn write_fields(&self, w: &mut WireWriter) {
        w.write_u48(self.block_id);
        w.write_u24(self.timestamp.as_millis());
        w.write_u16(self.delay_ms);
        w.write_u24(self.sequence.value());
        w.write_raw(&self.payload);
    }

    fn read_fields(r: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Data {
            block_id: r.read_u48()?,
            timestamp: Timestamp::from_millis(r.read_u24()? as u64),
            delay_ms: r.read_u16()?,
            sequence: SequenceNumber::new(r.read_u24()?),
            payload: r.rest().to_vec(),
        })
    }
}

/// The block decoded; stop sending symbols for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckBlock {
    pub block_id: u64,
}

/// The block is stuck; grant more symbols beyond the nominal budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackBlock {
    pub block_id: u64,
    /// Symbols the receiver has accumulated for the block so far.
    pub received: u16,
}

/// Retires a sub-range of block ids from this connection.
///
/// Shrinking to an empty range is the opposite-range ACK that stops the
/// sender entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShrinkRange {
    pub block_range: BlockRange,
}

/// Numeric error codes carried by [`ErrorPacket`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ErrorCode {
    ResourceNotFound = 0,
    ProtocolViolation = 1,
}

impl TryFrom<u16> for ErrorCode {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, WireError> {
        match value {
            0 => Ok(ErrorCode::ResourceNotFound),
            1 => Ok(ErrorCode::ProtocolViolation),
            other => Err(WireError::UnknownErrorCode(other)),
        }
    }
}

/// Reports a peer-visible protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPacket {
    pub code: ErrorCode,
}

/// TFRC measurement report from the receiver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feedback {
    /// Milliseconds between the last Data receipt and this report.
    pub delay_ms: u16,
    /// Echo of the last received Data packet's timestamp.
    pub timestamp: Timestamp,
    /// Receive rate over the last round trip, in packets per second.
    pub receive_rate: u32,
    /// Current loss-event-rate estimate.
    pub loss_event_rate: f32,
}

// ============================================================================
// Tagged packet value
// ============================================================================

/// Any CMB packet, produced by one parse and branched on by the state
/// machines.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    RequestResource(RequestResource),
    Data(Data),
    AckBlock(AckBlock),
    NackBlock(NackBlock),
    ShrinkRange(ShrinkRange),
    Error(ErrorPacket),
    Feedback(Feedback),
}

impl Packet {
    /// The packet's wire magic.
    pub fn magic(&self) -> u16 {
        match self {
            Packet::RequestResource(_) => MAGIC_REQUEST_RESOURCE,
            Packet::Data(_) => MAGIC_DATA,
            Packet::AckBlock(_) => MAGIC_ACK_BLOCK,
            Packet::NackBlock(_) => MAGIC_NACK_BLOCK,
            Packet::ShrinkRange(_) => MAGIC_SHRINK_RANGE,
            Packet::Error(_) => MAGIC_ERROR,
            Packet::Feedback(_) => MAGIC_FEEDBACK,
        }
    }

    /// Serializes the packet into a datagram.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = WireWriter::new(self.magic());
        match self {
            Packet::RequestResource(p) => p.write_fields(&mut w),
            Packet::Data(p) => p.write_fields(&mut w),
            Packet::AckBlock(p) => w.write_u48(p.block_id),
            Packet::NackBlock(p) => {
                w.write_u48(p.block_id);
                w.write_u16(p.received);
            }
            Packet::ShrinkRange(p) => {
                w.write_u48(p.block_range.start);
                w.write_u48(p.block_range.end);
            }
            Packet::Error(p) => w.write_u16(p.code as u16),
            Packet::Feedback(p) => {
                w.write_u16(p.delay_ms);
                w.write_u24(p.timestamp.as_millis());
                w.write_u32(p.receive_rate);
                w.write_f32(p.loss_event_rate);
            }
        }
        w.finish()
    }

    /// Parses a datagram into a packet.
    pub fn parse(frame: &[u8]) -> Result<Packet, WireError> {
        let mut r = WireReader::new(frame);
        let magic = r.read_u16()?;
        let packet = match magic {
            MAGIC_REQUEST_RESOURCE => Packet::RequestResource(RequestResource::read_fields(&mut r)?),
            MAGIC_DATA => Packet::Data(Data::read_fields(&mut r)?),
            MAGIC_ACK_BLOCK => Packet::AckBlock(AckBlock { block_id: r.read_u48()? }),
            MAGIC_NACK_BLOCK => Packet::NackBlock(NackBlock {
                block_id: r.read_u48()?,
                received: r.read_u16()?,
            }),
            MAGIC_SHRINK_RANGE => {
                let (start, end) = read_range(&mut r)?;
                Packet::ShrinkRange(ShrinkRange { block_range: BlockRange { start, end } })
            }
            MAGIC_ERROR => Packet::Error(ErrorPacket { code: ErrorCode::try_from(r.read_u16()?)? }),
            MAGIC_FEEDBACK => Packet::Feedback(Feedback {
                delay_ms: r.read_u16()?,
                timestamp: Timestamp::from_millis(r.read_u24()? as u64),
                receive_rate: r.read_u32()?,
                loss_event_rate: r.read_f32()?,
            }),
            other => return Err(WireError::UnknownMagic(other)),
        };
        r.finish()?;
        Ok(packet)
    }
}
