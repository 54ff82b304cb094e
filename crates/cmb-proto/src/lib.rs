//! # cmb-proto
//!
//! Protocol engine for CMB, a UDP-based receiver-driven bulk transfer
//! protocol. A sender holds content-addressed resources; a receiver streams
//! one of them over one or two parallel connections, with packet loss
//! repaired by per-block RaptorQ forward error correction instead of
//! retransmission.
//!
//! ## Protocol flow
//!
//! ```text
//! Receiver                                            Sender
//!    |                                                   |
//!    |  ── RequestResource (rate, range, [REVERSE]) ──>  |
//!    |                                                   |
//!    |  <────────── Data (block, seqno, symbol) ───────  |
//!    |  <────────── Data ...   (paced at rate)  ───────  |
//!    |                                                   |
//!    |        (block decodes from any K' symbols)        |
//!    |  ── AckBlock ──────────────────────────────────>  |
//!    |  ── Feedback (rtt echo, rate, loss) ───────────>  |
//!    |  ── NackBlock (stuck block) ───────────────────>  |
//!    |  ── ShrinkRange (claimed elsewhere / done) ────>  |
//!    |                                                   |
//! ```
//!
//! With two endpoints the session opens one forward and one REVERSE
//! connection over the full block range; the ranges contract towards each
//! other and meet in the middle, splitting the work in proportion to the
//! rate each peer sustains.
//!
//! This crate contains no I/O. The state machines take explicit `now`
//! instants and return the packets and actions the caller must carry out,
//! which keeps every timing rule unit-testable; `cmb-node` drives them over
//! real sockets.

pub mod block;
pub mod error;
pub mod fec;
pub mod partition;
pub mod receiver;
pub mod resource;
pub mod sender;
pub mod sequence;
pub mod tfrc;
pub mod timestamp;
pub mod wire;

pub use block::{block_count, block_size, BlockId, BlockRange};
pub use error::{ProtoError, Result, WireError};
pub use fec::{BlockDecoder, BlockEncoder, BLOCK_SIZE, SYMBOL_SIZE};
pub use partition::{Partitioner, SessionInstruction, MAX_CONNECTIONS};
pub use receiver::{ReceiverAction, ReceiverConnection, ReceiverState};
pub use resource::{Resource, ResourceId};
pub use sender::{SenderConnection, SenderState, SEGMENT_SIZE};
pub use sequence::SequenceNumber;
pub use tfrc::{RttEstimator, TfrcReceiver, TfrcSender};
pub use timestamp::Timestamp;
pub use wire::{ErrorCode, Packet};

/// Default server port.
pub const DEFAULT_PORT: u16 = 9999;

/// Default sending rate in bits per second.
pub const DEFAULT_SENDING_RATE: u32 = 500_000;
