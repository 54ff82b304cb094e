//! Receiver-side connection state machine.
//!
//! One instance per server endpoint the session talks to. The machine is
//! sans-I/O like its sender counterpart: the driving actor feeds it inbound
//! packets and timer polls, and it returns actions (packets to send,
//! decoded blocks to hand to the partitioner, or terminal outcomes).
//!
//! ```text
//! Requesting ──first Data──> Established ──range empty──> Completing ──1 RTT──> Closed
//!     │                          │
//!     └─30 s backoff exhausted   └─10 s inactivity ──> Closed (failed)
//! ```

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::block::{block_count, block_size, BlockId, BlockRange};
use crate::error::ProtoError;
use crate::fec::BlockDecoder;
use crate::resource::ResourceId;
use crate::sender::SEGMENT_SIZE;
use crate::tfrc::{RttEstimator, TfrcReceiver};
use crate::timestamp::Timestamp;
use crate::wire::{
    AckBlock, Data, ErrorCode, ErrorPacket, NackBlock, Packet, RequestResource, ShrinkRange,
};

/// First retransmit interval for the initial request.
pub const HANDSHAKE_INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Ceiling for the doubling request backoff.
pub const HANDSHAKE_MAX_BACKOFF: Duration = Duration::from_millis(3_200);

/// Give up on a sender that never answered after this long.
pub const HANDSHAKE_GIVE_UP: Duration = Duration::from_secs(30);

/// A mid-transfer connection with no inbound packet for this long fails.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Floor of the feedback reporting period.
pub const FEEDBACK_FLOOR: Duration = Duration::from_millis(250);

/// Ceiling of the keepalive request period.
pub const KEEPALIVE_CEILING: Duration = Duration::from_millis(250);

/// Floor of the keepalive request period.
pub const KEEPALIVE_FLOOR: Duration = Duration::from_millis(1);

/// Symbols beyond the source count after which a still-undecoded block is
/// NACKed.
pub const NACK_DECODE_SLACK: u32 = 5;

/// A lost ack is re-sent when Data for an acked block arrives this many
/// round trips after the previous ack.
pub const ACK_REFRESH_RTTS: u32 = 4;

/// Receiver connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Requesting,
    Established,
    Completing,
    Closed,
}

/// What the driving actor must do after an event.
#[derive(Debug)]
pub enum ReceiverAction {
    /// Transmit this packet to the peer.
    Send(Packet),
    /// A block decoded; hand it to the partitioner.
    Deliver { block_id: BlockId, data: Vec<u8> },
    /// The connection failed; the session should be torn down.
    Failed(ProtoError),
    /// The connection completed its share and closed cleanly.
    Finished,
}

/// Per-block reception state.
struct BlockRx {
    decoder: BlockDecoder,
    last_data: Instant,
    last_nack: Option<Instant>,
}

/// Receiver-side connection state machine.
pub struct ReceiverConnection {
    resource_id: ResourceId,
    blocks_total: u64,
    epoch: Instant,
    reverse: bool,
    sending_rate: u32,
    state: ReceiverState,
    range: BlockRange,
    acked: HashMap<BlockId, Instant>,
    claimed: HashSet<BlockId>,
    decoders: HashMap<BlockId, BlockRx>,
    rtt: RttEstimator,
    tfrc: TfrcReceiver,
    started: Instant,
    backoff: Duration,
    next_request: Instant,
    last_request_sent: Instant,
    next_feedback: Option<Instant>,
    last_inbound: Option<Instant>,
    completing_until: Option<Instant>,
}

impl ReceiverConnection {
    /// Creates a connection that will request `range` of the resource,
    /// traversed in reverse when `reverse` is set.
    pub fn new(
        resource_id: ResourceId,
        range: BlockRange,
        reverse: bool,
        sending_rate: u32,
        now: Instant,
    ) -> Self {
        Self {
            resource_id,
            blocks_total: block_count(resource_id.length),
            epoch: now,
            reverse,
            sending_rate,
            state: ReceiverState::Requesting,
            range,
            acked: HashMap::new(),
            claimed: HashSet::new(),
            decoders: HashMap::new(),
            rtt: RttEstimator::new(),
            tfrc: TfrcReceiver::new(),
            started: now,
            backoff: HANDSHAKE_INITIAL_BACKOFF,
            next_request: now,
            last_request_sent: now,
            next_feedback: None,
            last_inbound: None,
            completing_until: None,
        }
    }

    pub fn state(&self) -> ReceiverState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ReceiverState::Closed
    }

    /// The connection's current effective block range.
    pub fn block_range(&self) -> BlockRange {
        self.range
    }

    /// Runs timers: request retransmit/keepalive, feedback, give-up,
    /// inactivity, and completion.
    pub fn poll(&mut self, now: Instant) -> Vec<ReceiverAction> {
        let mut out = Vec::new();
        match self.state {
            ReceiverState::Closed => {}
            ReceiverState::Requesting => {
                if now.saturating_duration_since(self.started) >= HANDSHAKE_GIVE_UP {
                    debug!("handshake gave up");
                    self.state = ReceiverState::Closed;
                    out.push(ReceiverAction::Failed(ProtoError::HandshakeTimeout));
                } else if now >= self.next_request {
                    out.push(ReceiverAction::Send(self.request_packet(now)));
                    self.last_request_sent = now;
                    self.next_request = now + self.backoff;
                    self.backoff = (self.backoff * 2).min(HANDSHAKE_MAX_BACKOFF);
                }
            }
            ReceiverState::Established => {
                let idle = self
                    .last_inbound
                    .map_or(Duration::ZERO, |at| now.saturating_duration_since(at));
                if idle >= INACTIVITY_TIMEOUT {
                    debug!("connection inactive mid-transfer");
                    self.state = ReceiverState::Closed;
                    out.push(ReceiverAction::Failed(ProtoError::Inactivity));
                    return out;
                }
                if now >= self.next_request {
                    out.push(ReceiverAction::Send(self.request_packet(now)));
                    self.last_request_sent = now;
                    self.next_request = now + self.keepalive_interval();
                }
                if self.next_feedback.is_some_and(|at| now >= at) {
                    self.emit_feedback(now, &mut out);
                    self.next_feedback = Some(now + self.feedback_period());
                }
            }
            ReceiverState::Completing => {
                if self.completing_until.is_some_and(|at| now >= at) {
                    self.state = ReceiverState::Closed;
                    out.push(ReceiverAction::Finished);
                }
            }
        }
        out
    }

    /// The next instant at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            ReceiverState::Closed => None,
            ReceiverState::Requesting => {
                Some(self.next_request.min(self.started + HANDSHAKE_GIVE_UP))
            }
            ReceiverState::Established => {
                let mut deadline = self.next_request;
                if let Some(at) = self.next_feedback {
                    deadline = deadline.min(at);
                }
                if let Some(at) = self.last_inbound {
                    deadline = deadline.min(at + INACTIVITY_TIMEOUT);
                }
                Some(deadline)
            }
            ReceiverState::Completing => self.completing_until,
        }
    }

    /// Processes one inbound packet.
    pub fn on_packet(&mut self, packet: &Packet, now: Instant) -> Vec<ReceiverAction> {
        if self.state == ReceiverState::Closed {
            return Vec::new();
        }
        self.last_inbound = Some(now);

        match packet {
            Packet::Data(data) => self.on_data(data, now),
            Packet::Error(err) => self.on_error(err),
            other => {
                trace!(magic = other.magic(), "unexpected packet kind on receiver");
                Vec::new()
            }
        }
    }

    /// Applies a partitioner claim: the block was obtained on the other
    /// connection and must be retired here.
    pub fn apply_claim(&mut self, block_id: BlockId, now: Instant) -> Vec<ReceiverAction> {
        let mut out = Vec::new();
        if self.state == ReceiverState::Closed || self.acked.contains_key(&block_id) {
            return out;
        }

        self.claimed.insert(block_id);
        self.decoders.remove(&block_id);

        let before = self.range;
        self.normalize_range();
        if self.range.is_empty() {
            self.enter_completing(now, &mut out);
        } else if self.range != before {
            out.push(ReceiverAction::Send(Packet::ShrinkRange(ShrinkRange {
                block_range: self.range,
            })));
        }
        out
    }

    /// Instructs the connection that the whole session is complete.
    pub fn complete(&mut self, now: Instant) -> Vec<ReceiverAction> {
        let mut out = Vec::new();
        if matches!(self.state, ReceiverState::Completing | ReceiverState::Closed) {
            return out;
        }
        if self.state == ReceiverState::Requesting {
            // Make sure the sender has seen us at all before the final ack,
            // which matters for the zero-block resource exchange.
            out.push(ReceiverAction::Send(self.request_packet(now)));
        }
        self.range = BlockRange::empty_at(self.range.start);
        self.enter_completing(now, &mut out);
        out
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    fn on_data(&mut self, data: &Data, now: Instant) -> Vec<ReceiverAction> {
        let mut out = Vec::new();
        if self.state == ReceiverState::Completing {
            // Residual symbols are expected for up to one round trip.
            return out;
        }
        if self.state == ReceiverState::Requesting {
            debug!("first data packet, connection established");
            self.state = ReceiverState::Established;
            self.next_request = now + self.keepalive_interval();
            self.next_feedback = Some(now + self.feedback_period());
        }

        // RTT from the request echo: the sender reports how long it held
        // our last request before this send.
        let elapsed = now.saturating_duration_since(self.last_request_sent);
        let hold = Duration::from_millis(data.delay_ms as u64);
        if elapsed > hold {
            self.rtt.sample((elapsed - hold).max(Duration::from_millis(1)));
        }

        self.tfrc.on_data(data.sequence, data.timestamp, now, self.rtt.or_initial());

        if data.block_id >= self.blocks_total {
            warn!(block_id = data.block_id, "data for nonexistent block");
            out.push(ReceiverAction::Send(Packet::Error(ErrorPacket {
                code: ErrorCode::ProtocolViolation,
            })));
            return out;
        }

        if let Some(acked_at) = self.acked.get_mut(&data.block_id) {
            // The ack may have been lost; refresh it after a few RTTs.
            let refresh = self.rtt.or_initial() * ACK_REFRESH_RTTS;
            if now.saturating_duration_since(*acked_at) > refresh {
                *acked_at = now;
                out.push(ReceiverAction::Send(Packet::AckBlock(AckBlock {
                    block_id: data.block_id,
                })));
            }
            return out;
        }
        if self.claimed.contains(&data.block_id) || !self.range.contains(data.block_id) {
            // Stragglers around the convergence point; bounded and harmless.
            trace!(block_id = data.block_id, "data outside working range");
            return out;
        }

        if let Entry::Vacant(entry) = self.decoders.entry(data.block_id) {
            match block_size(self.resource_id.length, data.block_id) {
                Some(len) => {
                    entry.insert(BlockRx {
                        decoder: BlockDecoder::new(len),
                        last_data: now,
                        last_nack: None,
                    });
                }
                None => return out,
            }
        }
        let Some(rx) = self.decoders.get_mut(&data.block_id) else {
            return out;
        };
        rx.last_data = now;

        if let Some(bytes) = rx.decoder.feed(&data.payload) {
            debug!(block_id = data.block_id, "block decoded");
            self.decoders.remove(&data.block_id);
            self.acked.insert(data.block_id, now);
            out.push(ReceiverAction::Send(Packet::AckBlock(AckBlock {
                block_id: data.block_id,
            })));
            out.push(ReceiverAction::Deliver { block_id: data.block_id, data: bytes });

            self.normalize_range();
            if self.range.is_empty() {
                self.enter_completing(now, &mut out);
            }
        }
        out
    }

    fn on_error(&mut self, err: &ErrorPacket) -> Vec<ReceiverAction> {
        match err.code {
            ErrorCode::ResourceNotFound => {
                self.state = ReceiverState::Closed;
                vec![ReceiverAction::Failed(ProtoError::ResourceNotFound)]
            }
            ErrorCode::ProtocolViolation => {
                warn!("peer reported protocol violation");
                Vec::new()
            }
        }
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn request_packet(&self, now: Instant) -> Packet {
        Packet::RequestResource(RequestResource {
            reverse: self.reverse,
            timestamp: Timestamp::since(self.epoch, now),
            sending_rate: self.sending_rate,
            block_range: self.range,
            resource_id: self.resource_id,
        })
    }

    /// Feedback report plus the NACK sweep over stuck blocks.
    fn emit_feedback(&mut self, now: Instant, out: &mut Vec<ReceiverAction>) {
        let rtt = self.rtt.or_initial();
        if let Some(feedback) = self.tfrc.feedback(now, rtt) {
            out.push(ReceiverAction::Send(Packet::Feedback(feedback)));
        }

        let period = self.feedback_period();
        for (block_id, rx) in self.decoders.iter_mut() {
            let seen = rx.decoder.symbols_seen();
            if seen == 0 {
                continue;
            }
            let overfed = seen >= rx.decoder.symbols_needed() + NACK_DECODE_SLACK;
            let stalled = now.saturating_duration_since(rx.last_data) >= period;
            let throttled = rx.last_nack.is_some_and(|at| now.saturating_duration_since(at) < period);
            if (overfed || stalled) && !throttled {
                rx.last_nack = Some(now);
                out.push(ReceiverAction::Send(Packet::NackBlock(NackBlock {
                    block_id: *block_id,
                    received: seen.min(u16::MAX as u32) as u16,
                })));
            }
        }
    }

    fn keepalive_interval(&self) -> Duration {
        let min_interval = Duration::from_secs_f64(
            4.0 * SEGMENT_SIZE as f64 * 8.0 / self.sending_rate.max(1) as f64,
        )
        .max(KEEPALIVE_FLOOR);
        match self.rtt.get() {
            None => KEEPALIVE_CEILING.max(min_interval),
            Some(rtt) => rtt.min(KEEPALIVE_CEILING).max(min_interval),
        }
    }

    fn feedback_period(&self) -> Duration {
        self.rtt.or_initial().max(FEEDBACK_FLOOR)
    }

    /// Advances both range edges past blocks this connection acked or the
    /// partitioner claimed for the other one.
    fn normalize_range(&mut self) {
        let retired =
            |id: &BlockId| self.acked.contains_key(id) || self.claimed.contains(id);
        while !self.range.is_empty() && retired(&self.range.start) {
            self.range.start += 1;
        }
        while !self.range.is_empty() && retired(&(self.range.end - 1)) {
            self.range.end -= 1;
        }
    }

    fn enter_completing(&mut self, now: Instant, out: &mut Vec<ReceiverAction>) {
        debug!("range empty, completing");
        self.state = ReceiverState::Completing;
        self.completing_until = Some(now + self.rtt.or_initial());
        self.next_feedback = None;
        self.decoders.clear();
        out.push(ReceiverAction::Send(Packet::ShrinkRange(ShrinkRange {
            block_range: BlockRange::empty_at(self.range.start),
        })));
    }
}
