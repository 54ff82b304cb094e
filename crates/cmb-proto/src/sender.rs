//! Sender-side connection state machine and rate-governed scheduler.
//!
//! One instance per (local endpoint, remote endpoint) pair, created on the
//! first valid RequestResource and driven by a connection actor. The
//! machine is sans-I/O: inbound packets and timer polls go in with an
//! explicit `now`, outbound packets come back out.
//!
//! ```text
//! Idle ──request──> Active ──range empty──> Draining ──1 RTT──> Closed
//!                     │
//!                     └──inactivity──────────────────────────> Closed
//! ```
//!
//! Within a connection, inbound control packets are processed before the
//! next emission is computed; the driving actor guarantees this by calling
//! [`SenderConnection::handle_packet`] for everything queued before each
//! [`SenderConnection::poll`].

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::block::{BlockId, BlockRange};
use crate::fec::{BlockEncoder, PAYLOAD_ID_SIZE, SYMBOL_SIZE};
use crate::resource::Resource;
use crate::sequence::SequenceNumber;
use crate::tfrc::TfrcSender;
use crate::timestamp::Timestamp;
use crate::wire::{
    Data, ErrorCode, ErrorPacket, Feedback, NackBlock, Packet, RequestResource, ShrinkRange,
    DATA_HEADER_SIZE,
};

/// Nominal Data datagram size, used for pacing and the TFRC equation.
pub const SEGMENT_SIZE: u32 = (DATA_HEADER_SIZE + PAYLOAD_ID_SIZE) as u32 + SYMBOL_SIZE as u32;

/// A connection with no inbound packet for this long is dropped.
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Repair symbols granted beyond the source count before any NACK arrives.
pub const INITIAL_REPAIR_SYMBOLS: u32 = 5;

/// Minimum extra symbols granted per NACK.
pub const MIN_REPAIR_SYMBOLS: u32 = 2;

/// Emission debt beyond this many intervals is dropped rather than burst.
const MAX_CATCHUP_INTERVALS: u32 = 8;

/// Sender connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Active,
    Draining,
    Closed,
}

/// Per-block transmission state: the encoder plus the emit budget.
struct BlockTx {
    encoder: BlockEncoder,
    emitted: u32,
    budget: u32,
}

/// Sender-side connection state machine.
pub struct SenderConnection {
    resource: Arc<Resource>,
    epoch: Instant,
    state: SenderState,
    reverse: bool,
    range: BlockRange,
    acked: HashSet<BlockId>,
    blocks: HashMap<BlockId, BlockTx>,
    tfrc: TfrcSender,
    current_rate: u32,
    next_send: Option<Instant>,
    last_inbound: Instant,
    last_request_at: Instant,
    drain_until: Option<Instant>,
}

impl SenderConnection {
    /// Creates an idle connection for one remote peer.
    pub fn new(resource: Arc<Resource>, now: Instant) -> Self {
        Self {
            resource,
            epoch: now,
            state: SenderState::Idle,
            reverse: false,
            range: BlockRange::empty_at(0),
            acked: HashSet::new(),
            blocks: HashMap::new(),
            tfrc: TfrcSender::new(SEGMENT_SIZE),
            current_rate: 0,
            next_send: None,
            last_inbound: now,
            last_request_at: now,
            drain_until: None,
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == SenderState::Closed
    }

    /// The currently active block range.
    pub fn block_range(&self) -> BlockRange {
        self.range
    }

    /// The rate the pacing loop is honouring, in bits per second.
    pub fn current_rate(&self) -> u32 {
        self.current_rate
    }

    /// Processes one inbound packet, returning replies to send.
    pub fn handle_packet(&mut self, packet: &Packet, now: Instant) -> Vec<Packet> {
        if self.state == SenderState::Closed {
            return Vec::new();
        }
        self.last_inbound = now;

        match packet {
            Packet::RequestResource(request) => self.on_request(request, now),
            Packet::AckBlock(ack) => self.on_ack(ack.block_id, now),
            Packet::NackBlock(nack) => self.on_nack(nack, now),
            Packet::ShrinkRange(shrink) => self.on_shrink(shrink, now),
            Packet::Feedback(feedback) => self.on_feedback(feedback, now),
            Packet::Error(err) => {
                debug!(code = ?err.code, "peer reported error");
                Vec::new()
            }
            Packet::Data(_) => {
                debug!("data packet on sender side");
                vec![protocol_violation()]
            }
        }
    }

    /// Runs timers: inactivity, drain completion, and paced emissions.
    pub fn poll(&mut self, now: Instant) -> Vec<Packet> {
        match self.state {
            SenderState::Closed => Vec::new(),
            _ if now.saturating_duration_since(self.last_inbound) >= INACTIVITY_TIMEOUT => {
                debug!("connection inactive, dropping");
                self.state = SenderState::Closed;
                Vec::new()
            }
            SenderState::Idle => Vec::new(),
            SenderState::Draining => {
                if self.drain_until.is_some_and(|at| now >= at) {
                    self.state = SenderState::Closed;
                }
                Vec::new()
            }
            SenderState::Active => self.emit(now),
        }
    }

    /// The next instant at which [`poll`](Self::poll) has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let inactivity = self.last_inbound + INACTIVITY_TIMEOUT;
        match self.state {
            SenderState::Closed => None,
            SenderState::Idle => Some(inactivity),
            SenderState::Draining => {
                Some(self.drain_until.map_or(inactivity, |at| at.min(inactivity)))
            }
            SenderState::Active => {
                Some(self.next_send.map_or(inactivity, |at| at.min(inactivity)))
            }
        }
    }

    // ------------------------------------------------------------------
    // Inbound control
    // ------------------------------------------------------------------

    fn on_request(&mut self, request: &RequestResource, now: Instant) -> Vec<Packet> {
        if request.resource_id != self.resource.id() {
            debug!(requested = %request.resource_id, "unknown resource");
            self.state = SenderState::Closed;
            return vec![Packet::Error(ErrorPacket { code: ErrorCode::ResourceNotFound })];
        }
        if request.block_range.end > self.resource.block_count() {
            return vec![protocol_violation()];
        }

        trace!(
            offset_ms = Timestamp::since(self.epoch, now).millis_since(request.timestamp),
            "request probe offset"
        );
        self.last_request_at = now;

        let requested_rate = request.sending_rate;
        match self.state {
            SenderState::Idle => {
                self.reverse = request.reverse;
                self.range = request.block_range;
                self.tfrc.set_requested_rate(requested_rate);
                self.current_rate = self.tfrc.allowed_rate();
                self.state = SenderState::Active;
                self.next_send = Some(now);
                debug!(range = %self.range, reverse = self.reverse, rate = self.current_rate,
                       "connection active");
                self.normalize_range(now);
            }
            SenderState::Active => {
                self.tfrc.set_requested_rate(requested_rate);
                let allowed = self.tfrc.allowed_rate();
                if allowed != self.current_rate {
                    self.set_rate(allowed, now);
                }
                // A refresh can only narrow the range.
                self.range.clip_to(request.block_range);
                self.normalize_range(now);
            }
            SenderState::Draining | SenderState::Closed => {}
        }
        Vec::new()
    }

    fn on_ack(&mut self, block_id: BlockId, now: Instant) -> Vec<Packet> {
        if self.acked.contains(&block_id) {
            return Vec::new();
        }
        if !self.range.contains(block_id) {
            return vec![protocol_violation()];
        }

        trace!(block_id, "block acked");
        self.acked.insert(block_id);
        self.blocks.remove(&block_id);
        self.normalize_range(now);
        Vec::new()
    }

    fn on_nack(&mut self, nack: &NackBlock, now: Instant) -> Vec<Packet> {
        if self.acked.contains(&nack.block_id) {
            return Vec::new();
        }
        if !self.range.contains(nack.block_id) {
            return vec![protocol_violation()];
        }

        let resource = &self.resource;
        if let Entry::Vacant(entry) = self.blocks.entry(nack.block_id) {
            match resource.block(nack.block_id) {
                Some(block) => {
                    let encoder = BlockEncoder::new(block);
                    let budget = encoder.source_symbols() + INITIAL_REPAIR_SYMBOLS;
                    entry.insert(BlockTx { encoder, emitted: 0, budget });
                }
                None => return Vec::new(),
            }
        }
        let Some(tx) = self.blocks.get_mut(&nack.block_id) else {
            return Vec::new();
        };

        let received = nack.received as u32;
        let source_count = tx.encoder.source_symbols();
        let grant = if received == 0 || self.tfrc.srtt().is_none() {
            // No usable estimate: grant one full block worth of repair.
            source_count
        } else {
            let slack = (self.tfrc.loss_event_rate() * received as f64).ceil() as u32;
            received + slack + MIN_REPAIR_SYMBOLS
        };
        tx.budget = tx.budget.max(tx.emitted + grant);
        debug!(block_id = nack.block_id, received, grant, "nack extended budget");

        if self.state == SenderState::Active && self.next_send.is_none() {
            self.next_send = Some(now);
        }
        Vec::new()
    }

    fn on_shrink(&mut self, shrink: &ShrinkRange, now: Instant) -> Vec<Packet> {
        if self.range.clip_to(shrink.block_range) {
            debug!(range = %self.range, "range shrunk");
        }
        self.normalize_range(now);
        Vec::new()
    }

    fn on_feedback(&mut self, feedback: &Feedback, now: Instant) -> Vec<Packet> {
        let now_ts = Timestamp::since(self.epoch, now);
        if !self.tfrc.on_feedback(feedback, now_ts) {
            trace!("stale feedback ignored");
            return Vec::new();
        }
        let allowed = self.tfrc.allowed_rate();
        if allowed != self.current_rate {
            self.set_rate(allowed, now);
        }
        Vec::new()
    }

    // ------------------------------------------------------------------
    // Emission
    // ------------------------------------------------------------------

    fn emit(&mut self, now: Instant) -> Vec<Packet> {
        let mut out = Vec::new();
        while let Some(at) = self.next_send {
            if now < at {
                break;
            }
            match self.next_symbol() {
                Some((block_id, sequence, payload)) => {
                    let delay = now.saturating_duration_since(self.last_request_at).as_millis();
                    out.push(Packet::Data(Data {
                        block_id,
                        timestamp: Timestamp::since(self.epoch, now),
                        delay_ms: delay.min(u16::MAX as u128) as u16,
                        sequence,
                        payload,
                    }));

                    let interval = self.send_interval();
                    let mut next = at + interval;
                    if now.saturating_duration_since(next) > interval * MAX_CATCHUP_INTERVALS {
                        next = now;
                    }
                    self.next_send = Some(next);
                }
                None => {
                    self.next_send = None;
                    break;
                }
            }
        }
        out
    }

    /// Picks the next symbol: the first unacked block in iteration order
    /// whose emit budget is not exhausted, at its next unsent sequence
    /// number.
    fn next_symbol(&mut self) -> Option<(BlockId, SequenceNumber, Vec<u8>)> {
        let range = self.range;
        let resource = &self.resource;
        for id in range.iter_directed(self.reverse) {
            if self.acked.contains(&id) {
                continue;
            }
            if let Entry::Vacant(entry) = self.blocks.entry(id) {
                match resource.block(id) {
                    Some(block) => {
                        let encoder = BlockEncoder::new(block);
                        let budget = encoder.source_symbols() + INITIAL_REPAIR_SYMBOLS;
                        entry.insert(BlockTx { encoder, emitted: 0, budget });
                    }
                    None => continue,
                }
            }
            let Some(tx) = self.blocks.get_mut(&id) else {
                continue;
            };
            if tx.emitted < tx.budget {
                let sequence = SequenceNumber::new(tx.emitted);
                let payload = tx.encoder.symbol(sequence);
                tx.emitted += 1;
                return Some((id, sequence, payload));
            }
        }
        None
    }

    fn send_interval(&self) -> Duration {
        Duration::from_secs_f64(SEGMENT_SIZE as f64 * 8.0 / self.current_rate.max(1) as f64)
    }

    fn set_rate(&mut self, rate: u32, now: Instant) {
        debug!(rate, "sending rate changed");
        self.current_rate = rate;
        // Recompute the cadence from this moment; no historical debt.
        if self.next_send.is_some() {
            self.next_send = Some(now + self.send_interval());
        }
    }

    /// Advances both range edges past acknowledged blocks and enters the
    /// drain phase once the range empties.
    fn normalize_range(&mut self, now: Instant) {
        while !self.range.is_empty() && self.acked.contains(&self.range.start) {
            self.range.start += 1;
        }
        while !self.range.is_empty() && self.acked.contains(&(self.range.end - 1)) {
            self.range.end -= 1;
        }
        if self.range.is_empty() && self.state == SenderState::Active {
            debug!("range empty, draining");
            self.state = SenderState::Draining;
            self.next_send = None;
            self.drain_until = Some(now + self.tfrc.srtt_or_initial());
        }
    }
}

fn protocol_violation() -> Packet {
    Packet::Error(ErrorPacket { code: ErrorCode::ProtocolViolation })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fec::BLOCK_SIZE;

    fn test_resource(blocks: u64) -> Arc<Resource> {
        let len = blocks * BLOCK_SIZE;
        let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        Arc::new(Resource::new(data))
    }

    fn request_for(resource: &Resource, rate: u32, reverse: bool) -> Packet {
        Packet::RequestResource(RequestResource {
            reverse,
            timestamp: Timestamp::ZERO,
            sending_rate: rate,
            block_range: BlockRange::full(resource.block_count()),
            resource_id: resource.id(),
        })
    }

    fn data_blocks(packets: &[Packet]) -> Vec<u64> {
        packets
            .iter()
            .filter_map(|p| match p {
                Packet::Data(d) => Some(d.block_id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_request_activates_and_emits() {
        let resource = test_resource(2);
        let now = Instant::now();
        let mut conn = SenderConnection::new(resource.clone(), now);
        assert_eq!(conn.state(), SenderState::Idle);

        assert!(conn.handle_packet(&request_for(&resource, 500_000, false), now).is_empty());
        assert_eq!(conn.state(), SenderState::Active);

        let out = conn.poll(now);
        assert_eq!(data_blocks(&out), vec![0]);
    }

    #[test]
    fn test_unknown_resource_rejected() {
        let resource = test_resource(1);
        let other = test_resource(2);
        let now = Instant::now();
        let mut conn = SenderConnection::new(resource, now);

        let out = conn.handle_packet(&request_for(&other, 500_000, false), now);
        assert_eq!(
            out,
            vec![Packet::Error(ErrorPacket { code: ErrorCode::ResourceNotFound })]
        );
        assert!(conn.is_closed());
    }

    #[test]
    fn test_range_beyond_resource_rejected() {
        let resource = test_resource(2);
        let now = Instant::now();
        let mut conn = SenderConnection::new(resource.clone(), now);

        let request = Packet::RequestResource(RequestResource {
            reverse: false,
            timestamp: Timestamp::ZERO,
            sending_rate: 500_000,
            block_range: BlockRange { start: 0, end: 3 },
            resource_id: resource.id(),
        });
        let out = conn.handle_packet(&request, now);
        assert_eq!(out, vec![protocol_violation()]);
        assert_eq!(conn.state(), SenderState::Idle);
    }

    #[test]
    fn test_pacing_matches_rate() {
        let resource = test_resource(2);
        let start = Instant::now();
        let mut conn = SenderConnection::new(resource.clone(), start);
        // 851_200 bps over 4_256-bit segments = 200 packets per second.
        let rate = SEGMENT_SIZE * 8 * 200;
        conn.handle_packet(&request_for(&resource, rate, false), start);

        let mut sent = 0usize;
        for ms in 0..1_000u64 {
            let now = start + Duration::from_millis(ms);
            sent += data_blocks(&conn.poll(now)).len();
            // Keep the connection alive and the budget open.
            if ms % 100 == 0 {
                conn.handle_packet(
                    &Packet::NackBlock(NackBlock { block_id: 0, received: 0 }),
                    now,
                );
            }
        }
        assert!((180..=220).contains(&sent), "sent {sent} packets, expected ~200");
    }

    #[test]
    fn test_reverse_iterates_from_high_end() {
        let resource = test_resource(3);
        let now = Instant::now();
        let mut conn = SenderConnection::new(resource.clone(), now);
        conn.handle_packet(&request_for(&resource, 500_000, true), now);

        let out = conn.poll(now);
        assert_eq!(data_blocks(&out), vec![2]);
    }

    #[test]
    fn test_ack_advances_edge_and_skips_block() {
        let resource = test_resource(3);
        let now = Instant::now();
        let mut conn = SenderConnection::new(resource.clone(), now);
        conn.handle_packet(&request_for(&resource, 500_000, false), now);

        conn.handle_packet(&Packet::AckBlock(crate::wire::AckBlock { block_id: 0 }), now);
        assert_eq!(conn.block_range(), BlockRange { start: 1, end: 3 });

        let out = conn.poll(now);
        assert_eq!(data_blocks(&out), vec![1]);
    }

    #[test]
    fn test_ack_idempotent_and_out_of_range_rejected() {
        let resource = test_resource(2);
        let now = Instant::now();
        let mut conn = SenderConnection::new(resource.clone(), now);
        conn.handle_packet(&request_for(&resource, 500_000, false), now);

        let ack = Packet::AckBlock(crate::wire::AckBlock { block_id: 0 });
        assert!(conn.handle_packet(&ack, now).is_empty());
        // A repeat of the same ack is silently absorbed.
        assert!(conn.handle_packet(&ack, now).is_empty());

        let bogus = Packet::AckBlock(crate::wire::AckBlock { block_id: 7 });
        assert_eq!(conn.handle_packet(&bogus, now), vec![protocol_violation()]);
        assert!(!conn.is_closed());
    }

    #[test]
    fn test_all_acked_drains_then_closes() {
        let resource = test_resource(2);
        let now = Instant::now();
        let mut conn = SenderConnection::new(resource.clone(), now);
        conn.handle_packet(&request_for(&resource, 500_000, false), now);

        conn.handle_packet(&Packet::AckBlock(crate::wire::AckBlock { block_id: 0 }), now);
        conn.handle_packet(&Packet::AckBlock(crate::wire::AckBlock { block_id: 1 }), now);
        assert_eq!(conn.state(), SenderState::Draining);

        conn.poll(now + Duration::from_secs(1));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_shrink_to_empty_drains() {
        let resource = test_resource(4);
        let now = Instant::now();
        let mut conn = SenderConnection::new(resource.clone(), now);
        conn.handle_packet(&request_for(&resource, 500_000, false), now);

        let shrink = Packet::ShrinkRange(ShrinkRange { block_range: BlockRange::empty_at(2) });
        conn.handle_packet(&shrink, now);
        assert_eq!(conn.state(), SenderState::Draining);
        assert!(conn.poll(now).is_empty());
    }

    #[test]
    fn test_shrink_never_grows_range() {
        let resource = test_resource(4);
        let now = Instant::now();
        let mut conn = SenderConnection::new(resource.clone(), now);
        conn.handle_packet(&request_for(&resource, 500_000, false), now);

        let narrow = Packet::ShrinkRange(ShrinkRange {
            block_range: BlockRange { start: 1, end: 3 },
        });
        conn.handle_packet(&narrow, now);
        assert_eq!(conn.block_range(), BlockRange { start: 1, end: 3 });

        let wide = Packet::ShrinkRange(ShrinkRange {
            block_range: BlockRange { start: 0, end: 4 },
        });
        conn.handle_packet(&wide, now);
        assert_eq!(conn.block_range(), BlockRange { start: 1, end: 3 });
    }

    #[test]
    fn test_budget_exhaustion_pauses_emission() {
        let resource = test_resource(1);
        let start = Instant::now();
        let mut conn = SenderConnection::new(resource.clone(), start);
        conn.handle_packet(&request_for(&resource, u32::MAX, false), start);

        let mut total = 0usize;
        for s in 0..5u64 {
            total += data_blocks(&conn.poll(start + Duration::from_secs(s))).len();
        }
        let budget = 100 + INITIAL_REPAIR_SYMBOLS as usize;
        assert_eq!(total, budget);

        // A NACK reopens the budget.
        let t = start + Duration::from_secs(5);
        conn.handle_packet(&Packet::NackBlock(NackBlock { block_id: 0, received: 80 }), t);
        let more = data_blocks(&conn.poll(t + Duration::from_secs(1)));
        assert!(!more.is_empty());
    }

    #[test]
    fn test_nack_grants_full_block_without_estimate() {
        let resource = test_resource(1);
        let now = Instant::now();
        let mut conn = SenderConnection::new(resource.clone(), now);
        conn.handle_packet(&request_for(&resource, u32::MAX, false), now);

        // At an unbounded rate the whole initial budget drains in one poll.
        let drained = data_blocks(&conn.poll(now)).len();
        assert_eq!(drained, 100 + INITIAL_REPAIR_SYMBOLS as usize);

        let t = now + Duration::from_millis(10);
        conn.handle_packet(&Packet::NackBlock(NackBlock { block_id: 0, received: 0 }), t);
        let regranted = data_blocks(&conn.poll(t)).len();
        assert_eq!(regranted, 100);
    }

    #[test]
    fn test_inactivity_closes() {
        let resource = test_resource(1);
        let now = Instant::now();
        let mut conn = SenderConnection::new(resource.clone(), now);
        conn.handle_packet(&request_for(&resource, 500_000, false), now);

        conn.poll(now + INACTIVITY_TIMEOUT);
        assert!(conn.is_closed());
    }

    #[test]
    fn test_feedback_under_loss_lowers_rate() {
        let resource = test_resource(2);
        let now = Instant::now();
        let mut conn = SenderConnection::new(resource.clone(), now);
        conn.handle_packet(&request_for(&resource, 10_000_000, false), now);
        assert_eq!(conn.current_rate(), 10_000_000);

        let feedback = Packet::Feedback(Feedback {
            delay_ms: 0,
            timestamp: Timestamp::ZERO,
            receive_rate: 100,
            loss_event_rate: 0.05,
        });
        conn.handle_packet(&feedback, now + Duration::from_millis(50));
        assert!(conn.current_rate() < 10_000_000);
    }

    #[test]
    fn test_empty_resource_request_drains_immediately() {
        let resource = Arc::new(Resource::new(Vec::new()));
        let now = Instant::now();
        let mut conn = SenderConnection::new(resource.clone(), now);

        conn.handle_packet(&request_for(&resource, 500_000, false), now);
        assert_eq!(conn.state(), SenderState::Draining);
    }
}
