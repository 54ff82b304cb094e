//! TFRC-style rate measurement and control.
//!
//! The receiver measures receive rate and loss-event rate and reports them
//! in periodic Feedback packets together with an echo of the last Data
//! timestamp; the sender turns those reports into a smoothed RTT and an
//! allowed sending rate. The allowed rate is the minimum of the
//! receiver-requested rate and the RFC 5348 throughput equation, floored so
//! a lossy path cannot stall the transfer entirely.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::sequence::SequenceNumber;
use crate::timestamp::Timestamp;
use crate::wire::Feedback;

/// EMA gain for RTT smoothing.
pub const RTT_ALPHA: f64 = 0.125;

/// RTT assumed before the first sample.
pub const INITIAL_RTT: Duration = Duration::from_millis(200);

/// Lower bound on the allowed sending rate, in bits per second.
pub const MINIMUM_SENDING_RATE: u32 = 8_000;

/// Number of loss intervals kept for the loss-event-rate average.
const LOSS_INTERVAL_HISTORY: usize = 8;

/// RFC 5348 weights for the loss-interval average, most recent first.
const LOSS_INTERVAL_WEIGHTS: [f64; LOSS_INTERVAL_HISTORY] =
    [1.0, 1.0, 1.0, 1.0, 0.8, 0.6, 0.4, 0.2];

/// Horizon after which packet arrival records are discarded.
const ARRIVAL_HORIZON: Duration = Duration::from_secs(2);

/// Smoothed round-trip-time estimator.
#[derive(Debug, Clone, Copy, Default)]
pub struct RttEstimator {
    srtt: Option<Duration>,
}

impl RttEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds in a new RTT sample. The first sample is taken as-is.
    pub fn sample(&mut self, rtt: Duration) {
        self.srtt = Some(match self.srtt {
            None => rtt,
            Some(srtt) => {
                let smoothed =
                    srtt.as_secs_f64() * (1.0 - RTT_ALPHA) + rtt.as_secs_f64() * RTT_ALPHA;
                Duration::from_secs_f64(smoothed)
            }
        });
    }

    pub fn get(&self) -> Option<Duration> {
        self.srtt
    }

    /// The estimate, or [`INITIAL_RTT`] before the first sample.
    pub fn or_initial(&self) -> Duration {
        self.srtt.unwrap_or(INITIAL_RTT)
    }
}

// ============================================================================
// Sender side
// ============================================================================

/// Sender-side rate governor.
#[derive(Debug)]
pub struct TfrcSender {
    segment_bytes: u32,
    requested_rate: u32,
    loss_event_rate: f64,
    rtt: RttEstimator,
    last_feedback: Option<Timestamp>,
}

impl TfrcSender {
    /// `segment_bytes` is the nominal datagram size used in the throughput
    /// equation.
    pub fn new(segment_bytes: u32) -> Self {
        Self {
            segment_bytes,
            requested_rate: MINIMUM_SENDING_RATE,
            loss_event_rate: 0.0,
            rtt: RttEstimator::new(),
            last_feedback: None,
        }
    }

    /// Records the receiver-requested target rate.
    pub fn set_requested_rate(&mut self, bps: u32) {
        self.requested_rate = bps.max(MINIMUM_SENDING_RATE);
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.rtt.get()
    }

    pub fn srtt_or_initial(&self) -> Duration {
        self.rtt.or_initial()
    }

    /// Current loss-event-rate estimate as last reported by the receiver.
    pub fn loss_event_rate(&self) -> f64 {
        self.loss_event_rate
    }

    /// Feeds an RTT sample measured outside the feedback path.
    pub fn sample_rtt(&mut self, rtt: Duration) {
        self.rtt.sample(rtt);
    }

    /// Processes a feedback report received at sender-clock time `now`.
    ///
    /// Returns `false` if the report is older than one already processed
    /// and was ignored.
    pub fn on_feedback(&mut self, feedback: &Feedback, now: Timestamp) -> bool {
        if let Some(last) = self.last_feedback {
            if last.is_newer_than(feedback.timestamp) {
                return false;
            }
        }
        self.last_feedback = Some(feedback.timestamp);

        let elapsed = now.millis_since(feedback.timestamp);
        let rtt_ms = elapsed.saturating_sub(feedback.delay_ms as u32).max(1);
        self.rtt.sample(Duration::from_millis(rtt_ms as u64));

        if feedback.loss_event_rate.is_finite() {
            self.loss_event_rate = feedback.loss_event_rate.clamp(0.0, 1.0) as f64;
        }
        true
    }

    /// The rate the pacing loop must honour, in bits per second.
    pub fn allowed_rate(&self) -> u32 {
        if self.loss_event_rate <= 0.0 {
            return self.requested_rate;
        }
        let equation = self.equation_rate_bps();
        let capped = (self.requested_rate as f64).min(equation);
        (capped as u32).max(MINIMUM_SENDING_RATE)
    }

    /// RFC 5348 throughput equation with b = 1 and t_RTO = 4R, in bits per
    /// second.
    fn equation_rate_bps(&self) -> f64 {
        let s = self.segment_bytes as f64;
        let p = self.loss_event_rate;
        let r = self.rtt.or_initial().as_secs_f64();
        let t_rto = 4.0 * r;

        let denominator =
            r * (2.0 * p / 3.0).sqrt() + t_rto * 3.0 * (3.0 * p / 8.0).sqrt() * p * (1.0 + 32.0 * p * p);
        if denominator <= 0.0 {
            return f64::INFINITY;
        }
        s / denominator * 8.0
    }
}

// ============================================================================
// Receiver side
// ============================================================================

/// Receiver-side measurement state.
///
/// Loss events are inferred from sequence-number gaps; gaps within one RTT
/// of the previous event merge into it, per the TFRC loss-interval
/// discipline.
#[derive(Debug, Default)]
pub struct TfrcReceiver {
    highest_seq: Option<SequenceNumber>,
    arrivals: VecDeque<Instant>,
    loss_intervals: VecDeque<u64>,
    current_interval: u64,
    last_loss_event: Option<Instant>,
    last_data: Option<(Timestamp, Instant)>,
}

impl TfrcReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accounts for one received Data packet.
    pub fn on_data(&mut self, seq: SequenceNumber, timestamp: Timestamp, now: Instant, rtt: Duration) {
        self.arrivals.push_back(now);
        while let Some(front) = self.arrivals.front() {
            if now.saturating_duration_since(*front) > ARRIVAL_HORIZON {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }

        match self.highest_seq {
            Some(prev) if !seq.is_newer_than(prev) => {
                // Reordered or duplicate delivery; no gap accounting.
            }
            Some(prev) => {
                let gap = seq.distance_from(prev).saturating_sub(1);
                if gap > 0 {
                    let new_event = self
                        .last_loss_event
                        .map_or(true, |at| now.saturating_duration_since(at) >= rtt);
                    if new_event {
                        self.loss_intervals.push_front(self.current_interval.max(1));
                        self.loss_intervals.truncate(LOSS_INTERVAL_HISTORY);
                        self.current_interval = 0;
                        self.last_loss_event = Some(now);
                    }
                }
                self.highest_seq = Some(seq);
            }
            None => self.highest_seq = Some(seq),
        }

        self.current_interval += 1;
        self.last_data = Some((timestamp, now));
    }

    /// When the last Data packet arrived, if any.
    pub fn last_data_at(&self) -> Option<Instant> {
        self.last_data.map(|(_, at)| at)
    }

    /// Weighted-average loss-event rate per RFC 5348 §5.4.
    pub fn loss_event_rate(&self) -> f32 {
        if self.loss_intervals.is_empty() {
            return 0.0;
        }

        let mut weighted = 0.0;
        let mut weight_sum = 0.0;
        let intervals = std::iter::once(self.current_interval.max(1))
            .chain(self.loss_intervals.iter().copied())
            .take(LOSS_INTERVAL_HISTORY);
        for (interval, weight) in intervals.zip(LOSS_INTERVAL_WEIGHTS) {
            weighted += interval as f64 * weight;
            weight_sum += weight;
        }

        let mean_interval = weighted / weight_sum;
        (1.0 / mean_interval) as f32
    }

    /// Packets per second received over the last round trip.
    pub fn receive_rate(&self, now: Instant, rtt: Duration) -> u32 {
        let window = rtt.max(Duration::from_millis(10)).min(ARRIVAL_HORIZON);
        let count = self
            .arrivals
            .iter()
            .filter(|at| now.saturating_duration_since(**at) <= window)
            .count();
        (count as f64 / window.as_secs_f64()) as u32
    }

    /// Builds a feedback report, or `None` before the first Data packet.
    pub fn feedback(&self, now: Instant, rtt: Duration) -> Option<Feedback> {
        let (timestamp, arrived_at) = self.last_data?;
        let delay = now.saturating_duration_since(arrived_at).as_millis();
        Some(Feedback {
            delay_ms: delay.min(u16::MAX as u128) as u16,
            timestamp,
            receive_rate: self.receive_rate(now, rtt),
            loss_event_rate: self.loss_event_rate(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtt_smoothing() {
        let mut rtt = RttEstimator::new();
        assert_eq!(rtt.or_initial(), INITIAL_RTT);

        rtt.sample(Duration::from_millis(100));
        assert_eq!(rtt.get(), Some(Duration::from_millis(100)));

        rtt.sample(Duration::from_millis(200));
        // (1 - 1/8) * 100 + 1/8 * 200 = 112.5 ms
        let srtt = rtt.get().unwrap();
        assert!(srtt > Duration::from_millis(110) && srtt < Duration::from_millis(115));
    }

    #[test]
    fn test_allowed_rate_without_loss_is_requested() {
        let mut tfrc = TfrcSender::new(532);
        tfrc.set_requested_rate(2_000_000);
        assert_eq!(tfrc.allowed_rate(), 2_000_000);
    }

    #[test]
    fn test_allowed_rate_capped_under_loss() {
        let mut tfrc = TfrcSender::new(532);
        tfrc.set_requested_rate(100_000_000);
        tfrc.sample_rtt(Duration::from_millis(100));

        let light = Feedback {
            delay_ms: 0,
            timestamp: Timestamp::from_millis(1_000),
            receive_rate: 1_000,
            loss_event_rate: 0.01,
        };
        assert!(tfrc.on_feedback(&light, Timestamp::from_millis(1_100)));
        let light_rate = tfrc.allowed_rate();
        assert!(light_rate < 100_000_000);

        let heavy = Feedback {
            loss_event_rate: 0.2,
            timestamp: Timestamp::from_millis(2_000),
            ..light
        };
        assert!(tfrc.on_feedback(&heavy, Timestamp::from_millis(2_100)));
        let heavy_rate = tfrc.allowed_rate();
        assert!(heavy_rate < light_rate);
        assert!(heavy_rate >= MINIMUM_SENDING_RATE);
    }

    #[test]
    fn test_stale_feedback_ignored() {
        let mut tfrc = TfrcSender::new(532);
        let newer = Feedback {
            delay_ms: 0,
            timestamp: Timestamp::from_millis(5_000),
            receive_rate: 100,
            loss_event_rate: 0.0,
        };
        let older = Feedback {
            timestamp: Timestamp::from_millis(4_000),
            loss_event_rate: 0.5,
            ..newer
        };

        assert!(tfrc.on_feedback(&newer, Timestamp::from_millis(5_050)));
        assert!(!tfrc.on_feedback(&older, Timestamp::from_millis(5_060)));
        assert_eq!(tfrc.loss_event_rate(), 0.0);
    }

    #[test]
    fn test_feedback_rtt_sample_subtracts_delay() {
        let mut tfrc = TfrcSender::new(532);
        let feedback = Feedback {
            delay_ms: 40,
            timestamp: Timestamp::from_millis(1_000),
            receive_rate: 100,
            loss_event_rate: 0.0,
        };
        tfrc.on_feedback(&feedback, Timestamp::from_millis(1_100));
        assert_eq!(tfrc.srtt(), Some(Duration::from_millis(60)));
    }

    #[test]
    fn test_receiver_no_loss() {
        let mut tfrc = TfrcReceiver::new();
        let start = Instant::now();
        let rtt = Duration::from_millis(50);
        for i in 0..20 {
            tfrc.on_data(SequenceNumber::new(i), Timestamp::from_millis(i as u64), start, rtt);
        }
        assert_eq!(tfrc.loss_event_rate(), 0.0);
        assert!(tfrc.receive_rate(start, rtt) > 0);
    }

    #[test]
    fn test_receiver_counts_loss_events() {
        let mut tfrc = TfrcReceiver::new();
        let rtt = Duration::from_millis(50);
        let mut now = Instant::now();

        for i in 0..50 {
            tfrc.on_data(SequenceNumber::new(i), Timestamp::ZERO, now, rtt);
        }
        // One gap: 50..53 missing.
        now += Duration::from_millis(100);
        tfrc.on_data(SequenceNumber::new(53), Timestamp::ZERO, now, rtt);
        let rate = tfrc.loss_event_rate();
        assert!(rate > 0.0 && rate < 0.1);

        // A second gap inside the same RTT merges into the same event.
        tfrc.on_data(SequenceNumber::new(56), Timestamp::ZERO, now, rtt);
        let merged = tfrc.loss_event_rate();
        assert!((merged - rate).abs() < 0.01);
    }

    #[test]
    fn test_feedback_echoes_last_data() {
        let mut tfrc = TfrcReceiver::new();
        assert!(tfrc.feedback(Instant::now(), INITIAL_RTT).is_none());

        let at = Instant::now();
        tfrc.on_data(SequenceNumber::ZERO, Timestamp::from_millis(777), at, INITIAL_RTT);
        let feedback = tfrc.feedback(at + Duration::from_millis(25), INITIAL_RTT).unwrap();
        assert_eq!(feedback.timestamp, Timestamp::from_millis(777));
        assert_eq!(feedback.delay_ms, 25);
    }
}
