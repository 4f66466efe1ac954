use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

const STATS_HISTORY_WINDOW: Duration = Duration::from_secs(30);
const RECENT_HISTORY_WINDOW: Duration = Duration::from_secs(15);
const RATE_UTILIZATION_NEEDED_FOR_INCREASE: f64 = 0.70;
const RATE_INCREASE_DECAY_MULTIPLIER: f64 = 0.75;
pub const MINIMUM_RATE: u32 = 256_000;

const MIN_TIME_BETWEEN_DECREASES: Duration = Duration::from_secs(2);
const MIN_TIME_BETWEEN_INCREASES: Duration = Duration::from_secs(10);
const MIN_TIME_BETWEEN_LIMIT_INCREASES: Duration = Duration::from_secs(60);

const DECREASE_MULTIPLIER_MAX: f64 = 0.95;
const DECREASE_MULTIPLIER_MIN: f64 = 0.60;
const INCREASE_MULTIPLIER_MIN: f64 = 1.02;
const INCREASE_MULTIPLIER_SCALAR: f64 = 1.08;
const LIMIT_INCREASE_MULTIPLIERS: [f64; 5] = [1.0226, 1.0226, 1.0226, 1.0075, 1.00375];
const LIMIT_FRACTION_ON_LOSS: f64 = 0.80;
const MAX_LOSS_FOR_AVERAGE: f64 = 0.05;

/// Loss a rate tolerates, highest rate first. Rates in between interpolate linearly.
const ACCEPTABLE_LOSS: [(u32, f64); 3] = [(1_024_000, 0.0025), (512_000, 0.0100), (256_000, 0.0200)];

/// FlowControlStats accumulate what was received between two rate calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControlStats {
    pub start: SystemTime,
    pub packets_received: u32,
    pub packets_lost: u32,
    pub payload_size_sum: u64,
    pub overhead_size_sum: u64,
    /// loss before retransmission repaired any of it
    pub actual_packets_lost: u32,
}

impl FlowControlStats {
    pub fn new(start: SystemTime) -> Self {
        FlowControlStats {
            start,
            packets_received: 0,
            packets_lost: 0,
            payload_size_sum: 0,
            overhead_size_sum: 0,
            actual_packets_lost: 0,
        }
    }

    pub fn avg_packet_size(&self) -> u32 {
        if self.packets_received == 0 {
            return 0;
        }
        ((self.payload_size_sum + self.overhead_size_sum) / self.packets_received as u64) as u32
    }

    pub fn avg_overhead(&self) -> u32 {
        if self.packets_received == 0 {
            return 0;
        }
        (self.overhead_size_sum / self.packets_received as u64) as u32
    }
}

#[derive(Debug, Clone, Copy)]
struct ReceiveStats {
    duration_ms: u32,
    packets_received: u32,
    packets_lost: u32,
    observed_rate: u32,
    actual_packets_lost: u32,
}

impl ReceiveStats {
    fn loss(&self) -> f64 {
        let total = self.packets_received + self.packets_lost;
        if total == 0 {
            return 0.0;
        }
        self.packets_lost as f64 / total as f64
    }

    fn actual_loss(&self) -> f64 {
        let total = self.packets_received + self.packets_lost;
        if total == 0 {
            return 0.0;
        }
        self.actual_packets_lost as f64 / total as f64
    }
}

/// acceptable_loss_at_rate is the fraction of packets a stream at `rate` bits per second may
/// lose before the rate is lowered.
pub fn acceptable_loss_at_rate(rate: u32) -> f64 {
    let (highest_rate, lowest_loss) = ACCEPTABLE_LOSS[0];
    if rate > highest_rate {
        return lowest_loss;
    }
    let (lowest_rate, highest_loss) = ACCEPTABLE_LOSS[ACCEPTABLE_LOSS.len() - 1];
    if rate <= lowest_rate {
        return highest_loss;
    }

    for pair in ACCEPTABLE_LOSS.windows(2) {
        let ((rate1, loss1), (rate0, loss0)) = (pair[0], pair[1]);
        if rate > rate0 && rate <= rate1 {
            let ratio = (rate - rate0) as f64 / (rate1 - rate0) as f64;
            return loss0 + ratio * (loss1 - loss0);
        }
    }
    lowest_loss
}

/// PlaybackFlowControl works out the highest rate the remote sender should use.
///
/// Loss above what the rate tolerates lowers the rate at once. Sustained use of most of the
/// rate without loss raises it, by less each time the estimated bandwidth limit had to come
/// down. The limit itself creeps up after a minute without loss and drops when loss shows
/// up that isn't the stream's usual background loss.
#[derive(Debug)]
pub struct PlaybackFlowControl {
    absolute_max_rate: u32,
    current_max_rate: u32,
    est_bandwidth_limit: u32,
    bandwidth_limit_decrease_count: u32,
    rate_increase_count: u32,
    rate_decrease_count: u32,

    last_rate_change: SystemTime,
    last_rate_decrease: SystemTime,
    last_bandwidth_limit_change: SystemTime,

    /// newest first
    history: VecDeque<ReceiveStats>,
    average_rate: u32,
    average_loss_ratio: f64,
}

impl PlaybackFlowControl {
    pub fn new(absolute_max_rate: u32, now: SystemTime) -> Self {
        log::debug!("video flow control absolute max rate {}", absolute_max_rate);
        PlaybackFlowControl {
            absolute_max_rate,
            current_max_rate: absolute_max_rate,
            est_bandwidth_limit: absolute_max_rate,
            bandwidth_limit_decrease_count: 0,
            rate_increase_count: 0,
            rate_decrease_count: 0,
            last_rate_change: now,
            last_rate_decrease: now,
            last_bandwidth_limit_change: now,
            history: VecDeque::new(),
            average_rate: 0,
            average_loss_ratio: 0.0,
        }
    }

    pub fn max_rate(&self) -> u32 {
        self.current_max_rate
    }

    pub fn bandwidth_limit(&self) -> u32 {
        self.est_bandwidth_limit
    }

    pub fn average_rate(&self) -> u32 {
        self.average_rate
    }

    /// rate_change_counts returns how often the rate went up and down.
    pub fn rate_change_counts(&self) -> (u32, u32) {
        (self.rate_increase_count, self.rate_decrease_count)
    }

    /// max_rate_calculate folds in what was received over the last `duration_ms` and returns
    /// the max rate to ask for.
    pub fn max_rate_calculate(
        &mut self,
        now: SystemTime,
        duration_ms: u32,
        packets_received: u32,
        packets_lost: u32,
        packet_size_avg: u32,
        actual_packets_lost: u32,
    ) -> u32 {
        self.stats_history_update(
            duration_ms,
            packets_received,
            packets_lost,
            packet_size_avg,
            actual_packets_lost,
        );

        if packets_received + packets_lost == 0 || self.history.is_empty() {
            return self.current_max_rate;
        }

        let mut new_max_rate = self.current_max_rate;
        let limit = self.bandwidth_limit_calculate(now);
        if limit != self.est_bandwidth_limit {
            if limit < self.est_bandwidth_limit {
                self.bandwidth_limit_decrease_count += 1;
            }
            log::debug!(
                "video bandwidth limit changed from {} to {}",
                self.est_bandwidth_limit,
                limit
            );
            self.est_bandwidth_limit = limit;
            self.last_bandwidth_limit_change = now;
            new_max_rate = new_max_rate.min(limit);
        }

        if self.rate_decrease_check(now) {
            new_max_rate = self.rate_decrease_calculate();
            if new_max_rate < self.current_max_rate {
                self.rate_decrease_count += 1;
                self.last_rate_change = now;
                self.last_rate_decrease = now;
            }
        } else if self.rate_increase_check(now) {
            new_max_rate = self.rate_increase_calculate();
            if new_max_rate > self.current_max_rate {
                self.rate_increase_count += 1;
                self.last_rate_change = now;
            }
        }

        self.current_max_rate = new_max_rate;
        new_max_rate
    }

    fn history_duration_ms(&self) -> u64 {
        self.history.iter().map(|rs| rs.duration_ms as u64).sum()
    }

    fn stats_history_update(
        &mut self,
        duration_ms: u32,
        packets_received: u32,
        packets_lost: u32,
        packet_size_avg: u32,
        actual_packets_lost: u32,
    ) {
        if duration_ms == 0 {
            return;
        }

        let observed_rate = (packets_received as f64 * packet_size_avg as f64 * 8.0 * 1000.0
            / duration_ms as f64) as u32;
        log::trace!(
            "video flow control rate {}, received {}, lost {}, average size {}, {} ms",
            observed_rate,
            packets_received,
            packets_lost,
            packet_size_avg,
            duration_ms
        );
        self.history.push_front(ReceiveStats {
            duration_ms,
            packets_received,
            packets_lost,
            observed_rate,
            actual_packets_lost,
        });

        let window_ms = STATS_HISTORY_WINDOW.as_millis() as u64;
        let mut total_ms = 0u64;
        let mut keep = self.history.len();
        for (i, rs) in self.history.iter().enumerate() {
            total_ms += rs.duration_ms as u64;
            if total_ms > window_ms {
                keep = i;
                break;
            }
        }
        self.history.truncate(keep.max(1));

        let total_ms = self.history_duration_ms();
        if total_ms >= RECENT_HISTORY_WINDOW.as_millis() as u64 {
            self.average_rate = self.average_rate_calculate(Duration::from_millis(total_ms));
            let loss_sum: f64 = self
                .history
                .iter()
                .map(|rs| rs.loss().min(MAX_LOSS_FOR_AVERAGE))
                .sum();
            self.average_loss_ratio = loss_sum / self.history.len() as f64;
        }
    }

    /// average_rate_calculate averages the observed rates of the newest entries covering
    /// `window`.
    fn average_rate_calculate(&self, window: Duration) -> u32 {
        let window_ms = window.as_millis() as u64;
        let (mut sum, mut count, mut duration_ms) = (0u64, 0u64, 0u64);
        for rs in &self.history {
            count += 1;
            sum += rs.observed_rate as u64;
            duration_ms += rs.duration_ms as u64;
            if duration_ms >= window_ms {
                break;
            }
        }
        if count == 0 {
            0
        } else {
            (sum / count) as u32
        }
    }

    fn rate_decrease_check(&self, now: SystemTime) -> bool {
        let rs = match self.history.front() {
            Some(rs) => rs,
            None => return false,
        };
        if rs.loss() <= acceptable_loss_at_rate(rs.observed_rate) {
            return false;
        }
        now.duration_since(self.last_rate_decrease).unwrap_or_default()
            >= MIN_TIME_BETWEEN_DECREASES
    }

    /// rate_decrease_calculate lowers the rate in proportion to the loss, by 5% to 40%,
    /// starting from the rate actually observed.
    fn rate_decrease_calculate(&self) -> u32 {
        let rs = match self.history.front() {
            Some(rs) => rs,
            None => return self.current_max_rate,
        };
        let multiplier = (1.0 - rs.loss()).clamp(DECREASE_MULTIPLIER_MIN, DECREASE_MULTIPLIER_MAX);
        let lowered = self
            .est_bandwidth_limit
            .min((rs.observed_rate as f64 * multiplier) as u32);
        let new_max_rate = MINIMUM_RATE.max(lowered);
        log::debug!(
            "video max receive rate decrease to {} from {}, multiplier {:.5}",
            new_max_rate,
            self.current_max_rate,
            multiplier
        );
        new_max_rate
    }

    fn rate_increase_check(&self, now: SystemTime) -> bool {
        if self.current_max_rate >= self.est_bandwidth_limit
            || self.history_duration_ms() < RECENT_HISTORY_WINDOW.as_millis() as u64
        {
            return false;
        }

        let threshold = (self.current_max_rate as f64 * RATE_UTILIZATION_NEEDED_FOR_INCREASE) as u32;
        let recent_average = self.average_rate_calculate(RECENT_HISTORY_WINDOW);
        let rs = match self.history.front() {
            Some(rs) => rs,
            None => return false,
        };
        if recent_average < threshold || rs.observed_rate < threshold {
            log::trace!(
                "video rate {} or recent average {} under {}, no increase",
                rs.observed_rate,
                recent_average,
                threshold
            );
            return false;
        }
        if rs.actual_loss() > acceptable_loss_at_rate(rs.observed_rate) {
            return false;
        }
        now.duration_since(self.last_rate_change).unwrap_or_default() >= MIN_TIME_BETWEEN_INCREASES
    }

    fn rate_increase_calculate(&self) -> u32 {
        let multiplier = INCREASE_MULTIPLIER_MIN.max(
            INCREASE_MULTIPLIER_SCALAR
                * RATE_INCREASE_DECAY_MULTIPLIER.powi(self.bandwidth_limit_decrease_count as i32),
        );
        let new_max_rate = self
            .est_bandwidth_limit
            .min((self.current_max_rate as f64 * multiplier) as u32);
        log::debug!(
            "video max receive rate increase to {} from {}, multiplier {:.5}",
            new_max_rate,
            self.current_max_rate,
            multiplier
        );
        new_max_rate
    }

    fn bandwidth_limit_calculate(&self, now: SystemTime) -> u32 {
        let mut limit = self.est_bandwidth_limit;
        let rs = match self.history.front() {
            Some(rs) => rs,
            None => return limit,
        };

        let recent_average = self.average_rate_calculate(RECENT_HISTORY_WINDOW);
        let loss = rs.loss();
        let acceptable = acceptable_loss_at_rate(rs.observed_rate);

        if loss <= acceptable && rs.actual_loss() <= acceptable {
            let since_change = now
                .duration_since(self.last_bandwidth_limit_change)
                .unwrap_or_default();
            if since_change >= MIN_TIME_BETWEEN_LIMIT_INCREASES
                && recent_average as f64
                    >= self.est_bandwidth_limit as f64 * RATE_UTILIZATION_NEEDED_FOR_INCREASE
            {
                let index = (self.bandwidth_limit_decrease_count as usize)
                    .min(LIMIT_INCREASE_MULTIPLIERS.len() - 1);
                let raised = (self.est_bandwidth_limit as f64 * LIMIT_INCREASE_MULTIPLIERS[index]) as u32;
                limit = self.absolute_max_rate.min(raised);
            }
        } else if loss > acceptable
            && self.history_duration_ms() >= RECENT_HISTORY_WINDOW.as_millis() as u64
            && rs.observed_rate as f64 * 1.15 > recent_average as f64
            && loss > self.average_loss_ratio * 1.25
        {
            limit = MINIMUM_RATE.max((recent_average as f64 * LIMIT_FRACTION_ON_LOSS) as u32);
        }
        limit
    }
}
