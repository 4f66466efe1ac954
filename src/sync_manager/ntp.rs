/// Largest seconds value kept in the 16.16 representation; one bit short of 16 so that
/// differences never look negative.
pub const MAX_NTP_SEC: u32 = 0x0000_7fff;

pub(crate) const MICROSECONDS_PER_SECOND: u64 = 1_000_000;

/// Reference spacing between two sender reports used by [`NtpOrderDetector`], five seconds in
/// 16.16 form.
const EXPECTED_REPORT_SPACING: u32 = 5 << 16;

/// Consistent samples needed before [`NtpOrderDetector`] trusts its answer.
pub const NTP_ORDER_SAMPLES: u32 = 5;

/// ntp64to32 narrows a 64-bit NTP timestamp to 16.16 fixed point: the low 15 bits of the
/// seconds and the top 16 bits of the fraction.
pub fn ntp64to32(ntp_sec: u32, ntp_frac: u32) -> u32 {
    ((ntp_sec & MAX_NTP_SEC) << 16) | ((ntp_frac & 0xffff_0000) >> 16)
}

/// usec_to_frac converts microseconds (below one second) into a 32-bit NTP fraction.
///
/// The multiply and shift form approximates `usec * 2^32 / 10^6` to within about 3e-7 and
/// wraps the same way on 32-bit arithmetic.
pub fn usec_to_frac(usec: u32) -> u32 {
    let t = usec.wrapping_mul(1825) >> 5;
    (usec << 12).wrapping_add(usec << 8).wrapping_sub(t)
}

/// elapsed_to_ntp32 converts a positive RTP timestamp difference at `clock_rate` into the
/// 16.16 NTP form.
pub(crate) fn elapsed_to_ntp32(ticks: u32, clock_rate: u32) -> u32 {
    if clock_rate == 0 {
        return 0;
    }
    let usec = ticks as u64 * MICROSECONDS_PER_SECOND / clock_rate as u64;
    let sec = (usec / MICROSECONDS_PER_SECOND) as u32;
    let usec = (usec % MICROSECONDS_PER_SECOND) as u32;
    ntp64to32(sec, usec_to_frac(usec))
}

/// NtpOrder is the field order a remote uses for the sender report NTP timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NtpOrder {
    /// most significant word carries the seconds
    SecondsFirst,
    /// most significant word carries the fraction
    Swapped,
}

/// NtpOrderDetector guesses whether a remote swaps the two NTP words of its sender reports.
///
/// Each report after the first yields two candidate deltas, one per ordering. The ordering
/// whose delta lands closer to the nominal five second report spacing wins that sample. The
/// answer is trusted after [`NTP_ORDER_SAMPLES`] consecutive samples agree; a disagreeing
/// sample starts the count over.
#[derive(Debug, Default)]
pub struct NtpOrderDetector {
    last: Option<(u32, u32)>,
    order: Option<NtpOrder>,
    solved: u32,
}

impl NtpOrderDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// observe feeds one (most, least) word pair. Returns the ordering once it is trusted.
    pub fn observe(&mut self, most: u32, least: u32) -> Option<NtpOrder> {
        let (last_most, last_least) = match self.last {
            Some(last) => last,
            None => {
                self.last = Some((most, least));
                self.solved = 0;
                return None;
            }
        };
        if self.solved >= NTP_ORDER_SAMPLES {
            self.last = Some((most, least));
            return self.order;
        }

        let straight = Self::delta(most, last_most, least, last_least);
        let swapped = Self::delta(least, last_least, most, last_most);

        let guess = match (straight, swapped) {
            (0, 0) => None,
            (_, 0) => Some(NtpOrder::SecondsFirst),
            (0, _) => Some(NtpOrder::Swapped),
            (a, b) => {
                if a.abs_diff(EXPECTED_REPORT_SPACING) >= b.abs_diff(EXPECTED_REPORT_SPACING) {
                    Some(NtpOrder::Swapped)
                } else {
                    Some(NtpOrder::SecondsFirst)
                }
            }
        };
        self.last = Some((most, least));

        match guess {
            None => self.solved = 0,
            Some(guess) => {
                self.solved += 1;
                if self.solved == 1 {
                    self.order = Some(guess);
                } else if self.order != Some(guess) {
                    log::debug!("sender report ntp order changed to {:?}", guess);
                    self.solved = 0;
                }
            }
        }

        if self.solved >= NTP_ORDER_SAMPLES {
            self.order
        } else {
            None
        }
    }

    pub fn order(&self) -> Option<NtpOrder> {
        if self.solved >= NTP_ORDER_SAMPLES {
            self.order
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    // 16.16 delta assuming `sec` holds seconds and `frac` the fraction; 0 when seconds did
    // not advance by at least two
    fn delta(sec: u32, last_sec: u32, frac: u32, last_frac: u32) -> u32 {
        if sec <= last_sec.wrapping_add(1) {
            return 0;
        }
        if frac >= last_frac {
            ((sec.wrapping_sub(last_sec) & 0xffff) << 16)
                .wrapping_add((frac.wrapping_sub(last_frac) & 0xffff_0000) >> 16)
        } else {
            let borrow = u32::MAX - (last_frac - frac);
            ((sec.wrapping_sub(last_sec).wrapping_sub(1) & 0xffff) << 16)
                .wrapping_add((borrow & 0xffff_0000) >> 16)
        }
    }
}
