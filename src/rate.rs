//! Rate Estimator: a windowed byte-rate accumulator over a
//! bounded history, sampled at roughly 1 Hz. Used both per-`FileHandle` (to
//! publish an outgoing kbit/s stat) and globally for aggregate throughput.

const BUCKET_MS: i64 = 1000;

/// A ring of per-second byte buckets spanning `history_ms` of history.
#[derive(Debug, Clone)]
pub struct RateEstimator {
    history_ms: i64,
    buckets: Vec<u64>,
    /// Index of the bucket last written to, or `None` before the first `add`.
    head: Option<i64>,
}

impl RateEstimator {
    /// `history_ms` is rounded up to a whole number of one-second buckets.
    pub fn new(history_ms: u64) -> Self {
        let bucket_count = ((history_ms as i64) / BUCKET_MS).max(1) as usize;
        RateEstimator {
            history_ms: bucket_count as i64 * BUCKET_MS,
            buckets: vec![0; bucket_count],
            head: None,
        }
    }

    fn bucket_index(&self, slot: i64) -> usize {
        (slot.rem_euclid(self.buckets.len() as i64)) as usize
    }

    /// Record `bytes` delivered at `now_ms`. A sparse call (no update for
    /// several seconds) simply zeroes the buckets that aged out. A clock
    /// discontinuity (now_ms before the last recorded slot) resets the
    /// whole window rather than producing a nonsensical rate.
    pub fn add(&mut self, bytes: u64, now_ms: i64) {
        let slot = now_ms / BUCKET_MS;
        match self.head {
            None => {
                self.buckets.iter_mut().for_each(|b| *b = 0);
                self.head = Some(slot);
                self.buckets[self.bucket_index(slot)] += bytes;
            }
            Some(prev_slot) => {
                if slot < prev_slot {
                    // Clock went backwards: discontinuity, reset.
                    self.buckets.iter_mut().for_each(|b| *b = 0);
                    self.head = Some(slot);
                    self.buckets[self.bucket_index(slot)] += bytes;
                    return;
                }
                let advance = slot - prev_slot;
                if advance >= self.buckets.len() as i64 {
                    self.buckets.iter_mut().for_each(|b| *b = 0);
                } else {
                    for step in 1..=advance {
                        let idx = self.bucket_index(prev_slot + step);
                        self.buckets[idx] = 0;
                    }
                }
                self.head = Some(slot);
                self.buckets[self.bucket_index(slot)] += bytes;
            }
        }
    }

    /// Average bytes/sec over the configured history window.
    pub fn avg(&self) -> u64 {
        if self.head.is_none() {
            return 0;
        }
        let total: u64 = self.buckets.iter().sum();
        total / (self.history_ms as u64 / 1000).max(1)
    }
}

impl Default for RateEstimator {
    /// Matches the 10s/1s window `fserve.c`'s `rate_setup(10000, 1000)` uses.
    fn default() -> Self {
        RateEstimator::new(10_000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_estimator_reports_zero() {
        let r = RateEstimator::default();
        assert_eq!(r.avg(), 0);
    }

    #[test]
    fn steady_rate_converges() {
        let mut r = RateEstimator::default();
        for s in 0..20 {
            r.add(1000, s * 1000);
        }
        // Window holds 10 buckets of 1000 bytes each -> 1000 bytes/sec.
        assert_eq!(r.avg(), 1000);
    }

    #[test]
    fn sparse_updates_age_out() {
        let mut r = RateEstimator::default();
        r.add(10_000, 0);
        // Jump far enough ahead that the old bucket has aged out of the window.
        r.add(0, 20_000);
        assert_eq!(r.avg(), 0);
    }

    #[test]
    fn clock_going_backwards_resets_window() {
        let mut r = RateEstimator::default();
        r.add(5000, 5000);
        r.add(5000, 1000); // backwards: discontinuity
        assert_eq!(r.avg(), 500);
    }

    #[test]
    fn tolerates_single_sample() {
        let mut r = RateEstimator::default();
        r.add(2000, 42);
        assert_eq!(r.avg(), 200);
    }
}
