//! The value primitives behind each exported time series.
//!
//! Counters and gauges store their `f64` value as raw bits inside an
//! `AtomicU64`, updated with CAS loops, so the ingest workers never contend
//! on a lock for the simple families. Histograms and summaries hold their
//! mutable cores behind a `parking_lot::Mutex`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use sketches_ddsketch::{Config, DDSketch};

/// A monotone counter.
#[derive(Debug, Default)]
pub struct AtomicCounter {
    bits: AtomicU64,
}

impl AtomicCounter {
    /// Adds `value` to the counter.
    pub fn add(&self, value: f64) {
        let _ = self.bits.fetch_update(Ordering::AcqRel, Ordering::Relaxed, |curr| {
            Some((f64::from_bits(curr) + value).to_bits())
        });
    }

    /// Adds one to the counter.
    pub fn inc(&self) {
        self.add(1.0);
    }

    /// Current value.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// A gauge supporting absolute sets and signed deltas.
#[derive(Debug, Default)]
pub struct AtomicGauge {
    bits: AtomicU64,
}

impl AtomicGauge {
    /// Replaces the gauge value.
    pub fn set(&self, value: f64) {
        self.bits.store(value.to_bits(), Ordering::Release);
    }

    /// Adds a signed delta to the gauge.
    pub fn add(&self, value: f64) {
        let _ = self.bits.fetch_update(Ordering::AcqRel, Ordering::Relaxed, |curr| {
            Some((f64::from_bits(curr) + value).to_bits())
        });
    }

    /// Current value.
    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}

/// A fixed-bucket histogram series.
#[derive(Debug)]
pub struct HistogramHandle {
    core: Mutex<HistogramCore>,
}

#[derive(Debug)]
struct HistogramCore {
    bounds: Vec<f64>,
    counts: Vec<u64>,
    count: u64,
    sum: f64,
}

/// Point-in-time view of a histogram, with cumulative bucket counts.
#[derive(Debug)]
pub struct HistogramSnapshot {
    /// `(upper bound, cumulative count)` pairs, excluding `+Inf`.
    pub buckets: Vec<(f64, u64)>,
    /// Total number of observations.
    pub count: u64,
    /// Sum of all observations.
    pub sum: f64,
}

impl HistogramHandle {
    /// Creates a histogram with the given upper bounds, which are sorted and
    /// deduplicated. An empty bounds list is allowed; only the implicit
    /// `+Inf` bucket is exported then.
    pub fn new(bounds: &[f64]) -> Self {
        let mut bounds = bounds.to_vec();
        bounds.sort_by(|a, b| a.total_cmp(b));
        bounds.dedup();
        let counts = vec![0u64; bounds.len()];
        HistogramHandle { core: Mutex::new(HistogramCore { bounds, counts, count: 0, sum: 0.0 }) }
    }

    /// Records one observation.
    pub fn observe(&self, sample: f64) {
        let mut core = self.core.lock();
        core.count += 1;
        core.sum += sample;
        // Per-bucket counts are kept non-cumulative; the cumulative `le`
        // semantics are produced at snapshot time.
        if let Some(idx) = core.bounds.iter().position(|bound| sample <= *bound) {
            core.counts[idx] += 1;
        }
    }

    /// Takes a snapshot with the cumulative counts Prometheus expects.
    pub fn snapshot(&self) -> HistogramSnapshot {
        let core = self.core.lock();
        let mut cumulative = 0u64;
        let buckets = core
            .bounds
            .iter()
            .zip(&core.counts)
            .map(|(bound, count)| {
                cumulative += count;
                (*bound, cumulative)
            })
            .collect();
        HistogramSnapshot { buckets, count: core.count, sum: core.sum }
    }
}

/// A quantile-sketch series backing a Prometheus summary.
///
/// Negative and positive samples go into separate [DDSketch] instances so an
/// arbitrary distribution of floats can be served, with a relative-error
/// guarantee regardless of the value range.
///
/// [DDSketch]: https://arxiv.org/abs/1908.10693
#[derive(Debug)]
pub struct SummaryHandle {
    core: Mutex<SummaryCore>,
    quantiles: Arc<Vec<f64>>,
}

struct SummaryCore {
    negative: DDSketch,
    positive: DDSketch,
    min_value: f64,
    zeroes: usize,
    count: u64,
    sum: f64,
}

impl std::fmt::Debug for SummaryCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryCore")
            .field("min_value", &self.min_value)
            .field("zeroes", &self.zeroes)
            .field("count", &self.count)
            .field("sum", &self.sum)
            .finish()
    }
}

const SUMMARY_ALPHA: f64 = 0.0001;
const SUMMARY_MAX_BINS: u32 = 32_768;
const SUMMARY_MIN_VALUE: f64 = 1.0e-9;

impl SummaryHandle {
    /// Creates an empty summary that will expose the given quantiles.
    pub fn new(quantiles: Arc<Vec<f64>>) -> Self {
        let config = Config::new(SUMMARY_ALPHA, SUMMARY_MAX_BINS, SUMMARY_MIN_VALUE);
        SummaryHandle {
            core: Mutex::new(SummaryCore {
                negative: DDSketch::new(config.clone()),
                positive: DDSketch::new(config),
                min_value: SUMMARY_MIN_VALUE,
                zeroes: 0,
                count: 0,
                sum: 0.0,
            }),
            quantiles,
        }
    }

    /// The quantiles this summary exposes when rendered.
    pub fn quantiles(&self) -> &[f64] {
        &self.quantiles
    }

    /// Records one observation.
    pub fn observe(&self, value: f64) {
        let mut core = self.core.lock();
        core.count += 1;
        core.sum += value;
        let vabs = value.abs();
        if vabs <= core.min_value {
            core.zeroes += 1;
        } else if value > 0.0 {
            core.positive.add(vabs);
        } else {
            core.negative.add(vabs);
        }
    }

    /// Total number of observations.
    pub fn count(&self) -> u64 {
        self.core.lock().count
    }

    /// Sum of all observations.
    pub fn sum(&self) -> f64 {
        self.core.lock().sum
    }

    /// Estimated value at quantile `q`, or `None` while the summary is empty
    /// or when `q` is outside `[0, 1]`.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        if !(0.0..=1.0).contains(&q) {
            return None;
        }

        let core = self.core.lock();
        let ncount = core.negative.count();
        let pcount = core.positive.count();
        let zcount = core.zeroes;
        let total = ncount + pcount + zcount;
        if total == 0 {
            return None;
        }

        let rank = (q * total as f64).ceil() as usize;
        if rank < ncount {
            // The rank lands in the negative sketch; flip the quantile since
            // magnitudes are stored there.
            let nq = 1.0 - (rank as f64 / ncount as f64);
            core.negative.quantile(nq).ok().flatten().map(|v| -v)
        } else if rank < ncount + zcount {
            Some(0.0)
        } else if pcount > 0 {
            let pq = (rank.saturating_sub(ncount + zcount)) as f64 / pcount as f64;
            core.positive.quantile(pq.min(1.0)).ok().flatten()
        } else if ncount > 0 {
            core.negative.quantile(0.0).ok().flatten().map(|v| -v)
        } else {
            Some(0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_add() {
        let counter = AtomicCounter::default();
        counter.add(2.0);
        counter.add(0.5);
        counter.inc();
        assert_eq!(counter.get(), 3.5);
    }

    #[test]
    fn test_gauge_set_and_add() {
        let gauge = AtomicGauge::default();
        gauge.set(3.0);
        gauge.add(1.0);
        gauge.add(-0.5);
        assert_eq!(gauge.get(), 3.5);
        gauge.set(-2.0);
        assert_eq!(gauge.get(), -2.0);
    }

    #[test]
    fn test_histogram_cumulative_buckets() {
        let histogram = HistogramHandle::new(&[10.0, 25.0, 100.0]);
        for sample in [3.0, 2.0, 6.0, 12.0, 56.0, 82.0, 202.0, 100.0, 29.0] {
            histogram.observe(sample);
        }

        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.buckets, vec![(10.0, 3), (25.0, 4), (100.0, 8)]);
        assert_eq!(snapshot.count, 9);
        assert_eq!(snapshot.sum, 492.0);
    }

    #[test]
    fn test_histogram_unsorted_bounds() {
        let histogram = HistogramHandle::new(&[5.0, 1.0, 2.0]);
        histogram.observe(1.5);
        let snapshot = histogram.snapshot();
        assert_eq!(snapshot.buckets, vec![(1.0, 0), (2.0, 1), (5.0, 1)]);
    }

    #[test]
    fn test_summary_quantiles() {
        let summary = SummaryHandle::new(Arc::new(vec![0.5, 0.99]));
        for i in 1..=1000 {
            summary.observe(f64::from(i));
        }

        assert_eq!(summary.count(), 1000);
        assert_eq!(summary.sum(), 500_500.0);

        let p50 = summary.quantile(0.5).unwrap();
        assert!((p50 - 500.0).abs() < 5.0, "p50 was {p50}");
        let p99 = summary.quantile(0.99).unwrap();
        assert!((p99 - 990.0).abs() < 5.0, "p99 was {p99}");
    }

    #[test]
    fn test_summary_empty() {
        let summary = SummaryHandle::new(Arc::new(vec![0.5]));
        assert_eq!(summary.quantile(0.5), None);
        assert_eq!(summary.quantile(1.5), None);
    }
}
