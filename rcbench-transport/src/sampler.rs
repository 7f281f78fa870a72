// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-operation latency collection.

use std::time::Instant;

/// Collects one latency sample per measured operation.
///
/// The buffer is sized once up front so the measurement loop never
/// allocates. Sorting is explicit; percentile queries assume it has
/// happened.
#[derive(Clone, Debug, Default)]
pub struct Sampler {
    samples: Vec<u64>,
    started: Option<Instant>,
}

impl Sampler {
    /// A sampler with room for `capacity` samples.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: Vec::with_capacity(capacity),
            started: None,
        }
    }

    /// Mark the start of an operation.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Record the time since the matching [`start`](Self::start) call.
    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            let ns = u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX);
            self.samples.push(ns);
        }
    }

    #[cfg(test)]
    fn record(&mut self, ns: u64) {
        self.samples.push(ns);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Sort samples ascending, enabling percentile queries.
    pub fn sort_ascending(&mut self) {
        self.samples.sort_unstable();
    }

    /// Nearest-rank percentile in nanoseconds for `p` in `(0, 1]`.
    ///
    /// Returns `None` outside that range or when no samples were taken.
    /// Only meaningful after [`sort_ascending`](Self::sort_ascending).
    #[must_use]
    pub fn percentile(&self, p: f64) -> Option<u64> {
        if self.samples.is_empty() || p <= 0.0 || p > 1.0 {
            return None;
        }
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_precision_loss,
            clippy::cast_sign_loss
        )]
        let rank = (p * self.samples.len() as f64).ceil() as usize;
        Some(self.samples[rank - 1])
    }

    #[must_use]
    pub fn min(&self) -> Option<u64> {
        self.samples.iter().min().copied()
    }

    #[must_use]
    pub fn max(&self) -> Option<u64> {
        self.samples.iter().max().copied()
    }

    /// Mean sample in nanoseconds.
    #[must_use]
    pub fn avg(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        #[allow(clippy::cast_precision_loss)]
        let sum: f64 = self.samples.iter().map(|&ns| ns as f64).sum();
        #[allow(clippy::cast_precision_loss)]
        Some(sum / self.samples.len() as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::Sampler;

    fn sampler_of(samples: &[u64]) -> Sampler {
        let mut s = Sampler::with_capacity(samples.len());
        for &ns in samples {
            s.record(ns);
        }
        s.sort_ascending();
        s
    }

    #[test]
    fn nearest_rank() {
        let s = sampler_of(&[50, 10, 40, 20, 30]);
        // ceil(0.5 * 5) = 3, third smallest.
        assert_eq!(s.percentile(0.5), Some(30));
        assert_eq!(s.percentile(0.95), Some(50));
        assert_eq!(s.percentile(1.0), Some(50));
        // ceil(0.2 * 5) = 1, the minimum.
        assert_eq!(s.percentile(0.2), Some(10));
    }

    #[test]
    fn out_of_range_is_none() {
        let s = sampler_of(&[1, 2, 3]);
        assert_eq!(s.percentile(0.0), None);
        assert_eq!(s.percentile(-0.5), None);
        assert_eq!(s.percentile(1.5), None);
    }

    #[test]
    fn empty_sampler() {
        let s = Sampler::with_capacity(8);
        assert!(s.is_empty());
        assert_eq!(s.percentile(0.5), None);
        assert_eq!(s.min(), None);
        assert_eq!(s.max(), None);
        assert_eq!(s.avg(), None);
    }

    #[test]
    fn single_sample_is_every_percentile() {
        let s = sampler_of(&[42]);
        assert_eq!(s.percentile(0.001), Some(42));
        assert_eq!(s.percentile(0.999), Some(42));
        assert_eq!(s.percentile(1.0), Some(42));
    }

    #[test]
    fn reductions() {
        let s = sampler_of(&[10, 20, 60]);
        assert_eq!(s.min(), Some(10));
        assert_eq!(s.max(), Some(60));
        assert_eq!(s.avg(), Some(30.0));
    }

    #[test]
    fn stop_without_start_records_nothing() {
        let mut s = Sampler::with_capacity(1);
        s.stop();
        assert!(s.is_empty());
    }

    #[test]
    fn start_stop_measures_something() {
        let mut s = Sampler::with_capacity(1);
        s.start();
        s.stop();
        assert_eq!(s.len(), 1);
    }
}
