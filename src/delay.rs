//! The queueing-delay signal: histogram snapshots of scheduler latency,
//! differenced between pool updates to estimate the worst delay any work
//! item saw in the interval.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

/// A point-in-time reading of a scheduler-latency histogram.
///
/// `upper_bounds[i]` is the inclusive upper edge of bucket `i` in seconds;
/// `counts[i]` is the number of observations that have ever landed in that
/// bucket. Counts never decrease across readings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DelayHistogram {
    pub upper_bounds: Vec<f64>,
    pub counts: Vec<u64>,
}

/// Anything that can produce scheduler-latency histogram readings.
pub trait DelaySource: Send + 'static {
    fn read(&mut self) -> DelayHistogram;
}

/// Differences successive histogram readings.
///
/// Each sample reads a fresh histogram, scans buckets from slowest to
/// fastest, and reports the upper bound of the slowest bucket that gained
/// observations since the previous sample, in microseconds. The first sample
/// only primes the baseline and reports zero. Not re-entrant: exactly one
/// consumer may sample.
pub struct DelaySignal {
    source: Box<dyn DelaySource>,
    prev: Option<DelayHistogram>,
}

impl DelaySignal {
    pub fn new(source: impl DelaySource) -> Self {
        Self {
            source: Box::new(source),
            prev: None,
        }
    }

    /// Worst-case queueing delay (µs) observed since the previous sample.
    pub fn sample(&mut self) -> f64 {
        let curr = self.source.read();
        let delay = match &self.prev {
            None => 0.0,
            Some(prev) => worst_bucket_micros(prev, &curr),
        };
        self.prev = Some(curr);
        delay
    }
}

fn worst_bucket_micros(earlier: &DelayHistogram, later: &DelayHistogram) -> f64 {
    let buckets = earlier.counts.len().min(later.counts.len());
    for i in (0..buckets).rev() {
        if later.counts[i] > earlier.counts[i] {
            return later.upper_bounds[i] * 1e6;
        }
    }
    0.0
}

const PROBE_BUCKETS: usize = 24;

/// Timer-overshoot probe: the crate's stock [`DelaySource`].
///
/// A background task sleeps a fixed interval in a loop and records how far
/// past its deadline it actually woke. On a saturated runtime the overshoot
/// grows with the runnable backlog, which is the signal the controller
/// feeds on. Overshoots accumulate into a geometric bucket grid from 1µs to
/// roughly 8s.
pub struct TimerLagProbe {
    shared: Arc<Mutex<DelayHistogram>>,
    worker: JoinHandle<()>,
}

impl TimerLagProbe {
    /// Spawn the probe task. Must be called within a tokio runtime.
    pub fn spawn(interval: Duration) -> Self {
        let shared = Arc::new(Mutex::new(DelayHistogram {
            upper_bounds: (0..PROBE_BUCKETS).map(|i| 1e-6 * f64::powi(2.0, i as i32)).collect(),
            counts: vec![0; PROBE_BUCKETS],
        }));
        let histogram = Arc::clone(&shared);
        let worker = tokio::spawn(async move {
            loop {
                let before = tokio::time::Instant::now();
                tokio::time::sleep(interval).await;
                let lag = (before.elapsed().saturating_sub(interval)).as_secs_f64();
                let mut histogram = histogram.lock().expect("probe histogram poisoned");
                let slot = histogram
                    .upper_bounds
                    .iter()
                    .position(|&bound| lag <= bound)
                    .unwrap_or(PROBE_BUCKETS - 1);
                histogram.counts[slot] += 1;
            }
        });
        Self { shared, worker }
    }

    /// Probe with a 1ms interval, a reasonable default for millisecond-scale
    /// RTT windows.
    pub fn spawn_default() -> Self {
        Self::spawn(Duration::from_millis(1))
    }
}

impl DelaySource for TimerLagProbe {
    fn read(&mut self) -> DelayHistogram {
        self.shared.lock().expect("probe histogram poisoned").clone()
    }
}

impl Drop for TimerLagProbe {
    fn drop(&mut self) {
        self.worker.abort();
    }
}


#[cfg(test)]
mod test {
    use super::testing::{histogram, ScriptedSource};
    use super::*;

    #[test]
    fn first_sample_primes_the_baseline() {
        let mut signal = DelaySignal::new(ScriptedSource::new(vec![histogram(&[
            (0.001, 5),
            (0.002, 9),
        ])]));
        assert_eq!(signal.sample(), 0.0);
    }

    #[test]
    fn reports_the_slowest_bucket_that_grew() {
        let mut signal = DelaySignal::new(ScriptedSource::new(vec![
            histogram(&[(0.001, 1), (0.002, 2), (0.004, 3)]),
            histogram(&[(0.001, 1), (0.002, 4), (0.004, 3)]),
        ]));
        signal.sample();
        assert_eq!(signal.sample(), 2000.0);
    }

    #[test]
    fn unchanged_histogram_reads_as_zero() {
        let mut signal = DelaySignal::new(ScriptedSource::quiet());
        signal.sample();
        assert_eq!(signal.sample(), 0.0);
        assert_eq!(signal.sample(), 0.0);
    }

    #[test]
    fn baseline_advances_every_sample() {
        let mut signal = DelaySignal::new(ScriptedSource::new(vec![
            histogram(&[(0.001, 0), (0.002, 0)]),
            histogram(&[(0.001, 0), (0.002, 7)]),
            histogram(&[(0.001, 1), (0.002, 7)]),
        ]));
        signal.sample();
        assert_eq!(signal.sample(), 2000.0);
        // The second reading is now the baseline, so only the fast bucket
        // shows growth.
        assert_eq!(signal.sample(), 1000.0);
    }

    #[tokio::test]
    async fn probe_accumulates_observations() {
        let mut probe = TimerLagProbe::spawn(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let reading = probe.read();
        assert!(reading.counts.iter().sum::<u64>() > 0);

        let mut signal = DelaySignal::new(probe);
        signal.sample();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(signal.sample() >= 0.0);
    }
}
