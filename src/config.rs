use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fraction of the SLO used as the delay threshold for pool adjustment.
const DELAY_THRESHOLD_PERCENT: f64 = 0.4;

/// Tuning parameters for both sides of the admission control loop.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields, default)]
pub struct AdmissionConfig {
    /// Additive growth rate of the credit pool, per registered client.
    pub a_factor: f64,

    /// Multiplicative shrink rate of the credit pool under delay.
    pub b_factor: f64,

    /// Latency objective in microseconds.
    pub slo_us: i64,

    /// Starting size of the credit pool.
    pub initial_credits: i64,

    /// Interval between credit pool updates, in microseconds.
    pub rtt_us: i64,

    /// Promote per-request grant/drop events to debug level.
    pub verbose: bool,

    /// Expire queued requests that waited longer than the AQM threshold.
    pub use_client_time_expiration: bool,

    /// Shed responses when the server's queueing delay exceeds the AQM
    /// threshold.
    pub load_shedding: bool,

    /// Alternative client-side deadline in microseconds, applied when the
    /// SLO-derived threshold degenerates to zero.
    pub client_expiration_us: i64,

    /// Seconds after construction at which a client that has never heard
    /// back from its server stops enforcing credits.
    pub escape_hatch_secs: u64,

    /// Capacity of the client-side waiting queue.
    pub max_queue_len: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            a_factor: 0.001,
            b_factor: 0.02,
            slo_us: 160,
            initial_credits: 1000,
            rtt_us: 5000,
            verbose: false,
            use_client_time_expiration: true,
            load_shedding: true,
            client_expiration_us: 1000,
            escape_hatch_secs: 25,
            max_queue_len: 50,
        }
    }
}

impl AdmissionConfig {
    /// Queueing delay (µs) above which the pool stops growing.
    pub fn threshold_delay(&self) -> f64 {
        self.slo_us as f64 * DELAY_THRESHOLD_PERCENT
    }

    /// Queueing delay (µs) above which requests are dropped outright.
    pub fn aqm_delay(&self) -> f64 {
        2.0 * self.threshold_delay()
    }

    /// How long a request may sit in the client queue before it expires.
    pub(crate) fn expiry_micros(&self) -> i64 {
        let aqm = self.aqm_delay();
        if aqm > 0.0 {
            aqm as i64
        } else {
            self.client_expiration_us
        }
    }

    pub(crate) fn escape_hatch(&self) -> Duration {
        Duration::from_secs(self.escape_hatch_secs)
    }
}
