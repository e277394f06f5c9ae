use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use dashmap::DashMap;
use metrics::{counter, gauge};
use uuid::Uuid;

use super::DelayCell;
use crate::config::AdmissionConfig;
use crate::delay::{DelaySignal, DelaySource};

/// Per-client credit ledger entry. Created on the client's first request and
/// retained for the life of the process.
pub struct Connection {
    id: Uuid,
    state: Mutex<ConnectionState>,
}

#[derive(Clone, Copy)]
struct ConnectionState {
    issued: i64,
    demand: i64,
    /// ns relative to the controller epoch.
    last_updated: i64,
}

impl Connection {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Credits currently granted to this client.
    pub fn issued(&self) -> i64 {
        self.state.lock().expect("connection state poisoned").issued
    }

    /// The client's last reported queue depth.
    pub fn demand(&self) -> i64 {
        self.state.lock().expect("connection state poisoned").demand
    }
}

/// Server-side credit accounting.
///
/// Owns the client map, the global pool (`c_total`), the running sum of
/// grants (`c_issued`), and the once-per-RTT AIMD pool update. `c_issued` is
/// maintained incrementally on the grant path and re-derived from the map at
/// every pool update; between updates it may drift by the number of
/// in-flight grants.
pub struct Controller {
    clients: DashMap<Uuid, Arc<Connection>>,
    num_clients: AtomicI64,
    c_issued: AtomicI64,
    c_total: AtomicI64,
    /// ns since epoch of the last committed pool update. Written only while
    /// `rtt` is held.
    last_update: AtomicI64,
    /// Exclusive token for the pool update; the guarded delay signal may
    /// only ever be sampled by the update that won the `try_lock`.
    rtt: Mutex<DelaySignal>,
    delay_cell: DelayCell,
    epoch: Instant,
    a_factor: f64,
    b_factor: f64,
    threshold_delay: f64,
    aqm_delay: f64,
    rtt_ns: i64,
    load_shedding: bool,
    verbose: bool,
}

impl Controller {
    /// Must be called within a tokio runtime; the controller owns the task
    /// behind its AQM delay cell.
    pub fn new(config: &AdmissionConfig, source: impl DelaySource) -> Arc<Self> {
        Arc::new(Self {
            clients: DashMap::new(),
            num_clients: AtomicI64::new(0),
            c_issued: AtomicI64::new(0),
            c_total: AtomicI64::new(config.initial_credits.max(1)),
            last_update: AtomicI64::new(0),
            rtt: Mutex::new(DelaySignal::new(source)),
            delay_cell: DelayCell::spawn(),
            epoch: Instant::now(),
            a_factor: config.a_factor,
            b_factor: config.b_factor,
            threshold_delay: config.threshold_delay(),
            aqm_delay: config.aqm_delay(),
            rtt_ns: config.rtt_us.saturating_mul(1000),
            load_shedding: config.load_shedding,
            verbose: config.verbose,
        })
    }

    fn now_nanos(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    /// Current size of the credit pool.
    pub fn total_credits(&self) -> i64 {
        self.c_total.load(Ordering::SeqCst)
    }

    /// Running sum of credits granted across all clients.
    pub fn issued_credits(&self) -> i64 {
        self.c_issued.load(Ordering::SeqCst)
    }

    pub fn num_clients(&self) -> i64 {
        self.num_clients.load(Ordering::SeqCst)
    }

    pub fn aqm_delay(&self) -> f64 {
        self.aqm_delay
    }

    pub fn load_shedding(&self) -> bool {
        self.load_shedding
    }

    pub(crate) fn delay_cell(&self) -> &DelayCell {
        &self.delay_cell
    }

    /// Look up or create the ledger entry for `id`. Strictly get-or-insert:
    /// a racing registration never replaces live state.
    pub fn register(&self, id: Uuid, demand: i64) -> Arc<Connection> {
        if let Some(existing) = self.clients.get(&id) {
            return Arc::clone(existing.value());
        }
        // Backdate the new entry past any possible pool update so its first
        // grant takes the post-update path.
        let backdated = self.now_nanos() - 1_000_000_000;
        let mut inserted = false;
        let entry = self.clients.entry(id).or_insert_with(|| {
            inserted = true;
            Arc::new(Connection {
                id,
                state: Mutex::new(ConnectionState {
                    issued: 0,
                    demand,
                    last_updated: backdated,
                }),
            })
        });
        let connection = Arc::clone(entry.value());
        drop(entry);
        if inserted {
            let clients = self.num_clients.fetch_add(1, Ordering::SeqCst) + 1;
            gauge!("seawall_clients", clients as f64);
            if self.verbose {
                debug!(client = %id, demand, "registered client");
            }
        }
        connection
    }

    /// Compute and record a new grant for `id`, returning the value to stamp
    /// on the response. An unknown id grants 0 and is reported as a logic
    /// error.
    pub fn issue(&self, id: Uuid, demand: i64) -> i64 {
        let Some(connection) = self.clients.get(&id).map(|c| Arc::clone(c.value())) else {
            error!(client = %id, "grant requested for unregistered client");
            counter!("seawall_grant_errors_total", 1);
            return 0;
        };

        let last_pool_update = self.last_update.load(Ordering::SeqCst);
        let mut state = connection.state.lock().expect("connection state poisoned");
        let c_prev = state.issued;
        let c_new = if state.last_updated > last_pool_update {
            // Already serviced this RTT window: lazy drain by one.
            (c_prev - 1).max(1)
        } else {
            self.fresh_grant(demand, c_prev)
        };
        state.issued = c_new;
        state.demand = demand;
        state.last_updated = self.now_nanos();
        drop(state);

        self.c_issued.fetch_add(c_new - c_prev, Ordering::SeqCst);
        gauge!("seawall_credits_issued", self.c_issued.load(Ordering::SeqCst) as f64);
        if self.verbose {
            debug!(client = %id, c_prev, c_new, demand, "issued credits");
        }
        c_new
    }

    /// First grant in the current RTT window: the client's demand plus a
    /// speculative share of the unused pool, capped by remaining headroom,
    /// or strictly non-increasing when the pool is saturated.
    fn fresh_grant(&self, demand: i64, c_prev: i64) -> i64 {
        let c_total = self.c_total.load(Ordering::SeqCst);
        let c_issued = self.c_issued.load(Ordering::SeqCst);
        let overcommit = self.overcommit(c_total, c_issued);
        let want = match demand.checked_add(overcommit) {
            Some(want) if want >= 0 => want,
            _ => {
                warn!(demand, overcommit, "negative grant demand, substituting 1");
                return 1;
            }
        };
        let c_new = if c_issued < c_total {
            want.min(c_prev + (c_total - c_issued))
        } else {
            want.min(c_prev - 1)
        };
        c_new.max(1)
    }

    /// Per-client share of the unused pool, at least 1 so idle clients can
    /// always make progress.
    fn overcommit(&self, c_total: i64, c_issued: i64) -> i64 {
        let clients = self.num_clients.load(Ordering::SeqCst);
        if clients <= 0 {
            return 1;
        }
        let share = ((c_total - c_issued) as f64 / clients as f64).round() as i64;
        share.max(1)
    }

    /// Once-per-RTT pool update. Safe to call from every completed request;
    /// only the caller that wins the non-blocking acquire inside an elapsed
    /// window commits.
    pub fn tick(&self) {
        if self.now_nanos() - self.last_update.load(Ordering::SeqCst) <= self.rtt_ns {
            return;
        }
        let Ok(mut signal) = self.rtt.try_lock() else {
            return;
        };
        // A caller that passed the pre-check while the winner was committing
        // must not run a second update in the same window.
        if self.now_nanos() - self.last_update.load(Ordering::SeqCst) <= self.rtt_ns {
            return;
        }

        let delay = signal.sample();
        if self.load_shedding {
            self.delay_cell.store(delay);
        }

        // Re-derive the issued sum from the map; this is the source of truth
        // that bounds incremental drift to one window.
        let reconciled: i64 = self.clients.iter().map(|entry| entry.value().issued()).sum();
        self.c_issued.store(reconciled, Ordering::SeqCst);

        let next = self.next_pool_size(delay);
        let prev = self.c_total.swap(next, Ordering::SeqCst);
        self.last_update.store(self.now_nanos(), Ordering::SeqCst);

        debug!(
            delay_us = delay,
            prev_total = prev,
            new_total = next,
            issued = reconciled,
            "credit pool updated"
        );
        gauge!("seawall_credit_pool", next as f64);
    }

    /// AIMD resize: additive growth while the delay signal is under the
    /// threshold, multiplicative shrink (floored at 50%) beyond it.
    fn next_pool_size(&self, delay: f64) -> i64 {
        let c_total = self.c_total.load(Ordering::SeqCst);
        if delay < self.threshold_delay {
            let grow = (self.a_factor * self.num_clients.load(Ordering::SeqCst) as f64).round() as i64;
            c_total + grow.max(1)
        } else {
            let factor =
                (1.0 - self.b_factor * ((delay - self.threshold_delay) / self.threshold_delay)).max(0.5);
            ((c_total as f64 * factor).round() as i64).max(1)
        }
    }
}
