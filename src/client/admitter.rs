use std::sync::{Arc, Mutex};
use std::time::Instant;

use metrics::counter;
use snafu::Snafu;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use crate::config::AdmissionConfig;

/// Balance stored when the escape hatch fires; effectively disables credit
/// limiting for the rest of the process lifetime.
const ESCAPE_BALANCE: i64 = 99_999_999;

#[derive(Debug, Snafu)]
pub enum AdmitError {
    #[snafu(display("client {client} queue full, request dropped"))]
    QueueFull { client: Uuid },

    #[snafu(display("client {client} request expired in queue after {waited_us}us"))]
    Expired { client: Uuid, waited_us: i64 },
}

/// Client-side admission: a bounded waiting queue, a credit balance
/// advertised by the peer server, and a single-slot wake-up gate.
///
/// The gate is a wake-up signal, not a queue: one waiter proceeds per post,
/// a post with no waiter present is kept for the next one, and no wake order
/// across waiters is guaranteed.
pub struct Admitter {
    id: Uuid,
    queue: Arc<Semaphore>,
    capacity: usize,
    credits: Mutex<i64>,
    gate: Notify,
    expiry_us: i64,
    use_expiration: bool,
    verbose: bool,
}

/// Holds one slot of the bounded queue for the life of a queued request.
pub(crate) struct QueueSlot {
    _permit: OwnedSemaphorePermit,
}

impl Admitter {
    /// Must be constructed inside a tokio runtime: spawns the escape-hatch
    /// timer that unblocks a client whose server never answers.
    pub fn new(config: &AdmissionConfig) -> Arc<Self> {
        let admitter = Arc::new(Self {
            id: Uuid::new_v4(),
            queue: Arc::new(Semaphore::new(config.max_queue_len)),
            capacity: config.max_queue_len,
            // One credit to spend before the first grant arrives.
            credits: Mutex::new(1),
            gate: Notify::new(),
            expiry_us: config.expiry_micros(),
            use_expiration: config.use_client_time_expiration,
            verbose: config.verbose,
        });
        admitter.gate.notify_one();

        let hatch = Arc::clone(&admitter);
        let delay = config.escape_hatch();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            warn!(client = %hatch.id, "escape hatch fired, credit limiting disabled");
            *hatch.credits.lock().expect("credit balance poisoned") = ESCAPE_BALANCE;
            hatch.gate.notify_one();
        });
        admitter
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Requests currently occupying queue slots.
    pub fn queue_len(&self) -> usize {
        self.capacity - self.queue.available_permits()
    }

    /// Current credit balance.
    pub fn balance(&self) -> i64 {
        *self.credits.lock().expect("credit balance poisoned")
    }

    pub(crate) fn try_enqueue(&self) -> Result<QueueSlot, AdmitError> {
        match Arc::clone(&self.queue).try_acquire_owned() {
            Ok(permit) => Ok(QueueSlot { _permit: permit }),
            Err(_) => {
                counter!("seawall_queue_rejections_total", 1);
                QueueFullSnafu { client: self.id }.fail()
            }
        }
    }

    /// Park until a credit is available or the request goes stale. On
    /// success exactly one credit has been consumed.
    pub(crate) async fn acquire_credit(&self, enqueued: Instant) -> Result<(), AdmitError> {
        loop {
            self.gate.notified().await;

            if self.use_expiration {
                let waited_us = enqueued.elapsed().as_micros() as i64;
                if waited_us > self.expiry_us {
                    // Stale: die here rather than consume a credit, and hand
                    // the wake-up to the next waiter.
                    self.gate.notify_one();
                    counter!("seawall_expired_requests_total", 1);
                    if self.verbose {
                        debug!(client = %self.id, waited_us, "request expired in queue");
                    }
                    return ExpiredSnafu {
                        client: self.id,
                        waited_us,
                    }
                    .fail();
                }
            }

            let mut balance = self.credits.lock().expect("credit balance poisoned");
            if *balance > 0 {
                *balance -= 1;
                if *balance > 0 {
                    self.gate.notify_one();
                }
                return Ok(());
            }
            // Balance stays at zero; the next response arrival re-posts the
            // gate and wakes us again.
        }
    }

    /// Admit one outbound request: take a queue slot, wait for a credit,
    /// release the slot. Returns the queue depth to piggyback as demand.
    pub async fn admit(&self) -> Result<i64, AdmitError> {
        let slot = self.try_enqueue()?;
        let enqueued = Instant::now();
        self.acquire_credit(enqueued).await?;
        drop(slot);
        Ok(self.queue_len() as i64)
    }

    /// Fold the server's piggybacked grant into the balance and wake a
    /// waiter. A response without a grant still keeps one unit alive so the
    /// loop cannot deadlock.
    pub fn absorb_grant(&self, credits: Option<i64>) {
        let mut balance = self.credits.lock().expect("credit balance poisoned");
        *balance = match credits {
            Some(granted) => granted.max(1),
            None => (*balance).max(1),
        };
        drop(balance);
        self.gate.notify_one();
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{AdmitError, Admitter};
    use crate::config::AdmissionConfig;

    /// Expiration off and a distant escape hatch, so tests control every
    /// wake-up themselves.
    fn patient_config() -> AdmissionConfig {
        AdmissionConfig {
            use_client_time_expiration: false,
            escape_hatch_secs: 3600,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn first_admit_spends_the_initial_credit() {
        let admitter = Admitter::new(&patient_config());
        assert_eq!(admitter.balance(), 1);
        let demand = admitter.admit().await.unwrap();
        assert_eq!(demand, 0);
        assert_eq!(admitter.balance(), 0);
    }

    #[tokio::test]
    async fn each_admit_consumes_exactly_one_credit() {
        let admitter = Admitter::new(&patient_config());
        admitter.absorb_grant(Some(5));
        admitter.admit().await.unwrap();
        assert_eq!(admitter.balance(), 4);
        admitter.admit().await.unwrap();
        assert_eq!(admitter.balance(), 3);
    }

    #[tokio::test]
    async fn queue_rejects_when_full() {
        let admitter = Admitter::new(&patient_config());
        let slots: Vec<_> = (0..50)
            .map(|_| admitter.try_enqueue().expect("slot within capacity"))
            .collect();
        assert_eq!(admitter.queue_len(), 50);
        assert!(matches!(
            admitter.try_enqueue(),
            Err(AdmitError::QueueFull { .. })
        ));
        drop(slots);
        assert!(admitter.try_enqueue().is_ok());
    }

    #[tokio::test]
    async fn waiters_park_until_a_grant_arrives() {
        let admitter = Admitter::new(&patient_config());
        admitter.admit().await.unwrap();

        let waiter = {
            let admitter = Arc::clone(&admitter);
            tokio::spawn(async move { admitter.admit().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        admitter.absorb_grant(Some(3));
        waiter.await.unwrap().unwrap();
        assert_eq!(admitter.balance(), 2);
    }

    #[tokio::test]
    async fn leftover_credits_wake_the_next_waiter() {
        let admitter = Admitter::new(&patient_config());
        admitter.admit().await.unwrap();

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let admitter = Arc::clone(&admitter);
                tokio::spawn(async move { admitter.admit().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // One post, two credits: the first waiter re-posts for the second.
        admitter.absorb_grant(Some(2));
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(admitter.balance(), 0);
    }

    #[tokio::test]
    async fn a_missing_grant_keeps_one_credit_alive() {
        let admitter = Admitter::new(&patient_config());
        admitter.admit().await.unwrap();
        assert_eq!(admitter.balance(), 0);
        admitter.absorb_grant(None);
        assert_eq!(admitter.balance(), 1);
        admitter.admit().await.unwrap();
        assert_eq!(admitter.balance(), 0);
    }

    #[tokio::test]
    async fn stale_waiters_expire_instead_of_spending_credits() {
        // Default SLO: requests older than 128µs are stale.
        let config = AdmissionConfig {
            escape_hatch_secs: 3600,
            ..Default::default()
        };
        let admitter = Admitter::new(&config);
        admitter.admit().await.unwrap();

        let waiter = {
            let admitter = Arc::clone(&admitter);
            tokio::spawn(async move { admitter.admit().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Simulate a response arrival; the stale waiter must refuse the
        // credit and surface its wait.
        admitter.gate.notify_one();
        let err = waiter.await.unwrap().unwrap_err();
        match err {
            AdmitError::Expired { waited_us, .. } => assert!(waited_us > 128),
            other => panic!("expected expiration, got {other}"),
        }
        assert_eq!(admitter.balance(), 0);
        assert_eq!(admitter.queue_len(), 0);
    }

    #[tokio::test]
    async fn expiration_reposts_the_gate_for_live_waiters() {
        // 20ms expiry: roomy enough that only the deliberately stalled
        // waiter goes stale.
        let config = AdmissionConfig {
            slo_us: 25_000,
            escape_hatch_secs: 3600,
            ..Default::default()
        };
        let admitter = Admitter::new(&config);
        admitter.admit().await.unwrap();

        let stale = {
            let admitter = Arc::clone(&admitter);
            tokio::spawn(async move { admitter.admit().await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        admitter.absorb_grant(Some(1));
        assert!(stale.await.unwrap().is_err());
        // The re-posted wake-up lets a fresh request claim the credit.
        admitter.admit().await.unwrap();
        assert_eq!(admitter.balance(), 0);
    }

    #[tokio::test]
    async fn escape_hatch_unblocks_a_stalled_client() {
        let config = AdmissionConfig {
            use_client_time_expiration: false,
            escape_hatch_secs: 0,
            ..Default::default()
        };
        let admitter = Admitter::new(&config);
        admitter.admit().await.unwrap();
        // Balance may be exhausted; the hatch must still let this through.
        admitter.admit().await.unwrap();
        assert!(admitter.balance() > 1_000_000);
    }
}
