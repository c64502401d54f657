//! Simulated packet loss for outgoing datagrams
//!
//! Used to exercise convergence on a lossy link without real radios.

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How drops are chosen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DropPolicy {
    /// Each packet is dropped independently with probability `drop_rate`
    #[default]
    Probabilistic,
    /// Drops are spread evenly so the observed rate tracks `drop_rate`
    Deterministic,
}

#[derive(Debug, Default)]
struct Counters {
    sent: u64,
    dropped: u64,
}

/// Decides which outgoing packets are dropped
#[derive(Debug)]
pub struct PacketScheduler {
    drop_rate: f64,
    policy: DropPolicy,
    counters: Mutex<Counters>,
}

impl PacketScheduler {
    pub fn new(drop_rate: f64, policy: DropPolicy) -> Self {
        Self {
            drop_rate: drop_rate.clamp(0.0, 1.0),
            policy,
            counters: Mutex::new(Counters::default()),
        }
    }

    /// A scheduler that never drops
    pub fn disabled() -> Self {
        Self::new(0.0, DropPolicy::Probabilistic)
    }

    /// Returns true if the next packet should go out
    pub fn add(&self) -> bool {
        let mut counters = self.counters.lock();

        let drop = if self.drop_rate <= 0.0 {
            false
        } else if self.drop_rate >= 1.0 {
            true
        } else {
            match self.policy {
                DropPolicy::Probabilistic => rand::thread_rng().gen_bool(self.drop_rate),
                DropPolicy::Deterministic => {
                    let total = counters.sent + counters.dropped + 1;
                    (counters.dropped as f64) < self.drop_rate * total as f64
                }
            }
        };

        if drop {
            counters.dropped += 1;
        } else {
            counters.sent += 1;
        }
        !drop
    }

    pub fn sent(&self) -> u64 {
        self.counters.lock().sent
    }

    pub fn dropped(&self) -> u64 {
        self.counters.lock().dropped
    }

    pub fn reset(&self) {
        *self.counters.lock() = Counters::default();
    }
}
