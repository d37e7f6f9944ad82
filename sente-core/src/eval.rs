use crate::result::Netresult;
use std::time::{Duration, Instant};

/// The seam to the actual network forward pass.
///
/// `features` is the bit-packed input-plane frame (one byte per plane
/// element). `selfcheck` requests the diagnostic evaluation path; it is
/// honored by implementations that have one and ignored otherwise.
pub trait Evaluator: Send + Sync {
    fn forward(&self, features: &[u8], selfcheck: bool) -> Netresult;
}

/// Evaluator that returns a precomputed pseudo-random result after a
/// configurable artificial delay. Used for testing the dispatch and cache
/// layers without loading any weights.
pub struct DummyEvaluator {
    artificial_delay: Duration,
    canned: Netresult,
}

impl DummyEvaluator {
    pub fn new(artificial_delay: Duration) -> Self {
        Self::with_seed(artificial_delay, fastrand::u64(..))
    }

    pub fn with_seed(artificial_delay: Duration, seed: u64) -> Self {
        let mut rng = fastrand::Rng::with_seed(seed);

        let mut canned = Netresult::default();
        let mut sum = 0.0f32;
        for v in canned.policy.iter_mut() {
            *v = rng.f32();
            sum += *v;
        }
        for v in canned.policy.iter_mut() {
            *v /= sum;
        }
        canned.policy_pass = rng.f32() * 0.01;
        canned.winrate = rng.f32() * 2.0 - 1.0;

        DummyEvaluator {
            artificial_delay,
            canned,
        }
    }
}

impl Evaluator for DummyEvaluator {
    fn forward(&self, _features: &[u8], _selfcheck: bool) -> Netresult {
        if !self.artificial_delay.is_zero() {
            // thread::sleep only guarantees a minimum duration; spinning
            // keeps the simulated latency accurate.
            let start = Instant::now();
            while start.elapsed() < self.artificial_delay {
                std::hint::spin_loop();
            }
        }

        self.canned.clone()
    }
}
