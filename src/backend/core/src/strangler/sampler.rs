//! Traffic split sampling.

use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU8, Ordering};

/// Source of percentile draws in `0..100` for dual-mode routing.
pub trait TrafficSampler: Send + Sync {
    fn sample(&self) -> u8;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSampler;

impl TrafficSampler for RandomSampler {
    fn sample(&self) -> u8 {
        rand::thread_rng().gen_range(0..100)
    }
}

/// Always returns the same percentile; for tests and forced rollouts.
#[derive(Debug)]
pub struct FixedSampler(AtomicU8);

impl FixedSampler {
    pub fn new(percentile: u8) -> Self {
        Self(AtomicU8::new(percentile.min(99)))
    }

    pub fn set(&self, percentile: u8) {
        self.0.store(percentile.min(99), Ordering::Relaxed);
    }
}

impl TrafficSampler for FixedSampler {
    fn sample(&self) -> u8 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Stable percentile for a user on a route.
pub fn sticky_bucket(route: &str, user_id: &str) -> u8 {
    let mut hasher = Sha256::new();
    hasher.update(route.as_bytes());
    hasher.update(b":");
    hasher.update(user_id.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % 100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sticky_bucket_is_stable_and_in_range() {
        let a = sticky_bucket("checkout", "user-42");
        assert_eq!(a, sticky_bucket("checkout", "user-42"));
        assert!(a < 100);
        for i in 0..200 {
            assert!(sticky_bucket("checkout", &format!("u{}", i)) < 100);
        }
    }

    #[test]
    fn test_random_sampler_range() {
        let sampler = RandomSampler;
        assert!((0..500).all(|_| sampler.sample() < 100));
    }
}
