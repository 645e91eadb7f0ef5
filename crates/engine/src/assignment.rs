//! Stable pseudo-random assignment.
//!
//! Split branches and A/B variants are derived from a SHA-256 hash of
//! `(execution_id, node_id)` instead of a fresh draw, so a retried tick for
//! the same execution always lands on the same branch.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Maps `(execution_id, node_id)` to a fraction in `[0, 1)`.
pub fn stable_fraction(execution_id: Uuid, node_id: &str) -> f64 {
    let mut hasher = Sha256::new();
    hasher.update(execution_id.as_bytes());
    hasher.update(b":");
    hasher.update(node_id.as_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    // Top 53 bits fill an f64 mantissa exactly.
    (u64::from_be_bytes(head) >> 11) as f64 / (1u64 << 53) as f64
}

/// Same as [`stable_fraction`], scaled to `[0, 100)`.
pub fn stable_percent(execution_id: Uuid, node_id: &str) -> f64 {
    stable_fraction(execution_id, node_id) * 100.0
}

/// Picks an index from `weights` (need not be normalized) using `roll` in `[0, 1)`.
pub fn weighted_pick(weights: &[f64], roll: f64) -> Option<usize> {
    let total: f64 = weights.iter().filter(|w| **w > 0.0).sum();
    if weights.is_empty() {
        return None;
    }
    if total <= 0.0 {
        return Some(((roll * weights.len() as f64) as usize).min(weights.len() - 1));
    }

    let target = roll * total;
    let mut cumulative = 0.0;
    let mut last_positive = 0;
    for (i, weight) in weights.iter().enumerate() {
        if *weight <= 0.0 {
            continue;
        }
        cumulative += weight;
        last_positive = i;
        if target < cumulative {
            return Some(i);
        }
    }
    Some(last_positive)
}
