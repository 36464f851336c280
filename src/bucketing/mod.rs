//! Deterministic bucketing: randomization value → branch assignment
//!
//! Bucketing is a pure function of its string inputs. Identical inputs yield
//! identical assignments across processes, host OS versions, and machine
//! architectures, which is what makes enrollment reproducible after restarts
//! and app updates.
//!
//! ## Wire contract (version 1)
//!
//! The hash, the key layout, and the resolution below are part of the wire
//! contract shared with the server and with reproducibility tests. None of
//! them may change without bumping [`BUCKETING_VERSION`]:
//!
//! - hash: BLAKE3 of `"<salt>.<namespace>.<value>"`
//! - bucket: first 4 hash bytes as a big-endian `u32`, modulo the space size
//! - branch space: [`RESOLUTION`] = 10,000 buckets

use crate::catalog::{Branch, BucketConfig};
use crate::{Error, Result};

/// Version of the bucketing wire contract.
pub const BUCKETING_VERSION: u32 = 1;

/// Size of the branch-assignment bucket space.
///
/// Large enough that ratio granularity error is at most 0.01% per branch.
pub const RESOLUTION: u32 = 10_000;

/// Fixed salt mixed into every bucketing key.
const SALT: &str = "cohorte-bucketing-v1";

/// Hash a namespaced randomization value into `[0, total)`.
///
/// Returns `None` when `total` is zero (degenerate configuration).
#[must_use]
fn hash_bucket(namespace: &str, value: &str, total: u32) -> Option<u32> {
    if total == 0 {
        return None;
    }
    let mut hasher = blake3::Hasher::new();
    hasher.update(SALT.as_bytes());
    hasher.update(b".");
    hasher.update(namespace.as_bytes());
    hasher.update(b".");
    hasher.update(value.as_bytes());
    let digest = hasher.finalize();

    let mut prefix = [0u8; 4];
    prefix.copy_from_slice(&digest.as_bytes()[..4]);
    Some(u32::from_be_bytes(prefix) % total)
}

/// Assign a randomization value to a branch of an experiment.
///
/// Walks `branches` in order, accumulating ratios scaled to [`RESOLUTION`],
/// and picks the first branch whose cumulative share exceeds the hashed
/// fraction.
///
/// # Arguments
/// * `randomization_value` - the resolved randomization unit value
/// * `experiment_slug` - namespaces the hash so experiments assign independently
/// * `branches` - ordered branch list from the experiment
///
/// # Returns
/// The selected branch slug and the fraction in `[0, RESOLUTION)` it hashed to.
///
/// # Errors
/// * [`Error::EmptyRatios`] when the branch ratios sum to zero
/// * [`Error::OutOfBounds`] when the fraction cannot be mapped (unreachable
///   for well-formed inputs, kept as an invariant guard)
pub fn bucket(
    randomization_value: &str,
    experiment_slug: &str,
    branches: &[Branch],
) -> Result<(String, u32)> {
    let total_ratio: u64 = branches.iter().map(|b| u64::from(b.ratio)).sum();
    if total_ratio == 0 {
        return Err(Error::EmptyRatios(experiment_slug.to_string()));
    }

    let fraction = hash_bucket(experiment_slug, randomization_value, RESOLUTION)
        .ok_or_else(|| Error::OutOfBounds(experiment_slug.to_string()))?;

    let mut cumulative: u64 = 0;
    for branch in branches {
        cumulative += u64::from(branch.ratio);
        let threshold = cumulative * u64::from(RESOLUTION) / total_ratio;
        if u64::from(fraction) < threshold {
            return Ok((branch.slug.clone(), fraction));
        }
    }

    // The last threshold equals RESOLUTION, which every fraction is below.
    Err(Error::OutOfBounds(experiment_slug.to_string()))
}

/// Whether a randomization value falls inside an experiment's population
/// sampling window.
///
/// The window is hashed over the config namespace, independently of branch
/// assignment, so growing `count` only ever adds devices to the sample.
#[must_use]
pub fn is_in_sample(config: &BucketConfig, randomization_value: &str) -> bool {
    match hash_bucket(&config.namespace, randomization_value, config.total) {
        Some(bucket) => {
            bucket >= config.start && bucket < config.start.saturating_add(config.count)
        }
        None => false,
    }
}
