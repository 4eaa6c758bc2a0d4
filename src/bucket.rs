//! Deterministic bucketing
//!
//! **Problem**: A subject must land in the same bucket every time it is seen by
//! the same experiment, without storing any per-subject randomness.
//!
//! **Solution**: Hash `"{salt}:{key}"` with SHA-256 and keep the low 52 bits.
//! The salt is the experiment name, so different experiments produce
//! statistically independent streams for the same subject.
//!
//! The hash has no per-process seed, so results are stable across calls,
//! processes and platforms.

use sha2::{Digest, Sha256};

/// Number of significant bits kept from the digest
pub const HASH_BITS: u32 = 52;

const HASH_MASK: u64 = (1 << HASH_BITS) - 1;

#[allow(clippy::cast_precision_loss)]
const HASH_SPAN: f64 = (1_u64 << HASH_BITS) as f64;

/// Salted pseudo-random stream for one experiment
///
/// # Examples
///
/// ```rust
/// use trueno_ab::bucket::Bucket;
///
/// let bucket = Bucket::new("checkout-button");
/// let n = bucket.lucky_number("user-42");
/// assert!((0.0..1.0).contains(&n));
/// assert_eq!(n, Bucket::new("checkout-button").lucky_number("user-42"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    salt: String,
}

impl Bucket {
    /// Create a bucket salted with `salt` (usually the experiment name)
    #[must_use]
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// Get the salt.
    #[must_use]
    pub fn salt(&self) -> &str {
        &self.salt
    }

    /// 52-bit hash of `key` under this bucket's salt
    #[must_use]
    pub fn hash(&self, key: &str) -> u64 {
        hash(&self.salt, key)
    }

    /// Uniform value in `[0, 1)`
    #[must_use]
    pub fn lucky_number(&self, key: &str) -> f64 {
        lucky_number(self.hash(key))
    }

    /// Uniform value in `[min, max]`
    #[must_use]
    pub fn random_double(&self, key: &str, min: f64, max: f64) -> f64 {
        (max - min).mul_add(self.lucky_number(key), min)
    }

    /// Uniform integer in `[min, max]` (bounds are swapped if reversed)
    #[must_use]
    pub fn random_int(&self, key: &str, min: i64, max: i64) -> i64 {
        let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
        let span = i128::from(hi) - i128::from(lo) + 1;
        let offset = i128::from(self.hash(key)) % span;
        // lo + offset never exceeds hi, so it always fits back into i64
        i64::try_from(i128::from(lo) + offset).unwrap_or(hi)
    }

    /// True with probability `percent` (inclusive at the boundary)
    #[must_use]
    pub fn bernoulli_trial(&self, percent: f64, key: &str) -> bool {
        self.lucky_number(key) <= percent
    }

    /// Pick one element; `None` when `choices` is empty
    #[must_use]
    pub fn uniform_choice<'a, T>(&self, choices: &'a [T], key: &str) -> Option<&'a T> {
        if choices.is_empty() {
            return None;
        }
        let len = choices.len() as u64;
        let idx = usize::try_from(self.hash(key) % len).ok()?;
        choices.get(idx)
    }
}

/// 52-bit SHA-256 hash of `"{salt}:{key}"`
#[must_use]
pub fn hash(salt: &str, key: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(b":");
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();

    let mut tail = [0_u8; 8];
    tail.copy_from_slice(&digest[digest.len() - 8..]);
    u64::from_be_bytes(tail) & HASH_MASK
}

/// Map a 52-bit hash into `[0, 1)`
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn lucky_number(hash: u64) -> f64 {
    (hash & HASH_MASK) as f64 / HASH_SPAN
}
