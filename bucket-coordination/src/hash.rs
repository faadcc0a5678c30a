use std::hash::Hasher;

use siphasher::sip::SipHasher13;

/// Process-independent 64-bit hash of a key.
///
/// `std`'s `DefaultHasher` is randomly seeded per process, so it cannot be used
/// for a mapping that every host (and the writer assigning items) must agree on.
pub fn stable_hash(key: &str) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0, 0);
    hasher.write(key.as_bytes());
    hasher.finish()
}

/// Jump consistent hash maps a key to one of `num_buckets` buckets.
///
/// Reference: Lamping & Veach, "A Fast, Minimal Memory, Consistent Hash Algorithm"
/// https://arxiv.org/abs/1406.2294
pub fn jump_consistent_hash(key: u64, num_buckets: u32) -> u32 {
    assert!(num_buckets > 0, "num_buckets must be positive");

    let mut k = key;
    let mut b: i64 = -1;
    let mut j: i64 = 0;

    while j < i64::from(num_buckets) {
        b = j;
        k = k.wrapping_mul(2862933555777941757).wrapping_add(1);
        j = ((b.wrapping_add(1) as f64) * (f64::from(1u32 << 31))
            / (((k >> 33).wrapping_add(1)) as f64)) as i64;
    }

    b as u32
}
