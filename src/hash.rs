use xxhash_rust::xxh3::xxh3_64_with_seed;

/// Hash a key with the database's seed.
#[inline]
pub(crate) fn hash_key(seed: u64, key: &[u8]) -> u64 {
    xxh3_64_with_seed(key, seed)
}

/// Fresh per-database seed so that chain distribution differs between files.
pub(crate) fn random_seed() -> u64 {
    rand::random()
}
