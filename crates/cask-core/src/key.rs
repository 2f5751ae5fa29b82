//! Digest-to-key codec.
//!
//! Keys name content by the first half of a sha512 digest: the remaining
//! 256 bits are treated as collision-free for practical purposes, and the
//! truncation keeps on-disk paths bounded.

/// Algorithm tag every key starts with.
pub const HASH_PREFIX: &str = "sha512-";
/// Raw byte width of the digests this store accepts.
pub const LEN_HASH: usize = 64;
/// Hex characters kept in a key: half of the digest's full hex rendering.
pub const LEN_HASH_KEY: usize = LEN_HASH;
/// Total length of a canonical key string.
pub const LEN_KEY: usize = HASH_PREFIX.len() + LEN_HASH_KEY;

/// Render a finished sha512 digest as a store key.
///
/// # Panics
///
/// Panics when `digest` is not exactly [`LEN_HASH`] bytes. Feeding any other
/// hash here is a programmer error, not a runtime condition.
#[must_use]
pub fn digest_to_key(digest: &[u8]) -> String {
    assert!(
        digest.len() == LEN_HASH,
        "bad digest width for key derivation: {} bytes",
        digest.len()
    );
    let hex = hex::encode(digest);
    format!("{HASH_PREFIX}{}", &hex[..LEN_HASH_KEY])
}

/// Truncate an over-long lookup string to canonical key length.
///
/// Anything past [`LEN_KEY`] cannot change which stored key is meant, so it
/// is dropped before resolution. Shorter input is returned unchanged.
#[must_use]
pub fn normalize(key: &str) -> &str {
    key.get(..LEN_KEY).unwrap_or(key)
}
