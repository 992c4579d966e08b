//! Content hashing for blob names and integrity checks.
//!
//! Everything here is SHA-256 rendered as lowercase hex. Two digests with
//! different jobs are built from it:
//!
//! - [`name_digest`] feeds the blob file name. It mixes in fresh random
//!   bytes, so two stores of the same file at the same instant still get
//!   different names. It is not a security boundary.
//! - [`content_digest`] covers a fixed-size sample of the content and is
//!   checked on every read.

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::crypto;

/// Bytes of content sampled for naming and integrity digests.
pub const SAMPLE_LEN: usize = 1024;

/// Hex characters of the name digest used in blob file names.
pub const NAME_DIGEST_LEN: usize = 12;

/// Random bytes mixed into every name digest.
const NAME_NONCE_LEN: usize = 16;

/// Hex SHA-256 digest of `bytes`.
#[must_use]
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// The first `min(len, 1 KiB)` bytes of `bytes`.
#[must_use]
pub fn sample(bytes: &[u8]) -> &[u8] {
    &bytes[..bytes.len().min(SAMPLE_LEN)]
}

/// Integrity digest over the content sample.
#[must_use]
pub fn content_digest(bytes: &[u8]) -> String {
    digest(sample(bytes))
}

/// File-name digest over a content sample, the size, a timestamp, and fresh
/// random bytes. Returns [`NAME_DIGEST_LEN`] hex characters.
#[must_use]
pub fn name_digest(content: &[u8], size: u64, timestamp_millis: i64) -> String {
    let mut nonce = [0u8; NAME_NONCE_LEN];
    crypto::fill_random(&mut nonce);

    let mut hasher = Sha256::new();
    hasher.update(sample(content));
    hasher.update(size.to_be_bytes());
    hasher.update(timestamp_millis.to_be_bytes());
    hasher.update(nonce);
    let mut hex = hex::encode(hasher.finalize());
    hex.truncate(NAME_DIGEST_LEN);
    hex
}

/// Compare two hex digests in constant time.
#[must_use]
pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.len() == actual.len() && bool::from(expected.as_bytes().ct_eq(actual.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_stable_hex() {
        let d = digest(b"abc");
        assert_eq!(
            d,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest(b"abc"), d);
    }

    #[test]
    fn digest_is_sensitive_to_every_byte() {
        let base = vec![7u8; 64];
        let reference = digest(&base);
        for i in 0..base.len() {
            let mut changed = base.clone();
            changed[i] ^= 0x01;
            assert_ne!(digest(&changed), reference, "byte {i} did not affect digest");
        }
    }

    #[test]
    fn sample_caps_at_one_kib() {
        assert_eq!(sample(&[1u8; 10]).len(), 10);
        assert_eq!(sample(&vec![1u8; 5000]).len(), SAMPLE_LEN);
        assert!(sample(&[]).is_empty());
    }

    #[test]
    fn content_digest_ignores_bytes_past_sample() {
        let mut a = vec![3u8; 4096];
        let b = a.clone();
        a[3000] = 9;
        assert_eq!(content_digest(&a), content_digest(&b));
        a[10] = 9;
        assert_ne!(content_digest(&a), content_digest(&b));
    }

    #[test]
    fn name_digest_is_short_and_unique() {
        let content = b"same content";
        let a = name_digest(content, 12, 1_700_000_000_000);
        let b = name_digest(content, 12, 1_700_000_000_000);
        assert_eq!(a.len(), NAME_DIGEST_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn digests_match_compares_exactly() {
        let d = digest(b"x");
        assert!(digests_match(&d, &d.clone()));
        assert!(!digests_match(&d, &digest(b"y")));
        assert!(!digests_match(&d, &d[..10]));
    }
}
