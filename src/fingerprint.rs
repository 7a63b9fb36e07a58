//! Stable, non-reversible key identifiers for tracing output.

use sha2::{Digest, Sha256};

/// Number of hex characters kept from the digest.
const FINGERPRINT_LEN: usize = 12;

/// Compute a short SHA-256 fingerprint of a license key.
///
/// Tracing fields carry this instead of the raw key so that side-channel
/// logs never hold usable credentials.
pub fn key_fingerprint(key: &str) -> String {
    let hash = Sha256::digest(key.as_bytes());
    let mut encoded = hex::encode(hash);
    encoded.truncate(FINGERPRINT_LEN);
    encoded
}
