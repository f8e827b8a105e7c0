//! Keyed-hash integrity check for metric payloads.
//!
//! Agent and collector share a secret key. Each payload is authenticated by an
//! HMAC-SHA-256 over its canonical form `"{name}:{kind}:{value}"`, hex encoded.
//! Gauges are rendered with exactly 6 decimal digits in the canonical form,
//! independently of the 3-digit plain-text wire rendering. Changing either
//! rule breaks verification of payloads signed by existing agents.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::record::MetricRecord;
use super::value::MetricValue;

type HmacSha256 = Hmac<Sha256>;

/// Hex length of an HMAC-SHA-256 digest.
const HASH_HEX_LEN: usize = 64;

/// Pre-shared key used to sign and verify metric payloads.
#[derive(Clone, PartialEq, Eq)]
pub struct IntegrityKey(Vec<u8>);

impl IntegrityKey {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self(key.as_ref().to_vec())
    }

    /// Builds a key from an optional configured string. An empty string
    /// means unsigned mode, same as no key at all.
    pub fn from_config(key: Option<&str>) -> Option<Self> {
        key.filter(|k| !k.is_empty()).map(Self::new)
    }

    fn mac(&self) -> Option<HmacSha256> {
        // HMAC accepts keys of any length; this only fails for fixed-size MACs.
        HmacSha256::new_from_slice(&self.0).ok()
    }
}

impl std::fmt::Debug for IntegrityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("IntegrityKey(<redacted>)")
    }
}

/// Builds the canonical `"{name}:{kind}:{value}"` string.
pub fn canonical_string(name: &str, value: &MetricValue) -> String {
    format!("{}:{}:{}", name, value.kind(), value.canonical_text())
}

/// Computes the hex HMAC of `canonical`, or `None` in unsigned mode.
pub fn compute_hash(canonical: &str, key: Option<&IntegrityKey>) -> Option<String> {
    let mut mac = key?.mac()?;
    mac.update(canonical.as_bytes());
    Some(hex::encode(mac.finalize().into_bytes()))
}

/// Verifies the hash attached to `record` against its canonical form.
///
/// The hash must be exactly the lowercase hex text [`compute_hash`] produces;
/// missing, uppercase or truncated hashes fail. Comparison is constant-time.
pub fn verify_hash(record: &MetricRecord, key: &IntegrityKey) -> bool {
    verify_canonical(
        &canonical_string(&record.name, &record.value),
        record.hash.as_deref(),
        key,
    )
}

pub(crate) fn verify_canonical(canonical: &str, hash: Option<&str>, key: &IntegrityKey) -> bool {
    // Lowercase hex of a fixed length maps one-to-one onto the digest bytes,
    // so comparing decoded bytes equals comparing the text.
    let Some(expected) = hash
        .filter(|h| is_lowercase_hex(h, HASH_HEX_LEN))
        .and_then(|h| hex::decode(h).ok())
    else {
        return false;
    };
    let Some(mut mac) = key.mac() else {
        return false;
    };
    mac.update(canonical.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

fn is_lowercase_hex(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Returns a copy of `record` signed with `key` (or with the hash cleared in
/// unsigned mode).
pub fn sign(record: MetricRecord, key: Option<&IntegrityKey>) -> MetricRecord {
    let hash = compute_hash(&canonical_string(&record.name, &record.value), key);
    record.with_hash(hash)
}
