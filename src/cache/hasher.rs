//! Key Hashers
//!
//! A hasher turns an opaque key into the 64-bit hash used for bucket
//! selection. Bucket selection uses the *top* bits of the hash, so every
//! hasher is built on a fixed-seed [`ahash::RandomState`], whose output is
//! mixed across all 64 bits. Zero is the hash a cleared slot carries and is
//! never returned.

use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::OnceLock;

use ahash::RandomState;

/// Hash capability of a cache instance
///
/// Hashers are stateless; they are type parameters of a cache, not values.
pub trait KeyHasher: Send + Sync + 'static {
    /// Short name used in logs and events
    const NAME: &'static str;

    /// Deterministic 64-bit hash of `key`
    fn hash_key(key: &[u8]) -> u64;

    /// Key equality consistent with `hash_key`
    fn same_key(a: &[u8], b: &[u8]) -> bool {
        a == b
    }
}

/// Hash carried by cleared slots
const EMPTY_HASH: u64 = 0;

/// Process-wide hash state with fixed seeds
fn hash_state() -> &'static RandomState {
    static STATE: OnceLock<RandomState> = OnceLock::new();
    STATE.get_or_init(|| {
        RandomState::with_seeds(
            0x243f_6a88_85a3_08d3,
            0x1319_8a2e_0370_7344,
            0xa409_3822_299f_31d0,
            0x082e_fa98_ec4e_6c89,
        )
    })
}

/// Remap the reserved empty hash
#[inline]
fn non_empty(hash: u64) -> u64 {
    if hash == EMPTY_HASH {
        1
    } else {
        hash
    }
}

// =============================================================================
// BinaryKeyHasher
// =============================================================================

/// Hashes the raw key bytes with aHash
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryKeyHasher;

impl KeyHasher for BinaryKeyHasher {
    const NAME: &'static str = "binary";

    #[inline]
    fn hash_key(key: &[u8]) -> u64 {
        non_empty(hash_state().hash_one(key))
    }
}

// =============================================================================
// StructuredKeyHasher
// =============================================================================

/// Hashes keys made of length-prefixed components
///
/// Each component is encoded as a little-endian `u32` length followed by
/// that many bytes. Components are fed in order through one aHash
/// hasher. Trailing bytes that do not form a complete component are hashed
/// as one final component.
#[derive(Debug, Clone, Copy, Default)]
pub struct StructuredKeyHasher;

impl StructuredKeyHasher {
    /// Encode components into the structured key layout
    pub fn encode<C: AsRef<[u8]>>(components: &[C]) -> Vec<u8> {
        let total: usize = components.iter().map(|c| 4 + c.as_ref().len()).sum();
        let mut out = Vec::with_capacity(total);
        for component in components {
            let bytes = component.as_ref();
            out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        out
    }

    /// Split an encoded key into its components
    pub fn components(key: &[u8]) -> Vec<&[u8]> {
        let mut parts = Vec::new();
        let mut rest = key;
        while rest.len() >= 4 {
            let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            if rest.len() - 4 < len {
                break;
            }
            parts.push(&rest[4..4 + len]);
            rest = &rest[4 + len..];
        }
        if !rest.is_empty() {
            parts.push(rest);
        }
        parts
    }
}

impl KeyHasher for StructuredKeyHasher {
    const NAME: &'static str = "structured";

    fn hash_key(key: &[u8]) -> u64 {
        let mut hasher = hash_state().build_hasher();
        // slice hashing writes the length first, so boundaries matter
        for component in Self::components(key) {
            component.hash(&mut hasher);
        }
        non_empty(hasher.finish())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_hash_deterministic() {
        assert_eq!(
            BinaryKeyHasher::hash_key(b"hello"),
            BinaryKeyHasher::hash_key(b"hello")
        );
        assert_ne!(
            BinaryKeyHasher::hash_key(b"hello"),
            BinaryKeyHasher::hash_key(b"hellp")
        );
        assert_ne!(BinaryKeyHasher::hash_key(b""), BinaryKeyHasher::hash_key(b"\0"));
    }

    #[test]
    fn test_binary_hash_spreads_top_bits() {
        // sequential keys must not all land in the same top-8-bit bucket
        let mut buckets = std::collections::HashSet::new();
        for i in 0u32..1000 {
            buckets.insert(BinaryKeyHasher::hash_key(&i.to_le_bytes()) >> 56);
        }
        assert!(buckets.len() > 200);
    }

    #[test]
    fn test_hashes_never_empty() {
        assert_eq!(non_empty(EMPTY_HASH), 1);
        assert_eq!(non_empty(42), 42);
        for i in 0u32..10_000 {
            assert_ne!(BinaryKeyHasher::hash_key(&i.to_le_bytes()), EMPTY_HASH);
        }
        assert_ne!(StructuredKeyHasher::hash_key(b""), EMPTY_HASH);
    }

    #[test]
    fn test_structured_hash_deterministic() {
        let key = StructuredKeyHasher::encode(&["users", "42"]);
        assert_eq!(
            StructuredKeyHasher::hash_key(&key),
            StructuredKeyHasher::hash_key(&key.clone())
        );
        let other = StructuredKeyHasher::encode(&["users", "43"]);
        assert_ne!(
            StructuredKeyHasher::hash_key(&key),
            StructuredKeyHasher::hash_key(&other)
        );
    }

    #[test]
    fn test_structured_encode_roundtrip() {
        let key = StructuredKeyHasher::encode(&[b"collection".as_slice(), b"doc-1".as_slice()]);
        let parts = StructuredKeyHasher::components(&key);
        assert_eq!(parts, vec![b"collection".as_slice(), b"doc-1".as_slice()]);
    }

    #[test]
    fn test_structured_component_boundaries_matter() {
        let a = StructuredKeyHasher::encode(&["ab", "c"]);
        let b = StructuredKeyHasher::encode(&["a", "bc"]);
        assert_ne!(
            StructuredKeyHasher::hash_key(&a),
            StructuredKeyHasher::hash_key(&b)
        );
    }

    #[test]
    fn test_structured_trailing_bytes() {
        let mut key = StructuredKeyHasher::encode(&["abc"]);
        key.extend_from_slice(b"xy");
        let parts = StructuredKeyHasher::components(&key);
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1], b"xy");
    }
}
