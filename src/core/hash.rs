//! Domain-Separated Hashing
//!
//! Provides the SHA-256 helpers used for:
//! - Configuration fingerprints exchanged in the connection request
//! - Session key derivation after the key exchange

use sha2::{Digest, Sha256};

/// Hash output type (256 bits / 32 bytes)
pub type Digest256 = [u8; 32];

/// Domain tag for configuration fingerprints.
pub const CONFIG_DOMAIN: &[u8] = b"NETSYNC_CONFIG_V1";

/// Domain tag for session key derivation.
pub const SESSION_KEY_DOMAIN: &[u8] = b"NETSYNC_SESSION_KEY_V1";

/// SHA-256 hasher seeded with a domain separator.
///
/// Order of updates is part of the output, so callers must feed fields in
/// a fixed order.
pub struct DomainHasher {
    hasher: Sha256,
}

impl DomainHasher {
    /// Create a new hasher with domain separator.
    pub fn new(domain: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(domain);
        Self { hasher }
    }

    /// Update with raw bytes.
    #[inline]
    pub fn update_bytes(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
    }

    /// Finalize and return the hash.
    pub fn finalize(self) -> Digest256 {
        self.hasher.finalize().into()
    }
}

/// Compute hash with domain separator.
pub fn hash_with_domain(domain: &[u8], data: &[u8]) -> Digest256 {
    let mut hasher = DomainHasher::new(domain);
    hasher.update_bytes(data);
    hasher.finalize()
}

/// Fold a digest down to its first 8 bytes (little-endian u64).
pub fn truncate_to_u64(digest: &Digest256) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}
