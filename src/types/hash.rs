use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A 32-byte merkle/content hash. `from_bytes` stands in for the spec's
/// external merkle-hash primitive (out of scope per spec.md §1); only the
/// capability (hash arbitrary bytes deterministically) is needed here.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug, Default)]
pub struct Hash([u8; 32]);

impl Hash {
    pub fn zero() -> Self {
        Self([0u8; 32])
    }

    /// The merkle hash of the empty byte string — used as the `current_hash`
    /// of an empty (dummy) proposal.
    pub fn empty() -> Self {
        Self::from_bytes(&[])
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut array = [0u8; 32];
        array.copy_from_slice(&digest[..32]);
        Self(array)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::empty()
    }
}

impl std::fmt::Display for Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(Hash::from_bytes(b"abc"), Hash::from_bytes(b"abc"));
        assert_ne!(Hash::from_bytes(b"abc"), Hash::from_bytes(b"abd"));
    }

    #[test]
    fn empty_is_hash_of_empty_string() {
        assert_eq!(Hash::empty(), Hash::from_bytes(&[]));
    }
}
