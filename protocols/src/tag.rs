//! Per-chunk authentication tag.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::error::ProtocolError;

pub const TAG_SIZE: usize = 16;

/// AEAD tag produced when a chunk is sealed and required before an inbound chunk
/// is considered ready.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AuthTag(pub [u8; TAG_SIZE]);

impl AuthTag {
    pub const ZERO: AuthTag = AuthTag([0u8; TAG_SIZE]);

    pub fn as_bytes(&self) -> &[u8; TAG_SIZE] {
        &self.0
    }

    /// Constant-time comparison
    pub fn ct_eq(&self, other: &AuthTag) -> bool {
        self.0[..].ct_eq(&other.0[..]).into()
    }

    /// Split into two words, used to store a tag in a pair of atomics.
    pub fn to_words(&self) -> (u64, u64) {
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&self.0[..8]);
        lo.copy_from_slice(&self.0[8..]);
        (u64::from_be_bytes(hi), u64::from_be_bytes(lo))
    }

    pub fn from_words(hi: u64, lo: u64) -> Self {
        let mut bytes = [0u8; TAG_SIZE];
        bytes[..8].copy_from_slice(&hi.to_be_bytes());
        bytes[8..].copy_from_slice(&lo.to_be_bytes());
        AuthTag(bytes)
    }
}

impl From<[u8; TAG_SIZE]> for AuthTag {
    fn from(bytes: [u8; TAG_SIZE]) -> Self {
        AuthTag(bytes)
    }
}

impl TryFrom<&[u8]> for AuthTag {
    type Error = ProtocolError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; TAG_SIZE] = value.try_into().map_err(|_| ProtocolError::Truncated {
            expected: TAG_SIZE,
            actual: value.len(),
        })?;
        Ok(AuthTag(bytes))
    }
}

impl std::fmt::Debug for AuthTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthTag(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}
