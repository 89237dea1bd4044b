//! Key material and the per-hop relay messages
//!
//! Relaying works by XOR combination: every hop returns the material it was
//! handed XOR-ed with fresh key from its own link, so the output of the last
//! hop is the end-to-end key. Material is opaque to the controller; `Debug`
//! never prints it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::{LinkId, SiteId};

/// Opaque key bytes
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial(Vec<u8>);

impl KeyMaterial {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// All-zero material, the identity for [`KeyMaterial::xor_with`]
    pub fn zeroed(len: usize) -> Self {
        Self(vec![0; len])
    }

    /// Number of bytes needed to hold `bits` bits of key
    pub fn bytes_for_bits(bits: u64) -> usize {
        bits.div_ceil(8) as usize
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Combine another piece of material into this one
    ///
    /// The result is as long as the longer input.
    pub fn xor_with(&mut self, other: &KeyMaterial) {
        if other.0.len() > self.0.len() {
            self.0.resize(other.0.len(), 0);
        }
        for (byte, rhs) in self.0.iter_mut().zip(other.0.iter()) {
            *byte ^= rhs;
        }
    }

    /// Short, non-reversible identifier for logs
    pub fn fingerprint(&self) -> String {
        let digest = blake3::hash(&self.0);
        hex::encode(&digest.as_bytes()[..8])
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({} bytes, {})", self.0.len(), self.fingerprint())
    }
}

/// Local reservation held by a site agent on one of its link pools
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationToken {
    pub id: Uuid,
    pub site: SiteId,
    pub link: LinkId,
    pub amount: u64,
    pub expires_at: DateTime<Utc>,
}

/// One hop of a relay: the upstream site draws key from `link` and
/// combines it with the material produced by the previous hop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopCommand {
    /// Position of this hop along the path, starting at 0
    pub index: usize,
    pub from: SiteId,
    pub to: SiteId,
    pub link: LinkId,
    /// Bits of key to draw
    pub amount: u64,
    /// Local reservation to consume, if one was taken
    pub token: Option<Uuid>,
    /// Output of the previous hop; `None` for the first hop
    pub upstream: Option<KeyMaterial>,
}

/// Acknowledgement of a committed hop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HopAck {
    pub index: usize,
    pub material: KeyMaterial,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xor_is_self_inverse() {
        let original = KeyMaterial::from_bytes(vec![0xde, 0xad, 0xbe, 0xef]);
        let pad = KeyMaterial::from_bytes(vec![0x12, 0x34, 0x56, 0x78]);

        let mut combined = original.clone();
        combined.xor_with(&pad);
        assert_ne!(combined, original);

        combined.xor_with(&pad);
        assert_eq!(combined, original);
    }

    #[test]
    fn test_xor_extends_shorter_material() {
        let mut short = KeyMaterial::from_bytes(vec![0xff]);
        short.xor_with(&KeyMaterial::from_bytes(vec![0x0f, 0xaa]));
        assert_eq!(short.as_bytes(), &[0xf0, 0xaa]);
    }

    #[test]
    fn test_bytes_for_bits_rounds_up() {
        assert_eq!(KeyMaterial::bytes_for_bits(0), 0);
        assert_eq!(KeyMaterial::bytes_for_bits(1), 1);
        assert_eq!(KeyMaterial::bytes_for_bits(8), 1);
        assert_eq!(KeyMaterial::bytes_for_bits(9), 2);
    }

    #[test]
    fn test_debug_does_not_leak_bytes() {
        let key = KeyMaterial::from_bytes(vec![0x42; 16]);
        let debug = format!("{:?}", key);
        assert!(debug.contains("16 bytes"));
        assert!(!debug.contains("[66, 66"));
        assert_eq!(key.fingerprint().len(), 16);
    }
}
