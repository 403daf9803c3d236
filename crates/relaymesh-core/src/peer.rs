//! Peer identities and unordered pair keys.
//!
//! A [`PeerId`] is the canonical 32-byte Ed25519 public key of a node. The
//! byte order gives peers a stable total order, which [`PairKey`] uses to
//! build one key per unordered pair of peers.

use crate::error::{Error, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Length of a serialized peer identity
pub const PEER_ID_LEN: usize = 32;

/// Node identity derived from an Ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Decode and validate a peer identity from raw public-key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPublicKey`] if the input is empty, has the
    /// wrong length or is not a valid Ed25519 point.
    pub fn from_public_key(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; PEER_ID_LEN] = bytes.try_into().map_err(|_| {
            Error::InvalidPublicKey(
                format!("expected {} bytes, got {}", PEER_ID_LEN, bytes.len()).into(),
            )
        })?;

        VerifyingKey::from_bytes(&raw)
            .map_err(|e| Error::InvalidPublicKey(e.to_string().into()))?;

        Ok(Self(raw))
    }

    /// Identity of the given verifying key
    #[must_use]
    pub fn from_verifying_key(key: &VerifyingKey) -> Self {
        Self(key.to_bytes())
    }

    /// Generate a fresh identity backed by a new random key pair
    #[must_use]
    pub fn random() -> Self {
        let signing = SigningKey::generate(&mut rand_core::OsRng);
        Self::from_verifying_key(&signing.verifying_key())
    }

    /// Raw public-key bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }

    /// Short prefix used in log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidPublicKey(e.to_string().into()))?;
        Self::from_public_key(&bytes)
    }
}

impl From<VerifyingKey> for PeerId {
    fn from(key: VerifyingKey) -> Self {
        Self::from_verifying_key(&key)
    }
}

/// Key of an unordered pair of distinct peers.
///
/// `PairKey::new(a, b) == PairKey::new(b, a)`; the larger identity is always
/// stored as `id_a`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PairKey {
    id_a: PeerId,
    id_b: PeerId,
}

impl PairKey {
    /// Build the key for `a` and `b`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Loopback`] if both identities are equal.
    pub fn new(a: PeerId, b: PeerId) -> Result<Self> {
        match a.cmp(&b) {
            Ordering::Equal => Err(Error::Loopback(a)),
            Ordering::Greater => Ok(Self { id_a: a, id_b: b }),
            Ordering::Less => Ok(Self { id_a: b, id_b: a }),
        }
    }

    /// The larger of the two identities
    #[must_use]
    pub fn id_a(&self) -> PeerId {
        self.id_a
    }

    /// The smaller of the two identities
    #[must_use]
    pub fn id_b(&self) -> PeerId {
        self.id_b
    }

    /// Whether `peer` is one end of the pair
    #[must_use]
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.id_a == *peer || self.id_b == *peer
    }

    /// The end of the pair that is not `peer`
    #[must_use]
    pub fn other(&self, peer: &PeerId) -> Option<PeerId> {
        if self.id_a == *peer {
            Some(self.id_b)
        } else if self.id_b == *peer {
            Some(self.id_a)
        } else {
            None
        }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.id_a, self.id_b)
    }
}

impl fmt::Debug for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PairKey({} <-> {})", self.id_a.short(), self.id_b.short())
    }
}

impl TryFrom<(PeerId, PeerId)> for PairKey {
    type Error = Error;

    fn try_from((a, b): (PeerId, PeerId)) -> Result<Self> {
        Self::new(a, b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_roundtrip_hex() {
        let peer = PeerId::random();
        let parsed: PeerId = peer.to_string().parse().unwrap();
        assert_eq!(peer, parsed);
    }

    #[test]
    fn test_peer_id_rejects_wrong_length() {
        assert!(matches!(
            PeerId::from_public_key(&[]),
            Err(Error::InvalidPublicKey(_))
        ));
        assert!(PeerId::from_public_key(&[1u8; 31]).is_err());
        assert!(PeerId::from_public_key(&[1u8; 33]).is_err());
    }

    #[test]
    fn test_peer_id_rejects_garbage_hex() {
        assert!("not-hex".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_pair_key_symmetric() {
        let a = PeerId::random();
        let b = PeerId::random();

        let ab = PairKey::new(a, b).unwrap();
        let ba = PairKey::new(b, a).unwrap();

        assert_eq!(ab, ba);
        assert_eq!(ab.to_string(), ba.to_string());
        assert!(ab.id_a() > ab.id_b());
    }

    #[test]
    fn test_pair_key_loopback() {
        let a = PeerId::random();
        assert!(matches!(PairKey::new(a, a), Err(Error::Loopback(p)) if p == a));
    }

    #[test]
    fn test_pair_key_other() {
        let a = PeerId::random();
        let b = PeerId::random();
        let c = PeerId::random();
        let key = PairKey::new(a, b).unwrap();

        assert_eq!(key.other(&a), Some(b));
        assert_eq!(key.other(&b), Some(a));
        assert_eq!(key.other(&c), None);
        assert!(key.contains(&a));
        assert!(!key.contains(&c));
    }

    #[test]
    fn test_pair_key_display() {
        let a = PeerId::random();
        let b = PeerId::random();
        let key = PairKey::new(a, b).unwrap();
        assert_eq!(
            key.to_string(),
            format!("{} <-> {}", key.id_a(), key.id_b())
        );
    }
}
