//! Core types for threshold signing sessions

use crate::{Error, Result};
use k256::{
    ecdsa::{self, signature::hazmat::PrehashVerifier, VerifyingKey},
    elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint},
    AffinePoint, EncodedPoint, FieldBytes, ProjectivePoint,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Digest to be signed
pub type Digest = [u8; 32];

/// Identifier of one group member.
///
/// Identifiers are opaque byte strings. Two identifiers are equal only when
/// their bytes are equal, and they order byte-wise (lexicographically); no
/// numeric normalization happens, so `[0x00, 0x01]` and `[0x01]` are
/// distinct members.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(Vec<u8>);

impl MemberId {
    /// Create an identifier from raw bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Minimal big-endian encoding, the same bytes a big-integer identifier has.
impl From<u64> for MemberId {
    fn from(value: u64) -> Self {
        let bytes = value.to_be_bytes();
        let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
        Self(bytes[first..].to_vec())
    }
}

impl From<&[u8]> for MemberId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId({})", hex::encode(&self.0))
    }
}

/// The fixed participant set of one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMembers {
    /// Members sorted by identifier
    members: Vec<MemberId>,
    /// Number of shares needed to sign
    threshold: usize,
}

impl GroupMembers {
    /// Create a group. Members are sorted so every participant derives the
    /// same evaluation indices regardless of the order it learned them in.
    pub fn new(mut members: Vec<MemberId>, threshold: usize) -> Result<Self> {
        if members.is_empty() {
            return Err(Error::InvalidConfig("Group must have at least one member".into()));
        }
        if threshold == 0 {
            return Err(Error::InvalidConfig("Threshold must be at least 1".into()));
        }
        if threshold > members.len() {
            return Err(Error::InvalidConfig(format!(
                "Threshold {} cannot exceed number of members {}",
                threshold,
                members.len()
            )));
        }

        members.sort();
        if let Some(pair) = members.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(Error::InvalidConfig(format!("Duplicate member {}", pair[0])));
        }

        Ok(Self { members, threshold })
    }

    /// Members in canonical order
    pub fn members(&self) -> &[MemberId] {
        &self.members
    }

    /// Signing threshold
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Number of members
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false for a constructed group
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Check if the group has a given member
    pub fn contains(&self, id: &MemberId) -> bool {
        self.members.binary_search(id).is_ok()
    }

    /// 1-based evaluation index of a member
    pub fn index_of(&self, id: &MemberId) -> Option<u64> {
        self.members
            .binary_search(id)
            .ok()
            .map(|position| position as u64 + 1)
    }

    /// Iterate over every member except `me`
    pub fn others<'a>(&'a self, me: &'a MemberId) -> impl Iterator<Item = &'a MemberId> + 'a {
        self.members.iter().filter(move |id| *id != me)
    }
}

/// One unit of the threshold protocol wire format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolMessage {
    /// Author of the message
    pub from: MemberId,
    /// Explicit recipients; empty means broadcast
    pub to: Vec<MemberId>,
    /// Protocol round the payload belongs to
    pub round: u32,
    /// Encoded round message
    pub payload: Vec<u8>,
}

impl ProtocolMessage {
    /// Message for every member except the sender
    pub fn broadcast(from: MemberId, round: u32, payload: Vec<u8>) -> Self {
        Self {
            from,
            to: Vec::new(),
            round,
            payload,
        }
    }

    /// Message for an explicit set of members
    pub fn direct(from: MemberId, to: Vec<MemberId>, round: u32, payload: Vec<u8>) -> Self {
        Self {
            from,
            to,
            round,
            payload,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_empty()
    }

    /// Whether `id` is a legitimate recipient. The sender never is.
    pub fn is_addressed_to(&self, id: &MemberId) -> bool {
        if &self.from == id {
            return false;
        }
        self.is_broadcast() || self.to.contains(id)
    }
}

/// Group public key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(AffinePoint);

impl PublicKey {
    /// Wrap a curve point; the identity is rejected
    pub fn from_point(point: ProjectivePoint) -> Result<Self> {
        if point == ProjectivePoint::IDENTITY {
            return Err(Error::Protocol("Public key is the identity point".into()));
        }
        Ok(Self(point.to_affine()))
    }

    /// Parse the 64-byte `x || y` form used for chain submissions
    pub fn from_uncompressed_xy(bytes: &[u8; 64]) -> Result<Self> {
        let encoded = EncodedPoint::from_affine_coordinates(
            FieldBytes::from_slice(&bytes[..32]),
            FieldBytes::from_slice(&bytes[32..]),
            false,
        );
        let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
            .ok_or_else(|| Error::Deserialization("Public key is not on the curve".into()))?;
        Self::from_point(ProjectivePoint::from(affine))
    }

    pub fn as_affine(&self) -> &AffinePoint {
        &self.0
    }

    /// Uncompressed coordinates without the SEC1 tag byte
    pub fn to_uncompressed_xy(&self) -> [u8; 64] {
        let encoded = self.0.to_encoded_point(false);
        let mut out = [0u8; 64];
        out.copy_from_slice(&encoded.as_bytes()[1..]);
        out
    }

    /// Compressed SEC1 encoding
    pub fn to_sec1_compressed(&self) -> Vec<u8> {
        self.0.to_encoded_point(true).as_bytes().to_vec()
    }

    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_affine(self.0).map_err(|e| Error::Protocol(e.to_string()))
    }
}

/// ECDSA signature (r, s)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// R component, big-endian
    pub r: [u8; 32],
    /// S component, big-endian
    pub s: [u8; 32],
    /// Recovery ID (0 or 1)
    pub recovery_id: u8,
}

impl Signature {
    /// Create a new signature
    pub fn new(r: [u8; 32], s: [u8; 32], recovery_id: u8) -> Self {
        Self { r, s, recovery_id }
    }

    /// Convert to bytes (r || s)
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..].copy_from_slice(&self.s);
        bytes
    }

    pub fn to_k256(&self) -> Result<ecdsa::Signature> {
        ecdsa::Signature::from_scalars(
            *FieldBytes::from_slice(&self.r),
            *FieldBytes::from_slice(&self.s),
        )
        .map_err(|_| Error::InvalidSignature)
    }

    /// Convert to DER format
    pub fn to_der(&self) -> Result<Vec<u8>> {
        Ok(self.to_k256()?.to_der().as_bytes().to_vec())
    }

    /// Verify against a public key and the signed digest
    pub fn verify(&self, public_key: &PublicKey, digest: &Digest) -> Result<()> {
        let signature = self.to_k256()?;
        public_key
            .verifying_key()?
            .verify_prehash(digest, &signature)
            .map_err(|_| Error::InvalidSignature)
    }
}

/// Protocol parameters shared by keygen and signing sessions
#[derive(Debug, Clone)]
pub struct Parameters {
    /// How long a party waits for one round's messages
    pub round_timeout: Duration,
}

impl Parameters {
    pub fn with_round_timeout(mut self, round_timeout: Duration) -> Self {
        self.round_timeout = round_timeout;
        self
    }
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[u64]) -> Vec<MemberId> {
        values.iter().copied().map(MemberId::from).collect()
    }

    #[test]
    fn test_member_id_from_integer() {
        assert_eq!(MemberId::from(100u64).as_bytes(), &[0x64]);
        assert_eq!(MemberId::from(0x0102u64).as_bytes(), &[0x01, 0x02]);
        assert_ne!(MemberId::new(vec![0x00, 0x01]), MemberId::new(vec![0x01]));
        assert_eq!(MemberId::from(258u64).to_string(), "0102");
    }

    #[test]
    fn test_group_is_sorted_and_indexed() {
        let group = GroupMembers::new(ids(&[103, 101, 102]), 2).unwrap();

        assert_eq!(group.members(), ids(&[101, 102, 103]).as_slice());
        assert_eq!(group.index_of(&MemberId::from(101u64)), Some(1));
        assert_eq!(group.index_of(&MemberId::from(103u64)), Some(3));
        assert_eq!(group.index_of(&MemberId::from(104u64)), None);

        let me = MemberId::from(102u64);
        let others: Vec<_> = group.others(&me).cloned().collect();
        assert_eq!(others, ids(&[101, 103]));
    }

    #[test]
    fn test_group_rejects_bad_configuration() {
        assert!(matches!(
            GroupMembers::new(ids(&[1, 2]), 3),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            GroupMembers::new(ids(&[1, 2]), 0),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(
            GroupMembers::new(ids(&[1, 2, 1]), 2),
            Err(Error::InvalidConfig(_))
        ));
        assert!(GroupMembers::new(Vec::new(), 1).is_err());
    }

    #[test]
    fn test_message_addressing() {
        let a = MemberId::from(1u64);
        let b = MemberId::from(2u64);
        let c = MemberId::from(3u64);

        let broadcast = ProtocolMessage::broadcast(a.clone(), 1, vec![]);
        assert!(broadcast.is_broadcast());
        assert!(!broadcast.is_addressed_to(&a));
        assert!(broadcast.is_addressed_to(&b));

        let direct = ProtocolMessage::direct(a.clone(), vec![b.clone()], 2, vec![]);
        assert!(!direct.is_broadcast());
        assert!(direct.is_addressed_to(&b));
        assert!(!direct.is_addressed_to(&c));
    }

    #[test]
    fn test_public_key_xy_round_trip() {
        let point = ProjectivePoint::GENERATOR * k256::Scalar::from(7u64);
        let key = PublicKey::from_point(point).unwrap();

        let parsed = PublicKey::from_uncompressed_xy(&key.to_uncompressed_xy()).unwrap();
        assert_eq!(parsed, key);
        assert!(PublicKey::from_point(ProjectivePoint::IDENTITY).is_err());
    }

    #[test]
    fn test_signature_encodings() {
        let key = ecdsa::SigningKey::from_bytes(&[5u8; 32].into()).unwrap();
        let (expected, recovery_id) = key.sign_prehash_recoverable(&[1u8; 32]).unwrap();
        let signature = Signature::new(
            expected.r().to_bytes().into(),
            expected.s().to_bytes().into(),
            recovery_id.to_byte(),
        );

        assert_eq!(signature.to_bytes().to_vec(), expected.to_bytes().to_vec());
        let der = signature.to_der().unwrap();
        assert_eq!(ecdsa::Signature::from_der(&der).unwrap(), expected);
    }
}
