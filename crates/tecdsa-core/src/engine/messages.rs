//! Round message types

use super::ot::MaskedPair;
use serde::{Deserialize, Serialize};

pub(crate) const KEYGEN_ROUND_COMMIT: u32 = 1;
pub(crate) const KEYGEN_ROUND_SHARE: u32 = 2;
pub(crate) const KEYGEN_LAST_ROUND: u32 = KEYGEN_ROUND_SHARE;

pub(crate) const SIGN_ROUND_GAMMA: u32 = 1;
pub(crate) const SIGN_ROUND_OT_CHOICE: u32 = 2;
pub(crate) const SIGN_ROUND_OT_TRANSFER: u32 = 3;
pub(crate) const SIGN_ROUND_DELTA: u32 = 4;
pub(crate) const SIGN_ROUND_PARTIAL: u32 = 5;
pub(crate) const SIGN_LAST_ROUND: u32 = SIGN_ROUND_PARTIAL;

/// Keygen round 1: commitments to the secret polynomial (Feldman VSS)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenCommitMessage {
    pub commitments: Vec<Vec<u8>>,
}

/// Keygen round 2: polynomial evaluated at the receiver's index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygenShareMessage {
    pub share: Vec<u8>,
}

/// Signing round 1: commitment to gamma_i and the member's OT sender key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignGammaMessage {
    pub gamma_commitment: Vec<u8>,
    pub ot_key: Vec<u8>,
}

/// Signing round 2: OT choice points, one per bit of the nonce share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignOtChoiceMessage {
    pub choices: Vec<Vec<u8>>,
}

/// Signing round 3: masked OT messages for gamma_i and the key share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignOtTransferMessage {
    pub gamma: Vec<MaskedPair>,
    pub key_share: Vec<MaskedPair>,
}

/// Signing round 4: delta share
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignDeltaMessage {
    pub delta_share: Vec<u8>,
}

/// Signing round 5: partial signature
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignPartialMessage {
    pub sigma_share: Vec<u8>,
}
