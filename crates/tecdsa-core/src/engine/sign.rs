//! Distributed signature generation
//!
//! Five rounds over the whole group. Each member turns its Shamir share into
//! an additive share `w_i = lambda_i * x_i`, so the sum over the group is the
//! private key for any threshold `t <= n`.
//!
//! 1. broadcast `Gamma_i = gamma_i * G` and an OT sender key
//! 2. send every peer OT choice points for the bits of `k_i`
//! 3. answer every peer's choices with masked `gamma_i` and `w_i`, giving
//!    additive shares of `k_j * gamma_i` and `k_j * w_i` on both sides
//! 4. broadcast `delta_i`, giving `delta = k * gamma` and `R = delta^-1 * Gamma`
//! 5. broadcast `sigma_i`, the partial signatures summed into `s`

use super::keygen::KeygenMaterial;
use super::math::{lagrange_coefficient, point_from_bytes, point_to_bytes, scalar_from_bytes, scalar_to_bytes};
use super::messages::{
    SignDeltaMessage, SignGammaMessage, SignOtChoiceMessage, SignOtTransferMessage,
    SignPartialMessage, SIGN_ROUND_DELTA, SIGN_ROUND_GAMMA, SIGN_ROUND_OT_CHOICE,
    SIGN_ROUND_OT_TRANSFER, SIGN_ROUND_PARTIAL,
};
use super::ot::{OtContext, OtReceiver, OtSender};
use super::rounds::RoundDriver;
use crate::{Digest, Error, MemberId, Result};
use hmac::{Hmac, Mac};
use k256::{
    ecdsa::{self, signature::hazmat::PrehashVerifier},
    elliptic_curve::{bigint::U256, ops::Reduce, point::AffineCoordinates, scalar::IsHigh, Field},
    ProjectivePoint, Scalar,
};
use rand::rngs::OsRng;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Domain separator for deterministic nonce shares
const NONCE_DOMAIN: &[u8] = b"tecdsa-nonce";

/// Raw signature as the engine emits it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureData {
    /// R component, big-endian
    pub r: Vec<u8>,
    /// S component, big-endian
    pub s: Vec<u8>,
    /// Recovery indicator; only the first byte is meaningful
    pub signature_recovery: Vec<u8>,
    /// The signed digest
    pub m: Vec<u8>,
}

/// Run the signing rounds for one member
pub(crate) async fn run_signing(
    mut driver: RoundDriver,
    material: Arc<KeygenMaterial>,
    digest: Digest,
) -> Result<SignatureData> {
    let me = driver.id().clone();
    let group = driver.group().clone();

    info!(
        member = %me,
        digest = hex::encode(digest),
        "Starting signing"
    );

    let indices: Vec<u64> = (1..=group.len() as u64).collect();
    let lambda_i = lagrange_coefficient(material.index(), &indices)?;
    let w_i = lambda_i * material.secret_share();

    let k_i = derive_nonce_share(material.secret_share(), &digest)?;
    let gamma_i = Scalar::random(&mut OsRng);
    let gamma_commitment = ProjectivePoint::GENERATOR * gamma_i;
    let ot_sender = OtSender::new();

    // Round 1: commit to gamma_i, publish the OT sender key
    driver
        .broadcast(
            SIGN_ROUND_GAMMA,
            &SignGammaMessage {
                gamma_commitment: point_to_bytes(&gamma_commitment),
                ot_key: point_to_bytes(ot_sender.public_key()),
            },
        )
        .await?;

    let gammas = driver
        .collect_broadcasts::<SignGammaMessage>(SIGN_ROUND_GAMMA)
        .await?;
    let mut sender_keys = BTreeMap::new();
    for (member, message) in &gammas {
        sender_keys.insert(member.clone(), point_from_bytes(&message.ot_key)?);
    }

    // Round 2: choose on the bits of k_i against every peer's sender key
    debug!(member = %me, "DSG Round 2: OT choices");
    let mut receivers: BTreeMap<MemberId, OtReceiver> = BTreeMap::new();
    for (member, sender_key) in &sender_keys {
        let receiver = OtReceiver::new(&k_i, sender_key);
        driver
            .send_direct(
                SIGN_ROUND_OT_CHOICE,
                member,
                &SignOtChoiceMessage {
                    choices: receiver.choices().to_vec(),
                },
            )
            .await?;
        receivers.insert(member.clone(), receiver);
    }

    let choices = driver
        .collect_direct::<SignOtChoiceMessage>(SIGN_ROUND_OT_CHOICE)
        .await?;

    // Round 3: transfer gamma_i and w_i; keep our halves of k_j * gamma_i
    // and k_j * w_i
    debug!(member = %me, "DSG Round 3: OT transfers");
    let mut delta_i = k_i * gamma_i;
    let mut chi_i = k_i * w_i;
    for (member, message) in &choices {
        let ctx = OtContext::new(&me, member, ot_sender.public_key());
        let (mut pairs, shares) = ot_sender.transfer(&ctx, &message.choices, &[gamma_i, w_i])?;
        delta_i += shares[0];
        chi_i += shares[1];

        let key_share = pairs.pop().unwrap_or_default();
        let gamma = pairs.pop().unwrap_or_default();
        driver
            .send_direct(
                SIGN_ROUND_OT_TRANSFER,
                member,
                &SignOtTransferMessage { gamma, key_share },
            )
            .await?;
    }

    let transfers = driver
        .collect_direct::<SignOtTransferMessage>(SIGN_ROUND_OT_TRANSFER)
        .await?;
    for (member, message) in transfers {
        let (receiver, sender_key) = receivers
            .get(&member)
            .zip(sender_keys.get(&member))
            .ok_or_else(|| Error::Protocol(format!("No OT state for {}", member)))?;
        let ctx = OtContext::new(&member, &me, sender_key);
        let shares = receiver.receive(&ctx, &[message.gamma, message.key_share])?;
        delta_i += shares[0];
        chi_i += shares[1];
    }

    // Round 4: open delta = k * gamma
    debug!(member = %me, "DSG Round 4: delta");
    driver
        .broadcast(
            SIGN_ROUND_DELTA,
            &SignDeltaMessage {
                delta_share: scalar_to_bytes(&delta_i),
            },
        )
        .await?;

    let deltas = driver
        .collect_broadcasts::<SignDeltaMessage>(SIGN_ROUND_DELTA)
        .await?;

    let mut delta = delta_i;
    for message in deltas.values() {
        delta += scalar_from_bytes(&message.delta_share)?;
    }
    let delta_inv = Option::<Scalar>::from(delta.invert())
        .ok_or_else(|| Error::Protocol("delta is zero".into()))?;

    let mut gamma_sum = gamma_commitment;
    for message in gammas.values() {
        gamma_sum += point_from_bytes(&message.gamma_commitment)?;
    }

    // R = k^-1 * G
    let r_point = (gamma_sum * delta_inv).to_affine();
    let r = <Scalar as Reduce<U256>>::reduce_bytes(&r_point.x());
    let m = <Scalar as Reduce<U256>>::reduce_bytes(&digest.into());

    // Round 5: partial signatures, sum is k * (m + r * x)
    debug!(member = %me, "DSG Round 5: partial signatures");
    let sigma_i = m * k_i + r * chi_i;
    driver
        .broadcast(
            SIGN_ROUND_PARTIAL,
            &SignPartialMessage {
                sigma_share: scalar_to_bytes(&sigma_i),
            },
        )
        .await?;

    let partials = driver
        .collect_broadcasts::<SignPartialMessage>(SIGN_ROUND_PARTIAL)
        .await?;

    let mut s = sigma_i;
    for message in partials.values() {
        s += scalar_from_bytes(&message.sigma_share)?;
    }

    // Normalize s to low-s form; negating s mirrors R, flipping the parity
    let mut recovery_id = u8::from(bool::from(r_point.y_is_odd()));
    if bool::from(s.is_high()) {
        s = -s;
        recovery_id ^= 1;
    }

    let signature = ecdsa::Signature::from_scalars(r.to_bytes(), s.to_bytes())
        .map_err(|e| Error::Protocol(format!("Invalid signature scalars: {}", e)))?;
    material
        .public_key()
        .verifying_key()?
        .verify_prehash(&digest, &signature)
        .map_err(|_| {
            Error::Protocol("Signature does not verify against the group public key".into())
        })?;

    info!(
        member = %me,
        r = hex::encode(r.to_bytes()),
        s = hex::encode(s.to_bytes()),
        "DSG completed successfully"
    );

    Ok(SignatureData {
        r: r.to_bytes().to_vec(),
        s: s.to_bytes().to_vec(),
        signature_recovery: vec![recovery_id],
        m: digest.to_vec(),
    })
}

/// Nonce share bound to the secret share and the digest: HMAC-SHA256
/// keyed by the share over `NONCE_DOMAIN || digest`.
pub(super) fn derive_nonce_share(secret_share: &Scalar, digest: &Digest) -> Result<Scalar> {
    let mut mac = Hmac::<Sha256>::new_from_slice(&secret_share.to_bytes())
        .map_err(|e| Error::Protocol(e.to_string()))?;
    mac.update(NONCE_DOMAIN);
    mac.update(digest);

    let k_i = <Scalar as Reduce<U256>>::reduce_bytes(&mac.finalize().into_bytes());
    if bool::from(k_i.is_zero()) {
        return Err(Error::Protocol("Derived a zero nonce share".into()));
    }
    Ok(k_i)
}
