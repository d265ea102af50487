//! Distributed key generation (Feldman VSS)

use super::math::{
    evaluate_commitments, evaluate_polynomial, point_from_bytes, point_to_bytes,
    scalar_from_bytes, scalar_to_bytes,
};
use super::messages::{
    KeygenCommitMessage, KeygenShareMessage, KEYGEN_ROUND_COMMIT, KEYGEN_ROUND_SHARE,
};
use super::rounds::RoundDriver;
use crate::{Error, GroupMembers, MemberId, PublicKey, Result};
use k256::{elliptic_curve::Field, ProjectivePoint, Scalar};
use rand::rngs::OsRng;
use std::fmt;
use tracing::{debug, info};
use zeroize::Zeroize;

/// The local member's share of the group key plus the group public key.
///
/// Owned by exactly one signer; the secret share is wiped on drop.
pub struct KeygenMaterial {
    member_id: MemberId,
    group: GroupMembers,
    index: u64,
    secret_share: Scalar,
    public_key: PublicKey,
    /// `secret_share * G` of every member, in group order
    public_shares: Vec<ProjectivePoint>,
}

impl KeygenMaterial {
    /// Assemble material from an externally produced share.
    ///
    /// The share must match the member's entry in `public_shares`.
    pub fn new(
        member_id: MemberId,
        group: GroupMembers,
        secret_share: Scalar,
        public_key: PublicKey,
        public_shares: Vec<ProjectivePoint>,
    ) -> Result<Self> {
        let index = group
            .index_of(&member_id)
            .ok_or_else(|| Error::InvalidMember(format!("{} is not in the group", member_id)))?;

        if public_shares.len() != group.len() {
            return Err(Error::InvalidConfig(format!(
                "Expected {} public shares, got {}",
                group.len(),
                public_shares.len()
            )));
        }
        if ProjectivePoint::GENERATOR * secret_share != public_shares[(index - 1) as usize] {
            return Err(Error::VerificationFailed(
                "Secret share does not match its public share".into(),
            ));
        }

        Ok(Self {
            member_id,
            group,
            index,
            secret_share,
            public_key,
            public_shares,
        })
    }

    /// Shamir-share a key from a trusted dealer's polynomial.
    ///
    /// `coefficients[0]` is the group private key; the polynomial degree is
    /// `threshold - 1`. Used to provision fixed key shares.
    pub fn deal(group: &GroupMembers, coefficients: &[Scalar]) -> Result<Vec<Self>> {
        if coefficients.len() != group.threshold() {
            return Err(Error::InvalidConfig(format!(
                "Expected {} coefficients, got {}",
                group.threshold(),
                coefficients.len()
            )));
        }

        let commitments: Vec<ProjectivePoint> = coefficients
            .iter()
            .map(|c| ProjectivePoint::GENERATOR * c)
            .collect();
        let public_key = PublicKey::from_point(commitments[0])?;
        let public_shares: Vec<ProjectivePoint> = (1..=group.len() as u64)
            .map(|x| evaluate_commitments(&commitments, x))
            .collect();

        group
            .members()
            .iter()
            .zip(1u64..)
            .map(|(member, x)| {
                Self::new(
                    member.clone(),
                    group.clone(),
                    evaluate_polynomial(coefficients, x),
                    public_key,
                    public_shares.clone(),
                )
            })
            .collect()
    }

    pub fn member_id(&self) -> &MemberId {
        &self.member_id
    }

    pub fn group(&self) -> &GroupMembers {
        &self.group
    }

    /// 1-based evaluation index of the local member
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Public share of any group member
    pub fn public_share(&self, member: &MemberId) -> Option<ProjectivePoint> {
        self.group
            .index_of(member)
            .map(|index| self.public_shares[(index - 1) as usize])
    }

    pub(crate) fn secret_share(&self) -> &Scalar {
        &self.secret_share
    }
}

impl Drop for KeygenMaterial {
    fn drop(&mut self) {
        self.secret_share.zeroize();
    }
}

impl fmt::Debug for KeygenMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeygenMaterial")
            .field("member_id", &self.member_id)
            .field("index", &self.index)
            .field("public_key", &hex::encode(self.public_key.to_sec1_compressed()))
            .finish_non_exhaustive()
    }
}

/// Run the key generation rounds for one member
pub(crate) async fn run_keygen(mut driver: RoundDriver) -> Result<KeygenMaterial> {
    let me = driver.id().clone();
    let group = driver.group().clone();
    let my_index = group
        .index_of(&me)
        .ok_or_else(|| Error::InvalidMember(me.to_string()))?;

    info!(
        member = %me,
        n_members = group.len(),
        threshold = group.threshold(),
        "Starting keygen"
    );

    // Round 1: commit to a random polynomial of degree t-1
    let mut coefficients: Vec<Scalar> = (0..group.threshold())
        .map(|_| Scalar::random(&mut OsRng))
        .collect();
    let commitments: Vec<ProjectivePoint> = coefficients
        .iter()
        .map(|c| ProjectivePoint::GENERATOR * c)
        .collect();

    driver
        .broadcast(
            KEYGEN_ROUND_COMMIT,
            &KeygenCommitMessage {
                commitments: commitments.iter().map(point_to_bytes).collect(),
            },
        )
        .await?;

    // Round 2: send each member its evaluation
    for member in group.others(&me) {
        let index = group
            .index_of(member)
            .ok_or_else(|| Error::InvalidMember(member.to_string()))?;
        let share = evaluate_polynomial(&coefficients, index);
        driver
            .send_direct(
                KEYGEN_ROUND_SHARE,
                member,
                &KeygenShareMessage {
                    share: scalar_to_bytes(&share),
                },
            )
            .await?;
    }

    let own_share = evaluate_polynomial(&coefficients, my_index);
    coefficients.iter_mut().for_each(|c| c.zeroize());

    let mut all_commitments = vec![commitments];
    let received_commitments = driver
        .collect_broadcasts::<KeygenCommitMessage>(KEYGEN_ROUND_COMMIT)
        .await?;
    let received_shares = driver
        .collect_direct::<KeygenShareMessage>(KEYGEN_ROUND_SHARE)
        .await?;

    debug!(member = %me, "Verifying received shares");
    let mut secret_share = own_share;
    for (sender, message) in &received_commitments {
        let sender_commitments = message
            .commitments
            .iter()
            .map(|bytes| point_from_bytes(bytes))
            .collect::<Result<Vec<_>>>()?;
        if sender_commitments.len() != group.threshold() {
            return Err(Error::Protocol(format!(
                "Member {} committed to {} coefficients, expected {}",
                sender,
                sender_commitments.len(),
                group.threshold()
            )));
        }

        let share_message = received_shares
            .get(sender)
            .ok_or_else(|| Error::Protocol(format!("Missing share from {}", sender)))?;
        let share = scalar_from_bytes(&share_message.share)?;

        if ProjectivePoint::GENERATOR * share != evaluate_commitments(&sender_commitments, my_index)
        {
            return Err(Error::Protocol(format!(
                "Share from member {} does not match commitment",
                sender
            )));
        }

        secret_share += share;
        all_commitments.push(sender_commitments);
    }

    let public_key = PublicKey::from_point(
        all_commitments
            .iter()
            .fold(ProjectivePoint::IDENTITY, |acc, c| acc + c[0]),
    )?;
    let public_shares = (1..=group.len() as u64)
        .map(|x| {
            all_commitments
                .iter()
                .fold(ProjectivePoint::IDENTITY, |acc, c| {
                    acc + evaluate_commitments(c, x)
                })
        })
        .collect();

    let material = KeygenMaterial::new(me, group, secret_share, public_key, public_shares)?;

    info!(
        member = %material.member_id,
        public_key = hex::encode(material.public_key.to_sec1_compressed()),
        "Keygen completed successfully"
    );

    Ok(material)
}
