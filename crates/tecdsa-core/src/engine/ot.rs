//! Multiplicative-to-additive conversion over oblivious transfer
//!
//! The receiver holds `b` and runs one Chou-Orlandi base OT per bit of `b`.
//! For every input `a_n` the sender offers `(t, t + a_n)` in each transfer,
//! masked under the two OT keys. The receiver learns `t + bit * a_n` and
//! nothing about `a_n`; the sender learns nothing about `b`. Summing with
//! bit weights gives `alpha_n + beta_n = a_n * b`, with `alpha_n` on the
//! sender side.

use super::math::{point_from_bytes, point_to_bytes, scalar_from_bytes, scalar_to_bytes};
use crate::{Error, MemberId, Result};
use k256::{
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        subtle::{Choice, ConditionallySelectable},
        Field,
    },
    ProjectivePoint, Scalar,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

/// One transfer per bit of a scalar
pub(crate) const OT_BITS: usize = 256;

const OT_DOMAIN: &[u8] = b"tecdsa-mta-ot";

/// Both masked messages of one transfer for one sender input
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaskedPair {
    pub zero: Vec<u8>,
    pub one: Vec<u8>,
}

/// Identifies one sender/receiver pair so keys never repeat across pairs
pub(crate) struct OtContext<'a> {
    sender: &'a MemberId,
    receiver: &'a MemberId,
    sender_key: ProjectivePoint,
    sender_key_bytes: Vec<u8>,
}

impl<'a> OtContext<'a> {
    pub(crate) fn new(
        sender: &'a MemberId,
        receiver: &'a MemberId,
        sender_key: &ProjectivePoint,
    ) -> Self {
        Self {
            sender,
            receiver,
            sender_key: *sender_key,
            sender_key_bytes: point_to_bytes(sender_key),
        }
    }

    /// Pad for transfer `bit`, sender input `input`, under the shared point
    fn pad(&self, bit: usize, input: usize, choice: &[u8], shared: &[u8]) -> Scalar {
        let mut hasher = Sha256::new();
        hasher.update(OT_DOMAIN);
        for id in [self.sender, self.receiver] {
            hasher.update((id.as_bytes().len() as u32).to_be_bytes());
            hasher.update(id.as_bytes());
        }
        hasher.update((bit as u32).to_be_bytes());
        hasher.update((input as u32).to_be_bytes());
        hasher.update(&self.sender_key_bytes);
        hasher.update(choice);
        hasher.update(shared);
        <Scalar as Reduce<U256>>::reduce_bytes(&hasher.finalize())
    }
}

/// Base OT key of a sender, shared by all of its receivers
pub(crate) struct OtSender {
    y: Scalar,
    big_y: ProjectivePoint,
    big_z: ProjectivePoint,
}

impl OtSender {
    pub(crate) fn new() -> Self {
        let y = Scalar::random(&mut OsRng);
        let big_y = ProjectivePoint::GENERATOR * y;
        Self {
            y,
            big_y,
            big_z: big_y * y,
        }
    }

    pub(crate) fn public_key(&self) -> &ProjectivePoint {
        &self.big_y
    }

    /// Answer a receiver's choice points.
    ///
    /// Returns the masked pairs per input (each `OT_BITS` long) and the
    /// sender's additive share of `inputs[n] * b` per input.
    pub(crate) fn transfer(
        &self,
        ctx: &OtContext<'_>,
        choices: &[Vec<u8>],
        inputs: &[Scalar],
    ) -> Result<(Vec<Vec<MaskedPair>>, Vec<Scalar>)> {
        if choices.len() != OT_BITS {
            return Err(Error::Protocol(format!(
                "Expected {} OT choices from {}, got {}",
                OT_BITS,
                ctx.receiver,
                choices.len()
            )));
        }

        let mut pairs: Vec<Vec<MaskedPair>> = inputs
            .iter()
            .map(|_| Vec::with_capacity(OT_BITS))
            .collect();
        let mut shares = vec![Scalar::ZERO; inputs.len()];
        let mut weight = Scalar::ONE;

        for (bit, choice) in choices.iter().enumerate() {
            let big_x = point_from_bytes(choice)?;
            let key0 = big_x * self.y;
            let key1 = point_to_bytes(&(key0 - self.big_z));
            let key0 = point_to_bytes(&key0);

            for (n, input) in inputs.iter().enumerate() {
                let t = Scalar::random(&mut OsRng);
                pairs[n].push(MaskedPair {
                    zero: scalar_to_bytes(&(t + ctx.pad(bit, n, choice, &key0))),
                    one: scalar_to_bytes(&(t + input + ctx.pad(bit, n, choice, &key1))),
                });
                shares[n] -= weight * t;
            }
            weight = weight.double();
        }

        Ok((pairs, shares))
    }
}

/// Receiver state for one sender: the choice bits of `b` and the OT secrets
pub(crate) struct OtReceiver {
    bits: Vec<Choice>,
    secrets: Vec<Scalar>,
    choices: Vec<Vec<u8>>,
}

impl OtReceiver {
    pub(crate) fn new(b: &Scalar, sender_key: &ProjectivePoint) -> Self {
        let bytes = b.to_bytes();
        let mut bits = Vec::with_capacity(OT_BITS);
        let mut secrets = Vec::with_capacity(OT_BITS);
        let mut choices = Vec::with_capacity(OT_BITS);

        for bit in 0..OT_BITS {
            let set = Choice::from((bytes[31 - bit / 8] >> (bit % 8)) & 1);
            let x = Scalar::random(&mut OsRng);
            let mut big_x = ProjectivePoint::GENERATOR * x;
            big_x.conditional_assign(&(big_x + sender_key), set);

            bits.push(set);
            secrets.push(x);
            choices.push(point_to_bytes(&big_x));
        }

        Self {
            bits,
            secrets,
            choices,
        }
    }

    /// Encoded choice points to send to the sender
    pub(crate) fn choices(&self) -> &[Vec<u8>] {
        &self.choices
    }

    /// Unmask the chosen messages; returns the receiver's share of
    /// `inputs[n] * b` per sender input
    pub(crate) fn receive(
        &self,
        ctx: &OtContext<'_>,
        pairs: &[Vec<MaskedPair>],
    ) -> Result<Vec<Scalar>> {
        if pairs.iter().any(|input_pairs| input_pairs.len() != OT_BITS) {
            return Err(Error::Protocol(format!(
                "Expected {} OT messages per input from {}",
                OT_BITS, ctx.sender
            )));
        }
        let keys: Vec<Vec<u8>> = self
            .secrets
            .iter()
            .map(|x| point_to_bytes(&(ctx.sender_key * x)))
            .collect();

        let mut shares = Vec::with_capacity(pairs.len());
        for (n, input_pairs) in pairs.iter().enumerate() {
            let mut share = Scalar::ZERO;
            let mut weight = Scalar::ONE;
            for (bit, pair) in input_pairs.iter().enumerate() {
                let zero = scalar_from_bytes(&pair.zero)?;
                let one = scalar_from_bytes(&pair.one)?;
                let chosen = Scalar::conditional_select(&zero, &one, self.bits[bit]);

                share += weight * (chosen - ctx.pad(bit, n, &self.choices[bit], &keys[bit]));
                weight = weight.double();
            }
            shares.push(share);
        }

        Ok(shares)
    }
}
