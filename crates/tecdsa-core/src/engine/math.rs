//! Scalar and point helpers shared by the protocols

use crate::{Error, Result};
use k256::{
    elliptic_curve::{
        bigint::U256,
        ops::Reduce,
        sec1::{FromEncodedPoint, ToEncodedPoint},
        Field,
    },
    AffinePoint, ProjectivePoint, Scalar,
};

pub(crate) fn scalar_from_bytes(bytes: &[u8]) -> Result<Scalar> {
    let array: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Deserialization("Invalid scalar length".into()))?;
    Ok(<Scalar as Reduce<U256>>::reduce_bytes(&array.into()))
}

pub(crate) fn scalar_to_bytes(scalar: &Scalar) -> Vec<u8> {
    scalar.to_bytes().to_vec()
}

pub(crate) fn point_from_bytes(bytes: &[u8]) -> Result<ProjectivePoint> {
    let encoded =
        k256::EncodedPoint::from_bytes(bytes).map_err(|e| Error::Deserialization(e.to_string()))?;
    let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| Error::Deserialization("Invalid curve point".into()))?;
    Ok(ProjectivePoint::from(affine))
}

pub(crate) fn point_to_bytes(point: &ProjectivePoint) -> Vec<u8> {
    point.to_affine().to_encoded_point(true).as_bytes().to_vec()
}

/// Evaluate polynomial at a point
pub(crate) fn evaluate_polynomial(coefficients: &[Scalar], x: u64) -> Scalar {
    let x_scalar = Scalar::from(x);
    let mut result = Scalar::ZERO;
    let mut x_power = Scalar::ONE;

    for coef in coefficients {
        result += *coef * x_power;
        x_power *= x_scalar;
    }

    result
}

/// Evaluate a polynomial "in the exponent" from its coefficient commitments
pub(crate) fn evaluate_commitments(commitments: &[ProjectivePoint], x: u64) -> ProjectivePoint {
    let x_scalar = Scalar::from(x);
    let mut result = ProjectivePoint::IDENTITY;
    let mut x_power = Scalar::ONE;

    for commitment in commitments {
        result += *commitment * x_power;
        x_power *= x_scalar;
    }

    result
}

/// Lagrange coefficient at zero for `index` over the evaluation set `indices`
pub(crate) fn lagrange_coefficient(index: u64, indices: &[u64]) -> Result<Scalar> {
    let mut numerator = Scalar::ONE;
    let mut denominator = Scalar::ONE;

    for &j in indices {
        if j == index {
            continue;
        }
        numerator *= Scalar::from(j);
        let diff = if j > index {
            Scalar::from(j - index)
        } else {
            -Scalar::from(index - j)
        };
        denominator *= diff;
    }

    let inverse = Option::<Scalar>::from(denominator.invert())
        .ok_or_else(|| Error::Protocol("Duplicate evaluation index".into()))?;
    Ok(numerator * inverse)
}
