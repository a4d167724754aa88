//! Threshold-BLS signer for the HotStuff family (spec.md §4.3): each replica
//! holds a Shamir share of a single group secret; `partial_sign` produces a
//! share-signature, `combine` Lagrange-interpolates `2f+1` shares into the
//! aggregate, `verify_combined` checks it against the fixed group public key
//! via pairing. Grounded on the teacher's `crypto/bls_threshold.rs` (same
//! curve, same G1-signature/G2-key split, same pairing check) generalized
//! from "aggregate raw signatures" to genuine `t`-of-`n` Shamir threshold.

use std::fmt;

use bls12_381::{pairing, G1Affine, G1Projective, G2Affine, G2Projective, Scalar};
use ff::Field;
use group::Curve;
use rand_core::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::OrdererError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdSignatureShare {
    pub signer_index: u32,
    pub point: G1Affine,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdAggregate {
    pub point: G1Affine,
}

impl Serialize for ThresholdAggregate {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.point.to_compressed())
    }
}

impl<'de> Deserialize<'de> for ThresholdAggregate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        let mut arr = [0u8; 48];
        if bytes.len() != 48 {
            return Err(serde::de::Error::custom("invalid threshold aggregate length"));
        }
        arr.copy_from_slice(&bytes);
        let point = G1Affine::from_compressed(&arr)
            .into_option()
            .ok_or_else(|| serde::de::Error::custom("invalid threshold aggregate point"))?;
        Ok(ThresholdAggregate { point })
    }
}

impl fmt::Display for ThresholdAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.point.to_compressed()))
    }
}

/// The fixed group public key shared by every replica holding a share.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThresholdPublicKey {
    point: G2Affine,
}

/// A single replica's Shamir share of the group secret.
#[derive(Clone, Copy)]
pub struct ThresholdSecretShare {
    index: u32,
    scalar: Scalar,
}

impl ThresholdSecretShare {
    pub fn index(&self) -> u32 {
        self.index
    }
}

fn hash_to_g1(msg: &[u8]) -> G1Affine {
    let mut hasher = Sha256::new();
    hasher.update(msg);
    let digest = hasher.finalize();
    let mut wide = [0u8; 64];
    wide[..32].copy_from_slice(&digest);
    let scalar = Scalar::from_bytes_wide(&wide);
    (G1Projective::generator() * scalar).to_affine()
}

fn scalar_from_index(index: u32) -> Scalar {
    Scalar::from(index as u64 + 1)
}

/// Lagrange coefficient for `index` evaluated at x=0 over the given set of
/// participating indices.
fn lagrange_coefficient(index: u32, indices: &[u32]) -> Scalar {
    let xi = scalar_from_index(index);
    let mut num = Scalar::ONE;
    let mut den = Scalar::ONE;
    for &j in indices {
        if j == index {
            continue;
        }
        let xj = scalar_from_index(j);
        num *= xj;
        den *= xj - xi;
    }
    num * den.invert().unwrap()
}

/// Generates a degree-`(threshold-1)` polynomial and evaluates it at
/// `1..=total_nodes` to produce Shamir shares of a fresh group secret.
pub fn generate_shares<R: RngCore + CryptoRng>(
    rng: &mut R,
    threshold: usize,
    total_nodes: usize,
) -> Result<(ThresholdPublicKey, Vec<ThresholdSecretShare>), OrdererError> {
    if threshold == 0 || threshold > total_nodes {
        return Err(OrdererError::InvalidThreshold(threshold, total_nodes));
    }
    let coeffs: Vec<Scalar> = (0..threshold).map(|_| Scalar::random(&mut *rng)).collect();
    let secret = coeffs[0];
    let public_key = (G2Projective::generator() * secret).to_affine();

    let shares = (0..total_nodes)
        .map(|i| {
            let x = scalar_from_index(i as u32);
            let mut y = Scalar::ZERO;
            let mut xpow = Scalar::ONE;
            for c in &coeffs {
                y += *c * xpow;
                xpow *= x;
            }
            ThresholdSecretShare {
                index: i as u32,
                scalar: y,
            }
        })
        .collect();

    Ok((ThresholdPublicKey { point: public_key }, shares))
}

/// Per-replica capability: sign a partial share, combine `2f+1` shares into
/// the group signature, verify the combined signature (spec.md §4.3).
pub struct ThresholdSigner {
    share: ThresholdSecretShare,
    public_key: ThresholdPublicKey,
}

impl ThresholdSigner {
    pub fn new(share: ThresholdSecretShare, public_key: ThresholdPublicKey) -> Self {
        Self { share, public_key }
    }

    pub fn signer_index(&self) -> u32 {
        self.share.index
    }

    pub fn partial_sign(&self, msg: &[u8]) -> ThresholdSignatureShare {
        let point = (hash_to_g1(msg) * self.share.scalar).to_affine();
        ThresholdSignatureShare {
            signer_index: self.share.index,
            point,
        }
    }

    /// Combine `>= threshold` distinct shares into the aggregate signature
    /// via Lagrange interpolation at x=0.
    pub fn combine(
        &self,
        shares: &[ThresholdSignatureShare],
        threshold: usize,
    ) -> Result<ThresholdAggregate, OrdererError> {
        let mut distinct: Vec<&ThresholdSignatureShare> = Vec::new();
        for s in shares {
            if !distinct.iter().any(|d| d.signer_index == s.signer_index) {
                distinct.push(s);
            }
        }
        if distinct.len() < threshold {
            return Err(OrdererError::ThresholdCombinationFailed);
        }
        distinct.truncate(threshold);
        let indices: Vec<u32> = distinct.iter().map(|s| s.signer_index).collect();

        let mut acc = G1Projective::identity();
        for s in &distinct {
            let coeff = lagrange_coefficient(s.signer_index, &indices);
            acc += G1Projective::from(s.point) * coeff;
        }
        Ok(ThresholdAggregate {
            point: acc.to_affine(),
        })
    }

    pub fn verify_combined(&self, msg: &[u8], aggregate: &ThresholdAggregate) -> bool {
        verify_with_public_key(msg, aggregate, &self.public_key)
    }

    pub fn public_key(&self) -> ThresholdPublicKey {
        self.public_key
    }
}

pub fn verify_with_public_key(
    msg: &[u8],
    aggregate: &ThresholdAggregate,
    public_key: &ThresholdPublicKey,
) -> bool {
    let h = hash_to_g1(msg);
    let lhs = pairing(&h, &public_key.point);
    let rhs = pairing(&aggregate.point, &G2Affine::generator());
    lhs == rhs
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn combine_of_threshold_shares_verifies() {
        let mut rng = OsRng;
        let n = 4usize;
        let f = (n - 1) / 3;
        let threshold = 2 * f + 1;
        let (pk, shares) = generate_shares(&mut rng, threshold, n).unwrap();

        let signers: Vec<ThresholdSigner> = shares
            .into_iter()
            .map(|s| ThresholdSigner::new(s, pk))
            .collect();

        let msg = b"commit-block-7";
        let partials: Vec<_> = signers[..threshold]
            .iter()
            .map(|s| s.partial_sign(msg))
            .collect();

        let agg = signers[0].combine(&partials, threshold).unwrap();
        assert!(verify_with_public_key(msg, &agg, &pk));
    }

    #[test]
    fn insufficient_shares_fail_to_combine() {
        let mut rng = OsRng;
        let (pk, shares) = generate_shares(&mut rng, 3, 4).unwrap();
        let signers: Vec<ThresholdSigner> = shares
            .into_iter()
            .map(|s| ThresholdSigner::new(s, pk))
            .collect();
        let msg = b"short";
        let partials: Vec<_> = signers[..2].iter().map(|s| s.partial_sign(msg)).collect();
        assert!(signers[0].combine(&partials, 3).is_err());
    }
}
