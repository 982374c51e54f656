//! ECDSA private-key recovery from nonce reuse.
//!
//! Given two signatures sharing an R value the nonce cancels out of the
//! signing equation and both the nonce and the key fall to linear algebra:
//!   k = (z1 - z2) * (s1 - s2)^-1 mod n
//!   d = (s1 * k - z1) * r^-1 mod n
//! The equations are symmetric in +-k, so recovery tries both branches and
//! keeps whichever one verifies against the sender address.

use alloy_primitives::{keccak256, Address};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{ProjectivePoint, Scalar};
use thiserror::Error;

use crate::math::{self, MathError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecoveryError {
    #[error("signatures have different R values")]
    DifferentR,
    #[error("signatures are identical (s1 == s2)")]
    IdenticalSignatures,
    #[error(transparent)]
    Math(#[from] MathError),
    #[error("recovered key failed address verification on both nonce branches")]
    RecoveryFailed,
    #[error("zero is not a valid private key or nonce")]
    InvalidScalar,
}

/// x-coordinate of k*G reduced mod n: the R value a signature made with
/// nonce `k` will carry.
pub fn nonce_commitment(k: &Scalar) -> Result<Scalar, RecoveryError> {
    if bool::from(k.is_zero()) {
        return Err(RecoveryError::InvalidScalar);
    }
    let point = (ProjectivePoint::GENERATOR * *k).to_affine();
    let encoded = point.to_encoded_point(false);
    let x = encoded.x().ok_or(RecoveryError::InvalidScalar)?;
    let mut buf = [0u8; 32];
    buf.copy_from_slice(x);
    Ok(math::scalar_reduce_bytes(&buf))
}

/// Ethereum address of the key `d`: keccak256 of the uncompressed public
/// point without its 0x04 prefix, last 20 bytes.
pub fn address_from_private_key(d: &Scalar) -> Result<Address, RecoveryError> {
    if bool::from(d.is_zero()) {
        return Err(RecoveryError::InvalidScalar);
    }
    let point = (ProjectivePoint::GENERATOR * *d).to_affine();
    let encoded = point.to_encoded_point(false);
    let hash = keccak256(&encoded.as_bytes()[1..]);
    Ok(Address::from_slice(&hash[12..]))
}

/// Case-insensitive check that `d` controls `expected_address`.
pub fn verify_private_key(d: &Scalar, expected_address: &str) -> bool {
    let derived = match address_from_private_key(d) {
        Ok(addr) => addr,
        Err(_) => return false,
    };
    let expected = expected_address
        .strip_prefix("0x")
        .or_else(|| expected_address.strip_prefix("0X"))
        .unwrap_or(expected_address);
    hex::encode(derived.as_slice()).eq_ignore_ascii_case(expected)
}

fn key_from_nonce(z: &Scalar, r: &Scalar, s: &Scalar, k: &Scalar) -> Result<Scalar, RecoveryError> {
    let r_inv = math::inv(r)?;
    Ok((*s * *k - *z) * r_inv)
}

/// Same-key recovery from two signatures over the same nonce.
///
/// Tries the `k` branch first and falls back to `n - k`; fails if neither
/// branch yields a key matching `expected_address`.
pub fn recover_from_signatures(
    z1: &Scalar,
    r1: &Scalar,
    s1: &Scalar,
    z2: &Scalar,
    r2: &Scalar,
    s2: &Scalar,
    expected_address: &str,
) -> Result<Scalar, RecoveryError> {
    if r1 != r2 {
        return Err(RecoveryError::DifferentR);
    }
    if s1 == s2 {
        return Err(RecoveryError::IdenticalSignatures);
    }

    let s_diff_inv = math::inv(&(*s1 - *s2))?;
    let k = (*z1 - *z2) * s_diff_inv;

    for candidate in [k, -k] {
        let d = key_from_nonce(z1, r1, s1, &candidate)?;
        if verify_private_key(&d, expected_address) {
            return Ok(d);
        }
    }
    Err(RecoveryError::RecoveryFailed)
}

/// Cross-key recovery once the nonce behind `r` is known.
pub fn recover_with_known_nonce(
    z: &Scalar,
    r: &Scalar,
    s: &Scalar,
    k: &Scalar,
) -> Result<Scalar, RecoveryError> {
    key_from_nonce(z, r, s, k)
}

/// Derive the nonce back out of a signature once the key is known:
/// k = (z + r*d) * s^-1 mod n.
pub fn derive_nonce(
    z: &Scalar,
    r: &Scalar,
    s: &Scalar,
    d: &Scalar,
) -> Result<Scalar, RecoveryError> {
    let s_inv = math::inv(s)?;
    Ok((*z + *r * *d) * s_inv)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{scalar_from_hex, scalar_reduce_bytes, scalar_to_hex};
    use k256::elliptic_curve::Field;
    use rand::rngs::OsRng;

    /// Sign a hash with an explicit nonce; no low-S normalization, the
    /// recovery math wants the raw s.
    fn sign_with_nonce(z: &Scalar, d: &Scalar, k: &Scalar) -> (Scalar, Scalar) {
        let r = nonce_commitment(k).unwrap();
        let k_inv = math::inv(k).unwrap();
        let s = (*z + r * *d) * k_inv;
        (r, s)
    }

    fn hash_scalar(msg: &str) -> Scalar {
        scalar_reduce_bytes(&keccak256(msg.as_bytes()).0)
    }

    #[test]
    fn test_known_key_address_vector() {
        // Throwaway key from the Ethereum docs; never fund it.
        let d = scalar_from_hex("0x4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318")
            .unwrap();
        assert!(verify_private_key(
            &d,
            "0x2c7536E3605D9C16a7a3D7b1898e529396a65c23"
        ));
        assert!(!verify_private_key(
            &d,
            "0x0000000000000000000000000000000000000000"
        ));
    }

    #[test]
    fn test_same_key_recovery() {
        let d = Scalar::random(&mut OsRng);
        let k = Scalar::random(&mut OsRng);
        let addr = address_from_private_key(&d).unwrap();
        let addr_hex = format!("0x{}", hex::encode(addr.as_slice()));

        let z1 = hash_scalar("message 1");
        let z2 = hash_scalar("message 2");
        let (r1, s1) = sign_with_nonce(&z1, &d, &k);
        let (r2, s2) = sign_with_nonce(&z2, &d, &k);
        assert_eq!(r1, r2);

        let recovered = recover_from_signatures(&z1, &r1, &s1, &z2, &r2, &s2, &addr_hex).unwrap();
        assert_eq!(scalar_to_hex(&recovered), scalar_to_hex(&d));
    }

    #[test]
    fn test_same_key_recovery_many() {
        for _ in 0..10 {
            let d = Scalar::random(&mut OsRng);
            let k = Scalar::random(&mut OsRng);
            let addr = address_from_private_key(&d).unwrap();
            let addr_hex = format!("0x{}", hex::encode(addr.as_slice()));

            let z1 = hash_scalar("test message A");
            let z2 = hash_scalar("test message B");
            let (r, s1) = sign_with_nonce(&z1, &d, &k);
            let (_, s2) = sign_with_nonce(&z2, &d, &k);

            let recovered =
                recover_from_signatures(&z1, &r, &s1, &z2, &r, &s2, &addr_hex).unwrap();
            assert!(verify_private_key(&recovered, &addr_hex));
        }
    }

    #[test]
    fn test_recovery_rejects_different_r() {
        let one = Scalar::ONE;
        let two = Scalar::from(2u64);
        let err = recover_from_signatures(&one, &one, &one, &two, &two, &two, "0x00").unwrap_err();
        assert_eq!(err, RecoveryError::DifferentR);
    }

    #[test]
    fn test_recovery_rejects_identical_signatures() {
        let one = Scalar::ONE;
        let err = recover_from_signatures(&one, &one, &one, &one, &one, &one, "0x00").unwrap_err();
        assert_eq!(err, RecoveryError::IdenticalSignatures);
    }

    #[test]
    fn test_recover_with_known_nonce() {
        let d = Scalar::random(&mut OsRng);
        let k = Scalar::random(&mut OsRng);
        let z = hash_scalar("test message");
        let (r, s) = sign_with_nonce(&z, &d, &k);

        let recovered = recover_with_known_nonce(&z, &r, &s, &k).unwrap();
        assert_eq!(recovered, d);
    }

    #[test]
    fn test_derive_nonce_roundtrip() {
        let d = Scalar::random(&mut OsRng);
        let k = Scalar::random(&mut OsRng);
        let z = hash_scalar("test message");
        let (r, s) = sign_with_nonce(&z, &d, &k);

        let derived = derive_nonce(&z, &r, &s, &d).unwrap();
        assert_eq!(derived, k);
    }

    #[test]
    fn test_cross_key_chain() {
        // A reuses a nonce, we learn k from A, then break B with it.
        let d_a = Scalar::random(&mut OsRng);
        let d_b = Scalar::random(&mut OsRng);
        let k = Scalar::random(&mut OsRng);
        let addr_a = format!(
            "0x{}",
            hex::encode(address_from_private_key(&d_a).unwrap().as_slice())
        );

        let z_a1 = hash_scalar("key A message 1");
        let z_a2 = hash_scalar("key A message 2");
        let z_b = hash_scalar("key B message");
        let (r, s_a1) = sign_with_nonce(&z_a1, &d_a, &k);
        let (_, s_a2) = sign_with_nonce(&z_a2, &d_a, &k);
        let (r_b, s_b) = sign_with_nonce(&z_b, &d_b, &k);
        assert_eq!(r, r_b);

        let recovered_a =
            recover_from_signatures(&z_a1, &r, &s_a1, &z_a2, &r, &s_a2, &addr_a).unwrap();
        let derived_k = derive_nonce(&z_a1, &r, &s_a1, &recovered_a).unwrap();
        let recovered_b = recover_with_known_nonce(&z_b, &r_b, &s_b, &derived_k).unwrap();
        assert_eq!(recovered_b, d_b);
    }

    #[test]
    fn test_nonce_commitment_rejects_zero() {
        assert_eq!(
            nonce_commitment(&Scalar::ZERO),
            Err(RecoveryError::InvalidScalar)
        );
    }
}
