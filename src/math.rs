//! Scalar arithmetic over the secp256k1 group order n.
//!
//! Every value handled by the monitor (r, s, z, private keys, nonces) lives
//! in Z/nZ. The curve library supplies the reduction and inversion; this
//! module adds the hex canonicalization the rest of the crate speaks.

use k256::elliptic_curve::ff::PrimeField;
use k256::elliptic_curve::ops::Reduce;
use k256::Scalar;
use thiserror::Error;

/// secp256k1 group order, big-endian hex. Kept for display and tests; the
/// arithmetic itself goes through `k256::Scalar`.
pub const CURVE_ORDER_HEX: &str =
    "fffffffffffffffffffffffffffffffebaaedce6af48a03bbfd25e8cd0364141";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MathError {
    #[error("scalar has no inverse (zero or shares a factor with the modulus)")]
    SingularScalar,
    #[error("invalid hex scalar: {0}")]
    InvalidHex(String),
    #[error("value is not a canonical scalar (>= curve order)")]
    OutOfRange,
}

pub fn add(a: &Scalar, b: &Scalar) -> Scalar {
    a + b
}

pub fn sub(a: &Scalar, b: &Scalar) -> Scalar {
    a - b
}

pub fn mul(a: &Scalar, b: &Scalar) -> Scalar {
    a * b
}

pub fn neg(a: &Scalar) -> Scalar {
    -*a
}

/// Modular inverse; fails on zero (the only non-invertible element for a
/// prime modulus).
pub fn inv(a: &Scalar) -> Result<Scalar, MathError> {
    Option::<Scalar>::from(a.invert()).ok_or(MathError::SingularScalar)
}

fn decode_hex_padded(s: &str) -> Result<[u8; 32], MathError> {
    let stripped = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    if stripped.is_empty() || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(MathError::InvalidHex(s.to_string()));
    }
    if stripped.len() > 64 {
        return Err(MathError::InvalidHex(s.to_string()));
    }
    // Odd-length quantities ("0x1") are legal in JSON-RPC responses.
    let mut padded = String::with_capacity(64);
    for _ in 0..(64 - stripped.len()) {
        padded.push('0');
    }
    padded.push_str(stripped);

    let bytes = hex::decode(&padded).map_err(|_| MathError::InvalidHex(s.to_string()))?;
    let mut buf = [0u8; 32];
    buf.copy_from_slice(&bytes);
    Ok(buf)
}

/// Strict parse: the value must already be a canonical element of [0, n).
pub fn scalar_from_hex(s: &str) -> Result<Scalar, MathError> {
    let buf = decode_hex_padded(s)?;
    Option::<Scalar>::from(Scalar::from_repr(buf.into())).ok_or(MathError::OutOfRange)
}

/// Parse a 256-bit hash or quantity and reduce it mod n. Used for z, which
/// is a keccak digest and may exceed the order.
pub fn scalar_reduce_hex(s: &str) -> Result<Scalar, MathError> {
    let buf = decode_hex_padded(s)?;
    Ok(scalar_reduce_bytes(&buf))
}

pub fn scalar_reduce_bytes(bytes: &[u8; 32]) -> Scalar {
    <Scalar as Reduce<k256::U256>>::reduce(k256::U256::from_be_slice(bytes))
}

/// Canonical render: lowercase, 0x-prefixed, zero-padded to 32 bytes.
pub fn scalar_to_hex(s: &Scalar) -> String {
    format!("0x{}", hex::encode(s.to_bytes()))
}

/// Canonicalize an R value as it arrives from the RPC: parse, reject
/// anything that normalizes to the integer 0, re-render as 32-byte hex.
pub fn canonical_r(raw: &str) -> Option<String> {
    let buf = decode_hex_padded(raw).ok()?;
    if buf.iter().all(|b| *b == 0) {
        return None;
    }
    Some(format!("0x{}", hex::encode(buf)))
}
