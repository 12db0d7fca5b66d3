//! Shamir's secret sharing over GF(256).
//!
//! Every byte of the secret gets its own random polynomial of degree
//! `threshold - 1` whose constant term is that byte. Share `i` holds the
//! x-coordinate `i` (1..=N) and the evaluation of every polynomial at `i`.
//! Combining interpolates each byte position at `x = 0`.
//!
//! Combining fewer than `threshold` shares does not fail: it yields a value
//! that is indistinguishable from random. Callers must verify the result
//! independently (the seal manager does so against a verification
//! ciphertext).

use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto;
use crate::error::ShamirError;

/// GF(256) arithmetic with the AES reduction polynomial x^8 + x^4 + x^3 + x + 1.
mod gf256 {
    /// Multiply two field elements (shift-and-add with reduction).
    ///
    /// Runs a fixed eight iterations regardless of the operands.
    pub const fn mul(mut a: u8, mut b: u8) -> u8 {
        let mut product: u8 = 0;
        let mut i = 0;
        while i < 8 {
            // Branch-free select: mask is 0xFF when the low bit of b is set.
            let mask = 0u8.wrapping_sub(b & 1);
            product ^= a & mask;
            let carry = 0u8.wrapping_sub(a >> 7);
            a = (a << 1) ^ (0x1B & carry);
            b >>= 1;
            i += 1;
        }
        product
    }

    /// Multiplicative inverse as a^254. Zero maps to zero.
    pub const fn inv(a: u8) -> u8 {
        let a2 = mul(a, a);
        let a4 = mul(a2, a2);
        let a8 = mul(a4, a4);
        let a16 = mul(a8, a8);
        let a32 = mul(a16, a16);
        let a64 = mul(a32, a32);
        let a128 = mul(a64, a64);
        mul(mul(mul(mul(mul(mul(a128, a64), a32), a16), a8), a4), a2)
    }

    /// Evaluate `coeffs[0] + coeffs[1]·x + …` at `x` with Horner's method.
    pub fn eval(coeffs: &[u8], x: u8) -> u8 {
        coeffs.iter().rev().fold(0, |acc, &c| mul(acc, x) ^ c)
    }
}

/// One share of a split secret.
///
/// Serialized form (see [`Share::to_bytes`]) is `x || y_0 .. y_{n-1}`.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Share {
    x: u8,
    y: Vec<u8>,
}

impl Share {
    /// Build a share from its x-coordinate and evaluations.
    ///
    /// # Errors
    ///
    /// Returns [`ShamirError::InvalidShare`] if `x` is zero or `y` is empty.
    pub fn new(x: u8, y: Vec<u8>) -> Result<Self, ShamirError> {
        if x == 0 {
            return Err(ShamirError::InvalidShare {
                reason: "x-coordinate must be non-zero".to_owned(),
            });
        }
        if y.is_empty() {
            return Err(ShamirError::InvalidShare {
                reason: "share carries no data".to_owned(),
            });
        }
        Ok(Self { x, y })
    }

    /// Parse the `x || y…` wire form.
    ///
    /// # Errors
    ///
    /// Returns [`ShamirError::InvalidShare`] if the input is shorter than two
    /// bytes or the x-coordinate is zero.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ShamirError> {
        match bytes.split_first() {
            Some((&x, y)) => Self::new(x, y.to_vec()),
            None => Err(ShamirError::InvalidShare {
                reason: "empty share".to_owned(),
            }),
        }
    }

    /// Encode as `x || y…`.
    #[must_use]
    pub fn to_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Zeroizing::new(Vec::with_capacity(self.y.len().saturating_add(1)));
        out.push(self.x);
        out.extend_from_slice(&self.y);
        out
    }

    /// The share's x-coordinate (1..=255).
    #[must_use]
    pub fn x(&self) -> u8 {
        self.x
    }

    /// Length of the secret this share belongs to.
    #[must_use]
    pub fn secret_len(&self) -> usize {
        self.y.len()
    }
}

impl std::fmt::Debug for Share {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Share")
            .field("x", &self.x)
            .field("y", &"[REDACTED]")
            .finish()
    }
}

/// Check `2 <= threshold <= shares` (`shares <= 255` holds by type).
///
/// # Errors
///
/// Returns [`ShamirError::InvalidThreshold`] otherwise.
pub fn validate(shares: u8, threshold: u8) -> Result<(), ShamirError> {
    if threshold < 2 || threshold > shares {
        return Err(ShamirError::InvalidThreshold { shares, threshold });
    }
    Ok(())
}

/// Split `secret` into `shares` shares, any `threshold` of which recover it.
///
/// # Errors
///
/// - [`ShamirError::InvalidThreshold`] unless `2 <= threshold <= shares`.
/// - [`ShamirError::EmptySecret`] if `secret` is empty.
pub fn split(secret: &[u8], shares: u8, threshold: u8) -> Result<Vec<Share>, ShamirError> {
    validate(shares, threshold)?;
    if secret.is_empty() {
        return Err(ShamirError::EmptySecret);
    }

    let mut out: Vec<Share> = (1..=shares)
        .map(|x| Share {
            x,
            y: Vec::with_capacity(secret.len()),
        })
        .collect();

    let mut coeffs = Zeroizing::new(vec![0u8; usize::from(threshold)]);
    for &byte in secret {
        if let Some((constant, random)) = coeffs.split_first_mut() {
            *constant = byte;
            crypto::fill_random(random);
        }
        for share in &mut out {
            share.y.push(gf256::eval(&coeffs, share.x));
        }
    }

    Ok(out)
}

/// Reconstruct the secret from `shares` by Lagrange interpolation at zero.
///
/// Supplying fewer shares than the split threshold returns a wrong value
/// rather than an error.
///
/// # Errors
///
/// - [`ShamirError::NotEnoughShares`] if fewer than two shares are given.
/// - [`ShamirError::DuplicateShare`] if two shares share an x-coordinate.
/// - [`ShamirError::InvalidShare`] if share lengths differ.
pub fn combine(shares: &[Share]) -> Result<Zeroizing<Vec<u8>>, ShamirError> {
    if shares.len() < 2 {
        return Err(ShamirError::NotEnoughShares { got: shares.len() });
    }

    let len = shares[0].y.len();
    let mut seen = [false; 256];
    for share in shares {
        if share.y.len() != len {
            return Err(ShamirError::InvalidShare {
                reason: format!(
                    "share lengths differ: {} and {}",
                    len,
                    share.y.len()
                ),
            });
        }
        let slot = &mut seen[usize::from(share.x)];
        if *slot {
            return Err(ShamirError::DuplicateShare { x: share.x });
        }
        *slot = true;
    }

    // L_j(0) = prod_{k != j} x_k / (x_j - x_k); subtraction is XOR in GF(2^8).
    let basis: Vec<u8> = shares
        .iter()
        .enumerate()
        .map(|(j, sj)| {
            let (num, den) = shares
                .iter()
                .enumerate()
                .filter(|&(k, _)| k != j)
                .fold((1u8, 1u8), |(num, den), (_, sk)| {
                    (gf256::mul(num, sk.x), gf256::mul(den, sj.x ^ sk.x))
                });
            gf256::mul(num, gf256::inv(den))
        })
        .collect();

    let mut secret = Zeroizing::new(vec![0u8; len]);
    for (i, byte) in secret.iter_mut().enumerate() {
        *byte = shares
            .iter()
            .zip(&basis)
            .fold(0u8, |acc, (share, &b)| acc ^ gf256::mul(share.y[i], b));
    }
    Ok(secret)
}
