//! Masking and unmasking of reduction payloads.
//!
//! The scheme masks each member's contribution so that only noise crosses
//! the transport, while the masks cancel arithmetically in the reduced
//! result up to a single group-wide term that every member can remove
//! locally.
//!
//! For the integer paths, member `r` adds (or multiplies in) a mask stream
//! derived from its own share, and the highest-ranked member folds in a
//! closing correction: the group stream (derived from the XOR of all
//! shares) minus the sum of every member's stream. All of these are
//! computable by every member because shares are disseminated at admission.
//! After the reduction the aggregate carries exactly one group-stream term,
//! so unmasking is `O(count)` regardless of group size, and integer results
//! are bit-identical to the unprotected reduction.
//!
//! The float path has no closing correction (there is no exact wrapping
//! arithmetic to hide it in): each member adds a small float mask and the
//! unmasking step subtracts the recomputed sum of all members' masks, which
//! costs `O(count * group_size)` and recovers the result up to float
//! rounding.

use thiserror::Error;

use super::CipherBackend;
use crate::transport::{ElementKind, ReduceOp};

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no masking transform for {kind} with {op}")]
/// The `(kind, op)` combination is outside the protected set.
pub struct UnsupportedTransform {
    pub kind: ElementKind,
    pub op: ReduceOp,
}

/// Masks one block of `src` into `dst` for the given combination.
///
/// `last_rank` must be set by exactly the member with the highest rank; the
/// integer transforms place the closing correction term there.
#[allow(clippy::too_many_arguments)]
pub fn encrypt_block(
    backend: &dyn CipherBackend,
    kind: ElementKind,
    op: ReduceOp,
    dst: &mut [u32],
    src: &[u32],
    rank: usize,
    shares: &[u32],
    nonce: u32,
    last_rank: bool,
) -> Result<(), UnsupportedTransform> {
    debug_assert_eq!(dst.len(), src.len());
    match (kind, op) {
        (ElementKind::Uint32, ReduceOp::Sum) => {
            encrypt_uint_sum(backend, dst, src, rank, shares, nonce, last_rank);
            Ok(())
        }
        (ElementKind::Uint32, ReduceOp::Prod) => {
            encrypt_uint_prod(backend, dst, src, rank, shares, nonce, last_rank);
            Ok(())
        }
        (ElementKind::Float32, ReduceOp::Sum) => {
            encrypt_float_sum(backend, dst, src, rank, shares, nonce);
            Ok(())
        }
        (kind, op) => Err(UnsupportedTransform { kind, op }),
    }
}

/// Unmasks one block of a reduced result in place.
pub fn decrypt_block(
    backend: &dyn CipherBackend,
    kind: ElementKind,
    op: ReduceOp,
    buf: &mut [u32],
    shares: &[u32],
    nonce: u32,
) -> Result<(), UnsupportedTransform> {
    match (kind, op) {
        (ElementKind::Uint32, ReduceOp::Sum) => {
            decrypt_uint_sum(backend, buf, shares, nonce);
            Ok(())
        }
        (ElementKind::Uint32, ReduceOp::Prod) => {
            decrypt_uint_prod(backend, buf, shares, nonce);
            Ok(())
        }
        (ElementKind::Float32, ReduceOp::Sum) => {
            decrypt_float_sum(backend, buf, shares, nonce);
            Ok(())
        }
        (kind, op) => Err(UnsupportedTransform { kind, op }),
    }
}

/// Whether a masking transform exists for the combination.
pub fn is_protected(kind: ElementKind, op: ReduceOp) -> bool {
    matches!(
        (kind, op),
        (ElementKind::Uint32, ReduceOp::Sum)
            | (ElementKind::Uint32, ReduceOp::Prod)
            | (ElementKind::Float32, ReduceOp::Sum)
    )
}

/// The group-wide share: the XOR-fold of every member's share.
fn group_share(shares: &[u32]) -> u32 {
    shares.iter().fold(0, |acc, share| acc ^ share)
}

/// Inverse of an odd `a` modulo 2^32, by Newton iteration.
///
/// The initial guess `a` is correct to 3 bits (`a * a ≡ 1 mod 8` for odd
/// `a`) and every step doubles the valid bits.
fn inverse_mod_2_32(a: u32) -> u32 {
    debug_assert_eq!(a & 1, 1);
    let mut x = a;
    for _ in 0..4 {
        x = x.wrapping_mul(2_u32.wrapping_sub(a.wrapping_mul(x)));
    }
    x
}

/// Forces a keystream word into the odd (invertible mod 2^32) residues.
fn odd(word: u32) -> u32 {
    word | 1
}

/// Maps a keystream word to a float mask in `[-0.5, 0.5)`.
fn float_mask(word: u32) -> f32 {
    (word >> 8) as f32 * (1.0 / 16_777_216.0) - 0.5
}

fn encrypt_uint_sum(
    backend: &dyn CipherBackend,
    dst: &mut [u32],
    src: &[u32],
    rank: usize,
    shares: &[u32],
    nonce: u32,
    last_rank: bool,
) {
    backend.fill_keystream(shares[rank], nonce, dst);
    for (word, &value) in dst.iter_mut().zip(src) {
        *word = value.wrapping_add(*word);
    }
    if last_rank {
        // Closing correction: + group stream - every member's stream, so
        // the reduced aggregate carries exactly the group stream.
        let mut stream = vec![0_u32; dst.len()];
        backend.fill_keystream(group_share(shares), nonce, &mut stream);
        for (word, &term) in dst.iter_mut().zip(&stream) {
            *word = word.wrapping_add(term);
        }
        for &share in shares {
            backend.fill_keystream(share, nonce, &mut stream);
            for (word, &term) in dst.iter_mut().zip(&stream) {
                *word = word.wrapping_sub(term);
            }
        }
    }
}

fn decrypt_uint_sum(backend: &dyn CipherBackend, buf: &mut [u32], shares: &[u32], nonce: u32) {
    let mut stream = vec![0_u32; buf.len()];
    backend.fill_keystream(group_share(shares), nonce, &mut stream);
    for (word, &term) in buf.iter_mut().zip(&stream) {
        *word = word.wrapping_sub(term);
    }
}

fn encrypt_uint_prod(
    backend: &dyn CipherBackend,
    dst: &mut [u32],
    src: &[u32],
    rank: usize,
    shares: &[u32],
    nonce: u32,
    last_rank: bool,
) {
    backend.fill_keystream(shares[rank], nonce, dst);
    for (word, &value) in dst.iter_mut().zip(src) {
        *word = value.wrapping_mul(odd(*word));
    }
    if last_rank {
        // Closing correction: * group stream * inverse of every member's
        // stream. All masks are forced odd, hence invertible mod 2^32.
        let mut factor = vec![0_u32; dst.len()];
        backend.fill_keystream(group_share(shares), nonce, &mut factor);
        for word in factor.iter_mut() {
            *word = odd(*word);
        }
        let mut stream = vec![0_u32; dst.len()];
        for &share in shares {
            backend.fill_keystream(share, nonce, &mut stream);
            for (f, &m) in factor.iter_mut().zip(&stream) {
                *f = f.wrapping_mul(inverse_mod_2_32(odd(m)));
            }
        }
        for (word, &f) in dst.iter_mut().zip(&factor) {
            *word = word.wrapping_mul(f);
        }
    }
}

fn decrypt_uint_prod(backend: &dyn CipherBackend, buf: &mut [u32], shares: &[u32], nonce: u32) {
    let mut stream = vec![0_u32; buf.len()];
    backend.fill_keystream(group_share(shares), nonce, &mut stream);
    for (word, &term) in buf.iter_mut().zip(&stream) {
        *word = word.wrapping_mul(inverse_mod_2_32(odd(term)));
    }
}

fn encrypt_float_sum(
    backend: &dyn CipherBackend,
    dst: &mut [u32],
    src: &[u32],
    rank: usize,
    shares: &[u32],
    nonce: u32,
) {
    backend.fill_keystream(shares[rank], nonce, dst);
    for (word, &value) in dst.iter_mut().zip(src) {
        *word = (f32::from_bits(value) + float_mask(*word)).to_bits();
    }
}

fn decrypt_float_sum(backend: &dyn CipherBackend, buf: &mut [u32], shares: &[u32], nonce: u32) {
    let mut total = vec![0_f32; buf.len()];
    let mut stream = vec![0_u32; buf.len()];
    for &share in shares {
        backend.fill_keystream(share, nonce, &mut stream);
        for (sum, &word) in total.iter_mut().zip(&stream) {
            *sum += float_mask(word);
        }
    }
    for (word, &masks) in buf.iter_mut().zip(&total) {
        *word = (f32::from_bits(*word) - masks).to_bits();
    }
}
