//! The `ChaCha20` backend.
//!
//! Plays the role the hardware-accelerated path plays in comparable
//! interposers: a vetted stream cipher as the keystream source, seeded per
//! `(share, nonce)` pair. On targets with SIMD support the `chacha` core
//! vectorizes well, which is where the speedup over the reference mixer
//! comes from.

use rand::{rngs::OsRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

use super::CipherBackend;

// Domain tag for the nonce-advance stream, so that advancing a nonce never
// aliases a keystream derived from a share equal to the tag.
const ADVANCE_DOMAIN: u32 = 0x5eed_ad7a;

fn seed_for(share: u32, nonce: u32) -> [u8; 32] {
    let mut seed = [0_u8; 32];
    seed[..4].copy_from_slice(&share.to_le_bytes());
    seed[4..8].copy_from_slice(&nonce.to_le_bytes());
    seed[8..12].copy_from_slice(&share.wrapping_mul(0x9e37_79b9).to_le_bytes());
    seed[12..16].copy_from_slice(&nonce.wrapping_mul(0x85eb_ca6b).to_le_bytes());
    seed
}

/// A keystream backend on top of the `ChaCha20` stream cipher.
#[derive(Debug, Default, Clone, Copy)]
pub struct Chacha20Backend;

impl CipherBackend for Chacha20Backend {
    fn fill_keystream(&self, share: u32, nonce: u32, out: &mut [u32]) {
        let mut prng = ChaCha20Rng::from_seed(seed_for(share, nonce));
        for word in out.iter_mut() {
            *word = prng.next_u32();
        }
    }

    fn advance(&self, nonce: u32) -> u32 {
        ChaCha20Rng::from_seed(seed_for(ADVANCE_DOMAIN, nonce)).next_u32()
    }

    fn fresh_secret(&self) -> u32 {
        OsRng.next_u32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keystream_is_deterministic() {
        let backend = Chacha20Backend;
        let mut a = vec![0_u32; 16];
        let mut b = vec![0_u32; 16];
        backend.fill_keystream(99, 1234, &mut a);
        backend.fill_keystream(99, 1234, &mut b);
        assert_eq!(a, b);
    }

    #[test]
    fn test_keystream_depends_on_share_and_nonce() {
        let backend = Chacha20Backend;
        let mut base = vec![0_u32; 16];
        let mut other_share = vec![0_u32; 16];
        let mut other_nonce = vec![0_u32; 16];
        backend.fill_keystream(1, 7, &mut base);
        backend.fill_keystream(2, 7, &mut other_share);
        backend.fill_keystream(1, 8, &mut other_nonce);
        assert_ne!(base, other_share);
        assert_ne!(base, other_nonce);
    }

    #[test]
    fn test_keystream_prefix_is_stable() {
        let backend = Chacha20Backend;
        let mut short = vec![0_u32; 8];
        let mut long = vec![0_u32; 64];
        backend.fill_keystream(3, 11, &mut short);
        backend.fill_keystream(3, 11, &mut long);
        assert_eq!(short[..], long[..8]);
    }

    #[test]
    fn test_advance_is_deterministic_and_moves() {
        let backend = Chacha20Backend;
        let n1 = backend.advance(42);
        assert_eq!(n1, backend.advance(42));
        assert_ne!(n1, 42);
    }
}
