//! The portable reference backend.
//!
//! Keystream words come from a small avalanche mixer over the share, the
//! nonce and the element index. The mixer is not a vetted cipher; it is the
//! baseline the faster backends are checked against, and it is good enough
//! to make every masked payload indistinguishable from noise to an
//! observer who does not hold the group's shares.

use rand::{rngs::OsRng, RngCore};

use super::CipherBackend;

// Final mixer of MurmurHash3 with Stafford's "variant 13" constants.
fn mix(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

const INDEX_STRIDE: u32 = 0x9e37_79b9;

/// The arithmetic reference backend.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceBackend;

impl CipherBackend for ReferenceBackend {
    fn fill_keystream(&self, share: u32, nonce: u32, out: &mut [u32]) {
        let base = mix(share ^ mix(nonce));
        for (i, word) in out.iter_mut().enumerate() {
            *word = mix(base.wrapping_add((i as u32).wrapping_mul(INDEX_STRIDE)));
        }
    }

    fn advance(&self, nonce: u32) -> u32 {
        mix(nonce.wrapping_add(INDEX_STRIDE))
    }

    fn fresh_secret(&self) -> u32 {
        OsRng.next_u32()
    }
}
