//! The cipher-backend boundary and the masking transforms.
//!
//! A [`CipherBackend`] supplies three primitives: a deterministic keystream
//! derived from a `(share, nonce)` pair, the keystream-advance step that
//! rotates a group's nonce, and a source of fresh secrets for admission.
//! Everything arithmetic (how keystream words become additive or
//! multiplicative masks, and how they cancel across the group) lives in
//! [`masking`] and is shared by all backends.
//!
//! Two backends ship with the crate: [`reference::ReferenceBackend`], a
//! portable integer mixer, and [`chacha::Chacha20Backend`], which draws its
//! keystream from the `ChaCha20` stream cipher. The backend is selected
//! once at startup (see [`Settings`]) and injected by reference; there is
//! no per-call backend dispatch beyond that one choice.
//!
//! [`Settings`]: crate::settings::Settings

pub mod chacha;
pub mod masking;
pub mod reference;

pub use self::{chacha::Chacha20Backend, reference::ReferenceBackend};

/// A pluggable keystream source.
///
/// Implementations must be deterministic in `fill_keystream` and `advance`:
/// every group member calls both with identical arguments and relies on
/// getting identical results without further communication.
pub trait CipherBackend {
    /// Fills `out` with keystream words derived from `(share, nonce)`.
    ///
    /// Word `i` depends only on `share`, `nonce` and `i`.
    fn fill_keystream(&self, share: u32, nonce: u32, out: &mut [u32]);

    /// Deterministically derives the successor of `nonce`.
    fn advance(&self, nonce: u32) -> u32;

    /// Draws a fresh secret from the process's entropy source.
    ///
    /// Only used during group admission; never on the reduction hot path.
    fn fresh_secret(&self) -> u32;
}
