//! # Shroud: transparent encryption for collective reductions
//!
//! Shroud sits between an application and its collective-communication
//! transport and encrypts reduction payloads in flight. Each member of a
//! group masks its contribution with a keystream before the data leaves
//! the process; the masks are arranged so that they cancel arithmetically
//! in the reduced result, up to a single group-wide term every member
//! removes locally. An observer of the transport sees only noise, while
//! callers keep their existing allreduce call shape and, for the integer
//! combinations, get bit-identical results.
//!
//! ## Protected combinations
//!
//! 32-bit unsigned sum, 32-bit unsigned product and 32-bit float sum are
//! protected. Anything else either falls through to the unprotected
//! reduction (with a warning) or is rejected, depending on the
//! `cipher.strict` setting. Float sums are recovered up to float rounding,
//! not bit-exactly.
//!
//! ## Caller obligations
//!
//! The layer inherits the lockstep model of the transport underneath: all
//! members of a group must make the same sequence of [`SecureLayer`] calls
//! with the same element kind, operation and count. Admission is a
//! collective handshake; after it, the group nonce rotates locally and
//! identically on every member, once per reduction call, with no further
//! communication. A member deviating from the sequence desynchronizes the
//! group's keystreams and corrupts results silently.
//!
//! ## Example
//!
//! ```no_run
//! use shroud::{
//!     settings::Settings,
//!     transport::{sim, Collective, ElementKind, ReduceOp},
//!     SecureLayer,
//! };
//!
//! let results = sim::run_members(4, |comm| {
//!     let mut layer = SecureLayer::new(&Settings::default());
//!     layer.admit(&comm).unwrap();
//!     let send = vec![comm.rank() as u32; 1024];
//!     let mut recv = vec![0_u32; 1024];
//!     layer
//!         .allreduce(&comm, &send, &mut recv, ElementKind::Uint32, ReduceOp::Sum)
//!         .unwrap();
//!     recv
//! });
//! assert_eq!(results[0][0], 6);
//! ```

pub mod cipher;
pub mod context;
pub mod engine;
pub mod layer;
pub mod pool;
pub mod settings;
pub mod transport;

pub use self::{
    context::AdmissionError,
    engine::ReduceError,
    layer::SecureLayer,
    settings::{Settings, SettingsError},
    transport::{Collective, ElementKind, GroupId, ReduceOp},
};
