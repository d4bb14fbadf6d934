//! The collective-communication boundary.
//!
//! The secure layer never moves bytes itself. Everything that touches the
//! network goes through the [`Collective`] trait: blocking and non-blocking
//! allreduce, the in-place all-gather and the broadcast used by group
//! admission, and the group-membership queries. A real runtime (MPI, NCCL,
//! gloo, ...) is bound by implementing this trait; the crate ships a
//! thread-backed loopback runtime in [`sim`] for tests and local runs.
//!
//! Payloads are sequences of 32-bit words. Float payloads travel as `f32`
//! bit patterns; [`ElementKind`] decides how the transport combines them.
//! Integer reductions are performed with wrapping arithmetic (mod 2^32),
//! which the masking scheme relies on for exact cancellation.

use std::fmt;

use thiserror::Error;

pub mod sim;

/// The element interpretation of a reduction payload.
///
/// Both kinds occupy one 32-bit word per element.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ElementKind {
    /// Unsigned 32-bit integers, reduced with wrapping arithmetic.
    Uint32,
    /// IEEE 754 single-precision floats, carried as their bit patterns.
    Float32,
}

impl ElementKind {
    /// The size of one element in bytes.
    pub const fn size(self) -> usize {
        4
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElementKind::Uint32 => write!(f, "u32"),
            ElementKind::Float32 => write!(f, "f32"),
        }
    }
}

/// The combining operation of a reduction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Prod,
}

impl fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReduceOp::Sum => write!(f, "sum"),
            ReduceOp::Prod => write!(f, "prod"),
        }
    }
}

/// An opaque handle identifying one communication group.
///
/// Handles are only compared and hashed; the runtime decides how they are
/// produced. A handle may be reused by the runtime after the group is
/// destroyed, which is why [`SecureLayer::retire`] must evict the security
/// context of a retired group before its handle can come back.
///
/// [`SecureLayer::retire`]: crate::layer::SecureLayer::retire
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GroupId(u64);

impl GroupId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl From<u64> for GroupId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

#[derive(Debug, Error)]
/// A failure reported by the underlying collective runtime.
///
/// Transport failures are propagated verbatim to the caller after owned
/// resources have been released; nothing is retried at this layer.
pub enum TransportError {
    #[error("collective operation failed: {0}")]
    Collective(String),
}

/// One communication group of a collective runtime.
///
/// All members of a group must invoke collectives in the same relative
/// order with matching arguments. That obligation is inherited from the
/// collective-communication model and cannot be verified here; the secure
/// layer additionally depends on it for nonce synchrony (see
/// [`GroupContext`]).
///
/// [`GroupContext`]: crate::context::GroupContext
pub trait Collective {
    /// Handle for an issued, not yet completed non-blocking reduction.
    type Pending;

    /// The opaque handle of this group.
    fn id(&self) -> GroupId;

    /// The number of members in this group.
    fn size(&self) -> usize;

    /// This process's rank within the group, in `0..size()`.
    fn rank(&self) -> usize;

    /// Starts a non-blocking allreduce of `send`.
    ///
    /// The result becomes available through [`wait`](Collective::wait).
    fn allreduce_start(
        &self,
        send: &[u32],
        kind: ElementKind,
        op: ReduceOp,
    ) -> Result<Self::Pending, TransportError>;

    /// Completes a non-blocking allreduce, writing the reduced values into
    /// `recv`. `recv` must have the length of the `send` buffer the
    /// operation was started with.
    fn wait(&self, pending: Self::Pending, recv: &mut [u32]) -> Result<(), TransportError>;

    /// Blocking allreduce of `send` into `recv`.
    fn allreduce(
        &self,
        send: &[u32],
        recv: &mut [u32],
        kind: ElementKind,
        op: ReduceOp,
    ) -> Result<(), TransportError> {
        let pending = self.allreduce_start(send, kind, op)?;
        self.wait(pending, recv)
    }

    /// In-place all-gather: member `r` contributes `buf[r]`, and on return
    /// every slot holds the corresponding member's contribution. `buf` must
    /// have length [`size()`](Collective::size).
    fn all_gather_in_place(&self, buf: &mut [u32]) -> Result<(), TransportError>;

    /// Broadcasts `word` from `root` to every member.
    fn broadcast(&self, word: &mut u32, root: usize) -> Result<(), TransportError>;
}
