//! The secure reduction engine.
//!
//! One call = one protected allreduce: mask the payload into scratch, run
//! the real reduction over the masked words, unmask the result in place.
//! [`reduce_single_shot`] does this for the whole payload at once;
//! [`reduce_pipelined`] chunks it into fixed-size blocks and runs a
//! three-stage software pipeline, overlapping the unmasking of block `n-1`
//! and the masking of block `n+1` with the in-flight transfer of block `n`.
//!
//! "Overlap" here is single-threaded: the CPU does cryptographic work while
//! a non-blocking reduction, already issued, progresses beneath this layer.
//! The only suspension point is the explicit wait on that reduction.
//!
//! Failure discipline: every scratch buffer is released on every exit path
//! (structural, via the [`ScratchBuf`] guard), and an issued non-blocking
//! reduction is always retired (waited on) before an error is surfaced,
//! so no in-flight transport operation ever leaks out of a call.
//!
//! The caller (the [`layer`]) is responsible for the admission check and
//! for advancing the group nonce exactly once before either entry point.
//!
//! [`ScratchBuf`]: crate::pool::ScratchBuf
//! [`layer`]: crate::layer

use std::ops::Range;

use thiserror::Error;
use tracing::trace;

use crate::{
    cipher::{
        masking::{self, UnsupportedTransform},
        CipherBackend,
    },
    context::GroupContext,
    pool::{ScratchBuf, ScratchProvider},
    transport::{Collective, ElementKind, GroupId, ReduceOp, TransportError},
};

#[derive(Debug, Error)]
/// An error related to one secure reduction call.
pub enum ReduceError {
    #[error("{0} has no security context; run admission first")]
    NotAdmitted(GroupId),

    #[error("scratch buffer acquisition failed for {0} elements; nothing was sent")]
    ScratchExhausted(usize),

    #[error("send and receive buffers disagree on length ({send} vs {recv})")]
    LengthMismatch { send: usize, recv: usize },

    #[error("{kind} with {op} is outside the protected set")]
    UnsupportedCombination { kind: ElementKind, op: ReduceOp },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<UnsupportedTransform> for ReduceError {
    fn from(err: UnsupportedTransform) -> Self {
        ReduceError::UnsupportedCombination {
            kind: err.kind,
            op: err.op,
        }
    }
}

/// One logical chunk of the overall payload.
#[derive(Debug, Clone, Copy)]
struct Block {
    offset: usize,
    count: usize,
}

impl Block {
    fn range(self) -> Range<usize> {
        self.offset..self.offset + self.count
    }
}

/// Acquires a scratch buffer and masks one block of `send` into it.
#[allow(clippy::too_many_arguments)]
fn mask_into_scratch<'p>(
    backend: &dyn CipherBackend,
    provider: &'p dyn ScratchProvider,
    ctx: &GroupContext,
    send: &[u32],
    block: Block,
    kind: ElementKind,
    op: ReduceOp,
    rank: usize,
    last_rank: bool,
) -> Result<ScratchBuf<'p>, ReduceError> {
    let mut scratch = provider
        .acquire(block.count)
        .ok_or(ReduceError::ScratchExhausted(block.count))?;
    masking::encrypt_block(
        backend,
        kind,
        op,
        &mut scratch,
        &send[block.range()],
        rank,
        ctx.secret_shares(),
        ctx.nonce(),
        last_rank,
    )?;
    Ok(scratch)
}

/// Baseline mode: one scratch buffer, one blocking reduction.
pub fn reduce_single_shot<C: Collective>(
    backend: &dyn CipherBackend,
    provider: &dyn ScratchProvider,
    ctx: &GroupContext,
    comm: &C,
    send: &[u32],
    recv: &mut [u32],
    kind: ElementKind,
    op: ReduceOp,
) -> Result<(), ReduceError> {
    if send.len() != recv.len() {
        return Err(ReduceError::LengthMismatch {
            send: send.len(),
            recv: recv.len(),
        });
    }
    let rank = comm.rank();
    let last_rank = rank + 1 == comm.size();
    let block = Block {
        offset: 0,
        count: send.len(),
    };
    let scratch = mask_into_scratch(
        backend, provider, ctx, send, block, kind, op, rank, last_rank,
    )?;
    comm.allreduce(&scratch, recv, kind, op)?;
    masking::decrypt_block(backend, kind, op, recv, ctx.secret_shares(), ctx.nonce())?;
    Ok(())
}

/// Pipelined mode: fixed-size blocks, two scratch buffers in flight.
///
/// While block `n` is on the wire, block `n-1` is unmasked and block `n+1`
/// is masked. A payload shorter than one block degenerates to a single
/// iteration; a trailing partial block is simply shorter. Block boundaries
/// are not observable in `recv`.
#[allow(clippy::too_many_arguments)]
pub fn reduce_pipelined<C: Collective>(
    backend: &dyn CipherBackend,
    provider: &dyn ScratchProvider,
    ctx: &GroupContext,
    comm: &C,
    send: &[u32],
    recv: &mut [u32],
    kind: ElementKind,
    op: ReduceOp,
    block_size: usize,
) -> Result<(), ReduceError> {
    if send.len() != recv.len() {
        return Err(ReduceError::LengthMismatch {
            send: send.len(),
            recv: recv.len(),
        });
    }
    debug_assert!(block_size > 0);
    let rank = comm.rank();
    let last_rank = rank + 1 == comm.size();

    let mut remaining = send.len();
    let mut current = Block {
        offset: 0,
        count: remaining.min(block_size),
    };
    let mut previous: Option<Block> = None;

    let mut scratch_current = mask_into_scratch(
        backend, provider, ctx, send, current, kind, op, rank, last_rank,
    )?;

    while remaining > 0 {
        trace!(offset = current.offset, count = current.count, "block in flight");
        let pending = comm.allreduce_start(&scratch_current, kind, op)?;

        // Unmask the previous block while the current one is on the wire.
        if let Some(block) = previous {
            if let Err(err) = masking::decrypt_block(
                backend,
                kind,
                op,
                &mut recv[block.range()],
                ctx.secret_shares(),
                ctx.nonce(),
            ) {
                // Retire the in-flight reduction before surfacing.
                let _ = comm.wait(pending, &mut recv[current.range()]);
                return Err(err.into());
            }
        }

        remaining -= current.count;

        // Mask the next block, also while the current one is on the wire.
        let mut staged: Option<(Block, ScratchBuf<'_>)> = None;
        if remaining > 0 {
            let next = Block {
                offset: current.offset + current.count,
                count: remaining.min(block_size),
            };
            match mask_into_scratch(
                backend, provider, ctx, send, next, kind, op, rank, last_rank,
            ) {
                Ok(scratch) => staged = Some((next, scratch)),
                Err(err) => {
                    let _ = comm.wait(pending, &mut recv[current.range()]);
                    return Err(err);
                }
            }
        }

        comm.wait(pending, &mut recv[current.range()])?;

        previous = Some(current);
        match staged {
            // Dropping the old scratch_current releases it; the buffer for
            // the block just waited on is no longer needed.
            Some((next, scratch)) => {
                scratch_current = scratch;
                current = next;
            }
            None => break,
        }
    }
    drop(scratch_current);

    // The last block's result has not been unmasked inside the loop.
    if let Some(block) = previous {
        masking::decrypt_block(
            backend,
            kind,
            op,
            &mut recv[block.range()],
            ctx.secret_shares(),
            ctx.nonce(),
        )?;
    }
    Ok(())
}
