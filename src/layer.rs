//! The transparent security layer.
//!
//! [`SecureLayer`] is the single entry point a host runtime wires its
//! collective calls through. It owns the per-group security contexts, the
//! keystream backend and the scratch provider, all selected from
//! [`Settings`] at construction. Callers keep their existing call shape:
//! [`SecureLayer::allreduce`] takes the same buffers, element kind and
//! operation the unprotected reduction takes, and returns bit-identical
//! results for the integer combinations.
//!
//! Lockstep obligations carry over from the underlying transport: all
//! members of a group must make the same sequence of `admit`, `allreduce`
//! and `retire` calls with the same element kind, operation and count.

use tracing::{debug, info, warn};

use crate::{
    cipher::{masking, Chacha20Backend, CipherBackend, ReferenceBackend},
    context::{self, AdmissionError, ContextStore},
    engine::{self, ReduceError},
    pool::{HeapScratch, PooledScratch, ScratchProvider},
    settings::{BackendKind, ProviderKind, Settings},
    transport::{Collective, ElementKind, ReduceOp},
};

/// The security layer for one process.
///
/// Not `Sync`: a process drives its collectives from one thread, matching
/// the lockstep model of the transport underneath.
pub struct SecureLayer {
    backend: Box<dyn CipherBackend>,
    provider: Box<dyn ScratchProvider>,
    store: ContextStore,
    strict: bool,
    pipelined: bool,
    block_size: usize,
}

impl SecureLayer {
    /// Builds a layer from validated settings.
    pub fn new(settings: &Settings) -> Self {
        let backend: Box<dyn CipherBackend> = match settings.cipher.backend {
            BackendKind::Reference => Box::new(ReferenceBackend),
            BackendKind::Chacha20 => Box::new(Chacha20Backend),
        };
        let provider: Box<dyn ScratchProvider> = match settings.scratch.provider {
            ProviderKind::Heap => Box::new(HeapScratch::new()),
            ProviderKind::Pool => Box::new(PooledScratch::new(
                settings.scratch.pool_buffers,
                settings.scratch.pool_buffer_len,
            )),
        };
        info!(
            backend = ?settings.cipher.backend,
            strict = settings.cipher.strict,
            provider = ?settings.scratch.provider,
            pipelined = settings.pipeline.enabled,
            block_size = settings.pipeline.block_size,
            "secure layer initialized"
        );
        Self {
            backend,
            provider,
            store: ContextStore::new(),
            strict: settings.cipher.strict,
            pipelined: settings.pipeline.enabled,
            block_size: settings.pipeline.block_size,
        }
    }

    /// Runs the admission handshake for a group. Collective.
    pub fn admit<C: Collective>(&mut self, comm: &C) -> Result<(), AdmissionError> {
        context::admit(&mut self.store, self.backend.as_ref(), comm)
    }

    /// Drops a group's security context. Local.
    ///
    /// Returns whether the group was admitted. After retirement the handle
    /// can be re-admitted, with fresh key material.
    pub fn retire<C: Collective>(&mut self, comm: &C) -> bool {
        let evicted = self.store.evict(comm.id());
        if evicted {
            debug!(group = %comm.id(), "group retired");
        }
        evicted
    }

    /// Whether a group currently holds a security context.
    pub fn is_admitted<C: Collective>(&self, comm: &C) -> bool {
        self.store.contains(comm.id())
    }

    /// A protected allreduce over `comm`.
    ///
    /// For a combination outside the protected set the behavior depends on
    /// the `cipher.strict` setting: an error in strict mode, a logged
    /// fall-through to the unprotected reduction otherwise. The fall-through
    /// does not require admission and touches no key material.
    pub fn allreduce<C: Collective>(
        &mut self,
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
        if !masking::is_protected(kind, op) {
            if self.strict {
                return Err(ReduceError::UnsupportedCombination { kind, op });
            }
            warn!(%kind, %op, "combination not protected, reducing in the clear");
            return comm.allreduce(send, recv, kind, op).map_err(Into::into);
        }

        let ctx = self
            .store
            .get_mut(comm.id())
            .ok_or_else(|| ReduceError::NotAdmitted(comm.id()))?;
        // One rotation per call, before any block is masked; all members
        // rotate identically because they reach this point in lockstep.
        ctx.advance_nonce(self.backend.as_ref());
        let ctx = &*ctx;

        if self.pipelined && send.len() > self.block_size {
            engine::reduce_pipelined(
                self.backend.as_ref(),
                self.provider.as_ref(),
                ctx,
                comm,
                send,
                recv,
                kind,
                op,
                self.block_size,
            )
        } else {
            engine::reduce_single_shot(
                self.backend.as_ref(),
                self.provider.as_ref(),
                ctx,
                comm,
                send,
                recv,
                kind,
                op,
            )
        }
    }

    /// The scratch provider's counters, for diagnostics.
    pub fn scratch_stats(&self) -> (usize, u64, u64) {
        (
            self.provider.outstanding(),
            self.provider.acquired(),
            self.provider.released(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        settings::{CipherSettings, PipelineSettings, ScratchSettings},
        transport::sim::run_members,
    };

    fn layer(settings: &Settings) -> SecureLayer {
        settings.validate().unwrap();
        SecureLayer::new(settings)
    }

    fn payload(rank: usize, count: usize) -> Vec<u32> {
        (0..count)
            .map(|i| (rank as u32).wrapping_add(i as u32).wrapping_mul(7))
            .collect()
    }

    fn plain_sum(size: usize, count: usize) -> Vec<u32> {
        (0..count)
            .map(|i| {
                (0..size).fold(0_u32, |acc, rank| acc.wrapping_add(payload(rank, count)[i]))
            })
            .collect()
    }

    #[test]
    fn test_admit_reduce_retire_lifecycle() {
        let count = 25;
        let results = run_members(3, |comm| {
            let mut layer = layer(&Settings::default());
            layer.admit(&comm).unwrap();
            assert!(layer.is_admitted(&comm));
            let send = payload(comm.rank(), count);
            let mut recv = vec![0_u32; count];
            layer
                .allreduce(&comm, &send, &mut recv, ElementKind::Uint32, ReduceOp::Sum)
                .unwrap();
            assert!(layer.retire(&comm));
            assert!(!layer.is_admitted(&comm));
            assert!(!layer.retire(&comm));
            recv
        });
        let expected = plain_sum(3, count);
        for recv in results {
            assert_eq!(recv, expected);
        }
    }

    #[test]
    fn test_reduce_without_admission_is_rejected() {
        let results = run_members(2, |comm| {
            let mut layer = layer(&Settings::default());
            let mut recv = vec![0_u32; 4];
            let err = layer
                .allreduce(
                    &comm,
                    &[1, 2, 3, 4],
                    &mut recv,
                    ElementKind::Uint32,
                    ReduceOp::Sum,
                )
                .unwrap_err();
            matches!(err, ReduceError::NotAdmitted(id) if id == comm.id())
        });
        assert!(results.into_iter().all(|rejected| rejected));
    }

    /// An unprotected combination falls through to the plain reduction and
    /// touches no scratch buffer and no key material.
    #[test]
    fn test_fallback_reduces_in_the_clear() {
        let results = run_members(2, |comm| {
            let mut layer = layer(&Settings::default());
            // No admission either: the fall-through must not need one.
            let send: Vec<u32> = (0..6).map(|i| (i as f32 * 1.5).to_bits()).collect();
            let mut recv = vec![0_u32; 6];
            layer
                .allreduce(&comm, &send, &mut recv, ElementKind::Float32, ReduceOp::Prod)
                .unwrap();
            assert_eq!(layer.scratch_stats(), (0, 0, 0));
            recv
        });
        for recv in results {
            for (i, word) in recv.iter().enumerate() {
                let expected = (i as f32 * 1.5) * (i as f32 * 1.5);
                assert!((f32::from_bits(*word) - expected).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_strict_mode_rejects_unprotected_combination() {
        let settings = Settings {
            cipher: CipherSettings {
                strict: true,
                ..CipherSettings::default()
            },
            ..Settings::default()
        };
        // Local rejection, no collective: one member is enough.
        let comm = crate::transport::sim::spawn_group(1).pop().unwrap();
        let mut layer = layer(&settings);
        layer.admit(&comm).unwrap();
        let mut recv = vec![0_u32; 2];
        let err = layer
            .allreduce(
                &comm,
                &[1, 2],
                &mut recv,
                ElementKind::Float32,
                ReduceOp::Prod,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            ReduceError::UnsupportedCombination {
                kind: ElementKind::Float32,
                op: ReduceOp::Prod,
            }
        ));
    }

    #[test]
    fn test_pipelined_layer_with_pooled_scratch() {
        let settings = Settings {
            scratch: ScratchSettings {
                provider: ProviderKind::Pool,
                pool_buffers: 2,
                pool_buffer_len: 64,
            },
            pipeline: PipelineSettings {
                enabled: true,
                block_size: 64,
            },
            ..Settings::default()
        };
        let count = 200;
        let results = run_members(4, |comm| {
            let mut layer = layer(&settings);
            layer.admit(&comm).unwrap();
            let send = payload(comm.rank(), count);
            let mut recv = vec![0_u32; count];
            layer
                .allreduce(&comm, &send, &mut recv, ElementKind::Uint32, ReduceOp::Sum)
                .unwrap();
            let (outstanding, acquired, released) = layer.scratch_stats();
            assert_eq!(outstanding, 0);
            assert_eq!(acquired, released);
            recv
        });
        let expected = plain_sum(4, count);
        for recv in results {
            assert_eq!(recv, expected);
        }
    }

    /// Payloads within one block stay single-shot even with pipelining on,
    /// so a single pool buffer suffices for them.
    #[test]
    fn test_small_payload_skips_pipeline() {
        let settings = Settings {
            pipeline: PipelineSettings {
                enabled: true,
                block_size: 64,
            },
            ..Settings::default()
        };
        let results = run_members(2, |comm| {
            let mut layer = layer(&settings);
            layer.admit(&comm).unwrap();
            let send = payload(comm.rank(), 64);
            let mut recv = vec![0_u32; 64];
            layer
                .allreduce(&comm, &send, &mut recv, ElementKind::Uint32, ReduceOp::Sum)
                .unwrap();
            let (_, acquired, _) = layer.scratch_stats();
            // One acquire means one block, i.e. the single-shot path.
            assert_eq!(acquired, 1);
            recv
        });
        let expected = plain_sum(2, 64);
        for recv in results {
            assert_eq!(recv, expected);
        }
    }

    #[test]
    fn test_retire_and_readmit_keeps_working() {
        let count = 10;
        let results = run_members(2, |comm| {
            let mut layer = layer(&Settings::default());
            let send = payload(comm.rank(), count);
            let mut recv = vec![0_u32; count];
            layer.admit(&comm).unwrap();
            layer
                .allreduce(&comm, &send, &mut recv, ElementKind::Uint32, ReduceOp::Sum)
                .unwrap();
            layer.retire(&comm);
            layer.admit(&comm).unwrap();
            layer
                .allreduce(&comm, &send, &mut recv, ElementKind::Uint32, ReduceOp::Sum)
                .unwrap();
            recv
        });
        let expected = plain_sum(2, count);
        for recv in results {
            assert_eq!(recv, expected);
        }
    }

    #[test]
    fn test_chacha_backend_via_settings() {
        let settings = Settings {
            cipher: CipherSettings {
                backend: BackendKind::Chacha20,
                strict: false,
            },
            ..Settings::default()
        };
        let count = 17;
        let results = run_members(3, |comm| {
            let mut layer = layer(&settings);
            layer.admit(&comm).unwrap();
            let send = payload(comm.rank(), count);
            let mut recv = vec![0_u32; count];
            layer
                .allreduce(&comm, &send, &mut recv, ElementKind::Uint32, ReduceOp::Prod)
                .unwrap();
            recv
        });
        let first = &results[0];
        for recv in &results {
            assert_eq!(recv, first);
        }
    }
}
