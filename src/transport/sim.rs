//! A thread-backed loopback runtime.
//!
//! [`spawn_group`] creates an in-process group with one [`SimComm`] handle
//! per member; each handle is meant to be driven from its own thread, the
//! way one process per rank would drive a real runtime. Collectives meet at
//! a barrier-style exchange: every member deposits its contribution, the
//! last arrival combines them, and every member then drains the shared
//! result. Members must call collectives in lockstep, exactly as the
//! [`Collective`] contract demands of a real runtime.
//!
//! The runtime exists for tests and local experiments. It supports group
//! duplication ([`SimComm::dup`]) and one-shot failure injection
//! ([`SimComm::inject_failure`]) so that error paths can be exercised on
//! all members at once.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
    Condvar,
    Mutex,
    MutexGuard,
};

use super::{Collective, ElementKind, GroupId, ReduceOp, TransportError};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

fn fresh_group_id() -> GroupId {
    GroupId::new(NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed))
}

/// Creates a simulated group of `size` members.
///
/// The returned handles share one group; handle `r` is the member with
/// rank `r`.
pub fn spawn_group(size: usize) -> Vec<SimComm> {
    let shared = Arc::new(Shared::new(size));
    (0..size)
        .map(|rank| SimComm {
            shared: Arc::clone(&shared),
            rank,
        })
        .collect()
}

/// Runs `f` once per member of a fresh group of `size`, each on its own
/// thread, and returns the per-rank results in rank order.
pub fn run_members<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(SimComm) -> T + Send + Sync,
{
    let comms = spawn_group(size);
    let f = &f;
    let mut results: Vec<Option<T>> = (0..size).map(|_| None).collect();
    std::thread::scope(|scope| {
        for (slot, comm) in results.iter_mut().zip(comms) {
            scope.spawn(move || {
                *slot = Some(f(comm));
            });
        }
    });
    // A panicking member propagates out of the scope above, so every slot
    // is filled by the time we get here.
    results
        .into_iter()
        .map(|slot| slot.expect("member thread finished without a result"))
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Phase {
    Fill,
    Drain,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Exchange {
    Reduce(ElementKind, ReduceOp),
    Gather,
    Broadcast(usize),
    Dup,
}

struct Round {
    phase: Phase,
    exchange: Option<Exchange>,
    deposits: Vec<Option<Vec<u32>>>,
    result: Vec<u32>,
    subgroup: Option<Arc<Shared>>,
    failed: bool,
    inject: bool,
    collected: usize,
    taken: usize,
}

struct Shared {
    id: GroupId,
    size: usize,
    round: Mutex<Round>,
    progress: Condvar,
}

impl Shared {
    fn new(size: usize) -> Self {
        Self {
            id: fresh_group_id(),
            size,
            round: Mutex::new(Round {
                phase: Phase::Fill,
                exchange: None,
                deposits: (0..size).map(|_| None).collect(),
                result: Vec::new(),
                subgroup: None,
                failed: false,
                inject: false,
                collected: 0,
                taken: 0,
            }),
            progress: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Round> {
        // Poisoning means a member panicked mid-collective; the simulation
        // cannot recover from that.
        self.round.lock().expect("sim group lock poisoned")
    }

    /// Deposits one member's contribution; the last arrival combines the
    /// round. Returns immediately, like a non-blocking collective.
    fn start(&self, rank: usize, data: Vec<u32>, exchange: Exchange) -> SimPending {
        let mut round = self.lock();
        while round.phase == Phase::Drain {
            round = self
                .progress
                .wait(round)
                .expect("sim group lock poisoned");
        }
        if round.collected == 0 {
            round.exchange = Some(exchange);
        } else {
            debug_assert_eq!(
                round.exchange,
                Some(exchange),
                "members disagree on the collective being performed"
            );
        }
        debug_assert!(
            round.deposits[rank].is_none(),
            "member re-entered a collective before completing the previous one"
        );
        let len = data.len();
        round.deposits[rank] = Some(data);
        round.collected += 1;
        if round.collected == self.size {
            self.complete(&mut round);
            round.phase = Phase::Drain;
            round.taken = 0;
            self.progress.notify_all();
        }
        SimPending { len }
    }

    fn complete(&self, round: &mut Round) {
        // Sampled here so that an injection from any member is guaranteed
        // to hit the round it precedes: completion cannot happen before the
        // injecting member has deposited.
        round.failed = round.inject;
        round.inject = false;
        let deposits: Vec<Vec<u32>> = round
            .deposits
            .iter_mut()
            .map(|slot| slot.take().unwrap_or_default())
            .collect();
        if round.failed {
            return;
        }
        match round.exchange {
            Some(Exchange::Reduce(kind, op)) => {
                let mut iter = deposits.into_iter();
                let mut acc = iter.next().unwrap_or_default();
                for contribution in iter {
                    for (a, b) in acc.iter_mut().zip(contribution) {
                        *a = combine_word(kind, op, *a, b);
                    }
                }
                round.result = acc;
            }
            Some(Exchange::Gather) => {
                round.result = deposits.into_iter().flatten().collect();
            }
            Some(Exchange::Broadcast(root)) => {
                round.result = deposits.into_iter().nth(root).unwrap_or_default();
            }
            Some(Exchange::Dup) => {
                round.result = Vec::new();
                round.subgroup = Some(Arc::new(Shared::new(self.size)));
            }
            None => unreachable!("round completed without an exchange"),
        }
    }

    /// Drains one member's share of the round result into `recv`. Blocks
    /// until the round has completed. The last member to drain resets the
    /// round for the next collective.
    fn finish(&self, recv: &mut [u32]) -> Result<Option<Arc<Shared>>, TransportError> {
        let mut round = self.lock();
        while round.phase == Phase::Fill {
            round = self
                .progress
                .wait(round)
                .expect("sim group lock poisoned");
        }
        let failed = round.failed;
        let subgroup = round.subgroup.clone();
        if !failed {
            debug_assert_eq!(recv.len(), round.result.len());
            recv.copy_from_slice(&round.result);
        }
        round.taken += 1;
        if round.taken == self.size {
            round.phase = Phase::Fill;
            round.exchange = None;
            round.result = Vec::new();
            round.subgroup = None;
            round.failed = false;
            round.collected = 0;
            self.progress.notify_all();
        }
        if failed {
            Err(TransportError::Collective("injected failure".into()))
        } else {
            Ok(subgroup)
        }
    }
}

fn combine_word(kind: ElementKind, op: ReduceOp, a: u32, b: u32) -> u32 {
    match (kind, op) {
        (ElementKind::Uint32, ReduceOp::Sum) => a.wrapping_add(b),
        (ElementKind::Uint32, ReduceOp::Prod) => a.wrapping_mul(b),
        (ElementKind::Float32, ReduceOp::Sum) => {
            (f32::from_bits(a) + f32::from_bits(b)).to_bits()
        }
        (ElementKind::Float32, ReduceOp::Prod) => {
            (f32::from_bits(a) * f32::from_bits(b)).to_bits()
        }
    }
}

/// One member's handle onto a simulated group.
#[derive(Clone)]
pub struct SimComm {
    shared: Arc<Shared>,
    rank: usize,
}

/// An issued, not yet completed simulated reduction.
#[must_use = "a pending reduction must be waited on"]
pub struct SimPending {
    len: usize,
}

impl SimComm {
    /// Collectively duplicates the group: every member calls `dup` and
    /// receives a handle onto a fresh group with a fresh [`GroupId`] and
    /// the same membership.
    pub fn dup(&self) -> Result<SimComm, TransportError> {
        let _pending = self.shared.start(self.rank, Vec::new(), Exchange::Dup);
        let subgroup = self.shared.finish(&mut [])?;
        // The completing member always populates the subgroup slot.
        let shared = subgroup.expect("dup round completed without a subgroup");
        Ok(SimComm {
            shared,
            rank: self.rank,
        })
    }

    /// Makes the next collective on this group fail on every member.
    pub fn inject_failure(&self) {
        self.shared.lock().inject = true;
    }
}

impl Collective for SimComm {
    type Pending = SimPending;

    fn id(&self) -> GroupId {
        self.shared.id
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn rank(&self) -> usize {
        self.rank
    }

    fn allreduce_start(
        &self,
        send: &[u32],
        kind: ElementKind,
        op: ReduceOp,
    ) -> Result<SimPending, TransportError> {
        Ok(self
            .shared
            .start(self.rank, send.to_vec(), Exchange::Reduce(kind, op)))
    }

    fn wait(&self, pending: SimPending, recv: &mut [u32]) -> Result<(), TransportError> {
        debug_assert_eq!(pending.len, recv.len());
        self.shared.finish(recv).map(|_| ())
    }

    fn all_gather_in_place(&self, buf: &mut [u32]) -> Result<(), TransportError> {
        debug_assert_eq!(buf.len(), self.shared.size);
        let _pending = self
            .shared
            .start(self.rank, vec![buf[self.rank]], Exchange::Gather);
        self.shared.finish(buf).map(|_| ())
    }

    fn broadcast(&self, word: &mut u32, root: usize) -> Result<(), TransportError> {
        let _pending = self
            .shared
            .start(self.rank, vec![*word], Exchange::Broadcast(root));
        let mut out = [0_u32; 1];
        self.shared.finish(&mut out)?;
        *word = out[0];
        Ok(())
    }
}
