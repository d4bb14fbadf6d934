//! Scratch buffers for in-flight masked payloads.
//!
//! The engine never sends from the caller's buffer: every block is masked
//! into a scratch buffer owned for exactly the lifetime of that block's
//! reduction. [`ScratchBuf`] is an RAII guard: dropping it returns the
//! buffer to its provider, so the one-release-per-acquire rule holds on
//! every path, including early error returns.
//!
//! Two providers ship with the crate: [`HeapScratch`] allocates per
//! acquire, [`PooledScratch`] hands out pre-allocated fixed-length buffers
//! and fails (rather than blocks) when exhausted. Pipelined mode keeps up
//! to two buffers in flight, so a pool used with it needs at least two
//! buffers (enforced at settings validation).
//!
//! Providers count acquires and releases. The counters are observational
//! only, but they let tests pin down the lifetime discipline.

use std::cell::{Cell, RefCell};
use std::ops::{Deref, DerefMut};

/// A provider of fixed-purpose scratch buffers.
///
/// The layer is single-threaded per process; providers use interior
/// mutability rather than locks.
pub trait ScratchProvider {
    /// Acquires a buffer of `len` words, or `None` if the provider cannot
    /// supply one right now.
    fn acquire(&self, len: usize) -> Option<ScratchBuf<'_>>;

    /// Takes a buffer back. Called by [`ScratchBuf`] on drop; not intended
    /// to be called directly.
    #[doc(hidden)]
    fn reclaim(&self, words: Box<[u32]>);

    /// Buffers currently acquired and not yet released.
    fn outstanding(&self) -> usize;

    /// Total number of successful acquires.
    fn acquired(&self) -> u64;

    /// Total number of releases.
    fn released(&self) -> u64;
}

/// An exclusively owned scratch buffer, returned to its provider on drop.
pub struct ScratchBuf<'a> {
    words: Option<Box<[u32]>>,
    len: usize,
    provider: &'a dyn ScratchProvider,
}

impl<'a> ScratchBuf<'a> {
    fn new(words: Box<[u32]>, len: usize, provider: &'a dyn ScratchProvider) -> Self {
        debug_assert!(len <= words.len());
        Self {
            words: Some(words),
            len,
            provider,
        }
    }
}

impl Deref for ScratchBuf<'_> {
    type Target = [u32];

    fn deref(&self) -> &[u32] {
        match &self.words {
            Some(words) => &words[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for ScratchBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u32] {
        match &mut self.words {
            Some(words) => &mut words[..self.len],
            None => &mut [],
        }
    }
}

impl Drop for ScratchBuf<'_> {
    fn drop(&mut self) {
        if let Some(words) = self.words.take() {
            self.provider.reclaim(words);
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    outstanding: Cell<usize>,
    acquired: Cell<u64>,
    released: Cell<u64>,
}

impl Counters {
    fn on_acquire(&self) {
        self.outstanding.set(self.outstanding.get() + 1);
        self.acquired.set(self.acquired.get() + 1);
    }

    fn on_release(&self) {
        self.outstanding.set(self.outstanding.get() - 1);
        self.released.set(self.released.get() + 1);
    }
}

/// A provider that allocates on every acquire.
#[derive(Debug, Default)]
pub struct HeapScratch {
    counters: Counters,
}

impl HeapScratch {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScratchProvider for HeapScratch {
    fn acquire(&self, len: usize) -> Option<ScratchBuf<'_>> {
        let words = vec![0_u32; len].into_boxed_slice();
        self.counters.on_acquire();
        Some(ScratchBuf::new(words, len, self))
    }

    fn reclaim(&self, words: Box<[u32]>) {
        drop(words);
        self.counters.on_release();
    }

    fn outstanding(&self) -> usize {
        self.counters.outstanding.get()
    }

    fn acquired(&self) -> u64 {
        self.counters.acquired.get()
    }

    fn released(&self) -> u64 {
        self.counters.released.get()
    }
}

/// A bounded pool of pre-allocated fixed-length buffers.
///
/// `acquire` fails when the pool is exhausted or when `len` exceeds the
/// pool's buffer length; it never blocks.
#[derive(Debug)]
pub struct PooledScratch {
    free: RefCell<Vec<Box<[u32]>>>,
    buffer_len: usize,
    counters: Counters,
}

impl PooledScratch {
    /// Creates a pool of `buffers` buffers of `buffer_len` words each.
    pub fn new(buffers: usize, buffer_len: usize) -> Self {
        Self {
            free: RefCell::new(
                (0..buffers)
                    .map(|_| vec![0_u32; buffer_len].into_boxed_slice())
                    .collect(),
            ),
            buffer_len,
            counters: Counters::default(),
        }
    }
}

impl ScratchProvider for PooledScratch {
    fn acquire(&self, len: usize) -> Option<ScratchBuf<'_>> {
        if len > self.buffer_len {
            tracing::warn!(
                len,
                buffer_len = self.buffer_len,
                "scratch request exceeds pool buffer length"
            );
            return None;
        }
        let words = self.free.borrow_mut().pop()?;
        self.counters.on_acquire();
        Some(ScratchBuf::new(words, len, self))
    }

    fn reclaim(&self, words: Box<[u32]>) {
        self.free.borrow_mut().push(words);
        self.counters.on_release();
    }

    fn outstanding(&self) -> usize {
        self.counters.outstanding.get()
    }

    fn acquired(&self) -> u64 {
        self.counters.acquired.get()
    }

    fn released(&self) -> u64 {
        self.counters.released.get()
    }
}
