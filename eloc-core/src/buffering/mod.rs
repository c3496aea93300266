//! Double-buffered block hand-off between the capture loop and a drain loop.
//!
//! Each registered consumer owns one buffer pair. The capture loop fills the
//! active half; when it reaches capacity the pair swaps: the filled half is
//! flagged ready, the other half becomes active, and the consumer is woken
//! exactly once. The consumer reads only the ready half and clears the flag
//! when it is done.
//!
//! ## Invariants
//!
//! - Exactly one producer ([`BlockProducer`]) and one consumer
//!   ([`BlockConsumer`]) per pair.
//! - The producer never writes into a half that is flagged ready but not yet
//!   drained. If the consumer falls a full block behind, the newly filled
//!   block is dropped and counted as an overrun — the producer is never
//!   blocked.
//! - Fill, swap and notify are strictly ordered: the ready flag is set only
//!   after the last sample of that half is written, so a woken consumer
//!   always observes a complete block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{ElocError, Result};

/// Hand-off token: which half (if any) is complete and unread.
struct Ctrl {
    ready: Option<usize>,
    closed: bool,
}

/// Counters shared by both halves of a pair.
pub struct BufferStats {
    pub samples_pushed: AtomicU64,
    pub blocks_swapped: AtomicU64,
    pub overruns: AtomicU64,
}

impl BufferStats {
    fn new() -> Self {
        Self {
            samples_pushed: AtomicU64::new(0),
            blocks_swapped: AtomicU64::new(0),
            overruns: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> BufferStatsSnapshot {
        BufferStatsSnapshot {
            samples_pushed: self.samples_pushed.load(Ordering::Relaxed),
            blocks_swapped: self.blocks_swapped.load(Ordering::Relaxed),
            overruns: self.overruns.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BufferStatsSnapshot {
    pub samples_pushed: u64,
    pub blocks_swapped: u64,
    pub overruns: u64,
}

struct Shared {
    halves: [Mutex<Vec<i16>>; 2],
    ctrl: Mutex<Ctrl>,
    ready_cv: Condvar,
    stats: BufferStats,
    capacity: usize,
}

/// Producer half — held by the capture loop.
pub struct BlockProducer {
    shared: Arc<Shared>,
    /// Index of the half currently being filled. Only the producer mutates
    /// this, so a plain field is enough.
    active: usize,
}

/// Consumer half — held by one drain loop.
pub struct BlockConsumer {
    shared: Arc<Shared>,
}

/// Create a matched producer/consumer pair with `capacity` samples per half.
///
/// # Errors
/// `ElocError::HardwareConfig` for a zero capacity, `ElocError::OutOfMemory`
/// when either half cannot be allocated. The caller must not start the
/// capture loop after an allocation failure.
pub fn block_pair(capacity: usize) -> Result<(BlockProducer, BlockConsumer)> {
    if capacity == 0 {
        return Err(ElocError::HardwareConfig(
            "buffer capacity must be > 0".into(),
        ));
    }

    let mut halves = [Vec::new(), Vec::new()];
    for half in &mut halves {
        half.try_reserve_exact(capacity)
            .map_err(|_| ElocError::OutOfMemory {
                requested: capacity,
            })?;
    }
    let [a, b] = halves;

    let shared = Arc::new(Shared {
        halves: [Mutex::new(a), Mutex::new(b)],
        ctrl: Mutex::new(Ctrl {
            ready: None,
            closed: false,
        }),
        ready_cv: Condvar::new(),
        stats: BufferStats::new(),
        capacity,
    });

    Ok((
        BlockProducer {
            shared: Arc::clone(&shared),
            active: 0,
        },
        BlockConsumer { shared },
    ))
}

impl BlockProducer {
    /// Append one sample to the active half. Returns `true` when this sample
    /// completed a block and the pair swapped.
    pub fn push(&mut self, sample: i16) -> bool {
        let full = {
            let mut half = self.shared.halves[self.active].lock();
            half.push(sample);
            half.len() >= self.shared.capacity
        };
        self.shared
            .stats
            .samples_pushed
            .fetch_add(1, Ordering::Relaxed);

        if !full {
            return false;
        }
        self.swap()
    }

    /// Hand the filled active half to the consumer and flip to the other one.
    fn swap(&mut self) -> bool {
        {
            let mut ctrl = self.shared.ctrl.lock();
            if ctrl.ready.is_some() {
                // Consumer still owns the other half — drop this block rather
                // than overwrite an undrained buffer or block the producer.
                drop(ctrl);
                self.shared.halves[self.active].lock().clear();
                self.shared.stats.overruns.fetch_add(1, Ordering::Relaxed);
                warn!("sample block dropped: consumer has not drained the previous buffer");
                return false;
            }
            ctrl.ready = Some(self.active);
        }
        self.shared.ready_cv.notify_one();

        self.active ^= 1;
        // The new active half was drained before `ready` cleared, so the
        // consumer is no longer reading it.
        self.shared.halves[self.active].lock().clear();
        self.shared
            .stats
            .blocks_swapped
            .fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Samples per half.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> BufferStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Wake the consumer permanently. A ready block left behind can still be
    /// drained; afterwards `wait_ready` returns `false`. A partially filled
    /// active half is discarded (at most one block of loss at stop).
    pub fn close(&self) {
        self.shared.ctrl.lock().closed = true;
        self.shared.ready_cv.notify_all();
    }
}

impl Drop for BlockProducer {
    fn drop(&mut self) {
        self.close();
    }
}

impl BlockConsumer {
    /// Block until a ready half exists or the producer closed the pair.
    /// Returns `false` only when closed with nothing left to drain.
    pub fn wait_ready(&self) -> bool {
        let mut ctrl = self.shared.ctrl.lock();
        loop {
            if ctrl.ready.is_some() {
                return true;
            }
            if ctrl.closed {
                return false;
            }
            self.shared.ready_cv.wait(&mut ctrl);
        }
    }

    /// Non-blocking check for a ready half.
    pub fn is_ready(&self) -> bool {
        self.shared.ctrl.lock().ready.is_some()
    }

    /// Copy the ready half into `out` and clear the ready flag. Returns the
    /// number of samples, or `None` when no half is ready.
    ///
    /// The flag is cleared only after the copy completes, so the producer
    /// cannot reclaim the half mid-read.
    pub fn drain_into(&self, out: &mut Vec<i16>) -> Option<usize> {
        let idx = self.shared.ctrl.lock().ready?;
        {
            let half = self.shared.halves[idx].lock();
            out.clear();
            out.extend_from_slice(&half);
        }
        self.shared.ctrl.lock().ready = None;
        Some(out.len())
    }

    /// Samples per half.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> BufferStatsSnapshot {
        self.shared.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    use rand::Rng;

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(block_pair(0).is_err());
    }

    #[test]
    fn swap_happens_exactly_at_capacity() {
        let (mut tx, rx) = block_pair(4).unwrap();
        assert!(!tx.push(10));
        assert!(!tx.push(11));
        assert!(!tx.push(12));
        assert!(!rx.is_ready());
        assert!(tx.push(13));
        assert!(rx.is_ready());

        let mut out = Vec::new();
        assert_eq!(rx.drain_into(&mut out), Some(4));
        assert_eq!(out, vec![10, 11, 12, 13]);
        assert!(!rx.is_ready());
    }

    #[test]
    fn producer_drops_block_when_consumer_is_behind() {
        let (mut tx, rx) = block_pair(2).unwrap();
        assert!(tx.push(1) | tx.push(2)); // first block swapped
        assert!(!(tx.push(3) | tx.push(4))); // consumer never drained — dropped

        let stats = tx.stats();
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.blocks_swapped, 1);

        // The surviving ready block is the first one.
        let mut out = Vec::new();
        assert_eq!(rx.drain_into(&mut out), Some(2));
        assert_eq!(out, vec![1, 2]);
    }

    #[test]
    fn drain_without_ready_returns_none() {
        let (mut tx, rx) = block_pair(3).unwrap();
        tx.push(5);
        let mut out = Vec::new();
        assert_eq!(rx.drain_into(&mut out), None);
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let (tx, rx) = block_pair(8).unwrap();
        let handle = thread::spawn(move || rx.wait_ready());
        thread::sleep(Duration::from_millis(20));
        tx.close();
        assert!(!handle.join().unwrap());
    }

    #[test]
    fn pending_block_survives_close() {
        let (mut tx, rx) = block_pair(2).unwrap();
        tx.push(7);
        tx.push(8);
        tx.close();

        assert!(rx.wait_ready());
        let mut out = Vec::new();
        assert_eq!(rx.drain_into(&mut out), Some(2));
        assert_eq!(out, vec![7, 8]);
        assert!(!rx.wait_ready());
    }

    /// Randomized producer/consumer interleaving: every drained block must be
    /// complete (full capacity) and internally consecutive, and its first
    /// sample must sit on a block boundary of the produced sequence. A torn
    /// or half-written block would violate one of those checks.
    #[test]
    fn randomized_interleaving_never_exposes_torn_blocks() {
        const CAP: usize = 32;
        const TOTAL: i32 = 32 * 200;

        let (mut tx, rx) = block_pair(CAP).unwrap();

        let producer = thread::spawn(move || {
            let mut rng = rand::thread_rng();
            for v in 0..TOTAL {
                tx.push(v as i16);
                if rng.gen_bool(0.01) {
                    thread::sleep(Duration::from_micros(rng.gen_range(1..200)));
                }
            }
            tx.close();
        });

        let consumer = thread::spawn(move || {
            let mut rng = rand::thread_rng();
            let mut out = Vec::new();
            let mut blocks = 0u64;
            while rx.wait_ready() {
                if rx.drain_into(&mut out).is_none() {
                    continue;
                }
                assert_eq!(out.len(), CAP, "partial block exposed to consumer");
                let first = out[0] as i32;
                assert_eq!(
                    first % CAP as i32,
                    0,
                    "block does not start on a swap boundary"
                );
                for (i, &s) in out.iter().enumerate() {
                    assert_eq!(s as i32, first + i as i32, "torn block contents");
                }
                blocks += 1;
                if rng.gen_bool(0.05) {
                    thread::sleep(Duration::from_micros(rng.gen_range(1..300)));
                }
            }
            blocks
        });

        producer.join().unwrap();
        let drained = consumer.join().unwrap();
        assert!(drained > 0, "consumer never saw a block");
        assert!(drained <= (TOTAL as u64) / CAP as u64);
    }
}
