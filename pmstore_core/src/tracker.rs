use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::SegQueue;

use crate::region::{PmRegion, NULL_OFFSET};

pub const RECLAIM_BATCH: usize = 1000;

/// A block handed over for deferred reclamation: the unlinked data block,
/// its delete marker when one exists, and the epoch at which it was retired.
#[derive(Clone, Copy, Debug)]
pub struct RetiredBlock {
    pub data: u64,
    pub marker: u64,
    pub epoch: u64,
}

#[repr(align(64))]
struct RetireQueue {
    inner: UnsafeCell<VecDeque<RetiredBlock>>,
}

// SAFETY:
// Each queue is mutated only by its owning thread (indexed by tid); foreign
// threads interact exclusively through the orphan SegQueue.
unsafe impl Sync for RetireQueue {}

/// Epoch-gap deferred reclamation. A block retired at epoch `r` may still be
/// referenced by any operation running in an epoch `>= r`, so it is freed
/// only once the clock has moved at least `reclaim_gap` epochs past `r`.
pub struct RetireTracker {
    queues: Box<[RetireQueue]>,
    orphans: SegQueue<RetiredBlock>,
    reclaim_gap: u64,
    retired: AtomicU64,
    reclaimed: AtomicU64,
}

impl RetireTracker {
    pub fn new(task_num: usize, reclaim_gap: u64) -> Self {
        let mut queues = Vec::with_capacity(task_num);
        for _ in 0..task_num {
            queues.push(RetireQueue {
                inner: UnsafeCell::new(VecDeque::new()),
            });
        }
        Self {
            queues: queues.into_boxed_slice(),
            orphans: SegQueue::new(),
            reclaim_gap,
            retired: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
        }
    }

    /// Queues retired blocks on the owning thread's list. Called from the
    /// commit path after the publishing fence.
    pub fn retire_batch(&self, tid: usize, blocks: impl IntoIterator<Item = RetiredBlock>) {
        let queue = self.queue_mut(tid);
        for block in blocks {
            queue.push_back(block);
            self.retired.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// Frees up to [`RECLAIM_BATCH`] ripe entries from the thread's own queue
    /// and a share of the orphan queue. The data block is freed before its
    /// marker: a crash between the two leaves the id dead (marker still
    /// tops it), never resurrected.
    pub fn drain(&self, tid: usize, current_epoch: u64, region: &PmRegion) -> usize {
        let mut freed = 0_usize;
        let queue = self.queue_mut(tid);
        while freed < RECLAIM_BATCH {
            let Some(&front) = queue.front() else { break };
            if !self.is_ripe(front.epoch, current_epoch) {
                break;
            }
            queue.pop_front();
            self.reclaim(region, front);
            freed += 1;
        }

        while freed < RECLAIM_BATCH {
            match self.orphans.pop() {
                Some(block) if self.is_ripe(block.epoch, current_epoch) => {
                    self.reclaim(region, block);
                    freed += 1;
                }
                Some(block) => {
                    self.orphans.push(block);
                    break;
                }
                None => break,
            }
        }

        if freed > 0 {
            tracing::trace!(tid, freed, current_epoch, "drained retire queue");
        }
        freed
    }

    /// Donates a departing thread's queue to the global orphan queue, where
    /// later commits drain it.
    pub fn donate(&self, tid: usize) {
        let queue = self.queue_mut(tid);
        while let Some(block) = queue.pop_front() {
            self.orphans.push(block);
        }
    }

    pub fn pending(&self) -> u64 {
        self.retired.load(Ordering::Acquire) - self.reclaimed.load(Ordering::Acquire)
    }

    pub fn reclaimed(&self) -> u64 {
        self.reclaimed.load(Ordering::Acquire)
    }

    #[inline]
    fn is_ripe(&self, retire_epoch: u64, current_epoch: u64) -> bool {
        current_epoch >= retire_epoch + self.reclaim_gap
    }

    fn reclaim(&self, region: &PmRegion, block: RetiredBlock) {
        region.pfree(block.data);
        if block.marker != NULL_OFFSET {
            region.pfree(block.marker);
        }
        self.reclaimed.fetch_add(1, Ordering::AcqRel);
    }

    #[allow(clippy::mut_from_ref)]
    #[inline]
    fn queue_mut(&self, tid: usize) -> &mut VecDeque<RetiredBlock> {
        // SAFETY:
        // Per-thread queues are touched only by the thread owning `tid`;
        // the epoch layer enforces unique tids.
        unsafe { &mut *self.queues[tid].inner.get() }
    }
}
