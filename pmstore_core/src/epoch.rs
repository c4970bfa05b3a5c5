use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use crate::config::StoreConfig;
use crate::pblk::{self, BlkType, PAYLOAD_OFFSET};
use crate::pmem::{clwb_range, sfence};
use crate::region::{PmRegion, RegionError, NULL_OFFSET};
use crate::tracker::{RetireTracker, RetiredBlock};

pub const NULL_EPOCH: u64 = u64::MAX;
const EPOCH_RING: usize = 4;

const STATUS_IDLE: u8 = 0;
const STATUS_ACTIVE: u8 = 1;
const STATUS_ABORTED: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SysMode {
    Online,
    Recover,
}

/// Per-thread operation record. `ui` and `status` are written only by the
/// owning thread and read by the epoch advancer; the pending lists behind
/// `inner` are private to the owner.
#[repr(align(64))]
struct ThreadSlot {
    ui: AtomicU64,
    status: AtomicU8,
    inner: UnsafeCell<SlotInner>,
}

// SAFETY:
// `inner` is mutated only through `EpochSys::inner_mut`, which callers invoke
// exclusively with their own registered tid.
unsafe impl Sync for ThreadSlot {}

#[derive(Default)]
struct SlotInner {
    pending_allocs: Vec<u64>,
    pending_updates: Vec<u64>,
    pending_retires: Vec<RetiredBlock>,
    tainted: bool,
    committed: u64,
}

#[repr(align(64))]
struct EpochCounter {
    txns: AtomicU64,
}

/// Process-wide persistence runtime: the epoch clock, per-thread transaction
/// scopes, versioned block open/alloc/retire, and the retire tracker. Thread
/// identity is passed explicitly on every call; slot `tid` must have been
/// claimed via [`EpochSys::init_thread`].
pub struct EpochSys {
    region: Arc<PmRegion>,
    epoch: AtomicU64,
    slots: Box<[ThreadSlot]>,
    in_flight: [EpochCounter; EPOCH_RING],
    next_id: AtomicU64,
    epoch_window: u64,
    reclaim_gap: u64,
    mode: AtomicU8,
    tracker: RetireTracker,
}

impl EpochSys {
    pub fn new(region: Arc<PmRegion>, config: &StoreConfig) -> Self {
        let task_num = config.task_num;
        let mut slots = Vec::with_capacity(task_num);
        for _ in 0..task_num {
            slots.push(ThreadSlot {
                ui: AtomicU64::new(NULL_EPOCH),
                status: AtomicU8::new(STATUS_IDLE),
                inner: UnsafeCell::new(SlotInner::default()),
            });
        }
        let reclaim_gap = config.effective_reclaim_gap();
        Self {
            epoch: AtomicU64::new(region.persisted_epoch()),
            slots: slots.into_boxed_slice(),
            in_flight: std::array::from_fn(|_| EpochCounter {
                txns: AtomicU64::new(0),
            }),
            next_id: AtomicU64::new(1),
            epoch_window: config.epoch_window,
            reclaim_gap,
            mode: AtomicU8::new(0),
            tracker: RetireTracker::new(task_num, reclaim_gap),
            region,
        }
    }

    /// Claims slot `tid` for the calling thread.
    pub fn init_thread(&self, tid: usize) {
        assert!(
            tid < self.slots.len(),
            "tid {} out of range for {} registered workers",
            tid,
            self.slots.len()
        );
        let slot = &self.slots[tid];
        slot.ui.store(NULL_EPOCH, Ordering::Release);
        slot.status.store(STATUS_IDLE, Ordering::Release);
        *self.inner_mut(tid) = SlotInner::default();
    }

    /// Donates any unreclaimed retires before the thread goes away.
    pub fn deregister_thread(&self, tid: usize) {
        assert_eq!(
            self.slots[tid].status.load(Ordering::Acquire),
            STATUS_IDLE,
            "deregister_thread inside an operation"
        );
        self.tracker.donate(tid);
    }

    pub fn begin_op(&self, tid: usize) {
        let slot = &self.slots[tid];
        assert_eq!(
            slot.status.load(Ordering::Acquire),
            STATUS_IDLE,
            "begin_op while a previous operation is still open"
        );
        let inner = self.inner_mut(tid);
        inner.pending_allocs.clear();
        inner.pending_updates.clear();
        inner.pending_retires.clear();
        inner.tainted = false;

        let e = self.epoch.load(Ordering::Acquire);
        self.in_flight[(e % EPOCH_RING as u64) as usize]
            .txns
            .fetch_add(1, Ordering::AcqRel);
        slot.ui.store(e, Ordering::Release);
        slot.status.store(STATUS_ACTIVE, Ordering::Release);
    }

    /// True when the thread's epoch still matches the clock. On mismatch the
    /// operation is marked aborted; the caller rolls back via `end_op` and
    /// retries.
    pub fn check_epoch(&self, tid: usize) -> bool {
        let slot = &self.slots[tid];
        let ui = slot.ui.load(Ordering::Acquire);
        assert_ne!(ui, NULL_EPOCH, "check_epoch outside begin_op/end_op");
        if ui == self.epoch.load(Ordering::Acquire) {
            true
        } else {
            slot.status.store(STATUS_ABORTED, Ordering::Release);
            false
        }
    }

    pub fn abort_op(&self, tid: usize) {
        let slot = &self.slots[tid];
        assert_eq!(
            slot.status.load(Ordering::Acquire),
            STATUS_ACTIVE,
            "abort_op outside an active operation"
        );
        slot.status.store(STATUS_ABORTED, Ordering::Release);
    }

    pub fn is_aborted(&self, tid: usize) -> bool {
        self.slots[tid].status.load(Ordering::Acquire) == STATUS_ABORTED
    }

    /// Allocates a fresh block (a new logical id) in the caller's epoch and
    /// registers it with the open operation.
    pub fn alloc_pblk(&self, tid: usize, payload: &[u8]) -> Result<u64, RegionError> {
        let ui = self.active_epoch(tid, "alloc_pblk");
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let off = pblk::write_new(&self.region, id, BlkType::Alloc, ui, NULL_OFFSET, payload)?;
        self.inner_mut(tid).pending_allocs.push(off);
        Ok(off)
    }

    /// Version of `off` live at the caller's epoch. On an aborted scope this
    /// degrades to the unsafe path: the newest version is returned and the
    /// scope is tainted so later writes become no-ops.
    pub fn openread_pblk(&self, tid: usize, off: u64) -> Option<u64> {
        let slot = &self.slots[tid];
        let ui = slot.ui.load(Ordering::Acquire);
        assert_ne!(ui, NULL_EPOCH, "openread_pblk outside begin_op/end_op");
        if slot.status.load(Ordering::Acquire) == STATUS_ABORTED {
            self.inner_mut(tid).tainted = true;
            return Some(off);
        }
        pblk::live_version_at(&self.region, off, ui)
    }

    /// Chains a new UPDATE version of `off`'s id carrying `payload`, recorded
    /// in the open operation's pending set. Returns `Ok(None)` when the scope
    /// is aborted or tainted (the write is dropped) or when the caller's
    /// epoch no longer has a readable base version (the scope aborts).
    ///
    /// A same-epoch rewrite links past the displaced version so epochs along
    /// a `prev` chain stay strictly decreasing; the displaced block's
    /// reclamation stays with the caller.
    pub fn openwrite_pblk(
        &self,
        tid: usize,
        off: u64,
        payload: &[u8],
    ) -> Result<Option<u64>, RegionError> {
        let slot = &self.slots[tid];
        let ui = slot.ui.load(Ordering::Acquire);
        assert_ne!(ui, NULL_EPOCH, "openwrite_pblk outside begin_op/end_op");
        if slot.status.load(Ordering::Acquire) == STATUS_ABORTED || self.inner_mut(tid).tainted {
            return Ok(None);
        }
        let live = match pblk::live_version_at(&self.region, off, ui) {
            Some(live) => live,
            None => {
                slot.status.store(STATUS_ABORTED, Ordering::Release);
                return Ok(None);
            }
        };
        let live_hdr = pblk::header(&self.region, live);
        let prev = if live_hdr.epoch == ui {
            live_hdr.prev
        } else {
            live
        };
        let new = pblk::write_new(&self.region, live_hdr.id, BlkType::Update, ui, prev, payload)?;
        self.inner_mut(tid).pending_updates.push(new);
        Ok(Some(new))
    }

    /// Writes the DELETE marker that makes retiring `data_off`'s id durable.
    /// The marker is registered with the operation (an abort reclaims it);
    /// publication happens when the caller links it into a mark CAS.
    pub fn pretire(&self, tid: usize, data_off: u64) -> Result<u64, RegionError> {
        let ui = self.active_epoch(tid, "pretire");
        let id = pblk::header(&self.region, data_off).id;
        let marker = pblk::write_new(&self.region, id, BlkType::Delete, ui, data_off, &[])?;
        self.inner_mut(tid).pending_updates.push(marker);
        Ok(marker)
    }

    /// Queues an unlinked block (and its marker, when present) for deferred
    /// reclamation at this operation's epoch.
    pub fn preclaim(&self, tid: usize, data_off: u64, marker_off: u64) {
        let ui = self.active_epoch(tid, "preclaim");
        self.inner_mut(tid).pending_retires.push(RetiredBlock {
            data: data_off,
            marker: marker_off,
            epoch: ui,
        });
    }

    /// Drops an unpublished block created earlier in this operation (a CAS
    /// loser or a duplicate-key insert). Physically frees only in ONLINE
    /// mode.
    pub fn discard_new_version(&self, tid: usize, off: u64) {
        let inner = self.inner_mut(tid);
        inner.pending_allocs.retain(|&p| p != off);
        inner.pending_updates.retain(|&p| p != off);
        self.pdelete(off);
    }

    /// Physically frees `off` unless the runtime is in RECOVER mode, where
    /// the recovery scan owns all frees.
    pub fn pdelete(&self, off: u64) {
        if self.mode() == SysMode::Online {
            self.region.pfree(off);
        }
    }

    /// Commits (flush pending blocks, fence, publish) or rolls back an
    /// aborted scope (free pending blocks, drop retires).
    pub fn end_op(&self, tid: usize) {
        let slot = &self.slots[tid];
        match slot.status.load(Ordering::Acquire) {
            STATUS_ACTIVE => {
                let ui = slot.ui.load(Ordering::Acquire);
                let inner = self.inner_mut(tid);
                for &off in inner.pending_allocs.iter().chain(&inner.pending_updates) {
                    let len = pblk::header(&self.region, off).payload_len as u64;
                    clwb_range(self.region.ptr_at(off), (PAYLOAD_OFFSET + len) as usize);
                }
                sfence();

                let retires = std::mem::take(&mut inner.pending_retires);
                self.tracker.retire_batch(tid, retires);
                self.leave(tid, ui);

                inner.committed += 1;
                if inner.committed % self.epoch_window == 0 {
                    self.advance_epoch();
                }
                self.tracker
                    .drain(tid, self.epoch.load(Ordering::Acquire), &self.region);
            }
            STATUS_ABORTED => self.rollback(tid),
            _ => panic!("end_op without begin_op"),
        }
    }

    /// Commit path for operations that produced no new versions: no flush or
    /// fence, only the transaction-counter publication and retire handoff.
    pub fn end_readonly_op(&self, tid: usize) {
        let slot = &self.slots[tid];
        match slot.status.load(Ordering::Acquire) {
            STATUS_ACTIVE => {
                let ui = slot.ui.load(Ordering::Acquire);
                let inner = self.inner_mut(tid);
                assert!(
                    inner.pending_allocs.is_empty() && inner.pending_updates.is_empty(),
                    "end_readonly_op after writes"
                );
                let retires = std::mem::take(&mut inner.pending_retires);
                self.tracker.retire_batch(tid, retires);
                self.leave(tid, ui);
                self.tracker
                    .drain(tid, self.epoch.load(Ordering::Acquire), &self.region);
            }
            STATUS_ABORTED => self.rollback(tid),
            _ => panic!("end_readonly_op without begin_op"),
        }
    }

    /// Advances the clock iff every active thread has caught up to the
    /// current epoch and no transaction is still in flight from the prior
    /// one. Single writer guarded by the CAS.
    pub fn advance_epoch(&self) -> bool {
        let e = self.epoch.load(Ordering::Acquire);
        for slot in self.slots.iter() {
            if slot.status.load(Ordering::Acquire) == STATUS_ACTIVE
                && slot.ui.load(Ordering::Acquire) != e
            {
                return false;
            }
        }
        let prior = (e + EPOCH_RING as u64 - 1) % EPOCH_RING as u64;
        if self.in_flight[prior as usize].txns.load(Ordering::Acquire) != 0 {
            return false;
        }
        if self
            .epoch
            .compare_exchange(e, e + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.region.persist_epoch(e + 1);
        true
    }

    #[inline]
    pub fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> SysMode {
        match self.mode.load(Ordering::Acquire) {
            0 => SysMode::Online,
            _ => SysMode::Recover,
        }
    }

    pub fn set_mode(&self, mode: SysMode) {
        let raw = match mode {
            SysMode::Online => 0,
            SysMode::Recover => 1,
        };
        self.mode.store(raw, Ordering::Release);
    }

    #[inline]
    pub fn region(&self) -> &PmRegion {
        &self.region
    }

    #[inline]
    pub fn reclaim_gap(&self) -> u64 {
        self.reclaim_gap
    }

    #[inline]
    pub fn task_num(&self) -> usize {
        self.slots.len()
    }

    pub fn pending_reclaims(&self) -> u64 {
        self.tracker.pending()
    }

    /// Drains the caller's retire queue outside any operation; used by
    /// quiescent maintenance and tests.
    pub fn reclaim_now(&self, tid: usize) -> usize {
        self.tracker
            .drain(tid, self.epoch.load(Ordering::Acquire), &self.region)
    }

    /// Restarts the clock past everything stamped before a crash, so
    /// pre-crash retire epochs can never alias fresh ones.
    pub(crate) fn resume_clock_after_recovery(&self) {
        let resumed = self.region.persisted_epoch() + self.reclaim_gap;
        self.epoch.store(resumed, Ordering::Release);
        self.region.persist_epoch(resumed);
    }

    pub(crate) fn seed_next_id(&self, max_seen: u64) {
        self.next_id.store(max_seen + 1, Ordering::Release);
    }

    /// True when no slot has an operation open; recovery requires it.
    pub(crate) fn is_quiescent(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| slot.status.load(Ordering::Acquire) == STATUS_IDLE)
    }

    fn rollback(&self, tid: usize) {
        let slot = &self.slots[tid];
        let ui = slot.ui.load(Ordering::Acquire);
        let inner = self.inner_mut(tid);
        for &off in inner.pending_updates.iter().chain(&inner.pending_allocs) {
            self.region.pfree(off);
        }
        inner.pending_allocs.clear();
        inner.pending_updates.clear();
        inner.pending_retires.clear();
        self.leave(tid, ui);
    }

    fn leave(&self, tid: usize, ui: u64) {
        let slot = &self.slots[tid];
        self.in_flight[(ui % EPOCH_RING as u64) as usize]
            .txns
            .fetch_sub(1, Ordering::AcqRel);
        slot.ui.store(NULL_EPOCH, Ordering::Release);
        slot.status.store(STATUS_IDLE, Ordering::Release);
    }

    #[inline]
    fn active_epoch(&self, tid: usize, what: &str) -> u64 {
        let ui = self.slots[tid].ui.load(Ordering::Acquire);
        assert_ne!(ui, NULL_EPOCH, "{} outside begin_op/end_op", what);
        ui
    }

    #[allow(clippy::mut_from_ref)]
    #[inline]
    fn inner_mut(&self, tid: usize) -> &mut SlotInner {
        // SAFETY:
        // The pending lists are touched only by the thread that registered
        // `tid`; cross-thread access goes through the atomics above.
        unsafe { &mut *self.slots[tid].inner.get() }
    }
}

// SAFETY:
// Shared state is atomics, the tracker, and per-thread slots whose interior
// mutability is confined to the owning thread.
unsafe impl Send for EpochSys {}
unsafe impl Sync for EpochSys {}

#[cfg(test)]
mod tests {
    use super::{EpochSys, SysMode};
    use crate::config::StoreConfig;
    use crate::pblk;
    use crate::region::{PmRegion, NULL_OFFSET};
    use std::sync::Arc;

    fn scratch(task_num: usize) -> (tempfile::TempDir, Arc<EpochSys>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = StoreConfig::new(dir.path().join("region.pm"), 4 << 20).with_task_num(task_num);
        let (region, _) = PmRegion::open(&cfg.persist_path, cfg.persist_size_bytes).expect("open");
        let esys = Arc::new(EpochSys::new(Arc::new(region), &cfg));
        for tid in 0..task_num {
            esys.init_thread(tid);
        }
        (dir, esys)
    }

    #[test]
    fn commit_keeps_new_blocks_and_rollback_frees_them() {
        let (_dir, esys) = scratch(1);
        let baseline = esys.region().live_chunk_count();

        esys.begin_op(0);
        let committed = esys.alloc_pblk(0, b"kept").expect("alloc");
        esys.end_op(0);
        assert_eq!(esys.region().live_chunk_count(), baseline + 1);
        assert_eq!(pblk::payload(esys.region(), committed), b"kept");

        esys.begin_op(0);
        esys.alloc_pblk(0, b"dropped").expect("alloc");
        esys.abort_op(0);
        esys.end_op(0);
        assert_eq!(
            esys.region().live_chunk_count(),
            baseline + 1,
            "aborted allocation must be rolled back"
        );
    }

    #[test]
    fn openwrite_chains_a_new_version_per_epoch() {
        let (_dir, esys) = scratch(1);

        esys.begin_op(0);
        let v1 = esys.alloc_pblk(0, b"one").expect("alloc");
        esys.end_op(0);
        assert!(esys.advance_epoch(), "idle system must advance");

        esys.begin_op(0);
        let v2 = esys
            .openwrite_pblk(0, v1, b"two")
            .expect("openwrite")
            .expect("active scope");
        esys.end_op(0);

        let hdr = pblk::header(esys.region(), v2);
        assert_eq!(hdr.prev, v1);
        assert!(hdr.epoch > pblk::header(esys.region(), v1).epoch);

        esys.begin_op(0);
        let read = esys.openread_pblk(0, v2).expect("live version");
        assert_eq!(pblk::payload(esys.region(), read), b"two");
        esys.end_readonly_op(0);
    }

    #[test]
    fn same_epoch_rewrite_links_past_the_displaced_version() {
        let (_dir, esys) = scratch(1);

        esys.begin_op(0);
        let v1 = esys.alloc_pblk(0, b"one").expect("alloc");
        let v2 = esys
            .openwrite_pblk(0, v1, b"two")
            .expect("openwrite")
            .expect("active scope");
        esys.end_op(0);

        assert_eq!(
            pblk::header(esys.region(), v2).prev,
            NULL_OFFSET,
            "same-epoch rewrite must skip the displaced version"
        );
    }

    #[test]
    fn epoch_mismatch_marks_the_operation_aborted() {
        let (_dir, esys) = scratch(2);

        esys.begin_op(0);
        assert!(esys.check_epoch(0));
        assert!(esys.advance_epoch(), "thread 0 is at the current epoch");
        assert!(!esys.check_epoch(0), "stale epoch must fail the check");
        assert!(esys.is_aborted(0));
        esys.end_op(0);
    }

    #[test]
    fn advance_is_blocked_by_a_stale_active_thread() {
        let (_dir, esys) = scratch(2);

        esys.begin_op(0);
        assert!(esys.advance_epoch());
        // Thread 0 is now one epoch behind and still active.
        assert!(!esys.advance_epoch());
        esys.end_op(0);
        assert!(esys.advance_epoch());
    }

    #[test]
    fn aborted_openread_taints_and_drops_later_writes() {
        let (_dir, esys) = scratch(1);

        esys.begin_op(0);
        let v1 = esys.alloc_pblk(0, b"one").expect("alloc");
        esys.end_op(0);

        esys.begin_op(0);
        esys.abort_op(0);
        let unsafe_read = esys.openread_pblk(0, v1).expect("unsafe path");
        assert_eq!(unsafe_read, v1);
        let dropped = esys.openwrite_pblk(0, v1, b"two").expect("openwrite");
        assert!(dropped.is_none(), "tainted scope must drop writes");
        esys.end_op(0);
    }

    #[test]
    fn recover_mode_suppresses_pdelete() {
        let (_dir, esys) = scratch(1);
        esys.begin_op(0);
        let off = esys.alloc_pblk(0, b"v").expect("alloc");
        esys.end_op(0);

        let live = esys.region().live_chunk_count();
        esys.set_mode(SysMode::Recover);
        esys.pdelete(off);
        assert_eq!(esys.region().live_chunk_count(), live);
        esys.set_mode(SysMode::Online);
        esys.pdelete(off);
        assert_eq!(esys.region().live_chunk_count(), live - 1);
    }

    #[test]
    #[should_panic(expected = "outside begin_op/end_op")]
    fn alloc_outside_an_operation_panics() {
        let (_dir, esys) = scratch(1);
        let _ = esys.alloc_pblk(0, b"nope");
    }
}
