use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::epoch::EpochSys;
use crate::pblk::{self, BlkType};
use crate::region::RegionError;

#[derive(Debug)]
pub enum RecoveryError {
    /// Recovery requires quiescence; a slot still has an operation open.
    Busy,
    Region(RegionError),
}

impl fmt::Display for RecoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryError::Busy => write!(f, "recovery attempted while operations are in flight"),
            RecoveryError::Region(err) => write!(f, "recovery region error: {}", err),
        }
    }
}

impl std::error::Error for RecoveryError {}

impl From<RegionError> for RecoveryError {
    fn from(value: RegionError) -> Self {
        RecoveryError::Region(value)
    }
}

#[derive(Clone, Copy)]
struct Candidate {
    off: u64,
    epoch: u64,
    ty: BlkType,
}

impl Candidate {
    /// Winner order: higher epoch, then later lifecycle stage (a DELETE beats
    /// the data version it killed in the same epoch), then offset as the
    /// deterministic last resort.
    #[inline]
    fn rank(&self) -> (u64, BlkType, u64) {
        (self.epoch, self.ty, self.off)
    }
}

/// Reduces the surviving blocks to the live-version set: per id, the
/// highest-ranked version with a valid checksum wins; ids topped by a DELETE
/// are dead. Every non-winning block is freed. Returns `id -> offset` of the
/// live blocks and leaves the epoch clock resumed past everything stamped
/// before the crash.
pub fn recover(esys: &EpochSys, rec_threads: usize) -> Result<HashMap<u64, u64>, RecoveryError> {
    if !esys.is_quiescent() {
        return Err(RecoveryError::Busy);
    }
    let region = esys.region();
    let scanned = region.recover_scan();
    let rec_threads = rec_threads.max(1);
    let shard_len = scanned.len().div_ceil(rec_threads).max(1);

    let shards: Vec<HashMap<u64, Candidate>> = std::thread::scope(|scope| {
        let mut handles = Vec::new();
        for shard in scanned.chunks(shard_len) {
            handles.push(scope.spawn(move || {
                let mut best: HashMap<u64, Candidate> = HashMap::new();
                for &off in shard {
                    // A checksum failure means the block was never fully
                    // written; it is invisible here and freed below.
                    if !pblk::integrity_check(region, off) {
                        continue;
                    }
                    let hdr = pblk::header(region, off);
                    let ty = BlkType::from_raw(hdr.blk_type).expect("checked by integrity");
                    let cand = Candidate {
                        off,
                        epoch: hdr.epoch,
                        ty,
                    };
                    best.entry(hdr.id)
                        .and_modify(|cur| {
                            if cand.rank() > cur.rank() {
                                *cur = cand;
                            }
                        })
                        .or_insert(cand);
                }
                best
            }));
        }
        handles
            .into_iter()
            .map(|handle| handle.join().expect("recovery worker panicked"))
            .collect()
    });

    let mut winners: HashMap<u64, Candidate> = HashMap::new();
    for shard in shards {
        for (id, cand) in shard {
            winners
                .entry(id)
                .and_modify(|cur| {
                    if cand.rank() > cur.rank() {
                        *cur = cand;
                    }
                })
                .or_insert(cand);
        }
    }

    let max_id = winners.keys().copied().max().unwrap_or(0);
    let mut live: HashMap<u64, u64> = HashMap::new();
    for (id, cand) in &winners {
        if cand.ty.is_data() {
            live.insert(*id, cand.off);
        }
    }

    // Losing versions, corrupt blocks, and every version of a dead id go
    // back to the allocator.
    let keep: HashSet<u64> = live.values().copied().collect();
    let mut freed = 0_usize;
    for &off in &scanned {
        if !keep.contains(&off) {
            region.pfree(off);
            freed += 1;
        }
    }

    esys.seed_next_id(max_id);
    esys.resume_clock_after_recovery();
    tracing::info!(
        scanned = scanned.len(),
        live = live.len(),
        freed,
        resumed_epoch = esys.current_epoch(),
        "recovered live block set"
    );
    Ok(live)
}

#[cfg(test)]
mod tests {
    use super::recover;
    use crate::config::StoreConfig;
    use crate::epoch::EpochSys;
    use crate::pblk::{self, BlkType};
    use crate::region::{PmRegion, NULL_OFFSET};
    use std::sync::Arc;

    fn scratch() -> (tempfile::TempDir, Arc<EpochSys>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = StoreConfig::new(dir.path().join("region.pm"), 4 << 20);
        let (region, _) = PmRegion::open(&cfg.persist_path, cfg.persist_size_bytes).expect("open");
        let esys = Arc::new(EpochSys::new(Arc::new(region), &cfg));
        esys.init_thread(0);
        (dir, esys)
    }

    #[test]
    fn highest_epoch_version_wins_and_losers_are_freed() {
        let (_dir, esys) = scratch();
        let region = esys.region();
        let v1 = pblk::write_new(region, 5, BlkType::Alloc, 1, NULL_OFFSET, b"old").expect("v1");
        let v2 = pblk::write_new(region, 5, BlkType::Update, 3, v1, b"new").expect("v2");

        let live = recover(&esys, 2).expect("recover");
        assert_eq!(live.get(&5), Some(&v2));
        assert_eq!(region.live_chunk_count(), 1, "losing version must be freed");
    }

    #[test]
    fn delete_topped_ids_are_omitted_and_fully_freed() {
        let (_dir, esys) = scratch();
        let region = esys.region();
        let v1 = pblk::write_new(region, 9, BlkType::Alloc, 1, NULL_OFFSET, b"v").expect("v1");
        let _tomb = pblk::write_new(region, 9, BlkType::Delete, 2, v1, b"").expect("tomb");
        let keep = pblk::write_new(region, 10, BlkType::Alloc, 2, NULL_OFFSET, b"w").expect("keep");

        let live = recover(&esys, 1).expect("recover");
        assert!(!live.contains_key(&9));
        assert_eq!(live.get(&10), Some(&keep));
        assert_eq!(region.live_chunk_count(), 1);
    }

    #[test]
    fn same_epoch_delete_beats_the_data_version() {
        let (_dir, esys) = scratch();
        let region = esys.region();
        let v1 = pblk::write_new(region, 3, BlkType::Alloc, 4, NULL_OFFSET, b"v").expect("v1");
        let _tomb = pblk::write_new(region, 3, BlkType::Delete, 4, v1, b"").expect("tomb");

        let live = recover(&esys, 1).expect("recover");
        assert!(live.is_empty(), "delete must win an epoch tie");
        assert_eq!(region.live_chunk_count(), 0);
    }

    #[test]
    fn corrupt_winner_falls_back_to_the_previous_version() {
        let (_dir, esys) = scratch();
        let region = esys.region();
        let v1 = pblk::write_new(region, 7, BlkType::Alloc, 1, NULL_OFFSET, b"ok").expect("v1");
        let v2 = pblk::write_new(region, 7, BlkType::Update, 3, v1, b"torn").expect("v2");
        // SAFETY: corrupting one payload byte of the newest version.
        unsafe {
            *region.ptr_at(v2 + pblk::PAYLOAD_OFFSET) ^= 0xFF;
        }

        let live = recover(&esys, 1).expect("recover");
        assert_eq!(live.get(&7), Some(&v1));
    }

    #[test]
    fn recovery_is_idempotent() {
        let (_dir, esys) = scratch();
        let region = esys.region();
        let v1 = pblk::write_new(region, 1, BlkType::Alloc, 1, NULL_OFFSET, b"a").expect("v1");
        let v2 = pblk::write_new(region, 2, BlkType::Alloc, 1, NULL_OFFSET, b"b").expect("v2");

        let first = recover(&esys, 2).expect("first recovery");
        let second = recover(&esys, 2).expect("second recovery");
        assert_eq!(first, second);
        assert_eq!(second.get(&1), Some(&v1));
        assert_eq!(second.get(&2), Some(&v2));
    }

    #[test]
    fn recovery_refuses_to_run_under_live_operations() {
        let (_dir, esys) = scratch();
        esys.begin_op(0);
        assert!(matches!(
            recover(&esys, 1),
            Err(super::RecoveryError::Busy)
        ));
        esys.end_readonly_op(0);
    }
}
