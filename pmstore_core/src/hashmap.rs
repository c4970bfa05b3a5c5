use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::config::{ConfigError, StoreConfig};
use crate::epoch::{EpochSys, SysMode};
use crate::pblk;
use crate::pmem::{clwb, sfence};
use crate::recovery::{self, RecoveryError};
use crate::region::{AttachMode, PmRegion, RegionError, NULL_OFFSET};

pub const BUCKET_COUNT: usize = 1_000_003;

/// Link-cell tags. Bit 0 marks logical deletion; bit 1 says the stored
/// offset is a delete marker whose own link cell records the real successor.
const MARK_BIT: u64 = 0b01;
const TOMB_BIT: u64 = 0b10;
const TAG_MASK: u64 = 0b11;

#[derive(Debug)]
pub enum MapError {
    Config(ConfigError),
    Region(RegionError),
    Recovery(RecoveryError),
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapError::Config(err) => write!(f, "invalid configuration: {}", err),
            MapError::Region(err) => write!(f, "persistent region error: {}", err),
            MapError::Recovery(err) => write!(f, "recovery failed: {}", err),
        }
    }
}

impl std::error::Error for MapError {}

impl From<ConfigError> for MapError {
    fn from(value: ConfigError) -> Self {
        MapError::Config(value)
    }
}

impl From<RegionError> for MapError {
    fn from(value: RegionError) -> Self {
        MapError::Region(value)
    }
}

impl From<RecoveryError> for MapError {
    fn from(value: RecoveryError) -> Self {
        MapError::Recovery(value)
    }
}

#[repr(align(64))]
struct BucketHead {
    cell: AtomicU64,
}

struct FindResult {
    prev: *const AtomicU64,
    prev_in_pm: bool,
    curr: u64,
    next: u64,
    found: bool,
}

enum SwapOutcome {
    /// New version published; prior value captured before the swap.
    Published(String),
    /// Publishing CAS lost; the prepared version was discarded.
    Lost,
    /// Scope aborted (epoch mismatch); restart the operation.
    Restart,
}

/// Durably linearizable lock-free hash map over persistent string entries.
///
/// Buckets are transient and rebuilt from the surviving block set on a warm
/// start; every entry node lives in the persistent region, carries the id of
/// its logical key slot, and chains superseded versions through `prev`.
/// Bucket chains are Harris-Michael ordered lists in bytewise key order.
pub struct PLockfreeHashMap {
    esys: Arc<EpochSys>,
    buckets: Box<[BucketHead]>,
    hasher: RandomState,
}

// SAFETY:
// Bucket cells are plain atomics over region offsets; all other shared state
// is the epoch runtime, which is Sync itself.
unsafe impl Send for PLockfreeHashMap {}
unsafe impl Sync for PLockfreeHashMap {}

impl PLockfreeHashMap {
    /// Opens (or creates) the backing region and constructs the map. A warm
    /// attach runs recovery with `config.task_num` workers and rebuilds the
    /// bucket chains from the survivor set.
    pub fn build(config: &StoreConfig) -> Result<Self, MapError> {
        config.validate()?;
        let (region, attach) = PmRegion::open(&config.persist_path, config.persist_size_bytes)?;
        let esys = Arc::new(EpochSys::new(Arc::new(region), config));

        let mut buckets = Vec::with_capacity(BUCKET_COUNT);
        for _ in 0..BUCKET_COUNT {
            buckets.push(BucketHead {
                cell: AtomicU64::new(NULL_OFFSET),
            });
        }
        let map = Self {
            esys,
            buckets: buckets.into_boxed_slice(),
            hasher: RandomState::new(),
        };
        if attach == AttachMode::WarmStart {
            map.recover(config.task_num)?;
        }
        Ok(map)
    }

    /// Registers worker `tid` (`0 <= tid < task_num`).
    pub fn init_thread(&self, tid: usize) {
        self.esys.init_thread(tid);
    }

    /// Donates worker `tid`'s deferred reclaims before its thread exits.
    pub fn deregister_thread(&self, tid: usize) {
        self.esys.deregister_thread(tid);
    }

    /// Re-derives the live entry set from the region and rebuilds every
    /// bucket chain. Requires quiescence (no operation in flight). Returns
    /// the number of live entries.
    pub fn recover(&self, rec_threads: usize) -> Result<usize, MapError> {
        self.esys.set_mode(SysMode::Recover);
        let outcome = self.rebuild_from_survivors(rec_threads);
        self.esys.set_mode(SysMode::Online);
        outcome
    }

    pub fn get(&self, key: &str, tid: usize) -> Option<String> {
        loop {
            self.esys.begin_op(tid);
            let f = self.find(tid, key.as_bytes());
            if !f.found {
                self.esys.end_readonly_op(tid);
                return None;
            }
            match self.esys.openread_pblk(tid, f.curr) {
                Some(version) => {
                    let value = decode_value(self.region(), version);
                    self.esys.end_readonly_op(tid);
                    return Some(value);
                }
                None => {
                    // Lagging reader: no version old enough. Retry fresh.
                    self.esys.abort_op(tid);
                    self.esys.end_readonly_op(tid);
                }
            }
        }
    }

    /// Inserts `key` if absent. Returns `false` (and leaves the map
    /// unchanged) when the key is already present.
    pub fn insert(&self, key: &str, val: &str, tid: usize) -> Result<bool, MapError> {
        let payload = encode_entry(key.as_bytes(), val.as_bytes());
        'op: loop {
            self.esys.begin_op(tid);
            let node = match self.esys.alloc_pblk(tid, &payload) {
                Ok(node) => node,
                Err(err) => return Err(self.fail_op(tid, err)),
            };
            loop {
                let f = self.find(tid, key.as_bytes());
                if f.found {
                    self.esys.discard_new_version(tid, node);
                    self.esys.end_op(tid);
                    return Ok(false);
                }
                if !self.esys.check_epoch(tid) {
                    // The aborted scope rolls the allocation back.
                    self.esys.end_op(tid);
                    continue 'op;
                }
                if self.publish(&f, node) {
                    self.esys.end_op(tid);
                    return Ok(true);
                }
            }
        }
    }

    /// Maps `key` to `val`, returning the prior value if any.
    pub fn put(&self, key: &str, val: &str, tid: usize) -> Result<Option<String>, MapError> {
        let payload = encode_entry(key.as_bytes(), val.as_bytes());
        'op: loop {
            self.esys.begin_op(tid);
            loop {
                let f = self.find(tid, key.as_bytes());
                if !self.esys.check_epoch(tid) {
                    self.esys.end_op(tid);
                    continue 'op;
                }
                if f.found {
                    match self.swap_entry(tid, &f, &payload)? {
                        SwapOutcome::Published(prior) => {
                            self.esys.end_op(tid);
                            return Ok(Some(prior));
                        }
                        SwapOutcome::Lost => continue,
                        SwapOutcome::Restart => {
                            self.esys.end_op(tid);
                            continue 'op;
                        }
                    }
                }
                let node = match self.esys.alloc_pblk(tid, &payload) {
                    Ok(node) => node,
                    Err(err) => return Err(self.fail_op(tid, err)),
                };
                if self.publish(&f, node) {
                    self.esys.end_op(tid);
                    return Ok(None);
                }
                self.esys.discard_new_version(tid, node);
            }
        }
    }

    /// Replaces the value of an existing `key`; absent keys are left absent.
    pub fn replace(&self, key: &str, val: &str, tid: usize) -> Result<Option<String>, MapError> {
        let payload = encode_entry(key.as_bytes(), val.as_bytes());
        'op: loop {
            self.esys.begin_op(tid);
            loop {
                let f = self.find(tid, key.as_bytes());
                if !f.found {
                    self.esys.end_readonly_op(tid);
                    return Ok(None);
                }
                if !self.esys.check_epoch(tid) {
                    self.esys.end_op(tid);
                    continue 'op;
                }
                match self.swap_entry(tid, &f, &payload)? {
                    SwapOutcome::Published(prior) => {
                        self.esys.end_op(tid);
                        return Ok(Some(prior));
                    }
                    SwapOutcome::Lost => continue,
                    SwapOutcome::Restart => {
                        self.esys.end_op(tid);
                        continue 'op;
                    }
                }
            }
        }
    }

    /// Removes `key`, returning the prior value if any. The delete marker is
    /// durable before the marking CAS publishes the removal.
    pub fn remove(&self, key: &str, tid: usize) -> Result<Option<String>, MapError> {
        'op: loop {
            self.esys.begin_op(tid);
            loop {
                let f = self.find(tid, key.as_bytes());
                if !f.found {
                    self.esys.end_readonly_op(tid);
                    return Ok(None);
                }
                let prior = decode_value(self.region(), f.curr);
                if !self.esys.check_epoch(tid) {
                    self.esys.end_op(tid);
                    continue 'op;
                }
                let marker = match self.esys.pretire(tid, f.curr) {
                    Ok(marker) => marker,
                    Err(err) => return Err(self.fail_op(tid, err)),
                };
                // Stamp the successor into the marker, make it durable, then
                // freeze the node with the tombstoned mark.
                pblk::link_cell(self.region(), marker).store(f.next, AtomicOrdering::SeqCst);
                clwb(self.region().ptr_at(marker + pblk::BLK_HEADER_BYTES));
                sfence();
                let curr_link = pblk::link_cell(self.region(), f.curr);
                if curr_link
                    .compare_exchange(
                        f.next,
                        marker | MARK_BIT | TOMB_BIT,
                        AtomicOrdering::SeqCst,
                        AtomicOrdering::SeqCst,
                    )
                    .is_err()
                {
                    self.esys.discard_new_version(tid, marker);
                    continue;
                }
                clwb(self.region().ptr_at(f.curr + pblk::BLK_HEADER_BYTES));
                sfence();

                // SAFETY: `f.prev` points into the bucket array or a live
                // node's link cell; both outlive this operation.
                let prev = unsafe { &*f.prev };
                if prev
                    .compare_exchange(f.curr, f.next, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
                    .is_ok()
                {
                    if f.prev_in_pm {
                        clwb(f.prev.cast());
                    }
                    sfence();
                    self.esys.preclaim(tid, f.curr, marker);
                } else {
                    // Someone else unlinked (and retired) it for us.
                    let _ = self.find(tid, key.as_bytes());
                }
                self.esys.end_op(tid);
                return Ok(Some(prior));
            }
        }
    }

    /// Pending deferred reclaims; exposed for leak accounting.
    pub fn pending_reclaims(&self) -> u64 {
        self.esys.pending_reclaims()
    }

    /// Live persistent blocks backing the map.
    pub fn live_block_count(&self) -> usize {
        self.region().live_chunk_count()
    }

    #[inline]
    pub fn epoch_sys(&self) -> &Arc<EpochSys> {
        &self.esys
    }

    #[inline]
    fn region(&self) -> &PmRegion {
        self.esys.region()
    }

    #[inline]
    fn bucket_index(&self, key: &[u8]) -> usize {
        let mut state = self.hasher.build_hasher();
        key.hash(&mut state);
        (state.finish() as usize) % BUCKET_COUNT
    }

    /// Bucket traversal. Returns with `curr` at the first unmarked node whose
    /// key is `>= key`; excises (and retires) marked nodes on the way. Every
    /// inspected link cell is flushed so a later fence orders the whole path.
    fn find(&self, tid: usize, key: &[u8]) -> FindResult {
        let region = self.region();
        'retry: loop {
            let head = &self.buckets[self.bucket_index(key)].cell;
            let mut prev: *const AtomicU64 = head;
            let mut prev_in_pm = false;
            // SAFETY: `prev` starts at a bucket cell owned by `self`.
            let mut curr = unsafe { &*prev }.load(AtomicOrdering::SeqCst) & !TAG_MASK;
            loop {
                if curr == NULL_OFFSET {
                    return FindResult {
                        prev,
                        prev_in_pm,
                        curr: NULL_OFFSET,
                        next: NULL_OFFSET,
                        found: false,
                    };
                }
                let curr_link = pblk::link_cell(region, curr);
                let tagged = curr_link.load(AtomicOrdering::SeqCst);
                clwb(region.ptr_at(curr + pblk::BLK_HEADER_BYTES));
                let marked = tagged & MARK_BIT != 0;
                let next = resolve_next(region, tagged);
                let cmp = decode_key(region, curr).cmp(key);
                // SAFETY: as above; bucket cells and link cells of reachable
                // nodes stay mapped for the life of the region.
                if unsafe { &*prev }.load(AtomicOrdering::SeqCst) != curr {
                    continue 'retry;
                }
                if !marked {
                    match cmp {
                        std::cmp::Ordering::Equal => {
                            sfence();
                            return FindResult {
                                prev,
                                prev_in_pm,
                                curr,
                                next,
                                found: true,
                            };
                        }
                        std::cmp::Ordering::Greater => {
                            return FindResult {
                                prev,
                                prev_in_pm,
                                curr,
                                next,
                                found: false,
                            };
                        }
                        std::cmp::Ordering::Less => {
                            prev = curr_link;
                            prev_in_pm = true;
                        }
                    }
                } else {
                    sfence();
                    // SAFETY: as above.
                    if unsafe { &*prev }
                        .compare_exchange(
                            curr,
                            next,
                            AtomicOrdering::SeqCst,
                            AtomicOrdering::SeqCst,
                        )
                        .is_ok()
                    {
                        if prev_in_pm {
                            clwb(prev.cast());
                        }
                        sfence();
                        let marker = if tagged & TOMB_BIT != 0 {
                            tagged & !TAG_MASK
                        } else {
                            NULL_OFFSET
                        };
                        self.esys.preclaim(tid, curr, marker);
                    } else {
                        continue 'retry;
                    }
                }
                curr = next;
            }
        }
    }

    /// Links an unpublished `node` in front of `f.curr`: set its link, flush,
    /// fence, publish by CAS, flush the publishing cell, fence.
    fn publish(&self, f: &FindResult, node: u64) -> bool {
        let region = self.region();
        pblk::link_cell(region, node).store(f.curr, AtomicOrdering::SeqCst);
        clwb(region.ptr_at(node + pblk::BLK_HEADER_BYTES));
        sfence();
        // SAFETY: `f.prev` points into the bucket array or a live node's
        // link cell; both outlive this operation.
        let prev = unsafe { &*f.prev };
        if prev
            .compare_exchange(f.curr, node, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
            .is_ok()
        {
            if f.prev_in_pm {
                clwb(f.prev.cast());
            }
            sfence();
            true
        } else {
            false
        }
    }

    /// Replace path shared by `put` and `replace`: chain a new version of
    /// `f.curr`'s id, publish it in front, then freeze and detach the
    /// superseded node.
    fn swap_entry(
        &self,
        tid: usize,
        f: &FindResult,
        payload: &[u8],
    ) -> Result<SwapOutcome, MapError> {
        let region = self.region();
        let prior = decode_value(region, f.curr);
        let node = match self.esys.openwrite_pblk(tid, f.curr, payload) {
            Ok(Some(node)) => node,
            Ok(None) => return Ok(SwapOutcome::Restart),
            Err(err) => return Err(self.fail_op(tid, err)),
        };
        if !self.publish(f, node) {
            self.esys.discard_new_version(tid, node);
            return Ok(SwapOutcome::Lost);
        }

        // Freeze the superseded node. A concurrent remover may have beaten
        // us to the mark; its tombstone then rides along to the excisor.
        let frozen = loop {
            let curr_link = pblk::link_cell(region, f.curr);
            let tagged = curr_link.load(AtomicOrdering::SeqCst);
            if tagged & MARK_BIT != 0 {
                break tagged;
            }
            if curr_link
                .compare_exchange(
                    tagged,
                    tagged | MARK_BIT,
                    AtomicOrdering::SeqCst,
                    AtomicOrdering::SeqCst,
                )
                .is_ok()
            {
                break tagged | MARK_BIT;
            }
        };
        clwb(region.ptr_at(f.curr + pblk::BLK_HEADER_BYTES));
        sfence();

        // Detach: swing our own link past the frozen node. Temporary
        // duplicates along the chain are fine; the first match wins.
        let after = resolve_next(region, frozen);
        let node_link = pblk::link_cell(region, node);
        if node_link
            .compare_exchange(f.curr, after, AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
            .is_ok()
        {
            clwb(region.ptr_at(node + pblk::BLK_HEADER_BYTES));
            sfence();
            let marker = if frozen & TOMB_BIT != 0 {
                frozen & !TAG_MASK
            } else {
                NULL_OFFSET
            };
            self.esys.preclaim(tid, f.curr, marker);
        } else {
            // Another traversal excised it; let it finish the cleanup.
            let _ = self.find(tid, decode_key(region, node).to_vec().as_slice());
        }
        Ok(SwapOutcome::Published(prior))
    }

    /// Aborts and closes the current scope around a hard failure.
    fn fail_op(&self, tid: usize, err: RegionError) -> MapError {
        if !self.esys.is_aborted(tid) {
            self.esys.abort_op(tid);
        }
        self.esys.end_op(tid);
        MapError::Region(err)
    }

    fn rebuild_from_survivors(&self, rec_threads: usize) -> Result<usize, MapError> {
        let live = recovery::recover(&self.esys, rec_threads)?;
        let region = self.region();
        for bucket in self.buckets.iter() {
            bucket.cell.store(NULL_OFFSET, AtomicOrdering::Release);
        }

        let mut grouped: HashMap<usize, Vec<u64>> = HashMap::new();
        for &off in live.values() {
            if pblk::payload(region, off).len() < ENTRY_HEADER_BYTES {
                // Not an entry node; leave it for whoever owns it.
                continue;
            }
            grouped
                .entry(self.bucket_index(decode_key(region, off)))
                .or_default()
                .push(off);
        }

        let mut kept_total = 0_usize;
        for (idx, mut offs) in grouped {
            // Ascending key; within a key the newest version first. A
            // duplicate key means a crash landed between a swap's publish
            // and its detach; the stale twin is dropped here.
            offs.sort_by(|&a, &b| {
                decode_key(region, a)
                    .cmp(decode_key(region, b))
                    .then_with(|| {
                        let ha = pblk::header(region, a);
                        let hb = pblk::header(region, b);
                        hb.epoch.cmp(&ha.epoch).then(b.cmp(&a))
                    })
            });
            let mut kept: Vec<u64> = Vec::new();
            for off in offs {
                match kept.last() {
                    Some(&prev_off)
                        if decode_key(region, prev_off) == decode_key(region, off) =>
                    {
                        region.pfree(off);
                    }
                    _ => kept.push(off),
                }
            }
            for pair in kept.windows(2) {
                pblk::link_cell(region, pair[0]).store(pair[1], AtomicOrdering::Release);
            }
            if let Some(&last) = kept.last() {
                pblk::link_cell(region, last).store(NULL_OFFSET, AtomicOrdering::Release);
            }
            if let Some(&first) = kept.first() {
                self.buckets[idx].cell.store(first, AtomicOrdering::Release);
            }
            kept_total += kept.len();
        }
        tracing::info!(entries = kept_total, "rebuilt bucket chains");
        Ok(kept_total)
    }
}

const ENTRY_HEADER_BYTES: usize = 8;

fn encode_entry(key: &[u8], val: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENTRY_HEADER_BYTES + key.len() + val.len());
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(&(val.len() as u32).to_le_bytes());
    out.extend_from_slice(key);
    out.extend_from_slice(val);
    out
}

fn decode_key(region: &PmRegion, off: u64) -> &[u8] {
    let payload = pblk::payload(region, off);
    let key_len = u32::from_le_bytes(payload[..4].try_into().expect("entry header")) as usize;
    &payload[ENTRY_HEADER_BYTES..ENTRY_HEADER_BYTES + key_len]
}

fn decode_value(region: &PmRegion, off: u64) -> String {
    let payload = pblk::payload(region, off);
    let key_len = u32::from_le_bytes(payload[..4].try_into().expect("entry header")) as usize;
    let val_len = u32::from_le_bytes(payload[4..8].try_into().expect("entry header")) as usize;
    let start = ENTRY_HEADER_BYTES + key_len;
    String::from_utf8_lossy(&payload[start..start + val_len]).into_owned()
}

/// Untagged successor of a link-cell value: a tombstoned mark routes through
/// the marker's own link cell, anything else is the offset itself.
fn resolve_next(region: &PmRegion, tagged: u64) -> u64 {
    let off = tagged & !TAG_MASK;
    if tagged & TOMB_BIT != 0 {
        pblk::link_cell(region, off).load(AtomicOrdering::SeqCst) & !TAG_MASK
    } else {
        off
    }
}

#[cfg(test)]
mod tests {
    use super::{encode_entry, PLockfreeHashMap, ENTRY_HEADER_BYTES};
    use crate::config::StoreConfig;

    fn scratch_map(task_num: usize) -> (tempfile::TempDir, PLockfreeHashMap) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg =
            StoreConfig::new(dir.path().join("region.pm"), 32 << 20).with_task_num(task_num);
        let map = PLockfreeHashMap::build(&cfg).expect("build map");
        for tid in 0..task_num {
            map.init_thread(tid);
        }
        (dir, map)
    }

    #[test]
    fn entry_encoding_round_trips() {
        let payload = encode_entry(b"key", b"value");
        assert_eq!(payload.len(), ENTRY_HEADER_BYTES + 3 + 5);
        assert_eq!(&payload[ENTRY_HEADER_BYTES..ENTRY_HEADER_BYTES + 3], b"key");
    }

    #[test]
    fn insert_get_remove_smoke() {
        let (_dir, map) = scratch_map(1);
        assert!(map.insert("alpha", "1", 0).expect("insert"));
        assert_eq!(map.get("alpha", 0).as_deref(), Some("1"));
        assert_eq!(map.remove("alpha", 0).expect("remove").as_deref(), Some("1"));
        assert_eq!(map.get("alpha", 0), None);
    }

    #[test]
    fn colliding_keys_stay_ordered_within_a_bucket() {
        let (_dir, map) = scratch_map(1);
        // Sharing one bucket is not required for the contract; ordered
        // traversal must hold regardless of where these land.
        for key in ["b", "a", "d", "c"] {
            assert!(map.insert(key, key, 0).expect("insert"));
        }
        for key in ["a", "b", "c", "d"] {
            assert_eq!(map.get(key, 0).as_deref(), Some(key));
        }
        assert_eq!(map.remove("c", 0).expect("remove").as_deref(), Some("c"));
        assert_eq!(map.get("c", 0), None);
        assert_eq!(map.get("d", 0).as_deref(), Some("d"));
    }

    #[test]
    fn put_overwrites_and_reports_the_prior_value() {
        let (_dir, map) = scratch_map(1);
        assert_eq!(map.put("k", "v1", 0).expect("first put"), None);
        assert_eq!(map.put("k", "v2", 0).expect("second put").as_deref(), Some("v1"));
        assert_eq!(map.get("k", 0).as_deref(), Some("v2"));
    }
}
