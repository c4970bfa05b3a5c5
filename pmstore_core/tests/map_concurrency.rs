use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use pmstore_core::{PLockfreeHashMap, StoreConfig};

const THREADS: usize = 8;
const OPS_PER_THREAD: usize = 20_000;
const KEY_SPACE: usize = 1_000;

fn key_name(slot: usize) -> String {
    format!("key{:04}", slot)
}

#[test]
fn mixed_insert_remove_storm_matches_per_key_accounting() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = StoreConfig::new(dir.path().join("map.pm"), 512 << 20).with_task_num(THREADS);
    let map = Arc::new(PLockfreeHashMap::build(&cfg).expect("build map"));

    // Net successful inserts minus successful removes per key. Only
    // operations that linearized (returned success) are counted, so the
    // final presence of each key must equal its net count.
    let net: Arc<Vec<AtomicI64>> = Arc::new((0..KEY_SPACE).map(|_| AtomicI64::new(0)).collect());

    std::thread::scope(|scope| {
        for tid in 0..THREADS {
            let map = Arc::clone(&map);
            let net = Arc::clone(&net);
            scope.spawn(move || {
                map.init_thread(tid);
                let mut state = 0xDEAD_BEEF_u64 ^ ((tid as u64) << 32) | 1;
                for _ in 0..OPS_PER_THREAD {
                    state ^= state << 13;
                    state ^= state >> 7;
                    state ^= state << 17;
                    let slot = (state % KEY_SPACE as u64) as usize;
                    let key = key_name(slot);
                    if state & (1 << 20) == 0 {
                        if map.insert(&key, "x", tid).expect("insert") {
                            net[slot].fetch_add(1, Ordering::AcqRel);
                        }
                    } else if map.remove(&key, tid).expect("remove").is_some() {
                        net[slot].fetch_sub(1, Ordering::AcqRel);
                    }
                }
            });
        }
    });

    for slot in 0..KEY_SPACE {
        let count = net[slot].load(Ordering::Acquire);
        assert!(
            count == 0 || count == 1,
            "key {} has impossible net count {}",
            slot,
            count
        );
        let present = map.get(&key_name(slot), 0).is_some();
        assert_eq!(
            present,
            count == 1,
            "key {} presence disagrees with its net count {}",
            slot,
            count
        );
    }
}

#[test]
fn concurrent_puts_on_disjoint_keys_all_land() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = StoreConfig::new(dir.path().join("map.pm"), 256 << 20).with_task_num(4);
    let map = Arc::new(PLockfreeHashMap::build(&cfg).expect("build map"));

    std::thread::scope(|scope| {
        for tid in 0..4 {
            let map = Arc::clone(&map);
            scope.spawn(move || {
                map.init_thread(tid);
                for i in 0..2_000 {
                    let key = format!("t{}-{:04}", tid, i);
                    assert_eq!(map.put(&key, "first", tid).expect("put"), None);
                    assert_eq!(
                        map.put(&key, "second", tid).expect("overwrite").as_deref(),
                        Some("first")
                    );
                }
            });
        }
    });

    map.init_thread(0);
    for tid in 0..4 {
        for i in 0..2_000 {
            let key = format!("t{}-{:04}", tid, i);
            assert_eq!(map.get(&key, 0).as_deref(), Some("second"));
        }
    }
}

#[test]
fn contended_single_key_keeps_one_winner() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = StoreConfig::new(dir.path().join("map.pm"), 128 << 20).with_task_num(THREADS);
    let map = Arc::new(PLockfreeHashMap::build(&cfg).expect("build map"));

    let winners = Arc::new(AtomicI64::new(0));
    std::thread::scope(|scope| {
        for tid in 0..THREADS {
            let map = Arc::clone(&map);
            let winners = Arc::clone(&winners);
            scope.spawn(move || {
                map.init_thread(tid);
                if map.insert("hot", &format!("owner{}", tid), tid).expect("insert") {
                    winners.fetch_add(1, Ordering::AcqRel);
                }
            });
        }
    });

    assert_eq!(winners.load(Ordering::Acquire), 1, "exactly one insert may win");
    assert!(map.get("hot", 0).is_some());
}

#[test]
fn balanced_insert_remove_pairs_leak_no_persistent_blocks() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = StoreConfig::new(dir.path().join("map.pm"), 64 << 20).with_task_num(1);
    cfg.reclaim_gap = 2;
    let map = PLockfreeHashMap::build(&cfg).expect("build map");
    map.init_thread(0);

    let baseline = map.live_block_count();
    const PAIRS: usize = 400;

    for i in 0..PAIRS {
        let key = key_name(i % 50);
        assert!(map.insert(&key, "v", 0).expect("insert"));
        assert_eq!(map.remove(&key, 0).expect("remove").as_deref(), Some("v"));
    }

    // Push the clock past every retire stamp, then drain the quarantine.
    let esys = map.epoch_sys();
    for _ in 0..(cfg.effective_reclaim_gap() + 2) {
        assert!(esys.advance_epoch(), "quiescent clock must advance");
    }
    while esys.reclaim_now(0) > 0 {}

    assert_eq!(map.pending_reclaims(), 0, "retire queues must drain fully");
    assert_eq!(
        map.live_block_count(),
        baseline,
        "balanced insert/remove pairs must not leak persistent blocks"
    );
}
