use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use pmstore_core::{PLockfreeHashMap, StoreConfig};

const REGION_BYTES: usize = 256 << 20;
const WARM_KEYS: usize = 10_000;

fn warm_map(dir: &tempfile::TempDir) -> PLockfreeHashMap {
    let cfg = StoreConfig::new(dir.path().join("bench.pm"), REGION_BYTES);
    let map = PLockfreeHashMap::build(&cfg).expect("build bench map");
    map.init_thread(0);
    for i in 0..WARM_KEYS {
        map.insert(&format!("key{:06}", i), "payload", 0)
            .expect("warm insert");
    }
    map
}

fn bench_map_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("pmap");
    group.sample_size(10);
    group.measurement_time(Duration::from_secs(5));

    group.bench_function("get_hit", |b| {
        let dir = tempfile::tempdir().expect("tempdir");
        let map = warm_map(&dir);
        let mut i = 0_usize;
        b.iter(|| {
            let key = format!("key{:06}", i % WARM_KEYS);
            i = i.wrapping_add(7);
            black_box(map.get(&key, 0))
        });
    });

    group.bench_function("put_overwrite", |b| {
        let dir = tempfile::tempdir().expect("tempdir");
        let map = warm_map(&dir);
        let mut i = 0_usize;
        b.iter(|| {
            let key = format!("key{:06}", i % WARM_KEYS);
            i = i.wrapping_add(13);
            black_box(map.put(&key, "rewritten", 0).expect("put"))
        });
    });

    group.bench_function("insert_remove_cycle", |b| {
        b.iter_batched(
            || tempfile::tempdir().expect("tempdir"),
            |dir| {
                let cfg = StoreConfig::new(dir.path().join("bench.pm"), 64 << 20);
                let map = PLockfreeHashMap::build(&cfg).expect("build map");
                map.init_thread(0);
                for i in 0..1_000 {
                    let key = format!("key{:04}", i);
                    map.insert(&key, "v", 0).expect("insert");
                    map.remove(&key, 0).expect("remove");
                }
                black_box(map.live_block_count())
            },
            BatchSize::PerIteration,
        )
    });

    group.finish();
}

criterion_group!(benches, bench_map_throughput);
criterion_main!(benches);
