use criterion::{criterion_group, criterion_main, Bencher, BenchmarkId, Criterion, Throughput};
use once_cell::sync::Lazy;
use rand::Rng;

use letree::{LeTree, PmSizes, StoreConfig};

const TOTAL_KEYS: u64 = 100_000;
const GROUP_SIZES: [usize; 2] = [256, 1024];

static RANDOM_KEYS: Lazy<Vec<u64>> = Lazy::new(|| {
    let mut rng = rand::thread_rng();
    (0..TOTAL_KEYS).map(|_| rng.gen_range(0, TOTAL_KEYS)).collect()
});

fn loaded_tree(max_entries_per_group: usize) -> LeTree {
    let mut tree = LeTree::init_anonymous(
        PmSizes::new(1 << 30, 1 << 30).with_clevel(1 << 30),
        StoreConfig {
            max_entries_per_group,
            min_entries_per_group: max_entries_per_group / 4,
            ..StoreConfig::single_threaded()
        },
    )
    .unwrap();
    let pairs: Vec<(u64, u64)> = (0..TOTAL_KEYS).map(|k| (k, k)).collect();
    tree.bulk_load(&pairs).unwrap();
    tree
}

fn put_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("put_get");
    group.throughput(Throughput::Elements(1));

    for &size in GROUP_SIZES.iter() {
        group.bench_with_input(BenchmarkId::new("get_random", size), &size, |b, &size| {
            get_random(b, size)
        });
        group.bench_with_input(BenchmarkId::new("put_random", size), &size, |b, &size| {
            put_random(b, size)
        });
    }
    group.finish()
}

fn get_random(b: &mut Bencher, max_entries_per_group: usize) {
    let tree = loaded_tree(max_entries_per_group);
    let mut i = 0usize;
    b.iter(|| {
        let key = RANDOM_KEYS[i % RANDOM_KEYS.len()];
        i += 1;
        tree.get(key)
    });
}

fn put_random(b: &mut Bencher, max_entries_per_group: usize) {
    let tree = loaded_tree(max_entries_per_group);
    let mut next = TOTAL_KEYS;
    b.iter(|| {
        tree.put(next, next).unwrap();
        next += 1;
    });
}

criterion_group!(benches, put_get);
criterion_main!(benches);
