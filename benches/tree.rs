//! Put/get benchmarks over a throwaway pool.
//!
//! Run with: `cargo bench --bench tree`
//!
//! Numbers here are dominated by the per-operation flush discipline, which
//! is the point: they track the cost of the durability contract, not of the
//! in-memory tree.

#![expect(clippy::unwrap_used)]

use divan::{black_box, Bencher};
use mvtree::{MvTree, Status, POOL_MIN_SIZE};
use tempfile::TempDir;

fn main() {
    divan::main();
}

const N: usize = 10_000;

fn keys(n: usize) -> Vec<Vec<u8>> {
    (0..n).map(|i| format!("key-{i:08}").into_bytes()).collect()
}

fn populated(dir: &TempDir, keys: &[Vec<u8>]) -> MvTree {
    let mut kv = MvTree::open(dir.path().join("bench.pool"), POOL_MIN_SIZE).unwrap();
    for k in keys {
        assert_eq!(kv.put(k, k), Status::Ok);
    }
    kv
}

#[divan::bench(sample_count = 10)]
fn put_ascending(bencher: Bencher) {
    let keys = keys(N);

    bencher
        .with_inputs(|| TempDir::new().unwrap())
        .bench_local_values(|dir| {
            let mut kv = MvTree::open(dir.path().join("bench.pool"), POOL_MIN_SIZE).unwrap();
            for k in &keys {
                assert_eq!(kv.put(black_box(k), k), Status::Ok);
            }
        });
}

#[divan::bench(sample_count = 10)]
fn overwrite_same_size(bencher: Bencher) {
    let keys = keys(N);
    let dir = TempDir::new().unwrap();
    let mut kv = populated(&dir, &keys);

    bencher.bench_local(|| {
        for k in &keys {
            assert_eq!(kv.put(black_box(k), k), Status::Ok);
        }
    });
}

#[divan::bench(sample_count = 10)]
fn get_hit(bencher: Bencher) {
    let keys = keys(N);
    let dir = TempDir::new().unwrap();
    let kv = populated(&dir, &keys);

    bencher.bench_local(|| {
        let mut out = Vec::new();
        for k in &keys {
            out.clear();
            assert_eq!(kv.get(black_box(k), &mut out), Status::Ok);
        }
        out.len()
    });
}

#[divan::bench(sample_count = 10)]
fn get_miss(bencher: Bencher) {
    let keys = keys(N);
    let dir = TempDir::new().unwrap();
    let kv = populated(&dir, &keys);

    bencher.bench_local(|| {
        let mut out = Vec::new();
        let mut misses = 0usize;
        for k in &keys {
            let mut probe = k.clone();
            probe.push(b'?');
            if kv.get(black_box(&probe), &mut out) == Status::NotFound {
                misses += 1;
            }
        }
        misses
    });
}
