use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sitebundle::{MemoryKeyStore, Packager, SiteIdentity, SiteTree, Verifier};

// Site of `files` files, `size_kb` each
fn create_test_site(files: usize, size_kb: usize) -> SiteTree {
    let mut tree = SiteTree::new();
    for i in 0..files {
        tree.insert(&format!("page-{}.html", i), vec![(i % 251) as u8; size_kb * 1024])
            .expect("valid path");
    }
    tree
}

fn create_keys() -> (MemoryKeyStore, SiteIdentity) {
    let site = SiteIdentity::new("bench.freedom").expect("valid identity");
    let keys = MemoryKeyStore::new();
    keys.generate(&site).expect("generate key");
    (keys, site)
}

// Benchmark: sealing with one and several workers
fn bench_seal(c: &mut Criterion) {
    let mut group = c.benchmark_group("seal");
    let (keys, site) = create_keys();

    for workers in [1, 4].iter() {
        let tree = create_test_site(64, 16);
        group.throughput(Throughput::Bytes((64 * 16 * 1024) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(workers), workers, |b, &workers| {
            let packager = Packager::new(&keys).parallelism(workers);
            b.iter(|| {
                packager
                    .seal_to_bytes(black_box(&tree), &site)
                    .expect("Failed to seal")
            });
        });
    }

    group.finish();
}

// Benchmark: verify and decrypt
fn bench_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("open");
    let (keys, site) = create_keys();

    for size_kb in [1, 64, 1024].iter() {
        let tree = create_test_site(8, *size_kb);
        let bytes = Packager::new(&keys)
            .seal_to_bytes(&tree, &site)
            .expect("Failed to seal");
        group.throughput(Throughput::Bytes((8 * size_kb * 1024) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size_kb), size_kb, |b, _| {
            let verifier = Verifier::new(&keys);
            b.iter(|| verifier.open(black_box(&bytes)).expect("Failed to open"));
        });
    }

    group.finish();
}

// Benchmark: structural inspection only
fn bench_inspect(c: &mut Criterion) {
    let (keys, site) = create_keys();
    let bytes = Packager::new(&keys)
        .seal_to_bytes(&create_test_site(256, 4), &site)
        .expect("Failed to seal");
    c.bench_function("inspect", |b| {
        b.iter(|| Verifier::inspect(black_box(&bytes)).expect("Failed to inspect"))
    });
}

criterion_group!(benches, bench_seal, bench_open, bench_inspect);
criterion_main!(benches);
