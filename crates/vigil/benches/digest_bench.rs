// crates/vigil/benches/digest_bench.rs
//
// Two Criterion benchmark groups:
//   buffer_digest — one-shot SHA-1 over in-memory module images
//   file_digest   — streaming double-buffered measurement over MemFs files

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use vigil::{digest_buffer, digest_file, FileId, MemFs};

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

// ---------------------------------------------------------------------------
// Group 1: buffer_digest — the module-whitelist measurement path
// ---------------------------------------------------------------------------

fn buffer_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_digest");
    for size in [4 * 1024, 64 * 1024, 1024 * 1024] {
        let data = patterned(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(format!("{}KiB", size / 1024), |b| {
            b.iter(|| digest_buffer(black_box(&data)))
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Group 2: file_digest — the executable measurement path
// ---------------------------------------------------------------------------

fn file_digest(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_digest");
    for (name, size) in [
        ("single_buffer_32KiB", 32 * 1024),
        ("double_buffer_1MiB", 1024 * 1024),
        ("double_buffer_8MiB", 8 * 1024 * 1024),
    ] {
        let fs = MemFs::new();
        let id = FileId::new(1, 1);
        fs.add_file(id, "/bench/blob", &patterned(size), 0, 0, 420);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_function(name, |b| {
            b.iter(|| digest_file(black_box(&fs), black_box(id)).expect("bench digest"))
        });
    }
    group.finish();
}

criterion_group!(benches_buffer, buffer_digest);
criterion_group!(benches_file, file_digest);
criterion_main!(benches_buffer, benches_file);
