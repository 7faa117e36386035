use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::os::unix::fs::FileExt;
use tempfile::NamedTempFile;

use ssync::sparse::{retrieve_layout, Extent, Interval, BLOCK_SIZE};
use ssync::streaming::{plan, DestExtent, DestIndex};

/// Alternating data/hole file with `extents` extents of `blocks` blocks each.
fn fragmented_file(extents: u64, blocks: u64) -> (NamedTempFile, u64) {
    let tmp = NamedTempFile::new().unwrap();
    let stride = blocks * BLOCK_SIZE;
    let size = extents * stride;
    tmp.as_file().set_len(size).unwrap();

    let chunk = vec![0x5Au8; stride as usize];
    for i in (0..extents).step_by(2) {
        tmp.as_file().write_all_at(&chunk, i * stride).unwrap();
    }
    (tmp, size)
}

fn alternating_layout(extents: u64, stride: u64, data_first: bool) -> Vec<Extent> {
    (0..extents)
        .map(|i| {
            let begin = i * stride;
            if (i % 2 == 0) == data_first {
                Extent::data(begin, begin + stride)
            } else {
                Extent::hole(begin, begin + stride)
            }
        })
        .collect()
}

fn bench_retrieve_layout(c: &mut Criterion) {
    let mut group = c.benchmark_group("retrieve_layout");

    for extents in [16u64, 256, 4096].iter() {
        let (tmp, size) = fragmented_file(*extents, 4);

        group.bench_with_input(BenchmarkId::from_parameter(extents), extents, |b, _| {
            b.iter(|| retrieve_layout(black_box(tmp.as_file()), Interval::new(0, size)).unwrap());
        });
    }
    group.finish();
}

fn bench_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan");
    let stride = 64 * BLOCK_SIZE;

    for extents in [256u64, 4096, 65536].iter() {
        let source = alternating_layout(*extents, stride, true);
        // Opposite layout: every source hole is punched
        let dest_extents = alternating_layout(*extents, stride, false);

        group.bench_with_input(BenchmarkId::from_parameter(extents), extents, |b, _| {
            b.iter(|| {
                let mut dest = DestIndex::new();
                for extent in &dest_extents {
                    dest.insert(DestExtent {
                        extent: *extent,
                        digest: None,
                    })
                    .unwrap();
                }
                plan(black_box(&source), dest, 32 * BLOCK_SIZE)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_retrieve_layout, bench_plan);
criterion_main!(benches);
