#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use ssync::sparse::{coalesce, retrieve_layout, Extent, Interval, Kind, BLOCK_SIZE};
use ssync::{ApplyServer, ApplyStats, Endpoint, ServerConfig};

pub const MAX_EXTENT_BLOCKS: u64 = 256;

/// One generated extent; data bytes are derived from `mask` and the offset.
#[derive(Debug, Clone, Copy)]
pub struct TestExtent {
    pub extent: Extent,
    pub mask: u8,
}

/// Random alternating layout covering `[0, size)`, reproducible per seed.
pub fn generate_layout(seed: u64, size: u64) -> Vec<TestExtent> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut layout = Vec::new();
    let mut offset = 0;

    while offset < size {
        let blocks = rng.gen_range(1..=MAX_EXTENT_BLOCKS);
        let end = (offset + blocks * BLOCK_SIZE).min(size);
        let kind = if rng.gen_bool(0.5) { Kind::Data } else { Kind::Hole };
        let mask = if kind == Kind::Data && rng.gen_bool(0.1) { 0xAA } else { 0 };
        layout.push(TestExtent {
            extent: Extent::new(kind, offset, end),
            mask,
        });
        offset = end;
    }

    layout
}

/// Content of the data byte at `offset`
pub fn data_byte(mask: u8, offset: u64) -> u8 {
    mask ^ (offset / BLOCK_SIZE) as u8
}

pub fn data_bytes(mask: u8, interval: Interval) -> Vec<u8> {
    (interval.begin..interval.end)
        .map(|offset| data_byte(mask, offset))
        .collect()
}

pub fn create_sparse_file(path: &Path, layout: &[TestExtent], size: u64) -> File {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .unwrap();
    file.set_len(size).unwrap();

    for test_extent in layout.iter().filter(|e| e.extent.is_data()) {
        let interval = test_extent.extent.interval;
        file.write_all_at(&data_bytes(test_extent.mask, interval), interval.begin)
            .unwrap();
    }
    file.sync_all().unwrap();
    file
}

/// Assert that `path` holds exactly `layout`: data bytes match and every
/// hole is a genuine hole.
pub fn check_sparse_file(path: &Path, layout: &[TestExtent], size: u64) {
    let file = File::open(path).unwrap();
    assert_eq!(file.metadata().unwrap().len(), size, "size of {}", path.display());

    for test_extent in layout.iter().filter(|e| e.extent.is_data()) {
        let interval = test_extent.extent.interval;
        let mut buf = vec![0u8; interval.len() as usize];
        file.read_exact_at(&mut buf, interval.begin).unwrap();
        assert!(
            buf == data_bytes(test_extent.mask, interval),
            "data mismatch in {}",
            interval
        );
    }

    let extents: Vec<Extent> = layout.iter().map(|e| e.extent).collect();
    for hole in coalesce(&extents).iter().filter(|e| e.is_hole()) {
        let found = retrieve_layout(&file, hole.interval).unwrap();
        assert_eq!(found, vec![*hole], "hole {} is not a single hole", hole.interval);
    }
}

pub fn layout_data_bytes(layout: &[TestExtent]) -> u64 {
    layout
        .iter()
        .filter(|e| e.extent.is_data())
        .map(|e| e.extent.len())
        .sum()
}

/// Start a server on an ephemeral port that applies one session.
pub async fn spawn_server(
    config: ServerConfig,
) -> (Endpoint, tokio::task::JoinHandle<ssync::Result<ApplyStats>>) {
    let server = ApplyServer::bind(&Endpoint::new("127.0.0.1", 0), config)
        .await
        .unwrap();
    let endpoint = server.local_endpoint().unwrap();
    let handle = tokio::spawn(async move { server.serve_one().await });
    (endpoint, handle)
}
