//! Behavior of the two-buffer sequential read cache.

mod common;

use hdfsfs::io::{BLOCK_SIZE, ReadSeekCloserFactory as _, SequentialReader};

use common::{PseudoRandomFile, content_byte};

fn reader_over(file: &PseudoRandomFile) -> SequentialReader {
    SequentialReader::new(file.open_read().expect("open failed"))
}

fn assert_content(data: &[u8], offset: u64) {
    for (i, &byte) in data.iter().enumerate() {
        assert_eq!(byte, content_byte(offset + i as u64), "byte {i} of read at {offset}");
    }
}

#[test]
fn sequential_reads_hit_the_buffer() {
    let file = PseudoRandomFile::new(1 << 20);
    let mut reader = reader_over(&file);

    let first = reader.read(0, 4096).unwrap();
    assert_eq!(first.len(), 4096);
    assert_content(&first, 0);

    // The refill rounded up to a whole block, so the rest of it is free.
    for i in 1..16u64 {
        let data = reader.read(i * 4096, 4096).unwrap();
        assert_eq!(data.len(), 4096);
        assert_content(&data, i * 4096);
    }

    let counters = reader.counters();
    assert_eq!(file.stats.reads(), 1, "only the initial refill hits the backend");
    assert_eq!(counters.cache_hits, 15);
    assert_eq!(counters.holes, 0);
    assert_eq!(counters.seeks, 0);
}

#[test]
fn small_forward_gap_reads_through_instead_of_seeking() {
    let file = PseudoRandomFile::new(1 << 22);
    let mut reader = reader_over(&file);

    reader.read(0, BLOCK_SIZE).unwrap();
    // Skip one block: within the two-block hole tolerance.
    let offset = (2 * BLOCK_SIZE) as u64;
    let data = reader.read(offset, 4096).unwrap();
    assert_content(&data, offset);

    let counters = reader.counters();
    assert_eq!(counters.holes, 1);
    assert_eq!(counters.seeks, 0);
    assert_eq!(file.stats.seeks(), 0);
}

#[test]
fn large_jump_seeks_the_backend() {
    let file = PseudoRandomFile::new(1 << 24);
    let mut reader = reader_over(&file);

    reader.read(0, 4096).unwrap();
    let offset = 1 << 23;
    let data = reader.read(offset, 4096).unwrap();
    assert_content(&data, offset);

    let counters = reader.counters();
    assert_eq!(counters.holes, 0);
    assert_eq!(counters.seeks, 1);
    assert_eq!(file.stats.seeks(), 1);
}

#[test]
fn slightly_reordered_reads_are_absorbed_by_two_buffers() {
    let file = PseudoRandomFile::new(1 << 22);
    let mut reader = reader_over(&file);

    // Two refills land in the two fragments.
    reader.read(0, BLOCK_SIZE).unwrap();
    reader.read(BLOCK_SIZE as u64, BLOCK_SIZE).unwrap();
    let backend_reads = file.stats.reads();

    // A latecomer for the older range is served from the LRU fragment.
    let data = reader.read(1024, 2048).unwrap();
    assert_content(&data, 1024);
    assert_eq!(file.stats.reads(), backend_reads);
    assert!(reader.counters().cache_hits >= 1);
}

#[test]
fn short_backend_reads_are_assembled_into_the_full_request() {
    let mut file = PseudoRandomFile::new(1 << 20);
    file.chunk_limit = Some(1000);
    let mut reader = reader_over(&file);

    let data = reader.read(0, 5000).unwrap();
    assert_eq!(data.len(), 5000);
    assert_content(&data, 0);
}

#[test]
fn end_of_stream_returns_the_assembled_prefix() {
    let file = PseudoRandomFile::new(1000);
    let mut reader = reader_over(&file);

    let data = reader.read(900, 500).unwrap();
    assert_eq!(data.len(), 100);
    assert_content(&data, 900);

    let empty = reader.read(5000, 100).unwrap();
    assert!(empty.is_empty());
}
