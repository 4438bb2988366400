//! Corruption tests
//!
//! Files are built with the library, then patched on disk to simulate
//! damaged or hostile input. Every case must fail cleanly (or read short)
//! and never hang or panic.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use pole::{Config, PoleError, Storage, StorageResult};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const BLOCK: u64 = 512;
const EOF: u32 = 0xffff_fffe;

fn setup_temp_file() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("damaged.ole");
    (temp_dir, path)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8).collect()
}

/// Fresh container whose only stream `/big` occupies big blocks 0..9
fn build_big_stream(path: &PathBuf) {
    let config = Config::builder().writable().build();
    let mut storage = Storage::create_path(path, config).unwrap();
    storage.create_stream("/big").unwrap().write(&pattern(5000));
    storage.close().unwrap();
}

fn read_u32(path: &PathBuf, offset: u64) -> u32 {
    let bytes = fs::read(path).unwrap();
    let at = offset as usize;
    u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap())
}

fn patch_u32(path: &PathBuf, offset: u64, value: u32) {
    let mut bytes = fs::read(path).unwrap();
    let at = offset as usize;
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    fs::write(path, bytes).unwrap();
}

/// File offset of BAT entry `block` (first BAT block only)
fn bat_entry(path: &PathBuf, block: u32) -> u64 {
    let bat_block = read_u32(path, 0x4c) as u64;
    (bat_block + 1) * BLOCK + block as u64 * 4
}

/// File offset of a field inside directory record `index`
fn dir_field(path: &PathBuf, index: u64, field: u64) -> u64 {
    let dir_block = read_u32(path, 0x30) as u64;
    (dir_block + 1) * BLOCK + index * 128 + field
}

fn truncate(path: &PathBuf, len: u64) {
    OpenOptions::new().write(true).open(path).unwrap().set_len(len).unwrap();
}

// =============================================================================
// Chain Corruption Tests
// =============================================================================

#[test]
fn test_cyclic_stream_chain_fails_bad_ole() {
    let (_temp, path) = setup_temp_file();
    build_big_stream(&path);

    // block 3 -> 5 -> 3 with the stream starting at block 3
    patch_u32(&path, bat_entry(&path, 3), 5);
    patch_u32(&path, bat_entry(&path, 5), 3);
    patch_u32(&path, dir_field(&path, 1, 0x74), 3);

    let storage = Storage::open_path(&path, Config::default()).unwrap();
    assert!(matches!(storage.stream("/big", false), Err(PoleError::BadOle(_))));
}

#[test]
fn test_chain_leaving_table_fails_bad_ole() {
    let (_temp, path) = setup_temp_file();
    build_big_stream(&path);
    patch_u32(&path, bat_entry(&path, 4), 0x00ff_0000);

    let storage = Storage::open_path(&path, Config::default()).unwrap();
    assert!(matches!(storage.stream("/big", false), Err(PoleError::BadOle(_))));
}

#[test]
fn test_cyclic_directory_chain_fails_open() {
    let (_temp, path) = setup_temp_file();
    build_big_stream(&path);
    let dir_block = read_u32(&path, 0x30);
    patch_u32(&path, bat_entry(&path, dir_block), dir_block);

    let mut storage = Storage::new(&path);
    assert!(matches!(storage.open(), Err(PoleError::BadOle(_))));
    assert_eq!(storage.result(), StorageResult::BadOle);
}

// =============================================================================
// Directory Corruption Tests
// =============================================================================

#[test]
fn test_directory_link_out_of_range_fails_open() {
    let (_temp, path) = setup_temp_file();
    build_big_stream(&path);
    // next-sibling link of the stream entry
    patch_u32(&path, dir_field(&path, 1, 0x48), 77);

    let mut storage = Storage::new(&path);
    assert!(matches!(storage.open(), Err(PoleError::BadOle(_))));
}

#[test]
fn test_entry_linked_twice_fails_open() {
    let (_temp, path) = setup_temp_file();
    build_big_stream(&path);
    // the stream names itself as its own sibling
    patch_u32(&path, dir_field(&path, 1, 0x48), 1);

    let mut storage = Storage::new(&path);
    assert!(matches!(storage.open(), Err(PoleError::BadOle(_))));
}

// =============================================================================
// Header Corruption Tests
// =============================================================================

#[test]
fn test_truncated_header_fails_bad_ole() {
    let (_temp, path) = setup_temp_file();
    build_big_stream(&path);
    truncate(&path, 300);

    let mut storage = Storage::new(&path);
    assert!(matches!(storage.open(), Err(PoleError::BadOle(_))));
    assert_eq!(storage.result(), StorageResult::BadOle);
}

#[test]
fn test_empty_file_is_not_ole() {
    let (_temp, path) = setup_temp_file();
    fs::write(&path, b"").unwrap();

    let mut storage = Storage::new(&path);
    assert!(matches!(storage.open(), Err(PoleError::NotOle)));
}

#[test]
fn test_unsupported_threshold_fails_bad_ole() {
    let (_temp, path) = setup_temp_file();
    build_big_stream(&path);
    patch_u32(&path, 0x38, 2048);

    let mut storage = Storage::new(&path);
    assert!(matches!(storage.open(), Err(PoleError::BadOle(_))));
}

#[test]
fn test_missing_mbat_fails_bad_ole() {
    let (_temp, path) = setup_temp_file();
    build_big_stream(&path);
    // claim more BAT blocks than the header can address without an MBAT
    patch_u32(&path, 0x2c, 200);

    let mut storage = Storage::new(&path);
    assert!(matches!(storage.open(), Err(PoleError::BadOle(_))));
}

#[test]
fn test_bat_block_outside_file_fails_bad_ole() {
    let (_temp, path) = setup_temp_file();
    build_big_stream(&path);
    patch_u32(&path, 0x4c, 5000);

    let mut storage = Storage::new(&path);
    assert!(matches!(storage.open(), Err(PoleError::BadOle(_))));
}

// =============================================================================
// Truncation Tolerance Tests
// =============================================================================

#[test]
fn test_truncated_stream_reads_short() {
    let (_temp, path) = setup_temp_file();
    let config = Config::builder().writable().build();

    // an early flush pins the directory and BAT to blocks 0 and 1,
    // so the stream data (blocks 2..11) sits at the end of the file
    let mut storage = Storage::create_path(&path, config).unwrap();
    storage.flush().unwrap();
    storage.create_stream("/big").unwrap().write(&pattern(5000));
    storage.close().unwrap();
    assert_eq!(read_u32(&path, 0x30), 0);
    assert_eq!(read_u32(&path, 0x4c), 1);
    assert_eq!(read_u32(&path, bat_entry(&path, 11)), EOF);

    // keep the header and blocks 0..8: seven blocks of stream data survive
    truncate(&path, 10 * BLOCK);

    let storage = Storage::open_path(&path, Config::default()).unwrap();
    let mut stream = storage.stream("/big", false).unwrap();
    assert_eq!(stream.size(), 5000);

    let data = stream.read_to_end();
    assert_eq!(data.len(), 7 * 512);
    assert_eq!(data, pattern(5000)[..7 * 512]);
    assert!(stream.eof());
    assert!(!stream.fail());
}
