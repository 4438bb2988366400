//! Tests for Stream
//!
//! These tests verify:
//! - Cursor movement (seek clamping, tell, read advancing)
//! - getch() across cache windows
//! - eof()/fail() state transitions
//! - Writes, including growth seen through other handles
//! - Invalidation when the storage closes or goes away

use std::path::PathBuf;

use pole::{Config, Storage, Stream};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_file() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("streams.ole");
    (temp_dir, path)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 13 % 256) as u8).collect()
}

/// Container with `/small` (1000 bytes) and `/big` (10000 bytes), reopened read-only
fn setup_storage(path: &PathBuf, cache: usize) -> Storage {
    let mut storage = Storage::create_path(path, Config::builder().writable().build()).unwrap();
    storage.create_stream("/small").unwrap().write(&pattern(1000));
    storage.create_stream("/big").unwrap().write(&pattern(10_000));
    storage.close().unwrap();

    let config = Config::builder().stream_cache_size(cache).build();
    Storage::open_path(path, config).unwrap()
}

fn drain_getch(stream: &mut Stream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(byte) = stream.getch() {
        out.push(byte);
    }
    out
}

// =============================================================================
// Cursor Tests
// =============================================================================

#[test]
fn test_seek_clamps_to_size() {
    let (_temp, path) = setup_temp_file();
    let storage = setup_storage(&path, 4096);
    let mut stream = storage.stream("/small", false).unwrap();

    stream.seek(250);
    assert_eq!(stream.tell(), 250);
    stream.seek(1_000_000);
    assert_eq!(stream.tell(), 1000);
    stream.seek(0);
    assert_eq!(stream.tell(), 0);
}

#[test]
fn test_read_advances_cursor_read_at_does_not() {
    let (_temp, path) = setup_temp_file();
    let storage = setup_storage(&path, 4096);
    let data = pattern(10_000);
    let mut stream = storage.stream("/big", false).unwrap();

    let mut buf = vec![0u8; 700];
    assert_eq!(stream.read(&mut buf), 700);
    assert_eq!(buf, data[..700]);
    assert_eq!(stream.tell(), 700);

    assert_eq!(stream.read(&mut buf), 700);
    assert_eq!(buf, data[700..1400]);

    assert_eq!(stream.read_at(9000, &mut buf), 700);
    assert_eq!(buf, data[9000..9700]);
    assert_eq!(stream.tell(), 1400);
}

#[test]
fn test_read_spanning_block_boundaries() {
    let (_temp, path) = setup_temp_file();
    let storage = setup_storage(&path, 4096);
    let data = pattern(1000);
    let mut stream = storage.stream("/small", false).unwrap();

    // starts mid small block and crosses several
    let mut buf = vec![0u8; 200];
    assert_eq!(stream.read_at(37, &mut buf), 200);
    assert_eq!(buf, data[37..237]);
}

// =============================================================================
// getch Tests
// =============================================================================

#[test]
fn test_getch_walks_whole_stream_with_tiny_cache() {
    let (_temp, path) = setup_temp_file();
    let storage = setup_storage(&path, 16);
    let mut stream = storage.stream("/big", false).unwrap();

    assert_eq!(drain_getch(&mut stream), pattern(10_000));
    assert!(stream.eof());
    assert!(!stream.fail());
}

#[test]
fn test_seek_invalidates_getch_cache() {
    let (_temp, path) = setup_temp_file();
    let storage = setup_storage(&path, 64);
    let data = pattern(10_000);
    let mut stream = storage.stream("/big", false).unwrap();

    assert_eq!(stream.getch(), Some(data[0]));
    stream.seek(5000);
    assert_eq!(stream.getch(), Some(data[5000]));
    stream.seek(3);
    assert_eq!(stream.getch(), Some(data[3]));
    stream.seek(9999);
    assert_eq!(stream.getch(), Some(data[9999]));
    assert_eq!(stream.getch(), None);
}

// =============================================================================
// State Tests
// =============================================================================

#[test]
fn test_eof_set_on_short_read_and_cleared_by_seek() {
    let (_temp, path) = setup_temp_file();
    let storage = setup_storage(&path, 4096);
    let mut stream = storage.stream("/small", false).unwrap();

    let mut buf = vec![0u8; 1000];
    assert_eq!(stream.read(&mut buf), 1000);
    assert!(!stream.eof());

    assert_eq!(stream.read(&mut buf), 0);
    assert!(stream.eof());
    assert!(!stream.fail());

    stream.seek(990);
    assert!(!stream.eof());
    assert_eq!(stream.read(&mut buf), 10);
    assert!(stream.eof());
}

#[test]
fn test_empty_stream() {
    let (_temp, path) = setup_temp_file();
    let mut storage = Storage::create_path(&path, Config::builder().writable().build()).unwrap();
    let mut stream = storage.create_stream("/empty").unwrap();

    assert_eq!(stream.size(), 0);
    assert_eq!(stream.getch(), None);
    assert!(stream.eof());
    assert!(stream.read_to_end().is_empty());
}

#[test]
fn test_streams_fail_after_close() {
    let (_temp, path) = setup_temp_file();
    let mut storage = setup_storage(&path, 4096);
    let mut stream = storage.stream("/small", false).unwrap();
    assert!(!stream.fail());

    storage.close().unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf), 0);
    assert_eq!(stream.getch(), None);
    assert!(stream.fail());

    // reopening does not revive the old handle
    storage.open().unwrap();
    assert!(stream.fail());
    assert_eq!(storage.stream("/small", false).unwrap().size(), 1000);
}

#[test]
fn test_streams_fail_after_storage_drop() {
    let (_temp, path) = setup_temp_file();
    let storage = setup_storage(&path, 4096);
    let mut stream = storage.stream("/big", false).unwrap();
    drop(storage);

    let mut buf = [0u8; 16];
    assert_eq!(stream.read(&mut buf), 0);
    assert_eq!(stream.size(), 0);
    assert!(stream.fail());
    assert_eq!(stream.full_name(), "/big");
}

#[test]
fn test_deleted_stream_handle_fails() {
    let (_temp, path) = setup_temp_file();
    let mut storage = Storage::create_path(&path, Config::builder().writable().build()).unwrap();
    let mut doomed = storage.create_stream("/doomed").unwrap();
    doomed.write(b"bye");

    storage.delete("/doomed").unwrap();
    storage.create_stream("/other").unwrap().write(b"hello");

    let mut buf = [0u8; 8];
    assert_eq!(doomed.read_at(0, &mut buf), 0);
    assert!(doomed.fail());
}

#[test]
fn test_handle_fails_after_delete_and_recreate_same_name() {
    let (_temp, path) = setup_temp_file();
    let mut storage = Storage::create_path(&path, Config::builder().writable().build()).unwrap();
    let mut doomed = storage.create_stream("/doomed").unwrap();
    doomed.write(b"old payload");

    storage.delete("/doomed").unwrap();
    storage.create_stream("/doomed").unwrap().write(b"NEW");

    let mut buf = [0u8; 16];
    assert_eq!(doomed.read_at(0, &mut buf), 0);
    assert!(doomed.fail());
    assert_eq!(doomed.write(b"stale"), 0);

    let mut fresh = storage.stream("/doomed", true).unwrap();
    assert!(!fresh.fail());
    assert_eq!(fresh.read_to_end(), b"NEW");
}

#[test]
fn test_deleting_folder_fails_nested_handles() {
    let (_temp, path) = setup_temp_file();
    let mut storage = Storage::create_path(&path, Config::builder().writable().build()).unwrap();
    storage.create_stream("/dir/inner").unwrap().write(b"inside");
    storage.create_stream("/directory").unwrap().write(b"sibling");
    let inner = storage.stream("/dir/inner", false).unwrap();
    let sibling = storage.stream("/directory", false).unwrap();

    storage.delete("/dir").unwrap();
    storage.create_stream("/dir/inner").unwrap();

    assert!(inner.fail());
    assert!(!sibling.fail());
    assert_eq!(sibling.size(), 7);
}

// =============================================================================
// Reuse Tests
// =============================================================================

#[test]
fn test_reused_handles_share_cursor() {
    let (_temp, path) = setup_temp_file();
    let storage = setup_storage(&path, 4096);

    let mut first = storage.stream("/small", true).unwrap();
    let second = storage.stream("/small", true).unwrap();
    let independent = storage.stream("/small", false).unwrap();

    first.seek(123);
    assert_eq!(second.tell(), 123);
    assert_eq!(independent.tell(), 0);

    drop(first);
    assert_eq!(second.tell(), 123);
}

// =============================================================================
// Write Tests
// =============================================================================

#[test]
fn test_write_then_read_back_in_place() {
    let (_temp, path) = setup_temp_file();
    let mut storage = Storage::create_path(&path, Config::builder().writable().build()).unwrap();
    let mut stream = storage.create_stream("/w").unwrap();

    assert_eq!(stream.write(b"hello world"), 11);
    assert_eq!(stream.tell(), 11);
    assert_eq!(stream.write_at(6, b"there"), 5);
    assert_eq!(stream.size(), 11);
    assert_eq!(stream.read_to_end(), b"hello there");
}

#[test]
fn test_growth_visible_through_other_handle() {
    let (_temp, path) = setup_temp_file();
    let mut storage = Storage::create_path(&path, Config::builder().writable().build()).unwrap();
    let mut writer = storage.create_stream("/grow").unwrap();
    let mut reader = storage.stream("/grow", false).unwrap();

    writer.write(&pattern(100));
    assert_eq!(reader.size(), 100);

    // crossing the threshold moves the stream to big blocks
    writer.write(&pattern(5000));
    assert_eq!(reader.size(), 5100);
    let mut expected = pattern(100);
    expected.extend(pattern(5000));
    assert_eq!(reader.read_to_end(), expected);
}

#[test]
fn test_write_past_end_zero_fills() {
    let (_temp, path) = setup_temp_file();
    let mut storage = Storage::create_path(&path, Config::builder().writable().build()).unwrap();
    let mut stream = storage.create_stream("/sparse").unwrap();

    stream.write_at(5000, b"end");
    let data = stream.read_to_end();
    assert_eq!(data.len(), 5003);
    assert!(data[..5000].iter().all(|&b| b == 0));
    assert_eq!(&data[5000..], b"end");
}

#[test]
fn test_write_beyond_format_limit_fails_cleanly() {
    let (_temp, path) = setup_temp_file();
    let mut storage = Storage::create_path(&path, Config::builder().writable().build()).unwrap();
    let mut stream = storage.create_stream("/s").unwrap();
    stream.write(b"keep");

    assert_eq!(stream.write_at(u64::MAX - 1, b"x"), 0);
    assert!(stream.fail());

    // 512-byte blocks only record 32-bit sizes
    let mut other = storage.create_stream("/t").unwrap();
    assert_eq!(other.write_at(u32::MAX as u64, b"x"), 0);
    assert!(other.fail());

    // the storage and fresh handles keep working
    let mut again = storage.stream("/s", false).unwrap();
    assert!(!again.fail());
    assert_eq!(again.read_to_end(), b"keep");
    assert_eq!(again.write(b"!"), 1);
    storage.close().unwrap();

    let storage = Storage::open_path(&path, Config::default()).unwrap();
    assert_eq!(storage.stream("/s", false).unwrap().read_to_end(), b"!eep");
    assert_eq!(storage.stream("/t", false).unwrap().size(), 0);
}
